//! V4L2 ring device.
//!
//! `V4l2Device` implements [`RingDevice`] for a local device node such as
//! `/dev/video0`. Capability queries and format configuration go through the
//! `v4l` crate; the buffer ring itself (REQBUFS, QUERYBUF, mmap, QBUF/DQBUF,
//! STREAMON/OFF) is driven with raw ioctls so that buffer ownership stays
//! with [`BufferRing`](super::ring::BufferRing).

use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::memory::Memory;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::{Format, Fraction};

use super::ring::{BufferLocation, DequeuedSlot, MappedRegion, Readiness, RingDevice};
use crate::error::{CaptureError, Result};
use crate::format::{
    CapabilitySource, FormatDescriptor, FrameRate, NegotiatedFormat, Resolution, SizeDescriptor,
};
use crate::frame::{FourCc, PixelFormat};

pub struct V4l2Device {
    path: String,
    device: v4l::Device,
    fd: c_int,
}

impl V4l2Device {
    /// Open a device node and check that it can stream video capture.
    pub fn open(path: &str) -> Result<Self> {
        let device = v4l::Device::with_path(path)
            .map_err(|err| CaptureError::device_open(path, err.to_string()))?;
        let caps = device
            .query_caps()
            .map_err(|err| CaptureError::device_open(path, format!("query caps: {}", err)))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CaptureError::device_open(path, "not a video capture device"));
        }
        if !caps.capabilities.contains(Flags::STREAMING) {
            return Err(CaptureError::device_open(path, "device does not support streaming"));
        }
        let fd = device.handle().fd();
        log::info!("V4l2Device: opened {} ({}, driver {})", path, caps.card, caps.driver);
        Ok(Self {
            path: path.to_string(),
            device,
            fd,
        })
    }

    fn ioctl<T>(&self, request: vidioc::_IOC_TYPE, arg: &mut T) -> std::io::Result<()> {
        // SAFETY: `arg` is a live, correctly typed argument for `request`
        // and `fd` stays open for as long as `self.device` does.
        unsafe { v4l::v4l2::ioctl(self.fd, request, arg as *mut T as *mut c_void) }
    }

    fn capture_buffer(index: u32) -> v4l2_buffer {
        // SAFETY: v4l2_buffer is a plain C struct; all-zero is a valid value.
        let mut buffer: v4l2_buffer = unsafe { std::mem::zeroed() };
        buffer.index = index;
        buffer.type_ = Type::VideoCapture as u32;
        buffer.memory = Memory::Mmap as u32;
        buffer
    }

    fn stream_type() -> c_int {
        Type::VideoCapture as c_int
    }

    fn frame_rates(&self, fourcc: v4l::FourCC, width: u32, height: u32) -> Vec<FrameRate> {
        match self.device.enum_frameintervals(fourcc, width, height) {
            Ok(intervals) => intervals
                .into_iter()
                .filter_map(|interval| match interval.interval {
                    // An interval of n/d seconds is d/n frames per second.
                    FrameIntervalEnum::Discrete(fraction) => {
                        Some(FrameRate::new(fraction.denominator, fraction.numerator))
                    }
                    FrameIntervalEnum::Stepwise(_) => None,
                })
                .collect(),
            Err(err) => {
                log::debug!(
                    "V4l2Device: no frame intervals for {} {}x{} on {}: {}",
                    fourcc,
                    width,
                    height,
                    self.path,
                    err
                );
                Vec::new()
            }
        }
    }
}

fn pixel_format(fourcc: v4l::FourCC) -> PixelFormat {
    PixelFormat::from_fourcc(FourCc(fourcc.repr))
}

fn v4l_fourcc(format: PixelFormat) -> v4l::FourCC {
    v4l::FourCC::new(&format.fourcc().0)
}

impl CapabilitySource for V4l2Device {
    fn device_name(&self) -> String {
        self.path.clone()
    }

    fn formats(&mut self) -> Result<Vec<FormatDescriptor>> {
        let descriptions = self
            .device
            .enum_formats()
            .map_err(|err| {
                CaptureError::device_open(&self.path, format!("enum formats: {}", err))
            })?;
        let mut formats = Vec::with_capacity(descriptions.len());
        for description in descriptions {
            let mut sizes = Vec::new();
            match self.device.enum_framesizes(description.fourcc) {
                Ok(frame_sizes) => {
                    for frame_size in frame_sizes {
                        // Stepwise and continuous ranges leave `sizes` empty.
                        if let FrameSizeEnum::Discrete(discrete) = frame_size.size {
                            sizes.push(SizeDescriptor {
                                resolution: Resolution::new(discrete.width, discrete.height),
                                frame_rates: self.frame_rates(
                                    description.fourcc,
                                    discrete.width,
                                    discrete.height,
                                ),
                            });
                        }
                    }
                }
                Err(err) => log::debug!(
                    "V4l2Device: no frame sizes for {} on {}: {}",
                    description.fourcc,
                    self.path,
                    err
                ),
            }
            formats.push(FormatDescriptor {
                pixel_format: pixel_format(description.fourcc),
                sizes,
            });
        }
        Ok(formats)
    }

    fn current_format(&mut self) -> Result<Option<NegotiatedFormat>> {
        let format = match self.device.format() {
            Ok(format) => format,
            Err(err) => {
                log::debug!("V4l2Device: no current format on {}: {}", self.path, err);
                return Ok(None);
            }
        };
        let frame_rate = self
            .device
            .params()
            .ok()
            .filter(|params| params.interval.numerator != 0)
            .map(|params| FrameRate::new(params.interval.denominator, params.interval.numerator));
        Ok(Some(NegotiatedFormat {
            resolution: Resolution::new(format.width, format.height),
            pixel_format: pixel_format(format.fourcc),
            frame_rate,
            origin: None,
        }))
    }

    fn apply_format(&mut self, wanted: &NegotiatedFormat) -> Result<NegotiatedFormat> {
        let format = Format::new(
            wanted.resolution.width,
            wanted.resolution.height,
            v4l_fourcc(wanted.pixel_format),
        );
        let applied = self.device.set_format(&format).map_err(|err| {
            CaptureError::FormatNegotiation(format!("{}: set format: {}", self.path, err))
        })?;

        let mut frame_rate = None;
        if let Some(rate) = wanted.frame_rate.filter(|r| r.numerator != 0) {
            let interval = Fraction::new(rate.denominator, rate.numerator);
            let params = v4l::video::capture::Parameters::new(interval);
            match self.device.set_params(&params) {
                Ok(params) if params.interval.numerator != 0 => {
                    frame_rate = Some(FrameRate::new(
                        params.interval.denominator,
                        params.interval.numerator,
                    ));
                }
                Ok(_) => {}
                Err(err) => {
                    log::warn!(
                        "V4l2Device: failed to set frame rate {} on {}: {}",
                        rate,
                        self.path,
                        err
                    );
                }
            }
        }

        Ok(NegotiatedFormat {
            resolution: Resolution::new(applied.width, applied.height),
            pixel_format: pixel_format(applied.fourcc),
            frame_rate,
            origin: None,
        })
    }
}

impl RingDevice for V4l2Device {
    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        // SAFETY: plain C struct; all-zero is a valid value.
        let mut request: v4l2_requestbuffers = unsafe { std::mem::zeroed() };
        request.count = count;
        request.type_ = Type::VideoCapture as u32;
        request.memory = Memory::Mmap as u32;
        self.ioctl(vidioc::VIDIOC_REQBUFS, &mut request)
            .map_err(|err| CaptureError::protocol("request buffers", err))?;
        Ok(request.count)
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferLocation> {
        let mut buffer = Self::capture_buffer(index);
        self.ioctl(vidioc::VIDIOC_QUERYBUF, &mut buffer)
            .map_err(|err| CaptureError::protocol("query buffer", err))?;
        // SAFETY: for MMAP buffers the kernel fills the `offset` member.
        let offset = unsafe { buffer.m.offset };
        Ok(BufferLocation {
            index,
            offset: offset as u64,
            length: buffer.length as usize,
        })
    }

    fn map_buffer(&mut self, location: BufferLocation) -> Result<Box<dyn MappedRegion>> {
        // SAFETY: offset and length come from QUERYBUF on this fd; the
        // result is checked against MAP_FAILED before use.
        let address = unsafe {
            libc::mmap(
                ptr::null_mut(),
                location.length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                location.offset as libc::off_t,
            )
        };
        if address == libc::MAP_FAILED {
            return Err(CaptureError::protocol(
                "map buffer",
                std::io::Error::last_os_error(),
            ));
        }
        Ok(Box::new(V4l2Region {
            address,
            length: location.length,
            _device: self.device.handle(),
        }))
    }

    fn queue_buffer(&mut self, index: u32) -> Result<()> {
        let mut buffer = Self::capture_buffer(index);
        self.ioctl(vidioc::VIDIOC_QBUF, &mut buffer)
            .map_err(|err| CaptureError::protocol("queue buffer", err))
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedSlot> {
        let mut buffer = Self::capture_buffer(0);
        self.ioctl(vidioc::VIDIOC_DQBUF, &mut buffer)
            .map_err(|err| CaptureError::protocol("dequeue buffer", err))?;
        Ok(DequeuedSlot {
            index: buffer.index,
            bytes_used: buffer.bytesused as usize,
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        let mut kind = Self::stream_type();
        self.ioctl(vidioc::VIDIOC_STREAMON, &mut kind)
            .map_err(|err| CaptureError::protocol("stream on", err))
    }

    fn stream_off(&mut self) -> Result<()> {
        let mut kind = Self::stream_type();
        self.ioctl(vidioc::VIDIOC_STREAMOFF, &mut kind)
            .map_err(|err| CaptureError::protocol("stream off", err))
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<Readiness> {
        let mut pollfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(c_int::MAX as u128) as c_int;
        // SAFETY: one valid pollfd, count 1.
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(Readiness::Interrupted);
            }
            return Err(CaptureError::protocol("poll", err));
        }
        if ready == 0 {
            return Ok(Readiness::TimedOut);
        }
        if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return Err(CaptureError::protocol(
                "poll",
                format!("device reported revents {:#x}", pollfd.revents),
            ));
        }
        Ok(Readiness::Ready)
    }

    fn release_buffers(&mut self) -> Result<()> {
        self.request_buffers(0).map(|_| ())
    }
}

/// A kernel buffer mapped into this process.
struct V4l2Region {
    address: *mut c_void,
    length: usize,
    // Keeps the descriptor open until the mapping is gone.
    _device: Arc<v4l::device::Handle>,
}

// SAFETY: the mapping is plain shared memory owned by this value; access is
// serialized through `&self`/`&mut self` by BufferRing.
unsafe impl Send for V4l2Region {}

impl MappedRegion for V4l2Region {
    fn len(&self) -> usize {
        self.length
    }

    fn copy_to(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() > self.length {
            return Err(CaptureError::protocol(
                "copy",
                format!("{} bytes requested from a {} byte buffer", dst.len(), self.length),
            ));
        }
        // SAFETY: the region is mapped for `length` bytes and the caller
        // holds the buffer (dequeued), so the kernel is not writing to it.
        let src = unsafe { std::slice::from_raw_parts(self.address as *const u8, dst.len()) };
        dst.copy_from_slice(src);
        Ok(())
    }
}

impl Drop for V4l2Region {
    fn drop(&mut self) {
        // SAFETY: address/length are exactly what mmap returned.
        if unsafe { libc::munmap(self.address, self.length) } != 0 {
            log::warn!(
                "V4l2Device: munmap failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
