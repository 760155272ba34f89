//! GStreamer frame producers.
//!
//! `GstProducer` implements [`FrameProducer`] on top of an app sink:
//! - cameras run `v4l2src` as a media framework, delivering pixels with
//!   their own dimensions and format tag
//! - displays and windows run `ximagesrc` as a capture graph, delivering a
//!   sample time and a buffer in the negotiated layout
//!
//! The app sink calls back on a GStreamer streaming thread. Setting the
//! pipeline to `Null` joins those threads, which is what makes `stop()` a
//! hard barrier for delivery.

use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSinkCallbacks};

use super::callback::{FrameProducer, FrameSource};
use crate::device::{DeviceKind, DevicePath};
use crate::error::{CaptureError, Result};
use crate::format::{
    CapabilitySource, FormatDescriptor, FormatRequest, FrameRate, NegotiatedFormat, Resolution,
};
use crate::frame::PixelFormat;
use crate::queue::FrameSink;

const PROBE_TIMEOUT_SECS: u64 = 2;
const APP_SINK: &str = "appsink name=sink max-buffers=1 drop=true sync=false";

/// Raw formats and their GStreamer caps names.
const GST_FORMATS: &[(PixelFormat, &str)] = &[
    (PixelFormat::Yuyv, "YUY2"),
    (PixelFormat::Uyvy, "UYVY"),
    (PixelFormat::Nv12, "NV12"),
    (PixelFormat::Yuv420p, "I420"),
    (PixelFormat::Rgb24, "RGB"),
    (PixelFormat::Bgr24, "BGR"),
    (PixelFormat::Rgba, "RGBA"),
    (PixelFormat::Bgra, "BGRA"),
    (PixelFormat::Bgrx, "BGRx"),
    (PixelFormat::Gray8, "GRAY8"),
];

const CAMERA_FORMATS: &[PixelFormat] = &[
    PixelFormat::Yuyv,
    PixelFormat::Nv12,
    PixelFormat::Yuv420p,
    PixelFormat::Rgb24,
    PixelFormat::Bgr24,
    PixelFormat::Bgra,
    PixelFormat::Gray8,
];

const DISPLAY_FORMATS: &[PixelFormat] = &[
    PixelFormat::Bgrx,
    PixelFormat::Bgra,
    PixelFormat::Rgba,
    PixelFormat::Rgb24,
    PixelFormat::Bgr24,
    PixelFormat::Yuyv,
    PixelFormat::Nv12,
    PixelFormat::Yuv420p,
    PixelFormat::Gray8,
];

fn gst_name(format: PixelFormat) -> Option<&'static str> {
    GST_FORMATS
        .iter()
        .find(|(f, _)| *f == format)
        .map(|(_, name)| *name)
}

fn from_gst_name(name: &str) -> Option<PixelFormat> {
    GST_FORMATS
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(format, _)| *format)
}

/// Row length in bytes and row count of each plane, without padding.
fn plane_layout(format: PixelFormat, width: usize, height: usize) -> Vec<(usize, usize)> {
    match format {
        PixelFormat::Nv12 => vec![(width, height), (width, height / 2)],
        PixelFormat::Yuv420p => vec![
            (width, height),
            (width / 2, height / 2),
            (width / 2, height / 2),
        ],
        other => {
            let bpp = other.bits_per_pixel().unwrap_or(8) as usize;
            vec![(width * bpp / 8, height)]
        }
    }
}

/// Copy a sample out of GStreamer memory, dropping per-row stride padding.
fn sample_pixels(sample: &gstreamer::Sample) -> Option<(Vec<u8>, u32, u32, PixelFormat, f64)> {
    let buffer = sample.buffer()?;
    let caps = sample.caps()?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).ok()?;
    let format = from_gst_name(&info.format().to_string())?;
    let (width, height) = (info.width(), info.height());
    let sample_time = buffer
        .pts()
        .map(|pts| pts.nseconds() as f64 / 1e9)
        .unwrap_or(0.0);

    let map = buffer.map_readable().ok()?;
    let data = map.as_slice();
    let layout = plane_layout(format, width as usize, height as usize);
    let mut pixels = Vec::with_capacity(layout.iter().map(|(row, rows)| row * rows).sum());
    for (plane, (row_bytes, rows)) in layout.into_iter().enumerate() {
        let offset = *info.offset().get(plane)?;
        let stride = *info.stride().get(plane)? as usize;
        for row in 0..rows {
            let start = offset + row * stride;
            pixels.extend_from_slice(data.get(start..start + row_bytes)?);
        }
    }
    Some((pixels, width, height, format, sample_time))
}

fn launch(description: &str) -> Result<(gstreamer::Pipeline, AppSink)> {
    let pipeline = gstreamer::parse::launch(description)
        .map_err(|err| CaptureError::StreamStart(format!("build pipeline: {}", err)))?
        .downcast::<gstreamer::Pipeline>()
        .map_err(|_| CaptureError::StreamStart("pipeline is not a Pipeline".to_string()))?;
    let appsink = pipeline
        .by_name("sink")
        .ok_or_else(|| CaptureError::StreamStart("appsink missing from pipeline".to_string()))?
        .downcast::<AppSink>()
        .map_err(|_| CaptureError::StreamStart("appsink element has unexpected type".to_string()))?;
    Ok((pipeline, appsink))
}

pub struct GstProducer {
    device: DevicePath,
    source: FrameSource,
    draw_mouse: bool,
    format: Option<NegotiatedFormat>,
    pipeline: Option<gstreamer::Pipeline>,
}

impl GstProducer {
    pub fn open(device: &DevicePath, request: &FormatRequest) -> Result<Self> {
        gstreamer::init().map_err(|err| {
            CaptureError::device_open(&device.path, format!("gstreamer init: {}", err))
        })?;
        let source = match device.kind {
            DeviceKind::Camera => FrameSource::MediaFramework,
            DeviceKind::Display | DeviceKind::Window => FrameSource::CaptureGraph,
        };
        Ok(Self {
            device: device.clone(),
            source,
            draw_mouse: request.draw_mouse.unwrap_or(true),
            format: None,
            pipeline: None,
        })
    }

    fn source_element(&self) -> String {
        let show_pointer = self.draw_mouse;
        match self.device.kind {
            DeviceKind::Camera if self.device.path.is_empty() => "autovideosrc".to_string(),
            DeviceKind::Camera => format!("v4l2src device=\"{}\"", self.device.path),
            DeviceKind::Window => {
                let xid = self
                    .device
                    .path
                    .strip_prefix("window:")
                    .unwrap_or(&self.device.path);
                format!(
                    "ximagesrc xid={} use-damage=false show-pointer={}",
                    xid, show_pointer
                )
            }
            DeviceKind::Display => {
                let display = self
                    .device
                    .path
                    .strip_prefix("display:")
                    .unwrap_or(&self.device.path);
                let mut element = format!(
                    "ximagesrc display-name=\"{}\" use-damage=false show-pointer={}",
                    display, show_pointer
                );
                // Crop to the requested region when an origin was given.
                if let Some(format) = &self.format {
                    if let Some(origin) = format.origin {
                        let x = origin.x.max(0) as u32;
                        let y = origin.y.max(0) as u32;
                        element.push_str(&format!(
                            " startx={} starty={} endx={} endy={}",
                            x,
                            y,
                            x + format.resolution.width.saturating_sub(1),
                            y + format.resolution.height.saturating_sub(1)
                        ));
                    }
                }
                element
            }
        }
    }

    fn probe(&self) -> Result<Option<NegotiatedFormat>> {
        let description = format!(
            "{} num-buffers=1 ! videoconvert ! appsink name=sink sync=false",
            self.source_element()
        );
        let (pipeline, appsink) = launch(&description)?;
        if pipeline.set_state(gstreamer::State::Paused).is_err() {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Ok(None);
        }
        let sample =
            appsink.try_pull_preroll(gstreamer::ClockTime::from_seconds(PROBE_TIMEOUT_SECS));
        let _ = pipeline.set_state(gstreamer::State::Null);

        let Some(info) = sample
            .as_ref()
            .and_then(|s| s.caps())
            .and_then(|caps| gstreamer_video::VideoInfo::from_caps(caps).ok())
        else {
            return Ok(None);
        };
        let fps = info.fps();
        let frame_rate = (fps.numer() > 0 && fps.denom() > 0)
            .then(|| FrameRate::new(fps.numer() as u32, fps.denom() as u32));
        let pixel_format = from_gst_name(&info.format().to_string())
            .unwrap_or_else(|| self.offered()[0]);
        Ok(Some(NegotiatedFormat {
            resolution: Resolution::new(info.width(), info.height()),
            pixel_format,
            frame_rate,
            origin: None,
        }))
    }

    fn offered(&self) -> &'static [PixelFormat] {
        match self.source {
            FrameSource::MediaFramework => CAMERA_FORMATS,
            FrameSource::CaptureGraph => DISPLAY_FORMATS,
        }
    }

    fn capture_description(&self, format: &NegotiatedFormat) -> Result<String> {
        let caps_name = gst_name(format.pixel_format).ok_or_else(|| {
            CaptureError::Unsupported(format!("{} through gstreamer", format.pixel_format))
        })?;
        let mut caps = format!(
            "video/x-raw,format={},width={},height={}",
            caps_name, format.resolution.width, format.resolution.height
        );
        let mut rate = "";
        if let Some(frame_rate) = format.frame_rate.filter(|r| r.denominator != 0) {
            caps.push_str(&format!(
                ",framerate={}/{}",
                frame_rate.numerator, frame_rate.denominator
            ));
            rate = " ! videorate";
        }
        Ok(format!(
            "{} ! videoconvert ! videoscale{} ! {} ! {}",
            self.source_element(),
            rate,
            caps,
            APP_SINK
        ))
    }
}

impl CapabilitySource for GstProducer {
    fn device_name(&self) -> String {
        self.device.path.clone()
    }

    fn formats(&mut self) -> Result<Vec<FormatDescriptor>> {
        // videoconvert/videoscale accept any size.
        Ok(self
            .offered()
            .iter()
            .map(|&pixel_format| FormatDescriptor {
                pixel_format,
                sizes: Vec::new(),
            })
            .collect())
    }

    fn current_format(&mut self) -> Result<Option<NegotiatedFormat>> {
        match self.probe() {
            Ok(format) => Ok(format),
            Err(err) => {
                log::debug!("GstProducer: probing {} failed: {}", self.device.path, err);
                Ok(None)
            }
        }
    }

    fn apply_format(&mut self, format: &NegotiatedFormat) -> Result<NegotiatedFormat> {
        self.format = Some(format.clone());
        Ok(format.clone())
    }
}

impl FrameProducer for GstProducer {
    fn source(&self) -> FrameSource {
        self.source
    }

    fn start(&mut self, sink: FrameSink) -> Result<()> {
        if self.pipeline.is_some() {
            return Ok(());
        }
        let mut format = sink.format().clone();
        if let Some(applied) = &self.format {
            format.origin = applied.origin;
        }
        self.format = Some(format.clone());
        let description = self.capture_description(&format)?;
        log::debug!("GstProducer: pipeline {}", description);
        let (pipeline, appsink) = launch(&description)?;

        let source = self.source;
        let sample_sink = sink.clone();
        let eos_sink = sink.clone();
        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |appsink| {
                    let sample = appsink
                        .pull_sample()
                        .map_err(|_| gstreamer::FlowError::Eos)?;
                    let (pixels, width, height, format, sample_time) =
                        sample_pixels(&sample).ok_or(gstreamer::FlowError::Error)?;
                    match source {
                        FrameSource::MediaFramework => {
                            sample_sink.deliver(&pixels, width, height, format);
                        }
                        FrameSource::CaptureGraph => {
                            sample_sink.deliver_buffer(sample_time, &pixels);
                        }
                    }
                    Ok(gstreamer::FlowSuccess::Ok)
                })
                .eos(move |_| eos_sink.finish())
                .build(),
        );

        if let Some(bus) = pipeline.bus() {
            let device = self.device.path.clone();
            bus.set_sync_handler(move |_, message| {
                if let gstreamer::MessageView::Error(err) = message.view() {
                    log::error!(
                        "GstProducer: {} error from {:?}: {}",
                        device,
                        err.src().map(|s| s.path_string()),
                        err.error()
                    );
                    sink.finish();
                }
                gstreamer::BusSyncReply::Drop
            });
        }

        if let Err(err) = pipeline.set_state(gstreamer::State::Playing) {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(CaptureError::StreamStart(format!(
                "{}: set Playing: {}",
                self.device.path, err
            )));
        }
        log::info!("GstProducer: {:?} pipeline playing for {}", source, self.device.path);
        self.pipeline = Some(pipeline);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(pipeline) = self.pipeline.take() else {
            return Ok(());
        };
        pipeline
            .set_state(gstreamer::State::Null)
            .map_err(|err| {
                CaptureError::StreamStop(format!("{}: set Null: {}", self.device.path, err))
            })?;
        log::info!("GstProducer: pipeline stopped for {}", self.device.path);
        Ok(())
    }
}

impl Drop for GstProducer {
    fn drop(&mut self) {
        if let Err(err) = FrameProducer::stop(self) {
            log::warn!("GstProducer: stop on drop failed: {}", err);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_names_cover_every_offered_format() {
        for format in CAMERA_FORMATS.iter().chain(DISPLAY_FORMATS) {
            let name = gst_name(*format).expect("caps name");
            assert_eq!(from_gst_name(name), Some(*format));
        }
        assert_eq!(gst_name(PixelFormat::Mjpeg), None);
    }

    #[test]
    fn plane_layout_matches_frame_size() {
        for format in DISPLAY_FORMATS {
            let total: usize = plane_layout(*format, 64, 48)
                .iter()
                .map(|(row, rows)| row * rows)
                .sum();
            assert_eq!(Some(total), format.frame_size(64, 48), "{}", format);
        }
    }
}
