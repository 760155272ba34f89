//! Frame values handed to callers.
//!
//! - `PixelFormat`: the encodings the capture core understands, with their
//!   V4L2 four-character codes and fixed-size layouts.
//! - `Frame`: an owned copy of one captured image.
//!
//! A `Frame` never aliases device memory. Backends copy out of their mapped
//! buffers or queue slots before a frame reaches the caller, so the caller
//! may keep a frame for as long as it likes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

// ----------------------------------------------------------------------------
// PixelFormat
// ----------------------------------------------------------------------------

/// Four-character code as used by V4L2 and most capture frameworks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// Little-endian packed form (`v4l2_fourcc`).
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub fn from_u32(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() { b as char } else { '.' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

/// Pixel encoding of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed YUV 4:2:2, Y0 U Y1 V.
    Yuyv,
    /// Packed YUV 4:2:2, U Y0 V Y1.
    Uyvy,
    /// Y plane followed by interleaved UV at quarter resolution.
    Nv12,
    /// Planar YUV 4:2:0 (I420).
    Yuv420p,
    Rgb24,
    Bgr24,
    Rgba,
    Bgra,
    Bgrx,
    Gray8,
    Mjpeg,
    H264,
    /// Encoding reported by a device that the core has no layout for.
    Other(FourCc),
}

const FOURCC_TABLE: &[(PixelFormat, &[u8; 4])] = &[
    (PixelFormat::Yuyv, b"YUYV"),
    (PixelFormat::Uyvy, b"UYVY"),
    (PixelFormat::Nv12, b"NV12"),
    (PixelFormat::Yuv420p, b"YU12"),
    (PixelFormat::Rgb24, b"RGB3"),
    (PixelFormat::Bgr24, b"BGR3"),
    (PixelFormat::Rgba, b"AB24"),
    (PixelFormat::Bgra, b"AR24"),
    (PixelFormat::Bgrx, b"XR24"),
    (PixelFormat::Gray8, b"GREY"),
    (PixelFormat::Mjpeg, b"MJPG"),
    (PixelFormat::H264, b"H264"),
];

impl PixelFormat {
    pub fn from_fourcc(code: FourCc) -> Self {
        FOURCC_TABLE
            .iter()
            .find(|(_, c)| **c == code.0)
            .map(|(format, _)| *format)
            .unwrap_or(PixelFormat::Other(code))
    }

    pub fn fourcc(&self) -> FourCc {
        match self {
            PixelFormat::Other(code) => *code,
            known => FOURCC_TABLE
                .iter()
                .find(|(format, _)| format == known)
                .map(|(_, c)| FourCc::new(c))
                .unwrap_or(FourCc([0; 4])),
        }
    }

    /// Average bits per pixel for fixed-size encodings, `None` for
    /// compressed or unknown ones.
    pub fn bits_per_pixel(&self) -> Option<u32> {
        match self {
            PixelFormat::Yuyv | PixelFormat::Uyvy => Some(16),
            PixelFormat::Nv12 | PixelFormat::Yuv420p => Some(12),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(24),
            PixelFormat::Rgba | PixelFormat::Bgra | PixelFormat::Bgrx => Some(32),
            PixelFormat::Gray8 => Some(8),
            PixelFormat::Mjpeg | PixelFormat::H264 | PixelFormat::Other(_) => None,
        }
    }

    /// Byte length of one frame at the given resolution, for fixed-size encodings.
    pub fn frame_size(&self, width: u32, height: u32) -> Option<usize> {
        let bits = (width as u64)
            .checked_mul(height as u64)?
            .checked_mul(self.bits_per_pixel()? as u64)?;
        usize::try_from(bits / 8).ok()
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Mjpeg | PixelFormat::H264)
    }

    /// Whether the core has a layout for this encoding.
    pub fn is_known(&self) -> bool {
        !matches!(self, PixelFormat::Other(_))
    }

    fn name(&self) -> Option<&'static str> {
        Some(match self {
            PixelFormat::Yuyv => "yuyv",
            PixelFormat::Uyvy => "uyvy",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Yuv420p => "yuv420p",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Rgba => "rgba",
            PixelFormat::Bgra => "bgra",
            PixelFormat::Bgrx => "bgrx",
            PixelFormat::Gray8 => "gray8",
            PixelFormat::Mjpeg => "mjpeg",
            PixelFormat::H264 => "h264",
            PixelFormat::Other(_) => return None,
        })
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Other(code) => write!(f, "fourcc:{}", code),
            known => f.write_str(known.name().unwrap_or("unknown")),
        }
    }
}

impl FromStr for PixelFormat {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let parsed = match lowered.as_str() {
            "yuyv" | "yuyv422" | "yuy2" => PixelFormat::Yuyv,
            "uyvy" | "uyvy422" => PixelFormat::Uyvy,
            "nv12" => PixelFormat::Nv12,
            "yuv420p" | "i420" => PixelFormat::Yuv420p,
            "rgb24" | "rgb" => PixelFormat::Rgb24,
            "bgr24" | "bgr" => PixelFormat::Bgr24,
            "rgba" => PixelFormat::Rgba,
            "bgra" => PixelFormat::Bgra,
            "bgrx" | "bgr0" => PixelFormat::Bgrx,
            "gray8" | "gray" | "grey" => PixelFormat::Gray8,
            "mjpeg" | "mjpg" => PixelFormat::Mjpeg,
            "h264" => PixelFormat::H264,
            _ => {
                let raw = s.trim().as_bytes();
                if raw.len() == 4 {
                    let mut code = [0u8; 4];
                    code.copy_from_slice(raw);
                    return Ok(PixelFormat::from_fourcc(FourCc(code)));
                }
                return Err(CaptureError::InvalidConfig(format!(
                    "unknown pixel format '{}'",
                    s
                )));
            }
        };
        Ok(parsed)
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured image. Owned by the caller once retrieved.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Position in device capture order, starting at 1.
    pub sequence: u64,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            sequence: 0,
            data,
        }
    }

    /// An empty frame suitable for repeated [`Frame::refill`] calls.
    pub fn empty() -> Self {
        Self::new(0, 0, PixelFormat::Other(FourCc([0; 4])), Vec::new())
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Byte length implied by the dimensions, for fixed-size encodings.
    pub fn expected_len(&self) -> Option<usize> {
        self.format.frame_size(self.width, self.height)
    }

    /// Replace the frame contents with a copy of `bytes`.
    ///
    /// The backing buffer is only reallocated when the byte count changes.
    pub fn refill(&mut self, width: u32, height: u32, format: PixelFormat, bytes: &[u8]) {
        self.width = width;
        self.height = height;
        self.format = format;
        if self.data.len() != bytes.len() {
            self.data.resize(bytes.len(), 0);
        }
        self.data.copy_from_slice(bytes);
    }

    /// Resize the buffer to `len` bytes (only if it differs) and hand out a
    /// mutable view for a backend to copy into.
    pub(crate) fn buffer_for(&mut self, len: usize) -> &mut [u8] {
        if self.data.len() != len {
            self.data.resize(len, 0);
        }
        &mut self.data
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Pixel bytes are omitted on purpose; frames are megabytes.
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("sequence", &self.sequence)
            .field("len", &self.data.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
