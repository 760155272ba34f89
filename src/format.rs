//! Format requests, device capabilities and negotiation.
//!
//! A `FormatRequest` says what the caller would like; every field is
//! optional and an absent field lets the device choose. The
//! `FormatNegotiator` turns a request into the `NegotiatedFormat` the device
//! actually accepted, using the capabilities the device reports. The
//! negotiated format is fixed for the lifetime of an open device.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};
use crate::frame::PixelFormat;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CaptureError::InvalidConfig(format!("invalid resolution '{}'", s));
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        Ok(Self {
            width: w.trim().parse().map_err(|_| invalid())?,
            height: h.trim().parse().map_err(|_| invalid())?,
        })
    }
}

/// Frame rate as a ratio in frames per second (`numerator / denominator`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRate {
    pub numerator: u32,
    pub denominator: u32,
}

impl FrameRate {
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    pub const fn fps(fps: u32) -> Self {
        Self::new(fps, 1)
    }

    /// Rate in Hz, or `None` when the ratio is zero or undefined.
    pub fn as_hz(&self) -> Option<f64> {
        if self.numerator == 0 || self.denominator == 0 {
            return None;
        }
        Some(self.numerator as f64 / self.denominator as f64)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

impl FromStr for FrameRate {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CaptureError::InvalidConfig(format!("invalid frame rate '{}'", s));
        match s.trim().split_once('/') {
            Some((n, d)) => Ok(Self::new(
                n.trim().parse().map_err(|_| invalid())?,
                d.trim().parse().map_err(|_| invalid())?,
            )),
            None => Ok(Self::fps(s.trim().parse().map_err(|_| invalid())?)),
        }
    }
}

/// Top-left capture offset for display and window captures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub x: i32,
    pub y: i32,
}

// ----------------------------------------------------------------------------
// Request / negotiated format
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatRequest {
    pub resolution: Option<Resolution>,
    pub pixel_format: Option<PixelFormat>,
    pub frame_rate: Option<FrameRate>,
    /// Display/window captures only.
    pub origin: Option<Origin>,
    /// Display/window captures only.
    pub draw_mouse: Option<bool>,
}

impl FormatRequest {
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some(Resolution::new(width, height));
        self
    }

    pub fn with_pixel_format(mut self, format: PixelFormat) -> Self {
        self.pixel_format = Some(format);
        self
    }

    pub fn with_frame_rate(mut self, rate: FrameRate) -> Self {
        self.frame_rate = Some(rate);
        self
    }

    pub fn with_origin(mut self, x: i32, y: i32) -> Self {
        self.origin = Some(Origin { x, y });
        self
    }

    /// Render the request as the option dictionary handed to the decode
    /// library when it opens the device.
    pub fn to_options(&self) -> BTreeMap<String, String> {
        let mut options = BTreeMap::new();
        if let Some(resolution) = self.resolution {
            options.insert("video_size".to_string(), resolution.to_string());
        }
        if let Some(rate) = self.frame_rate {
            options.insert("framerate".to_string(), rate.to_string());
        }
        if let Some(format) = self.pixel_format {
            let key = if format.is_compressed() {
                "input_format"
            } else {
                "pixel_format"
            };
            options.insert(key.to_string(), format.to_string());
        }
        if let Some(origin) = self.origin {
            options.insert("offset_x".to_string(), origin.x.to_string());
            options.insert("offset_y".to_string(), origin.y.to_string());
        }
        if let Some(draw_mouse) = self.draw_mouse {
            options.insert("draw_mouse".to_string(), u8::from(draw_mouse).to_string());
        }
        options
    }
}

/// The format a device settled on. Immutable for the lifetime of the open
/// device; re-open to change it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedFormat {
    pub resolution: Resolution,
    pub pixel_format: PixelFormat,
    pub frame_rate: Option<FrameRate>,
    pub origin: Option<Origin>,
}

impl NegotiatedFormat {
    /// Byte length of one frame, for fixed-size encodings.
    pub fn frame_size(&self) -> Option<usize> {
        self.pixel_format
            .frame_size(self.resolution.width, self.resolution.height)
    }

    pub fn frame_rate_hz(&self) -> Option<f64> {
        self.frame_rate.and_then(|rate| rate.as_hz())
    }
}

impl fmt::Display for NegotiatedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.resolution, self.pixel_format)?;
        match self.frame_rate {
            Some(rate) => write!(f, " @ {} fps", rate),
            None => write!(f, " @ unknown fps"),
        }
    }
}

// ----------------------------------------------------------------------------
// Device capabilities
// ----------------------------------------------------------------------------

/// One frame size a device offers for an encoding, with its frame rates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SizeDescriptor {
    pub resolution: Resolution,
    pub frame_rates: Vec<FrameRate>,
}

/// One encoding a device offers. `sizes` is empty when the device only
/// reports continuous or stepwise ranges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub pixel_format: PixelFormat,
    pub sizes: Vec<SizeDescriptor>,
}

/// Capability queries a device answers at open time.
pub trait CapabilitySource {
    /// Identifier used in error messages.
    fn device_name(&self) -> String;

    /// Offered encodings in device enumeration order.
    fn formats(&mut self) -> Result<Vec<FormatDescriptor>>;

    /// The format the device is currently configured with, if it reports one.
    fn current_format(&mut self) -> Result<Option<NegotiatedFormat>>;

    /// Configure the device. Returns the format the device actually applied,
    /// which may differ from `format`.
    fn apply_format(&mut self, format: &NegotiatedFormat) -> Result<NegotiatedFormat>;
}

// ----------------------------------------------------------------------------
// Negotiation
// ----------------------------------------------------------------------------

pub struct FormatNegotiator;

impl FormatNegotiator {
    /// Query the device, pick a format for `request`, apply it, and return
    /// what the device settled on.
    pub fn negotiate(
        source: &mut dyn CapabilitySource,
        request: &FormatRequest,
    ) -> Result<NegotiatedFormat> {
        let device = source.device_name();
        let formats = source.formats()?;
        let current = source.current_format()?;
        let chosen = Self::choose(&device, &formats, current.as_ref(), request)?;

        let mut applied = source.apply_format(&chosen)?;
        if let Some(requested) = request.pixel_format {
            if applied.pixel_format != requested {
                return Err(CaptureError::FormatNegotiation(format!(
                    "{} substituted {} for requested {}",
                    device, applied.pixel_format, requested
                )));
            }
        }
        if applied.frame_rate.is_none() {
            applied.frame_rate = chosen.frame_rate;
        }
        applied.origin = request.origin;

        log::info!("FormatNegotiator: {} negotiated {}", device, applied);
        Ok(applied)
    }

    /// Pick a format from reported capabilities without touching the device.
    pub fn choose(
        device: &str,
        formats: &[FormatDescriptor],
        current: Option<&NegotiatedFormat>,
        request: &FormatRequest,
    ) -> Result<NegotiatedFormat> {
        let descriptor = Self::choose_encoding(device, formats, request)?;
        let (resolution, size) = Self::choose_size(device, descriptor, current, request)?;
        let frame_rate = Self::choose_rate(size, current, resolution, request);

        Ok(NegotiatedFormat {
            resolution,
            pixel_format: descriptor.pixel_format,
            frame_rate,
            origin: request.origin,
        })
    }

    fn choose_encoding<'a>(
        device: &str,
        formats: &'a [FormatDescriptor],
        request: &FormatRequest,
    ) -> Result<&'a FormatDescriptor> {
        if let Some(requested) = request.pixel_format {
            return formats
                .iter()
                .find(|f| f.pixel_format == requested)
                .ok_or_else(|| {
                    CaptureError::FormatNegotiation(format!(
                        "{} does not offer pixel format {}",
                        device, requested
                    ))
                });
        }
        formats
            .iter()
            .find(|f| f.pixel_format.is_known())
            .ok_or_else(|| CaptureError::device_open(device, "no supported pixel format"))
    }

    fn choose_size<'a>(
        device: &str,
        descriptor: &'a FormatDescriptor,
        current: Option<&NegotiatedFormat>,
        request: &FormatRequest,
    ) -> Result<(Resolution, Option<&'a SizeDescriptor>)> {
        let sizes = &descriptor.sizes;
        let find = |r: Resolution| sizes.iter().find(|s| s.resolution == r);

        if sizes.is_empty() {
            // Continuous/stepwise devices accept what we ask for.
            let resolution = request
                .resolution
                .or_else(|| current.map(|c| c.resolution))
                .ok_or_else(|| {
                    CaptureError::FormatNegotiation(format!(
                        "{} reports no frame sizes and no resolution was requested",
                        device
                    ))
                })?;
            return Ok((resolution, None));
        }

        if let Some(requested) = request.resolution {
            if let Some(size) = find(requested) {
                return Ok((requested, Some(size)));
            }
            let nearest = sizes
                .iter()
                .min_by_key(|s| s.resolution.pixels().abs_diff(requested.pixels()))
                .ok_or_else(|| CaptureError::FormatNegotiation("no frame sizes".to_string()))?;
            log::warn!(
                "FormatNegotiator: {} does not offer {}, using {}",
                device,
                requested,
                nearest.resolution
            );
            return Ok((nearest.resolution, Some(nearest)));
        }

        let preferred = current
            .filter(|c| c.pixel_format == descriptor.pixel_format)
            .and_then(|c| find(c.resolution));
        let size = preferred.unwrap_or(&sizes[0]);
        Ok((size.resolution, Some(size)))
    }

    fn choose_rate(
        size: Option<&SizeDescriptor>,
        current: Option<&NegotiatedFormat>,
        resolution: Resolution,
        request: &FormatRequest,
    ) -> Option<FrameRate> {
        let offered: &[FrameRate] = size.map(|s| s.frame_rates.as_slice()).unwrap_or(&[]);
        if offered.is_empty() {
            return request
                .frame_rate
                .or_else(|| current.and_then(|c| c.frame_rate));
        }
        if let Some(requested) = request.frame_rate {
            if offered.contains(&requested) {
                return Some(requested);
            }
            log::warn!(
                "FormatNegotiator: {} not offered at {}, using {}",
                requested,
                resolution,
                offered[0]
            );
            return Some(offered[0]);
        }
        current
            .and_then(|c| c.frame_rate)
            .filter(|rate| offered.contains(rate))
            .or(Some(offered[0]))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FourCc;

    fn size(width: u32, height: u32, rates: &[u32]) -> SizeDescriptor {
        SizeDescriptor {
            resolution: Resolution::new(width, height),
            frame_rates: rates.iter().map(|&r| FrameRate::fps(r)).collect(),
        }
    }

    fn webcam() -> Vec<FormatDescriptor> {
        vec![
            FormatDescriptor {
                pixel_format: PixelFormat::Other(FourCc::new(b"Y16 ")),
                sizes: vec![size(640, 480, &[30])],
            },
            FormatDescriptor {
                pixel_format: PixelFormat::Yuyv,
                sizes: vec![size(640, 480, &[30, 15]), size(1280, 720, &[10])],
            },
            FormatDescriptor {
                pixel_format: PixelFormat::Mjpeg,
                sizes: vec![size(1920, 1080, &[30])],
            },
        ]
    }

    #[test]
    fn empty_request_takes_first_supported_encoding() -> Result<()> {
        let format = FormatNegotiator::choose("cam", &webcam(), None, &FormatRequest::default())?;
        assert_eq!(format.pixel_format, PixelFormat::Yuyv);
        assert_eq!(format.resolution, Resolution::new(640, 480));
        assert_eq!(format.frame_rate, Some(FrameRate::new(30, 1)));
        Ok(())
    }

    #[test]
    fn empty_request_prefers_current_size() -> Result<()> {
        let current = NegotiatedFormat {
            resolution: Resolution::new(1280, 720),
            pixel_format: PixelFormat::Yuyv,
            frame_rate: Some(FrameRate::fps(10)),
            origin: None,
        };
        let format =
            FormatNegotiator::choose("cam", &webcam(), Some(&current), &FormatRequest::default())?;
        assert_eq!(format.resolution, Resolution::new(1280, 720));
        assert_eq!(format.frame_rate, Some(FrameRate::fps(10)));
        Ok(())
    }

    #[test]
    fn requested_encoding_must_be_offered() {
        let request = FormatRequest::default().with_pixel_format(PixelFormat::Nv12);
        let err = FormatNegotiator::choose("cam", &webcam(), None, &request).unwrap_err();
        assert!(matches!(err, CaptureError::FormatNegotiation(_)));
    }

    #[test]
    fn unknown_encodings_only_is_an_open_error() {
        let formats = vec![FormatDescriptor {
            pixel_format: PixelFormat::Other(FourCc::new(b"Y16 ")),
            sizes: vec![size(640, 480, &[30])],
        }];
        let err = FormatNegotiator::choose("cam", &formats, None, &FormatRequest::default())
            .unwrap_err();
        assert!(matches!(err, CaptureError::DeviceOpen { .. }));
    }

    #[test]
    fn unoffered_resolution_falls_back_to_nearest() -> Result<()> {
        let request = FormatRequest::default()
            .with_pixel_format(PixelFormat::Yuyv)
            .with_resolution(1024, 768)
            .with_frame_rate(FrameRate::fps(60));
        let format = FormatNegotiator::choose("cam", &webcam(), None, &request)?;
        assert_eq!(format.resolution, Resolution::new(1280, 720));
        assert_eq!(format.frame_rate, Some(FrameRate::fps(10)));
        Ok(())
    }

    #[test]
    fn stepwise_device_accepts_requested_size() -> Result<()> {
        let formats = vec![FormatDescriptor {
            pixel_format: PixelFormat::Bgrx,
            sizes: vec![],
        }];
        let request = FormatRequest::default()
            .with_resolution(2560, 1440)
            .with_origin(100, 50);
        let format = FormatNegotiator::choose("display", &formats, None, &request)?;
        assert_eq!(format.resolution, Resolution::new(2560, 1440));
        assert_eq!(format.frame_rate, None);
        assert_eq!(format.origin, Some(Origin { x: 100, y: 50 }));

        let err = FormatNegotiator::choose("display", &formats, None, &FormatRequest::default())
            .unwrap_err();
        assert!(matches!(err, CaptureError::FormatNegotiation(_)));
        Ok(())
    }

    #[test]
    fn frame_rate_hz_handles_degenerate_ratios() {
        assert_eq!(FrameRate::new(30000, 1001).as_hz().map(|hz| hz.round()), Some(30.0));
        assert_eq!(FrameRate::new(0, 1).as_hz(), None);
        assert_eq!(FrameRate::new(30, 0).as_hz(), None);
    }

    #[test]
    fn request_renders_decoder_options() {
        let mut request = FormatRequest::default()
            .with_resolution(1280, 720)
            .with_frame_rate(FrameRate::new(30, 1))
            .with_pixel_format(PixelFormat::Mjpeg)
            .with_origin(10, 20);
        request.draw_mouse = Some(false);

        let options = request.to_options();
        assert_eq!(options["video_size"], "1280x720");
        assert_eq!(options["framerate"], "30/1");
        assert_eq!(options["input_format"], "mjpeg");
        assert_eq!(options["offset_x"], "10");
        assert_eq!(options["offset_y"], "20");
        assert_eq!(options["draw_mouse"], "0");
        assert!(FormatRequest::default().to_options().is_empty());
    }

    #[test]
    fn parses_resolution_and_rate_strings() -> Result<()> {
        assert_eq!("640x480".parse::<Resolution>()?, Resolution::new(640, 480));
        assert_eq!("30000/1001".parse::<FrameRate>()?, FrameRate::new(30000, 1001));
        assert_eq!("25".parse::<FrameRate>()?, FrameRate::fps(25));
        assert!("640by480".parse::<Resolution>().is_err());
        Ok(())
    }
}
