//! Capture modes and frame rates negotiated with the camera.
//!
//! The discriminants are the IIDC format-0 register values, so a mode or rate can
//! be handed to a bus implementation unchanged.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use std::fmt;

use crate::{Error, Result};

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels in one frame.
    pub const fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// IIDC format-0 video modes.
///
/// The mode fixes both resolution and the packed byte layout of every frame.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CaptureMode {
    /// 160x120, YUV 4:4:4 (24 bits per pixel).
    Yuv444_160x120 = 64,
    /// 320x240, YUV 4:2:2 (16 bits per pixel).
    Yuv422_320x240 = 65,
    /// 640x480, YUV 4:1:1 (12 bits per pixel, `U Y Y V Y Y` groups).
    Yuv411_640x480 = 66,
    /// 640x480, YUV 4:2:2 (16 bits per pixel).
    Yuv422_640x480 = 67,
    /// 640x480, packed 8-bit RGB.
    Rgb8_640x480 = 68,
    /// 640x480, 8-bit intensity.
    Mono8_640x480 = 69,
    /// 640x480, 16-bit intensity.
    Mono16_640x480 = 70,
}

impl CaptureMode {
    pub const ALL: [CaptureMode; 7] = [
        CaptureMode::Yuv444_160x120,
        CaptureMode::Yuv422_320x240,
        CaptureMode::Yuv411_640x480,
        CaptureMode::Yuv422_640x480,
        CaptureMode::Rgb8_640x480,
        CaptureMode::Mono8_640x480,
        CaptureMode::Mono16_640x480,
    ];

    pub const fn size(self) -> ImageSize {
        match self {
            CaptureMode::Yuv444_160x120 => ImageSize::new(160, 120),
            CaptureMode::Yuv422_320x240 => ImageSize::new(320, 240),
            _ => ImageSize::new(640, 480),
        }
    }

    pub const fn bits_per_pixel(self) -> usize {
        match self {
            CaptureMode::Yuv444_160x120 | CaptureMode::Rgb8_640x480 => 24,
            CaptureMode::Yuv422_320x240
            | CaptureMode::Yuv422_640x480
            | CaptureMode::Mono16_640x480 => 16,
            CaptureMode::Yuv411_640x480 => 12,
            CaptureMode::Mono8_640x480 => 8,
        }
    }

    /// Size of one DMA slot for this mode.
    pub const fn frame_bytes(self) -> usize {
        self.size().area() * self.bits_per_pixel() / 8
    }
}

/// Discrete frame rates defined by IIDC.
///
/// Cameras only run at these rates; any requested rate is quantised with
/// [`FrameRate::nearest`] before negotiation.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum FrameRate {
    Fps1_875 = 32,
    Fps3_75 = 33,
    Fps7_5 = 34,
    Fps15 = 35,
    Fps30 = 36,
    Fps60 = 37,
}

impl FrameRate {
    /// All rates in ascending order.
    pub const ALL: [FrameRate; 6] = [
        FrameRate::Fps1_875,
        FrameRate::Fps3_75,
        FrameRate::Fps7_5,
        FrameRate::Fps15,
        FrameRate::Fps30,
        FrameRate::Fps60,
    ];

    pub fn as_f64(self) -> f64 {
        match self {
            FrameRate::Fps1_875 => 1.875,
            FrameRate::Fps3_75 => 3.75,
            FrameRate::Fps7_5 => 7.5,
            FrameRate::Fps15 => 15.0,
            FrameRate::Fps30 => 30.0,
            FrameRate::Fps60 => 60.0,
        }
    }

    /// The rate closest to `fps`.
    ///
    /// Rates form a doubling series, so distance is measured on a log scale. A
    /// request exactly between two rates picks the lower one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if `fps` is not a finite positive number.
    ///
    /// # Examples
    ///
    /// ```
    /// use dcam_ring::FrameRate;
    ///
    /// assert_eq!(FrameRate::nearest(30.0)?, FrameRate::Fps30);
    /// assert_eq!(FrameRate::nearest(25.0)?, FrameRate::Fps30);
    /// assert_eq!(FrameRate::nearest(100.0)?, FrameRate::Fps60);
    /// # Ok::<(), dcam_ring::Error>(())
    /// ```
    pub fn nearest(fps: f64) -> Result<FrameRate> {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(Error::InvalidConfiguration(format!(
                "Frame rate must be a positive number, got {fps}"
            )));
        }

        let target = fps.log2();
        let mut best = FrameRate::ALL[0];
        let mut best_distance = f64::INFINITY;
        for rate in FrameRate::ALL {
            let distance = (rate.as_f64().log2() - target).abs();
            if distance < best_distance {
                best = rate;
                best_distance = distance;
            }
        }
        Ok(best)
    }

    /// Time between two consecutive frames.
    pub fn period(self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.as_f64())
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} fps", self.as_f64())
    }
}
