//! Pixel types a [`FrameBuffer`](crate::FrameBuffer) can be bound to.
//!
//! The set is closed: [`Pixel`] is sealed and implemented only for `u8`
//! (8-bit intensity), [`Yuv411`] and [`Rgb8`]. Each pixel type selects exactly
//! one capture mode and a default frame rate, so binding a buffer to any other
//! type is a compile error rather than a runtime failure:
//!
//! ```compile_fail
//! use dcam_ring::{CaptureOptions, FrameBuffer, LoopbackBus};
//!
//! let bus = LoopbackBus::builder().camera(Default::default()).build();
//! let options = CaptureOptions::builder(0).build().unwrap();
//! // 16-bit samples have no packed frame type.
//! let buffer = FrameBuffer::<u16>::open(&bus, &options);
//! ```

use bytemuck::{Pod, Zeroable};

use std::fmt;

use crate::mode::{CaptureMode, FrameRate, ImageSize};

/// Sealed trait module to prevent external implementations of `Pixel`.
mod sealed {
    pub trait Sealed {}

    impl Sealed for u8 {}
    impl Sealed for super::Yuv411 {}
    impl Sealed for super::Rgb8 {}
}

/// A pixel representation that matches the packed layout of one capture mode.
///
/// # Layout
///
/// Every implementor is `Pod` with an alignment of one, so a DMA slot of the
/// associated mode can be viewed as `&[Self]` without copying. One value may
/// cover several pixels (a [`Yuv411`] group holds four).
pub trait Pixel: sealed::Sealed + Pod + fmt::Debug + Send + Sync + 'static {
    /// The hardware mode that produces this layout.
    const MODE: CaptureMode;

    /// The rate used when none is requested.
    ///
    /// Higher bit-depth colour is limited by isochronous bandwidth.
    const DEFAULT_FRAME_RATE: FrameRate;

    /// Number of pixels covered by one value.
    const PIXELS_PER_VALUE: usize;

    /// Number of values in a frame of `size`.
    fn values_per_frame(size: ImageSize) -> usize {
        size.area() / Self::PIXELS_PER_VALUE
    }

    /// Number of values in one row of `size`.
    fn values_per_row(size: ImageSize) -> usize {
        size.width as usize / Self::PIXELS_PER_VALUE
    }
}

impl Pixel for u8 {
    const MODE: CaptureMode = CaptureMode::Mono8_640x480;
    const DEFAULT_FRAME_RATE: FrameRate = FrameRate::Fps30;
    const PIXELS_PER_VALUE: usize = 1;
}

/// Four horizontally adjacent pixels in YUV 4:1:1, in camera byte order.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct Yuv411 {
    pub u: u8,
    pub y0: u8,
    pub y1: u8,
    pub v: u8,
    pub y2: u8,
    pub y3: u8,
}

impl Yuv411 {
    /// The four luma samples, left to right.
    pub fn luma(&self) -> [u8; 4] {
        [self.y0, self.y1, self.y2, self.y3]
    }
}

impl Pixel for Yuv411 {
    const MODE: CaptureMode = CaptureMode::Yuv411_640x480;
    const DEFAULT_FRAME_RATE: FrameRate = FrameRate::Fps30;
    const PIXELS_PER_VALUE: usize = 4;
}

/// An 8-bit per channel RGB pixel.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct Rgb8 {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl Rgb8 {
    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }
}

impl Pixel for Rgb8 {
    const MODE: CaptureMode = CaptureMode::Rgb8_640x480;
    const DEFAULT_FRAME_RATE: FrameRate = FrameRate::Fps15;
    const PIXELS_PER_VALUE: usize = 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    fn bytes_per_frame<T: Pixel>() -> usize {
        T::values_per_frame(T::MODE.size()) * size_of::<T>()
    }

    #[test]
    fn test_layout_matches_mode() {
        assert_eq!(bytes_per_frame::<u8>(), u8::MODE.frame_bytes());
        assert_eq!(bytes_per_frame::<Yuv411>(), Yuv411::MODE.frame_bytes());
        assert_eq!(bytes_per_frame::<Rgb8>(), Rgb8::MODE.frame_bytes());
    }

    #[test]
    fn test_alignment_is_one() {
        assert_eq!(align_of::<u8>(), 1);
        assert_eq!(align_of::<Yuv411>(), 1);
        assert_eq!(align_of::<Rgb8>(), 1);
        assert_eq!(size_of::<Yuv411>(), 6);
        assert_eq!(size_of::<Rgb8>(), 3);
    }

    #[test]
    fn test_mode_and_rate_mapping() {
        assert_eq!(u8::MODE, CaptureMode::Mono8_640x480);
        assert_eq!(u8::DEFAULT_FRAME_RATE, FrameRate::Fps30);
        assert_eq!(Yuv411::MODE, CaptureMode::Yuv411_640x480);
        assert_eq!(Yuv411::DEFAULT_FRAME_RATE, FrameRate::Fps30);
        assert_eq!(Rgb8::MODE, CaptureMode::Rgb8_640x480);
        assert_eq!(Rgb8::DEFAULT_FRAME_RATE, FrameRate::Fps15);
    }

    #[test]
    fn test_rows() {
        let size = CaptureMode::Yuv411_640x480.size();
        assert_eq!(Yuv411::values_per_row(size), 160);
        assert_eq!(Rgb8::values_per_row(size), 640);
    }

    #[test]
    fn test_yuv411_byte_order() {
        let bytes = [10u8, 1, 2, 20, 3, 4];
        let group: &[Yuv411] = bytemuck::cast_slice(&bytes);
        assert_eq!(group[0].u, 10);
        assert_eq!(group[0].v, 20);
        assert_eq!(group[0].luma(), [1, 2, 3, 4]);
    }
}
