//! Typed frame buffers.
//!
//! A [`FrameBuffer<T>`] wraps a [`RawCapture`] opened in `T`'s capture mode and
//! hands out [`VideoFrame<T>`]s. It adds no state of its own, so every raw
//! capability stays reachable through [`FrameBuffer::capture`].
//!
//! ```no_run
//! use dcam_ring::{CaptureOptions, LoopbackBus, LoopbackCamera, RgbBuffer};
//!
//! # fn main() -> dcam_ring::Result<()> {
//! let bus = LoopbackBus::builder().camera(LoopbackCamera::default()).build();
//! let options = CaptureOptions::builder(0).num_slots(4).build()?;
//!
//! let buffer = RgbBuffer::open(&bus, &options)?;
//! assert_eq!(buffer.frame_rate(), 15.0);
//!
//! let frame = buffer.get_frame()?;
//! let top_left = frame.pixels()[0];
//! println!("frame #{} starts with {top_left:?}", frame.sequence());
//! buffer.put_frame(frame)?;
//! # Ok(())
//! # }
//! ```

use std::{marker::PhantomData, time::Duration};

use crate::{
    bus::Bus,
    capture::{CaptureOptions, RawCapture},
    frames::VideoFrame,
    mode::ImageSize,
    pixel::{Pixel, Rgb8, Yuv411},
    Result,
};

/// Source of typed video frames.
///
/// Implemented by [`FrameBuffer`]; written against this trait, a consumer can
/// be handed any buffer of the same pixel type.
pub trait VideoBuffer<T: Pixel> {
    fn size(&self) -> ImageSize;

    /// Block until the next frame is available.
    fn get_frame(&self) -> Result<VideoFrame<'_, T>>;

    /// Return a frame obtained from [`get_frame`](VideoBuffer::get_frame).
    fn put_frame(&self, frame: VideoFrame<'_, T>) -> Result<()>;

    fn frame_pending(&self) -> bool;

    /// Position the stream at `time` seconds, where supported.
    fn seek_to(&self, time: f64);

    fn frame_rate(&self) -> f64;
}

/// A capture session bound to the pixel type `T`.
pub struct FrameBuffer<T: Pixel> {
    raw: RawCapture,
    _pixel: PhantomData<fn() -> T>,
}

/// 640x480 8-bit intensity at 30 fps.
pub type MonoBuffer = FrameBuffer<u8>;
/// 640x480 YUV 4:1:1 at 30 fps.
pub type Yuv411Buffer = FrameBuffer<Yuv411>;
/// 640x480 RGB at 15 fps.
pub type RgbBuffer = FrameBuffer<Rgb8>;

impl<T: Pixel> FrameBuffer<T> {
    /// Open a buffer at `T`'s default frame rate.
    pub fn open(bus: &dyn Bus, options: &CaptureOptions) -> Result<Self> {
        Self::open_with_rate(bus, options, T::DEFAULT_FRAME_RATE.as_f64())
    }

    /// Open a buffer at an explicit frame rate.
    ///
    /// # Errors
    ///
    /// Same as [`RawCapture::open`]; in particular
    /// [`Error::ModeUnsupported`](crate::Error::ModeUnsupported) if the camera
    /// cannot deliver `T`'s mode at `frame_rate`.
    pub fn open_with_rate(bus: &dyn Bus, options: &CaptureOptions, frame_rate: f64) -> Result<Self> {
        Ok(Self {
            raw: RawCapture::open(bus, options, T::MODE, frame_rate)?,
            _pixel: PhantomData,
        })
    }

    /// The underlying session, for controls, addressing and statistics.
    pub fn capture(&self) -> &RawCapture {
        &self.raw
    }

    pub fn size(&self) -> ImageSize {
        self.raw.size()
    }

    pub fn frame_rate(&self) -> f64 {
        self.raw.frame_rate()
    }

    /// Block until the next frame is available and view it as `T` pixels.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidFrame`](crate::Error::InvalidFrame) if the slot does not
    /// hold a `T` frame, or anything [`RawCapture::get_frame`] returns.
    pub fn get_frame(&self) -> Result<VideoFrame<'_, T>> {
        VideoFrame::from_raw(self.raw.get_frame()?)
    }

    /// `Ok(None)` if no frame completed within `timeout`.
    pub fn get_frame_timeout(&self, timeout: Duration) -> Result<Option<VideoFrame<'_, T>>> {
        self.raw
            .get_frame_timeout(timeout)?
            .map(VideoFrame::from_raw)
            .transpose()
    }

    pub fn try_get_frame(&self) -> Result<Option<VideoFrame<'_, T>>> {
        self.raw
            .try_get_frame()?
            .map(VideoFrame::from_raw)
            .transpose()
    }

    pub fn put_frame(&self, frame: VideoFrame<'_, T>) -> Result<()> {
        self.raw.put_frame(frame.into_raw())
    }

    pub fn frame_pending(&self) -> bool {
        self.raw.frame_pending()
    }

    /// Live streams cannot be repositioned; this does nothing.
    pub fn seek_to(&self, _time: f64) {}
}

impl<T: Pixel> VideoBuffer<T> for FrameBuffer<T> {
    fn size(&self) -> ImageSize {
        FrameBuffer::size(self)
    }

    fn get_frame(&self) -> Result<VideoFrame<'_, T>> {
        FrameBuffer::get_frame(self)
    }

    fn put_frame(&self, frame: VideoFrame<'_, T>) -> Result<()> {
        FrameBuffer::put_frame(self, frame)
    }

    fn frame_pending(&self) -> bool {
        FrameBuffer::frame_pending(self)
    }

    fn seek_to(&self, time: f64) {
        FrameBuffer::seek_to(self, time)
    }

    fn frame_rate(&self) -> f64 {
        FrameBuffer::frame_rate(self)
    }
}

impl<T: Pixel> std::fmt::Debug for FrameBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("pixel", &std::any::type_name::<T>())
            .field("capture", &self.raw)
            .finish()
    }
}
