//! Frames handed out by a capture session.
//!
//! [`RawFrame`] and [`VideoFrame`] are borrowed views of a DMA slot: no pixel is
//! copied, and the slot stays checked out (ineligible for refill) until the frame
//! is passed to `put_frame` or dropped. Both carry the lifetime of the session
//! they came from, so a frame can never outlive its session:
//!
//! ```compile_fail
//! use dcam_ring::{CaptureOptions, Clock, LoopbackBus, LoopbackCamera, MonoBuffer};
//!
//! let bus = LoopbackBus::builder()
//!     .camera(LoopbackCamera::builder().clock(Clock::Manual).build())
//!     .build();
//! let options = CaptureOptions::builder(0).build().unwrap();
//!
//! let frame = {
//!     let buffer = MonoBuffer::open(&bus, &options).unwrap();
//!     bus.trigger(0).unwrap();
//!     buffer.get_frame().unwrap()
//!     // buffer is dropped here
//! };
//! println!("{:?}", frame.sequence());
//! ```
//!
//! and `put_frame` consumes the frame, so one frame cannot be released twice:
//!
//! ```compile_fail
//! use dcam_ring::{CaptureOptions, Clock, LoopbackBus, LoopbackCamera, MonoBuffer};
//!
//! let bus = LoopbackBus::builder()
//!     .camera(LoopbackCamera::builder().clock(Clock::Manual).build())
//!     .build();
//! let options = CaptureOptions::builder(0).build().unwrap();
//! let buffer = MonoBuffer::open(&bus, &options).unwrap();
//! bus.trigger(0).unwrap();
//!
//! let frame = buffer.get_frame().unwrap();
//! buffer.put_frame(frame).unwrap();
//! buffer.put_frame(frame).unwrap();
//! ```

use std::{fmt, time::SystemTime};

use tracing::warn;

use crate::{
    mode::ImageSize,
    pixel::Pixel,
    ring::{Completion, Ring},
    Error, Result,
};

/// An untyped frame checked out of a session's ring.
///
/// The slot is returned to the hardware by
/// [`RawCapture::put_frame`](crate::RawCapture::put_frame), or automatically
/// when the frame is dropped.
pub struct RawFrame<'a> {
    ring: &'a Ring,
    session: u64,
    completion: Completion,
    size: ImageSize,
    data: &'a [u8],
    released: bool,
}

impl<'a> RawFrame<'a> {
    pub(crate) fn new(ring: &'a Ring, session: u64, completion: Completion, size: ImageSize) -> Self {
        // SAFETY: the slot is checked out, so the engine will not write it until
        // this frame releases it, and `ring` outlives 'a.
        let data = unsafe { ring.region().slot(completion.slot) };
        Self {
            ring,
            session,
            completion,
            size,
            data,
            released: false,
        }
    }

    /// The slot's bytes in the packed layout of the negotiated mode.
    pub fn data(&self) -> &[u8] {
        self.data
    }

    pub fn size(&self) -> ImageSize {
        self.size
    }

    /// When the DMA fill of this frame completed.
    pub fn timestamp(&self) -> SystemTime {
        self.completion.timestamp
    }

    /// Capture order of this frame within its session, starting at zero.
    pub fn sequence(&self) -> u64 {
        self.completion.sequence
    }

    /// Physical ring slot holding this frame.
    pub fn slot(&self) -> usize {
        self.completion.slot
    }

    pub(crate) fn session(&self) -> u64 {
        self.session
    }

    /// Return the slot to the hardware.
    pub(crate) fn release(mut self) -> Result<()> {
        self.released = true;
        self.ring
            .release(self.completion.slot, self.completion.sequence)
    }
}

impl Drop for RawFrame<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self
            .ring
            .release(self.completion.slot, self.completion.sequence)
        {
            warn!(
                slot = self.completion.slot,
                sequence = self.completion.sequence,
                error = %e,
                "failed to release dropped frame"
            );
        }
    }
}

impl fmt::Debug for RawFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("size", &self.size)
            .field("sequence", &self.completion.sequence)
            .field("slot", &self.completion.slot)
            .field("timestamp", &self.completion.timestamp)
            .field("data (bytes)", &self.data.len())
            .finish()
    }
}

/// A frame viewed as pixels of type `T`.
///
/// Built from a [`RawFrame`] by checking that the payload has exactly the
/// length and alignment of a `T` frame of the negotiated size.
pub struct VideoFrame<'a, T: Pixel> {
    raw: RawFrame<'a>,
    pixels: &'a [T],
}

impl<'a, T: Pixel> VideoFrame<'a, T> {
    /// Reinterpret `raw` as `T` pixels.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFrame`] if the payload does not hold exactly one
    /// frame of `T` at `raw.size()`. The slot is released in that case.
    pub fn from_raw(raw: RawFrame<'a>) -> Result<Self> {
        let expected = T::values_per_frame(raw.size);
        let pixels: &'a [T] = bytemuck::try_cast_slice(raw.data).map_err(|e| {
            Error::InvalidFrame(format!(
                "Cannot view {} bytes as {}: {e}",
                raw.data.len(),
                std::any::type_name::<T>()
            ))
        })?;

        if pixels.len() != expected {
            return Err(Error::InvalidFrame(format!(
                "Frame {} holds {} values of {}, expected {expected}",
                raw.size,
                pixels.len(),
                std::any::type_name::<T>()
            )));
        }

        Ok(Self { raw, pixels })
    }

    /// Give up the typed view.
    pub fn into_raw(self) -> RawFrame<'a> {
        self.raw
    }

    pub fn pixels(&self) -> &[T] {
        self.pixels
    }

    /// Iterate over image rows, top to bottom.
    pub fn rows(&self) -> impl Iterator<Item = &[T]> + '_ {
        self.pixels.chunks_exact(T::values_per_row(self.raw.size))
    }

    pub fn size(&self) -> ImageSize {
        self.raw.size()
    }

    pub fn timestamp(&self) -> SystemTime {
        self.raw.timestamp()
    }

    pub fn sequence(&self) -> u64 {
        self.raw.sequence()
    }

    pub fn slot(&self) -> usize {
        self.raw.slot()
    }

    /// Copy the pixels out so the slot can be returned immediately.
    pub fn to_owned(&self) -> OwnedFrame<T> {
        OwnedFrame {
            size: self.size(),
            timestamp: self.timestamp(),
            sequence: self.sequence(),
            pixels: self.pixels.to_vec(),
        }
    }
}

impl<T: Pixel> fmt::Debug for VideoFrame<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("pixel", &std::any::type_name::<T>())
            .field("size", &self.size())
            .field("sequence", &self.sequence())
            .field("slot", &self.slot())
            .field("timestamp", &self.timestamp())
            .field("pixels", &self.pixels.len())
            .finish()
    }
}

/// A frame copied out of the ring. It holds no slot.
#[derive(Clone, PartialEq, Eq)]
pub struct OwnedFrame<T: Pixel> {
    pub size: ImageSize,
    pub timestamp: SystemTime,
    pub sequence: u64,
    pub pixels: Vec<T>,
}

impl<T: Pixel> OwnedFrame<T> {
    pub fn rows(&self) -> impl Iterator<Item = &[T]> + '_ {
        self.pixels.chunks_exact(T::values_per_row(self.size))
    }
}

impl<T: Pixel> fmt::Debug for OwnedFrame<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedFrame")
            .field("pixel", &std::any::type_name::<T>())
            .field("size", &self.size)
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("pixels", &self.pixels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dma::{DmaRegion, RingPort},
        pixel::{Rgb8, Yuv411},
    };
    use std::sync::Arc;

    const SIZE: ImageSize = ImageSize::new(8, 2);

    fn ring_with_frame(slot_bytes: usize) -> Arc<Ring> {
        let ring = Arc::new(Ring::new(DmaRegion::allocate(2, slot_bytes).unwrap()));
        let port = RingPort::new(Arc::clone(&ring));
        let mut fill = port.begin_fill().unwrap();
        for (i, byte) in fill.data_mut().iter_mut().enumerate() {
            *byte = i as u8;
        }
        fill.commit(SystemTime::now());
        ring
    }

    fn check_out(ring: &Ring) -> RawFrame<'_> {
        let completion = ring.wait_for_frame(None).unwrap().unwrap();
        RawFrame::new(ring, 1, completion, SIZE)
    }

    #[test]
    fn test_typed_view_of_rgb() {
        let ring = ring_with_frame(SIZE.area() * 3);
        let frame = VideoFrame::<Rgb8>::from_raw(check_out(&ring)).unwrap();
        assert_eq!(frame.pixels().len(), 16);
        assert_eq!(frame.pixels()[1], Rgb8::new(3, 4, 5));
        assert_eq!(frame.rows().count(), 2);
        assert!(frame.rows().all(|row| row.len() == 8));
    }

    #[test]
    fn test_typed_view_of_yuv411() {
        let ring = ring_with_frame(SIZE.area() * 3 / 2);
        let frame = VideoFrame::<Yuv411>::from_raw(check_out(&ring)).unwrap();
        assert_eq!(frame.pixels().len(), 4);
        assert_eq!(frame.rows().next().unwrap().len(), 2);
        assert_eq!(frame.pixels()[0].luma(), [1, 2, 4, 5]);
    }

    #[test]
    fn test_layout_mismatch_is_rejected_and_released() {
        // A mono-sized slot cannot be an RGB frame.
        let ring = ring_with_frame(SIZE.area());
        match VideoFrame::<Rgb8>::from_raw(check_out(&ring)) {
            Err(Error::InvalidFrame(msg)) => assert!(msg.contains("Cannot view")),
            other => panic!("Expected InvalidFrame, got {other:?}"),
        }
        assert_eq!(ring.stats().checked_out, 0);
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        // Divisible by 3 but one pixel short of a full frame.
        let ring = ring_with_frame((SIZE.area() - 1) * 3);
        match VideoFrame::<Rgb8>::from_raw(check_out(&ring)) {
            Err(Error::InvalidFrame(msg)) => assert!(msg.contains("expected 16")),
            other => panic!("Expected InvalidFrame, got {other:?}"),
        };
    }

    #[test]
    fn test_drop_releases_slot() {
        let ring = ring_with_frame(SIZE.area());
        let frame = check_out(&ring);
        assert_eq!(ring.stats().checked_out, 1);
        drop(frame);
        assert_eq!(ring.stats().checked_out, 0);
    }

    #[test]
    fn test_to_owned_detaches_from_ring() {
        let ring = ring_with_frame(SIZE.area());
        let owned = {
            let frame = VideoFrame::<u8>::from_raw(check_out(&ring)).unwrap();
            frame.to_owned()
        };
        assert_eq!(ring.stats().checked_out, 0);
        assert_eq!(owned.pixels.len(), 16);
        assert_eq!(owned.pixels[15], 15);
        assert_eq!(owned.sequence, 0);
        assert_eq!(owned.rows().count(), 2);
    }
}
