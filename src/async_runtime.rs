//! Async runtime integration for Tokio.
//!
//! Acquisition is inherently blocking (`get_frame` waits on the DMA engine), so
//! these wrappers run it on Tokio's blocking pool with `spawn_blocking` and hand
//! back [`OwnedFrame`](crate::OwnedFrame)s: a borrowed frame cannot cross the task boundary, so the
//! pixels are copied and the slot is returned before the future resolves.
//!
//! # Features
//!
//! - `tokio` - Enable Tokio runtime support

#[cfg(feature = "tokio")]
pub mod tokio {
    //! Tokio async runtime integration.
    //!
    //! Provides [`AsyncFrameBuffer`], which uses `tokio::task::spawn_blocking` to
    //! wait for frames without blocking the Tokio runtime.

    use std::{io, sync::Arc, time::Duration};

    use crate::{buffer::FrameBuffer, frames::OwnedFrame, pixel::Pixel, Error, Result};

    fn copy_out<T: Pixel>(
        buffer: &FrameBuffer<T>,
        timeout: Option<Duration>,
    ) -> Result<Option<OwnedFrame<T>>> {
        let frame = match timeout {
            Some(timeout) => buffer.get_frame_timeout(timeout)?,
            None => Some(buffer.get_frame()?),
        };

        frame
            .map(|frame| {
                let owned = frame.to_owned();
                buffer.put_frame(frame)?;
                Ok(owned)
            })
            .transpose()
    }

    fn join_failed(e: ::tokio::task::JoinError) -> Error {
        Error::Io(io::Error::other(e))
    }

    /// Async frame buffer wrapper for Tokio runtime.
    ///
    /// # Thread Safety
    ///
    /// The underlying [`FrameBuffer`] is wrapped in an `Arc` so clones can be
    /// shared across tasks. Frames are delivered to concurrent callers in
    /// capture order.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # #[cfg(feature = "tokio")]
    /// # {
    /// use dcam_ring::{tokio::AsyncFrameBuffer, CaptureOptions, LoopbackBus, LoopbackCamera, MonoBuffer};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), dcam_ring::Error> {
    ///     let bus = LoopbackBus::builder().camera(LoopbackCamera::default()).build();
    ///     let options = CaptureOptions::builder(0).build()?;
    ///     let buffer = AsyncFrameBuffer::new(MonoBuffer::open(&bus, &options)?);
    ///
    ///     let frame = buffer.next_frame().await?;
    ///     println!("frame #{} ({})", frame.sequence, frame.size);
    ///     Ok(())
    /// }
    /// # }
    /// ```
    pub struct AsyncFrameBuffer<T: Pixel> {
        inner: Arc<FrameBuffer<T>>,
    }

    impl<T: Pixel> AsyncFrameBuffer<T> {
        pub fn new(buffer: FrameBuffer<T>) -> Self {
            Self {
                inner: Arc::new(buffer),
            }
        }

        /// The wrapped buffer, for controls and statistics.
        pub fn buffer(&self) -> &FrameBuffer<T> {
            &self.inner
        }

        /// Wait for the next frame and copy it out.
        ///
        /// # Errors
        ///
        /// Whatever [`FrameBuffer::get_frame`] returns, or [`Error::Io`] if the
        /// blocking task panicked.
        pub async fn next_frame(&self) -> Result<OwnedFrame<T>> {
            let buffer = Arc::clone(&self.inner);
            let frame = ::tokio::task::spawn_blocking(move || copy_out(&buffer, None))
                .await
                .map_err(join_failed)??;
            frame.ok_or_else(|| Error::CaptureStopped("no frame delivered".into()))
        }

        /// Like [`next_frame`](Self::next_frame), but resolves to `Ok(None)`
        /// if no frame completes within `timeout`.
        pub async fn next_frame_timeout(&self, timeout: Duration) -> Result<Option<OwnedFrame<T>>> {
            let buffer = Arc::clone(&self.inner);
            ::tokio::task::spawn_blocking(move || copy_out(&buffer, Some(timeout)))
                .await
                .map_err(join_failed)?
        }

        pub fn frame_pending(&self) -> bool {
            self.inner.frame_pending()
        }
    }

    impl<T: Pixel> Clone for AsyncFrameBuffer<T> {
        fn clone(&self) -> Self {
            Self {
                inner: Arc::clone(&self.inner),
            }
        }
    }
}
