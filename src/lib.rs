//! Typed frame acquisition from IIDC cameras over a DMA ring buffer.
//!
//! A camera on an isochronous bus streams frames into a fixed ring of DMA
//! slots. This crate turns that ring into a small, safe API: open a session,
//! take frames out in capture order, give them back so the hardware can reuse
//! their slots.
//!
//! # Quick Start
//!
//! ```
//! use dcam_ring::{CaptureOptions, Clock, LoopbackBus, LoopbackCamera, MonoBuffer};
//!
//! # fn main() -> Result<(), dcam_ring::Error> {
//! // A simulated bus with one manually clocked camera.
//! let bus = LoopbackBus::builder()
//!     .camera(LoopbackCamera::builder().clock(Clock::Manual).build())
//!     .build();
//!
//! let options = CaptureOptions::builder(0).num_slots(4).build()?;
//! let buffer = MonoBuffer::open(&bus, &options)?;
//! assert_eq!(buffer.frame_rate(), 30.0);
//!
//! bus.trigger(0)?;
//! let frame = buffer.get_frame()?;
//! assert_eq!(frame.pixels().len(), 640 * 480);
//! buffer.put_frame(frame)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Core Concepts
//!
//! ## Sessions
//!
//! [`RawCapture`] is one capture session: it negotiates a [`CaptureMode`] and
//! [`FrameRate`] with the camera through a [`Bus`], maps the ring, applies the
//! initial controls and starts reception. Frames are handed out as
//! [`RawFrame`]s that borrow the session, so a session can never be closed
//! while one of its frames is still in use.
//!
//! ## Typed buffers
//!
//! [`FrameBuffer<T>`] binds a session to a [`Pixel`] type: `u8` intensity,
//! [`Yuv411`] or [`Rgb8`]. The pixel type picks the mode and the default rate,
//! and frames come back as [`VideoFrame<T>`] views over the DMA memory.
//!
//! ## Ordering
//!
//! Frames are delivered in the order they were captured, even when slots are
//! returned out of order and the hardware refills them out of physical order.
//!
//! # Thread Safety
//!
//! [`RawCapture`] and [`FrameBuffer`] are `Send + Sync`. One thread may block in
//! `get_frame` while others return frames, poll `frame_pending` or change
//! controls.
//!
//! # Features
//!
//! - `tokio` - async frame acquisition via `tokio::AsyncFrameBuffer`

#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

// Internal modules
mod async_runtime;
mod error;
mod ring;

// Public modules
pub mod buffer;
pub mod bus;
pub mod capture;
pub mod control;
pub mod dma;
pub mod frames;
pub mod loopback;
pub mod mode;
pub mod pixel;

// Re-exports
pub use {
    buffer::{FrameBuffer, MonoBuffer, RgbBuffer, VideoBuffer, Yuv411Buffer},
    bus::{Bus, BusHandle, Negotiated, NodeId},
    capture::{CaptureOptions, CaptureOptionsBuilder, RawCapture, DEFAULT_NUM_SLOTS},
    control::{CameraControl, Feature, Setting},
    dma::{DmaEngine, DmaMapping, DmaRegion, RingPort, SlotFill},
    error::*,
    frames::{OwnedFrame, RawFrame, VideoFrame},
    loopback::{frame_counter, Clock, LoopbackBus, LoopbackBusBuilder, LoopbackCamera},
    mode::{CaptureMode, FrameRate, ImageSize},
    pixel::{Pixel, Rgb8, Yuv411},
    ring::CaptureStats,
};

#[cfg(feature = "tokio")]
pub use async_runtime::tokio;

/// Alias for Result with our Error type
pub type Result<T> = std::result::Result<T, crate::error::Error>;
