//! The host bus a camera is reached through.
//!
//! A [`Bus`] enumerates cameras, negotiates a video mode, maps the DMA ring and
//! hands out control access. [`RawCapture`](crate::RawCapture) drives it once,
//! during construction, and afterwards only keeps the [`BusHandle`] and
//! [`NodeId`] for collaborators that need to address the same device.

use std::fmt;

use crate::{
    control::CameraControl,
    dma::DmaMapping,
    mode::{CaptureMode, FrameRate},
    Result,
};

/// Opaque identifier of an open bus connection.
///
/// Stored and forwarded, never interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusHandle(u64);

impl BusHandle {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// Address of a device on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u16);

impl NodeId {
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {:#06x}", self.0)
    }
}

/// The outcome of mode negotiation. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub mode: CaptureMode,
    pub frame_rate: FrameRate,
    /// Isochronous channel the camera transmits on.
    pub channel: u8,
}

/// Host bus access used to open a capture session.
///
/// # Errors
///
/// Implementations report failures with the device-kind errors:
/// [`Error::BusUnavailable`](crate::Error::BusUnavailable) from [`Bus::cameras`],
/// [`Error::ModeUnsupported`](crate::Error::ModeUnsupported) from [`Bus::negotiate`]
/// and [`Error::DmaSetupFailed`](crate::Error::DmaSetupFailed) from [`Bus::map_dma`].
pub trait Bus: Send + Sync {
    fn handle(&self) -> BusHandle;

    /// Camera nodes in enumeration order; camera `0` is the first entry.
    fn cameras(&self) -> Result<Vec<NodeId>>;

    /// Check that `node` can deliver `mode` at `frame_rate` and pick the
    /// isochronous channel it will transmit on.
    fn negotiate(&self, node: NodeId, mode: CaptureMode, frame_rate: FrameRate)
        -> Result<Negotiated>;

    /// Map a ring of `num_slots` frame-sized slots for the negotiated stream.
    ///
    /// Dropping the returned mapping must release everything acquired here, so a
    /// session that fails later can unwind by dropping it.
    fn map_dma(&self, node: NodeId, negotiated: &Negotiated, num_slots: usize)
        -> Result<DmaMapping>;

    fn control(&self, node: NodeId) -> Result<Box<dyn CameraControl>>;
}
