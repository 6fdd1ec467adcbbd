//! Error types for the dcam-ring library.

use std::io;
use thiserror::Error;

use crate::{control::Feature, mode::CaptureMode};

/// Broad classification of an [`Error`].
///
/// Device errors are fatal to the session (or prevent it from being created),
/// control errors are local to one control call, usage errors indicate a bug in
/// the caller's frame checkout protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Opening, negotiating, mapping or running the capture failed.
    Device,
    /// A camera control accessor was rejected.
    Control,
    /// The caller violated the frame checkout protocol.
    Usage,
    /// The requested options are invalid before any hardware is touched.
    Configuration,
}

/// The main error type for capture operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The host bus could not be opened or enumerated.
    #[error("Host bus is unavailable: {0}")]
    BusUnavailable(String),

    /// The requested camera index does not exist on the bus.
    #[error("Camera {camera} not found ({available} camera(s) on the bus)")]
    CameraNotFound { camera: usize, available: usize },

    /// The camera cannot deliver the requested mode at the requested rate.
    #[error("Capture mode {mode:?} at {frame_rate} fps is not supported by the camera")]
    ModeUnsupported { mode: CaptureMode, frame_rate: f64 },

    /// The DMA ring buffer could not be mapped or isochronous reception could not start.
    #[error("Failed to set up DMA capture: {0}")]
    DmaSetupFailed(String),

    /// The DMA engine stopped delivering frames and no completed frame remains.
    #[error("Capture stopped: {0}")]
    CaptureStopped(String),

    /// The payload of a slot does not match the layout of the negotiated mode.
    #[error("Invalid frame data: {0}")]
    InvalidFrame(String),

    /// The camera refused a control value.
    #[error("Camera rejected {feature} = {value}: {reason}")]
    ControlRejected {
        feature: Feature,
        value: u32,
        reason: String,
    },

    /// Reading or switching a control failed.
    #[error("Camera control {feature} failed: {reason}")]
    ControlFailed { feature: Feature, reason: String },

    /// A control was addressed to a session whose capture has stopped.
    #[error("Capture session is not active")]
    SessionInactive,

    /// The released frame's slot is not checked out with that sequence number.
    ///
    /// Returned for stale handles and repeated releases.
    #[error("Slot {slot} (frame #{sequence}) is not checked out from this session")]
    FrameNotCheckedOut { slot: usize, sequence: u64 },

    /// The released frame was acquired from a different session.
    #[error("Frame belongs to a different capture session")]
    ForeignFrame,

    /// Configuration parameters are invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BusUnavailable(_)
            | Error::CameraNotFound { .. }
            | Error::ModeUnsupported { .. }
            | Error::DmaSetupFailed(_)
            | Error::CaptureStopped(_)
            | Error::InvalidFrame(_)
            | Error::Io(_) => ErrorKind::Device,
            Error::ControlRejected { .. } | Error::ControlFailed { .. } | Error::SessionInactive => {
                ErrorKind::Control
            }
            Error::FrameNotCheckedOut { .. } | Error::ForeignFrame => ErrorKind::Usage,
            Error::InvalidConfiguration(_) => ErrorKind::Configuration,
        }
    }
}
