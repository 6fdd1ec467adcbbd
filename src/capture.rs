//! The untyped capture session.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    bus::{Bus, BusHandle, NodeId},
    control::{self, CameraControl, Feature, Setting},
    dma::{DmaEngine, RingPort},
    frames::RawFrame,
    mode::{CaptureMode, FrameRate, ImageSize},
    ring::{CaptureStats, Ring},
    Error, Result,
};

/// Slots mapped when no count is requested.
pub const DEFAULT_NUM_SLOTS: usize = 4;

/// Below this many slots the engine overruns as soon as the consumer holds a
/// frame for longer than one period.
const MIN_COMFORTABLE_SLOTS: usize = 3;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Parameters for opening a capture session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Index into the bus's camera enumeration.
    pub camera: usize,
    /// Number of DMA ring slots.
    pub num_slots: usize,
    pub brightness: Setting,
    pub exposure: Setting,
}

impl CaptureOptions {
    /// Create a builder for the camera at index `camera`.
    pub fn builder(camera: usize) -> CaptureOptionsBuilder {
        CaptureOptionsBuilder::new(camera)
    }
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            camera: 0,
            num_slots: DEFAULT_NUM_SLOTS,
            brightness: Setting::Auto,
            exposure: Setting::Auto,
        }
    }
}

/// Builder for [`CaptureOptions`].
#[derive(Debug, Clone)]
pub struct CaptureOptionsBuilder {
    camera: usize,
    num_slots: Option<usize>,
    brightness: Option<Setting>,
    exposure: Option<Setting>,
}

impl CaptureOptionsBuilder {
    pub fn new(camera: usize) -> Self {
        CaptureOptionsBuilder {
            camera,
            num_slots: None,
            brightness: None,
            exposure: None,
        }
    }

    /// Number of frames the DMA ring can hold.
    pub fn num_slots(mut self, num_slots: usize) -> Self {
        self.num_slots = Some(num_slots);
        self
    }

    /// Initial brightness. Accepts a [`Setting`] or a raw `i32` where `-1`
    /// means automatic.
    pub fn brightness(mut self, setting: impl Into<Setting>) -> Self {
        self.brightness = Some(setting.into());
        self
    }

    /// Initial exposure. Accepts a [`Setting`] or a raw `i32` where `-1`
    /// means automatic.
    pub fn exposure(mut self, setting: impl Into<Setting>) -> Self {
        self.exposure = Some(setting.into());
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] for a ring of zero slots.
    pub fn build(self) -> Result<CaptureOptions> {
        let num_slots = self.num_slots.unwrap_or(DEFAULT_NUM_SLOTS);
        if num_slots == 0 {
            return Err(Error::InvalidConfiguration(
                "A capture ring needs at least one slot".into(),
            ));
        }

        Ok(CaptureOptions {
            camera: self.camera,
            num_slots,
            brightness: self.brightness.unwrap_or_default(),
            exposure: self.exposure.unwrap_or_default(),
        })
    }
}

/// A live capture session on one camera.
///
/// Frames are captured into a ring of DMA slots as soon as the session opens.
/// [`get_frame`](Self::get_frame) hands them out in capture order as borrowed
/// [`RawFrame`]s; each must go back through [`put_frame`](Self::put_frame) (or be
/// dropped) before its slot can be refilled. While every slot is filled or held,
/// the engine drops incoming frames and counts them in [`stats`](Self::stats).
///
/// The session is `Send + Sync`: one thread may block in `get_frame` while
/// another returns frames or adjusts controls. Dropping the session stops
/// reception and releases the mapping and channel.
pub struct RawCapture {
    id: u64,
    handle: BusHandle,
    node: NodeId,
    mode: CaptureMode,
    size: ImageSize,
    frame_rate: FrameRate,
    channel: u8,
    ring: Arc<Ring>,
    engine: Mutex<Box<dyn DmaEngine>>,
    control: Mutex<Box<dyn CameraControl>>,
}

impl RawCapture {
    /// Open camera `options.camera` on `bus` in `mode` at (the nearest supported
    /// step to) `frame_rate` frames per second, and start reception.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidConfiguration`] for an empty ring or an unusable rate.
    /// * [`Error::BusUnavailable`] if the bus cannot enumerate cameras.
    /// * [`Error::CameraNotFound`] if the camera index does not exist.
    /// * [`Error::ModeUnsupported`] if the camera cannot deliver the mode at that rate.
    /// * [`Error::ControlRejected`] if the initial brightness or exposure is refused.
    /// * [`Error::DmaSetupFailed`] if the ring cannot be mapped or reception cannot start.
    ///
    /// Everything acquired before the failure is released.
    pub fn open(
        bus: &dyn Bus,
        options: &CaptureOptions,
        mode: CaptureMode,
        frame_rate: f64,
    ) -> Result<Self> {
        if options.num_slots == 0 {
            return Err(Error::InvalidConfiguration(
                "A capture ring needs at least one slot".into(),
            ));
        }
        if options.num_slots < MIN_COMFORTABLE_SLOTS {
            warn!(
                num_slots = options.num_slots,
                "small capture ring, frames will be dropped while one is held"
            );
        }

        let requested = FrameRate::nearest(frame_rate)?;
        if requested.as_f64() != frame_rate {
            warn!(frame_rate, quantised = %requested, "frame rate quantised");
        }

        let cameras = bus.cameras()?;
        let node = *cameras.get(options.camera).ok_or(Error::CameraNotFound {
            camera: options.camera,
            available: cameras.len(),
        })?;

        let negotiated = bus.negotiate(node, mode, requested)?;
        if negotiated.mode != mode {
            return Err(Error::ModeUnsupported {
                mode,
                frame_rate: requested.as_f64(),
            });
        }

        let mut control = bus.control(node)?;
        control::apply(control.as_mut(), Feature::Brightness, options.brightness)?;
        control::apply(control.as_mut(), Feature::Exposure, options.exposure)?;

        let mapping = bus.map_dma(node, &negotiated, options.num_slots)?;
        let expected_bytes = negotiated.mode.frame_bytes();
        if mapping.region.num_slots() != options.num_slots
            || mapping.region.slot_bytes() != expected_bytes
        {
            return Err(Error::DmaSetupFailed(format!(
                "Bus mapped {} slots of {} bytes, expected {} slots of {expected_bytes} bytes",
                mapping.region.num_slots(),
                mapping.region.slot_bytes(),
                options.num_slots,
            )));
        }

        let ring = Arc::new(Ring::new(mapping.region));
        let mut engine = mapping.engine;
        engine.start(RingPort::new(Arc::clone(&ring)))?;

        let capture = RawCapture {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            handle: bus.handle(),
            node,
            mode: negotiated.mode,
            size: negotiated.mode.size(),
            frame_rate: negotiated.frame_rate,
            channel: negotiated.channel,
            ring,
            engine: Mutex::new(engine),
            control: Mutex::new(control),
        };

        info!(
            session = capture.id,
            node = %capture.node,
            mode = ?capture.mode,
            frame_rate = %capture.frame_rate,
            channel = capture.channel,
            num_slots = options.num_slots,
            "capture started"
        );

        Ok(capture)
    }

    pub fn size(&self) -> ImageSize {
        self.size
    }

    /// The negotiated rate in frames per second.
    pub fn frame_rate(&self) -> f64 {
        self.frame_rate.as_f64()
    }

    pub fn negotiated_rate(&self) -> FrameRate {
        self.frame_rate
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub fn num_slots(&self) -> usize {
        self.ring.region().num_slots()
    }

    /// Isochronous channel the camera transmits on.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn handle(&self) -> BusHandle {
        self.handle
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Block until the next frame in capture order is available.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CaptureStopped`] once the engine has failed and every
    /// frame it completed has been handed out.
    pub fn get_frame(&self) -> Result<RawFrame<'_>> {
        loop {
            if let Some(frame) = self.acquire(None)? {
                return Ok(frame);
            }
        }
    }

    /// Like [`get_frame`](Self::get_frame), but gives up after `timeout`.
    ///
    /// `Ok(None)` means no frame completed in time.
    pub fn get_frame_timeout(&self, timeout: Duration) -> Result<Option<RawFrame<'_>>> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.acquire(Some(deadline)),
            None => self.get_frame().map(Some),
        }
    }

    /// Take the next frame if one is already waiting.
    pub fn try_get_frame(&self) -> Result<Option<RawFrame<'_>>> {
        self.acquire(Some(Instant::now()))
    }

    fn acquire(&self, deadline: Option<Instant>) -> Result<Option<RawFrame<'_>>> {
        Ok(self
            .ring
            .wait_for_frame(deadline)?
            .map(|completion| RawFrame::new(&self.ring, self.id, completion, self.size)))
    }

    /// Return a frame's slot to the hardware.
    ///
    /// # Errors
    ///
    /// * [`Error::ForeignFrame`] if `frame` came from another session. The frame
    ///   is then returned to its own session.
    /// * [`Error::FrameNotCheckedOut`] if its slot is no longer checked out
    ///   under that sequence number.
    pub fn put_frame(&self, frame: RawFrame<'_>) -> Result<()> {
        if frame.session() != self.id {
            warn!(
                session = self.id,
                owner = frame.session(),
                sequence = frame.sequence(),
                "frame returned to the wrong session"
            );
            return Err(Error::ForeignFrame);
        }
        frame.release()
    }

    /// Whether a completed frame is waiting to be handed out.
    pub fn frame_pending(&self) -> bool {
        self.ring.frame_pending()
    }

    pub fn stats(&self) -> CaptureStats {
        self.ring.stats()
    }

    pub fn shutter(&self) -> Result<u32> {
        self.get_control(Feature::Shutter)
    }

    pub fn set_shutter(&self, value: u32) -> Result<()> {
        self.set_control(Feature::Shutter, value)
    }

    pub fn iris(&self) -> Result<u32> {
        self.get_control(Feature::Iris)
    }

    pub fn set_iris(&self, value: u32) -> Result<()> {
        self.set_control(Feature::Iris, value)
    }

    pub fn gain(&self) -> Result<u32> {
        self.get_control(Feature::Gain)
    }

    pub fn set_gain(&self, value: u32) -> Result<()> {
        self.set_control(Feature::Gain, value)
    }

    pub fn exposure(&self) -> Result<u32> {
        self.get_control(Feature::Exposure)
    }

    pub fn set_exposure(&self, value: u32) -> Result<()> {
        self.set_control(Feature::Exposure, value)
    }

    pub fn brightness(&self) -> Result<u32> {
        self.get_control(Feature::Brightness)
    }

    pub fn set_brightness(&self, value: u32) -> Result<()> {
        self.set_control(Feature::Brightness, value)
    }

    /// Hand `feature` back to the camera's automatic regulation.
    pub fn set_auto(&self, feature: Feature) -> Result<()> {
        self.active_control()?.set_auto(feature)
    }

    fn get_control(&self, feature: Feature) -> Result<u32> {
        self.active_control()?.get(feature)
    }

    fn set_control(&self, feature: Feature, value: u32) -> Result<()> {
        self.active_control()?.set(feature, value)?;
        debug!(session = self.id, %feature, value, "control updated");
        Ok(())
    }

    fn active_control(&self) -> Result<MutexGuard<'_, Box<dyn CameraControl>>> {
        if self.ring.is_stopped() {
            return Err(Error::SessionInactive);
        }
        Ok(self
            .control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

impl Drop for RawCapture {
    fn drop(&mut self) {
        self.engine
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .stop();
        self.ring.close();
        let stats = self.ring.stats();
        info!(
            session = self.id,
            captured = stats.captured,
            dropped = stats.dropped,
            delivered = stats.delivered,
            "capture closed"
        );
    }
}

impl fmt::Debug for RawCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawCapture")
            .field("session", &self.id)
            .field("handle", &self.handle)
            .field("node", &self.node)
            .field("mode", &self.mode)
            .field("frame_rate", &self.frame_rate)
            .field("channel", &self.channel)
            .field("num_slots", &self.num_slots())
            .finish()
    }
}
