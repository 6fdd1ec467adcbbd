//! An in-process bus with simulated cameras.
//!
//! [`LoopbackBus`] implements [`Bus`] without hardware: each camera "transmits"
//! by writing a test pattern into the session's ring, either from a background
//! thread at the negotiated rate ([`Clock::FreeRunning`]) or one frame per
//! [`LoopbackBus::trigger`] call ([`Clock::Manual`]). It also injects the
//! failures a real bus produces, so sessions can be exercised end to end.
//!
//! Every frame starts with the camera's frame counter as a little-endian `u64`
//! (see [`frame_counter`]); the remaining bytes hold the counter's low byte.
//! The counter advances on every tick, including ticks dropped because the ring
//! was full.

use std::{
    collections::HashMap,
    ops::RangeInclusive,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use tracing::{debug, trace, warn};

use crate::{
    bus::{Bus, BusHandle, Negotiated, NodeId},
    control::{CameraControl, Feature, Setting},
    dma::{DmaEngine, DmaMapping, DmaRegion, RingPort},
    mode::{CaptureMode, FrameRate},
    Error, Result,
};

static NEXT_BUS_HANDLE: AtomicU64 = AtomicU64::new(1);

/// First node id handed out on the local bus.
const LOCAL_NODE_BASE: u16 = 0xffc0;

const COUNTER_BYTES: usize = 8;

/// Read the frame counter a loopback camera stamped into `data`.
pub fn frame_counter(data: &[u8]) -> Option<u64> {
    let header: [u8; COUNTER_BYTES] = data.get(..COUNTER_BYTES)?.try_into().ok()?;
    Some(u64::from_le_bytes(header))
}

fn write_pattern(data: &mut [u8], counter: u64) {
    let fill = counter as u8;
    data.fill(fill);
    let header = counter.to_le_bytes();
    let len = header.len().min(data.len());
    data[..len].copy_from_slice(&header[..len]);
}

/// When a loopback camera produces frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Clock {
    /// A background thread fills one slot per frame period.
    #[default]
    FreeRunning,
    /// Frames are produced only by [`LoopbackBus::trigger`].
    Manual,
}

/// Configuration of one simulated camera.
#[derive(Debug, Clone)]
pub struct LoopbackCamera {
    clock: Clock,
    max_rates: HashMap<CaptureMode, FrameRate>,
    ranges: HashMap<Feature, RangeInclusive<u32>>,
}

impl LoopbackCamera {
    pub fn builder() -> LoopbackCameraBuilder {
        LoopbackCameraBuilder::new()
    }
}

impl Default for LoopbackCamera {
    fn default() -> Self {
        LoopbackCameraBuilder::new().build()
    }
}

/// Builder for [`LoopbackCamera`].
///
/// Defaults model a typical VGA IIDC camera: every format-0 mode, limited by
/// isochronous bandwidth (RGB and 640x480 YUV 4:2:2 top out at 15 fps, mono at
/// 60 fps, the rest at 30 fps).
#[derive(Debug, Clone)]
pub struct LoopbackCameraBuilder {
    clock: Clock,
    max_rates: HashMap<CaptureMode, FrameRate>,
    ranges: HashMap<Feature, RangeInclusive<u32>>,
}

impl LoopbackCameraBuilder {
    pub fn new() -> Self {
        let max_rates = CaptureMode::ALL
            .into_iter()
            .map(|mode| {
                let max = match mode {
                    CaptureMode::Mono8_640x480 => FrameRate::Fps60,
                    CaptureMode::Rgb8_640x480 | CaptureMode::Yuv422_640x480 => FrameRate::Fps15,
                    _ => FrameRate::Fps30,
                };
                (mode, max)
            })
            .collect();

        let ranges = Feature::ALL
            .into_iter()
            .map(|feature| {
                let range = match feature {
                    Feature::Brightness | Feature::Gain => 0..=255,
                    Feature::Exposure => 0..=1023,
                    Feature::Shutter => 1..=4095,
                    Feature::Iris => 0..=7,
                };
                (feature, range)
            })
            .collect();

        LoopbackCameraBuilder {
            clock: Clock::default(),
            max_rates,
            ranges,
        }
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Support `mode` up to and including `max`.
    pub fn max_rate(mut self, mode: CaptureMode, max: FrameRate) -> Self {
        self.max_rates.insert(mode, max);
        self
    }

    /// Drop `mode` from the camera's capabilities.
    pub fn without_mode(mut self, mode: CaptureMode) -> Self {
        self.max_rates.remove(&mode);
        self
    }

    /// Accept raw values of `feature` within `range`.
    pub fn control_range(mut self, feature: Feature, range: RangeInclusive<u32>) -> Self {
        self.ranges.insert(feature, range);
        self
    }

    pub fn build(self) -> LoopbackCamera {
        LoopbackCamera {
            clock: self.clock,
            max_rates: self.max_rates,
            ranges: self.ranges,
        }
    }
}

impl Default for LoopbackCameraBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct CameraState {
    node: NodeId,
    config: LoopbackCamera,
    settings: HashMap<Feature, Setting>,
    attached: bool,
    streaming: bool,
    port: Option<RingPort>,
    manual: Option<ManualClock>,
}

/// Timing of a manually clocked stream.
#[derive(Debug, Clone, Copy)]
struct ManualClock {
    counter: u64,
    base: SystemTime,
    period: Duration,
}

impl ManualClock {
    /// Capture time of frame `counter`, `counter` periods after the base.
    fn timestamp(&self, counter: u64) -> SystemTime {
        const NANOS_PER_SEC: u128 = 1_000_000_000;
        let nanos = self.period.as_nanos().saturating_mul(u128::from(counter));
        let secs = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
        self.base + Duration::new(secs, (nanos % NANOS_PER_SEC) as u32)
    }
}

impl CameraState {
    fn value(&self, feature: Feature) -> u32 {
        match self.settings.get(&feature) {
            Some(Setting::Manual(value)) => *value,
            // An automatic feature reports the midpoint of its range.
            _ => self
                .config
                .ranges
                .get(&feature)
                .map_or(0, |r| r.start() + (r.end() - r.start()) / 2),
        }
    }
}

#[derive(Debug)]
struct BusInner {
    available: bool,
    fail_next_mapping: bool,
    fail_next_start: bool,
    active_mappings: usize,
    cameras: Vec<CameraState>,
}

impl BusInner {
    fn camera(&self, node: NodeId) -> Result<(usize, &CameraState)> {
        self.cameras
            .iter()
            .enumerate()
            .find(|(_, c)| c.node == node && c.attached)
            .ok_or_else(|| Error::BusUnavailable(format!("{node} is not on the bus")))
    }
}

type Shared = Arc<Mutex<BusInner>>;

fn lock(inner: &Shared) -> MutexGuard<'_, BusInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A simulated host bus.
///
/// Clones share the same cameras.
#[derive(Debug, Clone)]
pub struct LoopbackBus {
    handle: BusHandle,
    inner: Shared,
}

impl LoopbackBus {
    pub fn builder() -> LoopbackBusBuilder {
        LoopbackBusBuilder::default()
    }

    /// Produce one frame on a manually clocked camera.
    ///
    /// Returns `Ok(true)` if the frame landed in the ring and `Ok(false)` if it
    /// was dropped because no slot was queued or no session is streaming.
    ///
    /// # Errors
    ///
    /// [`Error::CameraNotFound`] for an unknown index and
    /// [`Error::InvalidConfiguration`] if the camera is free-running.
    pub fn trigger(&self, camera: usize) -> Result<bool> {
        let (port, counter, timestamp) = {
            let mut inner = lock(&self.inner);
            let available = inner.cameras.len();
            let state = inner
                .cameras
                .get_mut(camera)
                .ok_or(Error::CameraNotFound { camera, available })?;

            if state.config.clock != Clock::Manual {
                return Err(Error::InvalidConfiguration(format!(
                    "Camera {camera} is free-running and cannot be triggered"
                )));
            }

            let (Some(port), Some(clock)) = (state.port.clone(), state.manual.as_mut()) else {
                return Ok(false);
            };
            let counter = clock.counter;
            clock.counter += 1;
            let timestamp = clock.timestamp(counter);
            (port, counter, timestamp)
        };

        Ok(emit(&port, counter, timestamp))
    }

    /// Detach `camera` as if its cable were pulled.
    ///
    /// A streaming session drains what was captured and then reports
    /// [`Error::CaptureStopped`].
    pub fn unplug(&self, camera: usize) {
        let port = {
            let mut inner = lock(&self.inner);
            let Some(state) = inner.cameras.get_mut(camera) else {
                return;
            };
            state.attached = false;
            state.port.clone()
        };

        debug!(camera, "loopback camera unplugged");
        if let Some(port) = port {
            port.fail("camera detached");
        }
    }

    /// Make enumeration fail with [`Error::BusUnavailable`] while `false`.
    pub fn set_available(&self, available: bool) {
        lock(&self.inner).available = available;
    }

    /// Make the next [`Bus::map_dma`] call fail.
    pub fn fail_next_mapping(&self) {
        lock(&self.inner).fail_next_mapping = true;
    }

    /// Make the next engine start fail after the ring has been mapped.
    pub fn fail_next_start(&self) {
        lock(&self.inner).fail_next_start = true;
    }

    /// DMA mappings currently held by sessions.
    pub fn active_mappings(&self) -> usize {
        lock(&self.inner).active_mappings
    }

    pub fn is_streaming(&self, camera: usize) -> bool {
        lock(&self.inner)
            .cameras
            .get(camera)
            .is_some_and(|c| c.streaming)
    }

    /// The current setting of `feature` on `camera`, as last applied.
    pub fn setting(&self, camera: usize, feature: Feature) -> Option<Setting> {
        lock(&self.inner)
            .cameras
            .get(camera)?
            .settings
            .get(&feature)
            .copied()
    }
}

/// Builder for [`LoopbackBus`].
#[derive(Debug, Clone, Default)]
pub struct LoopbackBusBuilder {
    cameras: Vec<LoopbackCamera>,
}

impl LoopbackBusBuilder {
    /// Attach a camera. Cameras are enumerated in the order they are added.
    pub fn camera(mut self, camera: LoopbackCamera) -> Self {
        self.cameras.push(camera);
        self
    }

    pub fn build(self) -> LoopbackBus {
        let cameras = self
            .cameras
            .into_iter()
            .enumerate()
            .map(|(index, config)| CameraState {
                node: NodeId::from_raw(LOCAL_NODE_BASE.wrapping_add(index as u16)),
                config,
                settings: HashMap::new(),
                attached: true,
                streaming: false,
                port: None,
                manual: None,
            })
            .collect();

        LoopbackBus {
            handle: BusHandle::from_raw(NEXT_BUS_HANDLE.fetch_add(1, Ordering::Relaxed)),
            inner: Arc::new(Mutex::new(BusInner {
                available: true,
                fail_next_mapping: false,
                fail_next_start: false,
                active_mappings: 0,
                cameras,
            })),
        }
    }
}

impl Bus for LoopbackBus {
    fn handle(&self) -> BusHandle {
        self.handle
    }

    fn cameras(&self) -> Result<Vec<NodeId>> {
        let inner = lock(&self.inner);
        if !inner.available {
            return Err(Error::BusUnavailable("loopback bus is offline".into()));
        }
        Ok(inner
            .cameras
            .iter()
            .filter(|c| c.attached)
            .map(|c| c.node)
            .collect())
    }

    fn negotiate(
        &self,
        node: NodeId,
        mode: CaptureMode,
        frame_rate: FrameRate,
    ) -> Result<Negotiated> {
        let inner = lock(&self.inner);
        let (index, camera) = inner.camera(node)?;

        match camera.config.max_rates.get(&mode) {
            Some(&max) if frame_rate <= max => Ok(Negotiated {
                mode,
                frame_rate,
                channel: index as u8,
            }),
            _ => Err(Error::ModeUnsupported {
                mode,
                frame_rate: frame_rate.as_f64(),
            }),
        }
    }

    fn map_dma(
        &self,
        node: NodeId,
        negotiated: &Negotiated,
        num_slots: usize,
    ) -> Result<DmaMapping> {
        let mut inner = lock(&self.inner);
        if std::mem::take(&mut inner.fail_next_mapping) {
            return Err(Error::DmaSetupFailed("injected mapping failure".into()));
        }

        let (index, camera) = inner.camera(node)?;
        if camera.streaming {
            return Err(Error::DmaSetupFailed(format!(
                "Isochronous channel {} is already in use",
                negotiated.channel
            )));
        }
        let clock = camera.config.clock;

        let region = DmaRegion::allocate(num_slots, negotiated.mode.frame_bytes())?;

        inner.cameras[index].streaming = true;
        inner.active_mappings += 1;
        debug!(%node, num_slots, channel = negotiated.channel, "DMA ring mapped");

        Ok(DmaMapping {
            region,
            engine: Box::new(LoopbackEngine {
                inner: Arc::clone(&self.inner),
                camera: index,
                clock,
                period: negotiated.frame_rate.period(),
                worker: None,
            }),
        })
    }

    fn control(&self, node: NodeId) -> Result<Box<dyn CameraControl>> {
        let inner = lock(&self.inner);
        let (index, _) = inner.camera(node)?;
        Ok(Box::new(LoopbackControl {
            inner: Arc::clone(&self.inner),
            camera: index,
        }))
    }
}

/// Write one frame into the next queued slot.
fn emit(port: &RingPort, counter: u64, timestamp: SystemTime) -> bool {
    match port.begin_fill() {
        Some(mut fill) => {
            write_pattern(fill.data_mut(), counter);
            fill.commit(timestamp);
            true
        }
        None => {
            trace!(counter, "ring full, frame dropped");
            false
        }
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct LoopbackEngine {
    inner: Shared,
    camera: usize,
    clock: Clock,
    period: Duration,
    worker: Option<Worker>,
}

impl LoopbackEngine {
    fn run(port: RingPort, stop: Arc<AtomicBool>, period: Duration) {
        let started = Instant::now();
        let base = SystemTime::now();
        let mut next = started;
        let mut counter = 0u64;

        loop {
            next += period;
            loop {
                if stop.load(Ordering::Acquire) || port.is_stopped() {
                    return;
                }
                let now = Instant::now();
                if now >= next {
                    break;
                }
                thread::park_timeout(next - now);
            }

            emit(&port, counter, base + started.elapsed());
            counter += 1;
        }
    }
}

impl DmaEngine for LoopbackEngine {
    fn start(&mut self, port: RingPort) -> Result<()> {
        {
            let mut inner = lock(&self.inner);
            if std::mem::take(&mut inner.fail_next_start) {
                return Err(Error::DmaSetupFailed(
                    "injected isochronous start failure".into(),
                ));
            }

            let state = &mut inner.cameras[self.camera];
            state.port = Some(port.clone());
            if self.clock == Clock::Manual {
                state.manual = Some(ManualClock {
                    counter: 0,
                    base: SystemTime::now(),
                    period: self.period,
                });
            }
        }

        if self.clock == Clock::FreeRunning {
            let stop = Arc::new(AtomicBool::new(false));
            let period = self.period;
            let worker_stop = Arc::clone(&stop);
            let handle = thread::Builder::new()
                .name(format!("dcam-loopback-{}", self.camera))
                .spawn(move || Self::run(port, worker_stop, period))?;
            self.worker = Some(Worker { stop, handle });
        }

        Ok(())
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
            worker.handle.thread().unpark();
            if worker.handle.join().is_err() {
                warn!(camera = self.camera, "loopback worker panicked");
            }
        }

        let mut inner = lock(&self.inner);
        let state = &mut inner.cameras[self.camera];
        state.port = None;
        state.manual = None;
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        self.stop();
        let mut inner = lock(&self.inner);
        inner.cameras[self.camera].streaming = false;
        inner.active_mappings -= 1;
        debug!(camera = self.camera, "DMA ring unmapped");
    }
}

struct LoopbackControl {
    inner: Shared,
    camera: usize,
}

impl LoopbackControl {
    fn with_camera<R>(
        &self,
        feature: Feature,
        f: impl FnOnce(&mut CameraState) -> Result<R>,
    ) -> Result<R> {
        let mut inner = lock(&self.inner);
        let state = &mut inner.cameras[self.camera];
        if !state.attached {
            return Err(Error::ControlFailed {
                feature,
                reason: "camera detached".into(),
            });
        }
        f(state)
    }
}

impl CameraControl for LoopbackControl {
    fn get(&self, feature: Feature) -> Result<u32> {
        self.with_camera(feature, |state| Ok(state.value(feature)))
    }

    fn set(&mut self, feature: Feature, value: u32) -> Result<()> {
        self.with_camera(feature, |state| {
            let range = state
                .config
                .ranges
                .get(&feature)
                .ok_or_else(|| Error::ControlFailed {
                    feature,
                    reason: "feature not present".into(),
                })?;
            if !range.contains(&value) {
                return Err(Error::ControlRejected {
                    feature,
                    value,
                    reason: format!("outside {}..={}", range.start(), range.end()),
                });
            }
            state.settings.insert(feature, Setting::Manual(value));
            Ok(())
        })
    }

    fn set_auto(&mut self, feature: Feature) -> Result<()> {
        self.with_camera(feature, |state| {
            state.settings.insert(feature, Setting::Auto);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> LoopbackBus {
        LoopbackBus::builder()
            .camera(LoopbackCamera::builder().clock(Clock::Manual).build())
            .camera(
                LoopbackCamera::builder()
                    .without_mode(CaptureMode::Rgb8_640x480)
                    .build(),
            )
            .build()
    }

    #[test]
    fn test_pattern_round_trip() {
        let mut data = [0u8; 16];
        write_pattern(&mut data, 0x0102_0304_0506_0708);
        assert_eq!(frame_counter(&data), Some(0x0102_0304_0506_0708));
        assert!(data[8..].iter().all(|&b| b == 0x08));
        assert_eq!(frame_counter(&data[..4]), None);
    }

    #[test]
    fn test_manual_timestamps_past_u32_counters() {
        let clock = ManualClock {
            counter: 0,
            base: SystemTime::UNIX_EPOCH,
            period: Duration::from_millis(10),
        };
        let far = (1u64 << 32) + 1;

        assert_eq!(clock.timestamp(0), SystemTime::UNIX_EPOCH);
        assert_eq!(
            clock.timestamp(1),
            SystemTime::UNIX_EPOCH + Duration::from_millis(10)
        );
        assert_eq!(
            clock.timestamp(far),
            SystemTime::UNIX_EPOCH + Duration::from_millis(10 * far)
        );
        assert!(clock.timestamp(far) > clock.timestamp(far - 1));
    }

    #[test]
    fn test_enumeration() {
        let bus = bus();
        let nodes = bus.cameras().unwrap();
        assert_eq!(nodes, vec![NodeId::from_raw(0xffc0), NodeId::from_raw(0xffc1)]);

        bus.set_available(false);
        assert!(matches!(bus.cameras(), Err(Error::BusUnavailable(_))));
    }

    #[test]
    fn test_negotiation_respects_max_rate() {
        let bus = bus();
        let node = bus.cameras().unwrap()[0];

        let ok = bus
            .negotiate(node, CaptureMode::Rgb8_640x480, FrameRate::Fps15)
            .unwrap();
        assert_eq!(ok.channel, 0);

        match bus.negotiate(node, CaptureMode::Rgb8_640x480, FrameRate::Fps30) {
            Err(Error::ModeUnsupported { mode, frame_rate }) => {
                assert_eq!(mode, CaptureMode::Rgb8_640x480);
                assert_eq!(frame_rate, 30.0);
            }
            other => panic!("Expected ModeUnsupported, got {other:?}"),
        }

        let second = bus.cameras().unwrap()[1];
        assert!(bus
            .negotiate(second, CaptureMode::Rgb8_640x480, FrameRate::Fps1_875)
            .is_err());
    }

    #[test]
    fn test_mapping_is_exclusive_and_released() {
        let bus = bus();
        let node = bus.cameras().unwrap()[0];
        let negotiated = bus
            .negotiate(node, CaptureMode::Mono8_640x480, FrameRate::Fps30)
            .unwrap();

        let mapping = bus.map_dma(node, &negotiated, 2).unwrap();
        assert_eq!(mapping.region.slot_bytes(), 640 * 480);
        assert_eq!(bus.active_mappings(), 1);
        assert!(matches!(
            bus.map_dma(node, &negotiated, 2),
            Err(Error::DmaSetupFailed(_))
        ));

        drop(mapping);
        assert_eq!(bus.active_mappings(), 0);
        assert!(!bus.is_streaming(0));
    }

    #[test]
    fn test_injected_mapping_failure_is_one_shot() {
        let bus = bus();
        let node = bus.cameras().unwrap()[0];
        let negotiated = bus
            .negotiate(node, CaptureMode::Mono8_640x480, FrameRate::Fps30)
            .unwrap();

        bus.fail_next_mapping();
        assert!(bus.map_dma(node, &negotiated, 2).is_err());
        assert_eq!(bus.active_mappings(), 0);
        assert!(bus.map_dma(node, &negotiated, 2).is_ok());
    }

    #[test]
    fn test_control_ranges() {
        let bus = bus();
        let node = bus.cameras().unwrap()[0];
        let mut control = bus.control(node).unwrap();

        control.set(Feature::Gain, 200).unwrap();
        assert_eq!(control.get(Feature::Gain).unwrap(), 200);
        assert_eq!(bus.setting(0, Feature::Gain), Some(Setting::Manual(200)));

        match control.set(Feature::Iris, 8) {
            Err(Error::ControlRejected { feature, value, .. }) => {
                assert_eq!(feature, Feature::Iris);
                assert_eq!(value, 8);
            }
            other => panic!("Expected ControlRejected, got {other:?}"),
        }

        control.set_auto(Feature::Gain).unwrap();
        assert_eq!(bus.setting(0, Feature::Gain), Some(Setting::Auto));
    }

    #[test]
    fn test_trigger_without_session_drops() {
        let bus = bus();
        assert!(!bus.trigger(0).unwrap());
        assert!(matches!(
            bus.trigger(1),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(matches!(
            bus.trigger(5),
            Err(Error::CameraNotFound { camera: 5, available: 2 })
        ));
    }
}
