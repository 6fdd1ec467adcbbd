//! Slot bookkeeping for the DMA ring.
//!
//! Two actors mutate the ring: the DMA engine (claims a queued slot, fills it,
//! reports completion) and the consumer (checks a filled slot out, later
//! releases it). Every transition happens under one mutex; a condvar wakes
//! consumers whenever a fill completes or the engine stops.
//!
//! ```text
//! Queued --begin_fill--> Filling --complete_fill--> Filled --check_out--> CheckedOut
//!   ^                      |                                                  |
//!   +------abort_fill------+-------------------release------------------------+
//! ```
//!
//! Physical slot order and capture order diverge as soon as slots are released
//! out of order; the [`SequenceTracker`] keeps completions in capture order so
//! frames are always handed out FIFO.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, MutexGuard},
    time::{Instant, SystemTime},
};

use tracing::{debug, trace, warn};

use crate::{dma::DmaRegion, Error, Result};

/// Stop reason recorded when a session is dropped.
const SESSION_CLOSED: &str = "session closed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// Owned by the hardware, eligible for the next fill.
    Queued,
    /// Being written by the engine.
    Filling,
    /// Holds a completed frame that has not been handed out.
    Filled,
    /// Held by the consumer.
    CheckedOut,
}

/// One completed DMA fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Completion {
    pub slot: usize,
    pub sequence: u64,
    pub timestamp: SystemTime,
}

/// Ordered record of which physical slot holds the Nth captured frame.
///
/// Entries before `next` have been handed to the consumer; entries from `next`
/// on are waiting. The front entry is the oldest frame not yet returned to the
/// hardware.
#[derive(Debug)]
pub(crate) struct SequenceTracker {
    entries: VecDeque<Completion>,
    next: usize,
}

impl SequenceTracker {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            next: 0,
        }
    }

    pub(crate) fn push(&mut self, completion: Completion) {
        debug_assert!(!self.contains_slot(completion.slot));
        self.entries.push_back(completion);
    }

    /// Entries not yet handed out.
    pub(crate) fn pending(&self) -> usize {
        self.entries.len() - self.next
    }

    pub(crate) fn checked_out(&self) -> usize {
        self.next
    }

    /// Hand out the oldest waiting entry.
    pub(crate) fn check_out(&mut self) -> Option<Completion> {
        let completion = *self.entries.get(self.next)?;
        self.next += 1;
        Some(completion)
    }

    /// Remove a handed-out entry. Releases may arrive in any order.
    pub(crate) fn release(&mut self, slot: usize, sequence: u64) -> Result<Completion> {
        let position = self
            .entries
            .iter()
            .take(self.next)
            .position(|c| c.slot == slot && c.sequence == sequence)
            .ok_or(Error::FrameNotCheckedOut { slot, sequence })?;

        self.next -= 1;
        self.entries
            .remove(position)
            .ok_or(Error::FrameNotCheckedOut { slot, sequence })
    }

    pub(crate) fn oldest_outstanding(&self) -> Option<&Completion> {
        self.entries.front()
    }

    pub(crate) fn contains_slot(&self, slot: usize) -> bool {
        self.entries.iter().any(|c| c.slot == slot)
    }
}

/// Counters describing a session's traffic so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Fills completed by the engine.
    pub captured: u64,
    /// Fills the engine had to skip because no slot was queued.
    pub dropped: u64,
    /// Frames handed to the consumer.
    pub delivered: u64,
    /// Frames currently held by the consumer.
    pub checked_out: usize,
    /// Completed frames waiting to be handed out.
    pub pending: usize,
    /// Sequence number of the oldest frame not yet returned to the hardware.
    pub oldest_outstanding: Option<u64>,
}

#[derive(Debug)]
pub(crate) struct RingState {
    slots: Vec<SlotState>,
    tracker: SequenceTracker,
    fill_cursor: usize,
    next_sequence: u64,
    stopped: Option<String>,
    captured: u64,
    dropped: u64,
    delivered: u64,
}

impl RingState {
    pub(crate) fn new(num_slots: usize) -> Self {
        Self {
            slots: vec![SlotState::Queued; num_slots],
            tracker: SequenceTracker::with_capacity(num_slots),
            fill_cursor: 0,
            next_sequence: 0,
            stopped: None,
            captured: 0,
            dropped: 0,
            delivered: 0,
        }
    }

    /// Claim the next queued slot in ring order, starting after the last fill.
    pub(crate) fn begin_fill(&mut self) -> Option<usize> {
        if self.stopped.is_some() {
            return None;
        }

        let n = self.slots.len();
        let found = (0..n)
            .map(|offset| (self.fill_cursor + offset) % n)
            .find(|&slot| self.slots[slot] == SlotState::Queued);

        match found {
            Some(slot) => {
                self.slots[slot] = SlotState::Filling;
                self.fill_cursor = (slot + 1) % n;
                Some(slot)
            }
            None => {
                self.dropped += 1;
                None
            }
        }
    }

    pub(crate) fn abort_fill(&mut self, slot: usize) {
        if self.slots[slot] == SlotState::Filling {
            self.slots[slot] = SlotState::Queued;
        }
    }

    pub(crate) fn complete_fill(&mut self, slot: usize, timestamp: SystemTime) -> Completion {
        debug_assert_eq!(self.slots[slot], SlotState::Filling);
        self.slots[slot] = SlotState::Filled;

        let completion = Completion {
            slot,
            sequence: self.next_sequence,
            timestamp,
        };
        self.next_sequence += 1;
        self.captured += 1;
        self.tracker.push(completion);
        completion
    }

    pub(crate) fn check_out(&mut self) -> Option<Completion> {
        let completion = self.tracker.check_out()?;
        self.slots[completion.slot] = SlotState::CheckedOut;
        self.delivered += 1;
        Some(completion)
    }

    /// Return a checked-out slot to the hardware.
    ///
    /// A rejected release leaves the state untouched.
    pub(crate) fn release(&mut self, slot: usize, sequence: u64) -> Result<()> {
        if self.slots.get(slot) != Some(&SlotState::CheckedOut) {
            return Err(Error::FrameNotCheckedOut { slot, sequence });
        }
        self.tracker.release(slot, sequence)?;
        self.slots[slot] = SlotState::Queued;
        Ok(())
    }

    pub(crate) fn pending(&self) -> usize {
        self.tracker.pending()
    }

    pub(crate) fn stop(&mut self, reason: String) {
        if self.stopped.is_none() {
            self.stopped = Some(reason);
        }
    }

    pub(crate) fn stopped(&self) -> Option<&str> {
        self.stopped.as_deref()
    }

    pub(crate) fn stats(&self) -> CaptureStats {
        CaptureStats {
            captured: self.captured,
            dropped: self.dropped,
            delivered: self.delivered,
            checked_out: self.tracker.checked_out(),
            pending: self.tracker.pending(),
            oldest_outstanding: self.tracker.oldest_outstanding().map(|c| c.sequence),
        }
    }

    #[cfg(test)]
    pub(crate) fn slot_state(&self, slot: usize) -> SlotState {
        self.slots[slot]
    }

    #[cfg(test)]
    pub(crate) fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }
}

/// The ring shared between a session and its DMA engine.
pub(crate) struct Ring {
    region: DmaRegion,
    state: Mutex<RingState>,
    ready: Condvar,
}

impl Ring {
    pub(crate) fn new(region: DmaRegion) -> Self {
        let state = RingState::new(region.num_slots());
        Self {
            region,
            state: Mutex::new(state),
            ready: Condvar::new(),
        }
    }

    /// Lock the ring state, recovering from poisoning.
    pub(crate) fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn region(&self) -> &DmaRegion {
        &self.region
    }

    /// Wait for the next frame in capture order and check it out.
    ///
    /// With no deadline this blocks until a frame completes. `Ok(None)` means
    /// the deadline passed first. Completed frames are still handed out after
    /// the engine stopped; once they are drained the stop reason is returned.
    pub(crate) fn wait_for_frame(&self, deadline: Option<Instant>) -> Result<Option<Completion>> {
        let mut state = self.lock();

        loop {
            if let Some(completion) = state.check_out() {
                trace!(
                    slot = completion.slot,
                    sequence = completion.sequence,
                    "frame checked out"
                );
                return Ok(Some(completion));
            }

            if let Some(reason) = state.stopped() {
                return Err(Error::CaptureStopped(reason.to_owned()));
            }

            match deadline {
                None => {
                    state = self
                        .ready
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    let (guard, _) = self
                        .ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    state = guard;
                }
            }
        }
    }

    pub(crate) fn release(&self, slot: usize, sequence: u64) -> Result<()> {
        self.lock().release(slot, sequence)?;
        trace!(slot, sequence, "slot returned to hardware");
        Ok(())
    }

    pub(crate) fn complete_fill(&self, slot: usize, timestamp: SystemTime) {
        let completion = self.lock().complete_fill(slot, timestamp);
        trace!(
            slot = completion.slot,
            sequence = completion.sequence,
            "DMA fill completed"
        );
        self.ready.notify_all();
    }

    /// Stop the ring because the engine can no longer deliver frames.
    pub(crate) fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.halt(reason.clone()) {
            warn!(%reason, "capture stopped");
        }
    }

    /// Stop the ring as part of an orderly session teardown.
    pub(crate) fn close(&self) {
        if self.halt(SESSION_CLOSED.into()) {
            debug!("capture ring closed");
        }
    }

    /// Mark the ring stopped and wake every waiting consumer. Returns `true`
    /// if this call stopped it.
    fn halt(&self, reason: String) -> bool {
        let first = {
            let mut state = self.lock();
            let first = state.stopped().is_none();
            state.stop(reason);
            first
        };
        self.ready.notify_all();
        first
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.lock().stopped().is_some()
    }

    pub(crate) fn frame_pending(&self) -> bool {
        self.lock().pending() > 0
    }

    pub(crate) fn stats(&self) -> CaptureStats {
        self.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn at(seconds: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(seconds)
    }

    fn fill(state: &mut RingState, seconds: u64) -> Option<Completion> {
        let slot = state.begin_fill()?;
        Some(state.complete_fill(slot, at(seconds)))
    }

    #[test]
    fn test_fills_in_ring_order() {
        let mut state = RingState::new(3);
        let slots: Vec<usize> = (0..3).map(|t| fill(&mut state, t).unwrap().slot).collect();
        assert_eq!(slots, vec![0, 1, 2]);
        assert_eq!(state.pending(), 3);
    }

    #[test]
    fn test_full_ring_drops_fill() {
        let mut state = RingState::new(2);
        fill(&mut state, 0).unwrap();
        fill(&mut state, 1).unwrap();
        assert!(state.begin_fill().is_none());
        assert_eq!(state.stats().dropped, 1);
        assert_eq!(state.stats().captured, 2);
    }

    #[test]
    fn test_checkout_is_fifo_across_wraparound() {
        let mut state = RingState::new(3);
        for t in 0..3 {
            fill(&mut state, t).unwrap();
        }

        let first = state.check_out().unwrap();
        let second = state.check_out().unwrap();
        assert_eq!((first.slot, second.slot), (0, 1));

        // Release out of order; the hardware refills slot 1 before slot 0.
        state.release(second.slot, second.sequence).unwrap();
        let refill_a = fill(&mut state, 3).unwrap();
        assert_eq!(refill_a.slot, 1);

        state.release(first.slot, first.sequence).unwrap();
        let refill_b = fill(&mut state, 4).unwrap();
        assert_eq!(refill_b.slot, 0);

        let delivered: Vec<(u64, usize)> = std::iter::from_fn(|| state.check_out())
            .map(|c| (c.sequence, c.slot))
            .collect();
        assert_eq!(delivered, vec![(2, 2), (3, 1), (4, 0)]);
    }

    #[test]
    fn test_checked_out_slot_is_not_refilled() {
        let mut state = RingState::new(2);
        fill(&mut state, 0).unwrap();
        fill(&mut state, 1).unwrap();
        let held = state.check_out().unwrap();
        assert_eq!(state.slot_state(held.slot), SlotState::CheckedOut);

        assert!(state.begin_fill().is_none());
        assert_eq!(state.slot_state(held.slot), SlotState::CheckedOut);
    }

    #[test]
    fn test_double_release_is_rejected_without_side_effects() {
        let mut state = RingState::new(3);
        fill(&mut state, 0).unwrap();
        fill(&mut state, 1).unwrap();
        let frame = state.check_out().unwrap();
        state.release(frame.slot, frame.sequence).unwrap();

        let before = state.stats();
        match state.release(frame.slot, frame.sequence) {
            Err(Error::FrameNotCheckedOut { slot, sequence }) => {
                assert_eq!(slot, frame.slot);
                assert_eq!(sequence, frame.sequence);
            }
            other => panic!("Expected FrameNotCheckedOut, got {other:?}"),
        }
        assert_eq!(state.stats(), before);
        assert_eq!(state.slot_state(frame.slot), SlotState::Queued);
    }

    #[test]
    fn test_stale_sequence_is_rejected() {
        let mut state = RingState::new(1);
        let old = fill(&mut state, 0).unwrap();
        let first = state.check_out().unwrap();
        state.release(first.slot, first.sequence).unwrap();

        fill(&mut state, 1).unwrap();
        let current = state.check_out().unwrap();
        assert_eq!(current.slot, old.slot);

        // Same slot, earlier capture.
        assert!(state.release(old.slot, old.sequence).is_err());
        assert_eq!(state.slot_state(current.slot), SlotState::CheckedOut);
        state.release(current.slot, current.sequence).unwrap();
    }

    #[test]
    fn test_release_of_unknown_slot() {
        let mut state = RingState::new(2);
        assert!(matches!(
            state.release(7, 0),
            Err(Error::FrameNotCheckedOut { slot: 7, .. })
        ));
        fill(&mut state, 0).unwrap();
        // Filled but never handed out.
        assert!(state.release(0, 0).is_err());
        assert_eq!(state.pending(), 1);
    }

    #[test]
    fn test_abort_fill_requeues_slot() {
        let mut state = RingState::new(1);
        let slot = state.begin_fill().unwrap();
        state.abort_fill(slot);
        assert_eq!(state.slot_state(slot), SlotState::Queued);
        assert_eq!(state.stats().captured, 0);
        assert!(fill(&mut state, 0).is_some());
    }

    #[test]
    fn test_tracker_cursors() {
        let mut state = RingState::new(3);
        for t in 0..3 {
            fill(&mut state, t).unwrap();
        }
        let a = state.check_out().unwrap();
        let b = state.check_out().unwrap();
        assert_eq!(state.tracker().checked_out(), 2);
        assert_eq!(state.tracker().pending(), 1);
        assert_eq!(state.tracker().oldest_outstanding().unwrap().sequence, 0);

        state.release(a.slot, a.sequence).unwrap();
        assert_eq!(state.tracker().oldest_outstanding().unwrap().sequence, 1);
        assert!(!state.tracker().contains_slot(a.slot));

        state.release(b.slot, b.sequence).unwrap();
        assert_eq!(state.tracker().checked_out(), 0);
        assert_eq!(state.tracker().oldest_outstanding().unwrap().sequence, 2);
    }

    #[test]
    fn test_close_keeps_an_earlier_failure() {
        let ring = Ring::new(DmaRegion::allocate(2, 16).unwrap());
        ring.close();
        assert_eq!(ring.lock().stopped(), Some(SESSION_CLOSED));

        let ring = Ring::new(DmaRegion::allocate(2, 16).unwrap());
        ring.fail("camera detached");
        ring.close();
        assert_eq!(ring.lock().stopped(), Some("camera detached"));
        assert!(matches!(
            ring.wait_for_frame(None),
            Err(Error::CaptureStopped(reason)) if reason == "camera detached"
        ));
    }

    #[test]
    fn test_stopped_ring_refuses_fills() {
        let mut state = RingState::new(2);
        state.stop("detached".into());
        state.stop("second reason".into());
        assert_eq!(state.stopped(), Some("detached"));
        assert!(state.begin_fill().is_none());
        assert_eq!(state.stats().dropped, 0);
    }
}
