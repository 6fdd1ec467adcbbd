//! The hardware-facing side of the ring buffer.
//!
//! A [`Bus`](crate::Bus) maps a [`DmaRegion`] and pairs it with a [`DmaEngine`].
//! Once the session has built its ring, the engine is started with a
//! [`RingPort`]; from then on it claims queued slots with
//! [`RingPort::begin_fill`], writes the frame and reports completion with
//! [`SlotFill::commit`]. The engine never sees a slot that a consumer holds.

use std::{fmt, ptr::NonNull, slice, sync::Arc, time::SystemTime};

use crate::{ring::Ring, Error, Result};

/// Memory backing the slots of a ring.
///
/// The region is `num_slots` contiguous slots of `slot_bytes` each. Access is
/// handed out one slot at a time, and the ring's slot states guarantee that a
/// slot is never written and read at the same time.
pub struct DmaRegion {
    ptr: NonNull<u8>,
    slot_bytes: usize,
    num_slots: usize,
}

impl DmaRegion {
    /// Allocate a zeroed region from the heap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DmaSetupFailed`] if the geometry is empty, overflows, or
    /// the allocation fails.
    pub fn allocate(num_slots: usize, slot_bytes: usize) -> Result<Self> {
        if num_slots == 0 || slot_bytes == 0 {
            return Err(Error::DmaSetupFailed(format!(
                "Cannot map an empty ring ({num_slots} slots of {slot_bytes} bytes)"
            )));
        }

        let len = num_slots.checked_mul(slot_bytes).ok_or_else(|| {
            Error::DmaSetupFailed(format!(
                "Ring of {num_slots} slots of {slot_bytes} bytes overflows the address space"
            ))
        })?;

        let mut buffer: Vec<u8> = Vec::new();
        buffer
            .try_reserve_exact(len)
            .map_err(|e| Error::DmaSetupFailed(format!("Failed to allocate {len} bytes: {e}")))?;
        buffer.resize(len, 0);

        let raw = Box::into_raw(buffer.into_boxed_slice()) as *mut u8;
        // SAFETY: Box::into_raw never returns null.
        let ptr = unsafe { NonNull::new_unchecked(raw) };

        Ok(Self {
            ptr,
            slot_bytes,
            num_slots,
        })
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    pub fn len(&self) -> usize {
        self.num_slots * self.slot_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Safety
    ///
    /// `slot` must be in range and must not be written for the lifetime of the
    /// returned slice.
    pub(crate) unsafe fn slot(&self, slot: usize) -> &[u8] {
        debug_assert!(slot < self.num_slots);
        slice::from_raw_parts(self.ptr.as_ptr().add(slot * self.slot_bytes), self.slot_bytes)
    }

    /// # Safety
    ///
    /// `slot` must be in range and no other reference to it may exist for the
    /// lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slot_mut(&self, slot: usize) -> &mut [u8] {
        debug_assert!(slot < self.num_slots);
        slice::from_raw_parts_mut(
            self.ptr.as_ptr().add(slot * self.slot_bytes),
            self.slot_bytes,
        )
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        let len = self.len();
        // SAFETY: ptr and len describe the boxed slice leaked in `allocate`.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                len,
            )));
        }
    }
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("num_slots", &self.num_slots)
            .field("slot_bytes", &self.slot_bytes)
            .finish()
    }
}

/// # Safety
///
/// The region owns its allocation; the pointer is never shared outside the ring,
/// which hands out disjoint slots under its lock.
unsafe impl Send for DmaRegion {}

/// # Safety
///
/// Shared access only produces per-slot slices, and the ring's slot states
/// guarantee a slot is never mutably and immutably borrowed at once.
unsafe impl Sync for DmaRegion {}

/// A freshly mapped ring and the engine that fills it.
pub struct DmaMapping {
    pub region: DmaRegion,
    pub engine: Box<dyn DmaEngine>,
}

/// The isochronous receive engine of one session.
///
/// Dropping the engine must unmap its resources and release its channel.
pub trait DmaEngine: Send {
    /// Start filling slots. Called once, after the ring has been built.
    fn start(&mut self, port: RingPort) -> Result<()>;

    /// Stop filling slots and wait for any fill in progress to finish.
    fn stop(&mut self);
}

/// The engine's handle on a session's ring.
#[derive(Clone)]
pub struct RingPort {
    ring: Arc<Ring>,
}

impl RingPort {
    pub(crate) fn new(ring: Arc<Ring>) -> Self {
        Self { ring }
    }

    pub fn num_slots(&self) -> usize {
        self.ring.region().num_slots()
    }

    pub fn slot_bytes(&self) -> usize {
        self.ring.region().slot_bytes()
    }

    /// Claim the next queued slot for writing.
    ///
    /// Returns `None` when every slot is filled or held by the consumer; the
    /// frame is counted as dropped. Also `None` once the ring is stopped.
    pub fn begin_fill(&self) -> Option<SlotFill<'_>> {
        let slot = self.ring.lock().begin_fill()?;
        Some(SlotFill {
            ring: &*self.ring,
            slot,
            committed: false,
        })
    }

    /// Report a fatal engine failure. Consumers drain completed frames, then
    /// receive [`Error::CaptureStopped`].
    pub fn fail(&self, reason: impl Into<String>) {
        self.ring.fail(reason);
    }

    pub fn is_stopped(&self) -> bool {
        self.ring.is_stopped()
    }
}

impl fmt::Debug for RingPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingPort")
            .field("num_slots", &self.num_slots())
            .field("slot_bytes", &self.slot_bytes())
            .finish()
    }
}

/// Exclusive write access to one slot while the engine fills it.
///
/// Dropping without [`commit`](SlotFill::commit) returns the slot to the queue.
pub struct SlotFill<'p> {
    ring: &'p Ring,
    slot: usize,
    committed: bool,
}

impl SlotFill<'_> {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: the slot is in the Filling state, which only this guard can
        // leave, so nothing else reads or writes it.
        unsafe { self.ring.region().slot_mut(self.slot) }
    }

    /// Publish the frame to consumers.
    pub fn commit(mut self, timestamp: SystemTime) {
        self.committed = true;
        self.ring.complete_fill(self.slot, timestamp);
    }
}

impl Drop for SlotFill<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.ring.lock().abort_fill(self.slot);
        }
    }
}
