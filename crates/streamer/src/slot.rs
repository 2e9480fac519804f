//! Request slot pool
//!
//! A slot bundles one request buffer, its transport-neutral descriptor and
//! the transport's own per-request handle. The pool owns every slot for the
//! whole run: it is allocated as one unit before the first submission and
//! released as one unit once nothing is in flight.

use crate::config::TransferType;
use crate::error::{AllocationError, TransportError};
use std::time::Duration;
use tracing::{debug, warn};

/// Index of a slot inside its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Allocated but not handed to the transport (initial, retired or rejected)
    Idle,
    /// Owned by the transport until its completion is delivered
    Submitted,
    /// Completion delivered, awaiting resubmission or retirement
    Completed,
}

/// One entry of the isochronous per-packet length table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacket {
    pub length: usize,
}

/// Transport-neutral description of the request a slot carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub endpoint: u8,
    pub transfer_type: TransferType,
    pub length: usize,
    pub timeout: Duration,
    /// Empty for bulk and interrupt requests
    pub iso_packets: Vec<IsoPacket>,
}

impl Default for TransferDescriptor {
    fn default() -> Self {
        Self {
            endpoint: 0,
            transfer_type: TransferType::Bulk,
            length: 0,
            timeout: Duration::ZERO,
            iso_packets: Vec::new(),
        }
    }
}

/// One reusable asynchronous request
#[derive(Debug)]
pub struct TransferSlot<H> {
    id: SlotId,
    pub(crate) buffer: Vec<u8>,
    pub(crate) descriptor: TransferDescriptor,
    pub(crate) handle: Option<H>,
    pub(crate) state: SlotState,
}

impl<H> TransferSlot<H> {
    fn new(id: SlotId, buffer: Vec<u8>, handle: H) -> Self {
        Self {
            id,
            buffer,
            descriptor: TransferDescriptor::default(),
            handle: Some(handle),
            state: SlotState::Idle,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn descriptor(&self) -> &TransferDescriptor {
        &self.descriptor
    }

    pub fn descriptor_mut(&mut self) -> &mut TransferDescriptor {
        &mut self.descriptor
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Mutable access to the buffer and the transport handle together
    ///
    /// Transports need both at submission time: the handle is filled with a
    /// pointer into the buffer.
    pub fn parts_mut(&mut self) -> (&TransferDescriptor, &mut [u8], Option<&mut H>) {
        (&self.descriptor, &mut self.buffer, self.handle.as_mut())
    }

    /// Free the buffer and handle of this slot, returning whether a handle was freed
    fn release(&mut self) -> bool {
        if self.state == SlotState::Submitted {
            warn!("Releasing slot {} while it is still submitted", self.id);
        }
        self.buffer = Vec::new();
        self.state = SlotState::Idle;
        self.handle.take().is_some()
    }
}

/// Arena of transfer slots, allocated and released as one unit
#[derive(Debug)]
pub struct SlotPool<H> {
    slots: Vec<TransferSlot<H>>,
}

impl<H> SlotPool<H> {
    /// Allocate `depth` slots of `bytes_per_slot` bytes each
    ///
    /// `alloc_handle` creates the transport handle for each slot. If any
    /// buffer or handle cannot be allocated, everything allocated by this call
    /// is released before the error is returned.
    pub fn allocate<F>(
        depth: usize,
        bytes_per_slot: usize,
        mut alloc_handle: F,
    ) -> Result<Self, AllocationError>
    where
        F: FnMut(SlotId) -> Result<H, TransportError>,
    {
        let mut pool = SlotPool { slots: Vec::new() };
        pool.slots
            .try_reserve_exact(depth)
            .map_err(|_| AllocationError::Table { depth })?;

        for index in 0..depth {
            let id = SlotId(index);

            let mut buffer = Vec::new();
            if buffer.try_reserve_exact(bytes_per_slot).is_err() {
                pool.release();
                return Err(AllocationError::Buffer {
                    slot: id,
                    bytes: bytes_per_slot,
                });
            }
            buffer.resize(bytes_per_slot, 0);

            let handle = match alloc_handle(id) {
                Ok(handle) => handle,
                Err(source) => {
                    pool.release();
                    return Err(AllocationError::Descriptor { slot: id, source });
                }
            };

            pool.slots.push(TransferSlot::new(id, buffer, handle));
        }

        debug!(
            "Allocated {} slots of {} bytes",
            pool.slots.len(),
            bytes_per_slot
        );
        Ok(pool)
    }

    /// Release every buffer and handle still held
    ///
    /// Safe to call any number of times; returns how many handles this call
    /// actually freed.
    pub fn release(&mut self) -> usize {
        let mut freed = 0;
        for slot in self.slots.iter_mut() {
            if slot.release() {
                freed += 1;
            }
        }
        if freed > 0 {
            debug!("Released {} transfer slots", freed);
        }
        freed
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, id: SlotId) -> Option<&TransferSlot<H>> {
        self.slots.get(id.0)
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut TransferSlot<H>> {
        self.slots.get_mut(id.0)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TransferSlot<H>> {
        self.slots.iter_mut()
    }

    /// Number of slots currently handed to the transport
    pub fn submitted(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state == SlotState::Submitted)
            .count()
    }
}

impl<H> Drop for SlotPool<H> {
    fn drop(&mut self) {
        self.release();
    }
}
