//! Queue memory and device address translation.
//!
//! These are the two collaborator contracts the transport consumes: a
//! provider of coherent memory with a stable device address, and a
//! translation service mapping one-off payload buffers into a device
//! context. [`HeapQueueMemory`] implements both in-process for emulation
//! and tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::MailboxError;
use crate::region::HeapRegion;
use crate::types::{ContextId, DmaDirection};

pub const PAGE_SIZE: usize = 4096;

/// Width of device addresses the mailbox registers can hold.
pub const DEVICE_ADDRESS_BITS: u32 = 36;

/// Returns true if `addr` is expressible in [`DEVICE_ADDRESS_BITS`].
pub fn fits_device_address(addr: u64) -> bool {
    addr >> DEVICE_ADDRESS_BITS == 0
}

/// Coherent memory visible to both host and device.
#[derive(Clone, Debug)]
pub struct CoherentBuffer {
    region: Arc<HeapRegion>,
    device_addr: u64,
}

impl CoherentBuffer {
    pub fn new(region: Arc<HeapRegion>, device_addr: u64) -> Self {
        Self { region, device_addr }
    }

    pub fn region(&self) -> &HeapRegion {
        &self.region
    }

    pub fn device_addr(&self) -> u64 {
        self.device_addr
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }
}

/// Supplies queue memory. The device address must stay valid until the
/// buffer is handed back to [`QueueMemory::free`].
pub trait QueueMemory: Send + Sync {
    fn allocate(&self, size: usize) -> Result<CoherentBuffer, MailboxError>;

    fn free(&self, buffer: CoherentBuffer);
}

/// Maps host buffers into a device context for commands that reference a
/// payload by address.
pub trait AddressTranslation: Send + Sync {
    fn map(
        &self,
        buffer: &CoherentBuffer,
        size: usize,
        direction: DmaDirection,
        context: ContextId,
    ) -> Result<u64, MailboxError>;

    fn unmap(&self, device_addr: u64, size: usize, context: ContextId);
}

const HEAP_IOVA_BASE: u64 = 0x4000_0000;

struct Mapping {
    region: Arc<HeapRegion>,
    size: usize,
    direction: DmaDirection,
    context: ContextId,
}

struct HeapState {
    next_iova: u64,
    allocations: HashMap<u64, Arc<HeapRegion>>,
    mappings: HashMap<u64, Mapping>,
}

/// In-process queue memory and address translation.
///
/// Hands out page-aligned heap regions under a bump-allocated device
/// address window. The device side of an emulation can look regions up by
/// the address it was given.
pub struct HeapQueueMemory {
    state: Mutex<HeapState>,
}

impl Default for HeapQueueMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapQueueMemory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeapState {
                next_iova: HEAP_IOVA_BASE,
                allocations: HashMap::new(),
                mappings: HashMap::new(),
            }),
        }
    }

    /// Region backing `device_addr`, whether allocated or mapped.
    pub fn lookup(&self, device_addr: u64) -> Option<Arc<HeapRegion>> {
        let state = self.state.lock();
        state
            .allocations
            .get(&device_addr)
            .cloned()
            .or_else(|| state.mappings.get(&device_addr).map(|m| m.region.clone()))
    }

    /// Direction and context of a live mapping.
    pub fn mapping(&self, device_addr: u64) -> Option<(usize, DmaDirection, ContextId)> {
        let state = self.state.lock();
        state
            .mappings
            .get(&device_addr)
            .map(|m| (m.size, m.direction, m.context))
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    pub fn live_mappings(&self) -> usize {
        self.state.lock().mappings.len()
    }

    fn reserve_iova(state: &mut HeapState, size: usize) -> Result<u64, MailboxError> {
        let span = size.next_multiple_of(PAGE_SIZE) as u64;
        let addr = state.next_iova;
        let end = addr.checked_add(span).ok_or(MailboxError::OutOfMemory { size })?;
        if !fits_device_address(end - 1) {
            return Err(MailboxError::OutOfMemory { size });
        }
        state.next_iova = end;
        Ok(addr)
    }
}

impl QueueMemory for HeapQueueMemory {
    fn allocate(&self, size: usize) -> Result<CoherentBuffer, MailboxError> {
        let rounded = size.next_multiple_of(PAGE_SIZE);
        let region = Arc::new(HeapRegion::new_zeroed(rounded, PAGE_SIZE)?);
        let mut state = self.state.lock();
        let addr = Self::reserve_iova(&mut state, rounded)?;
        state.allocations.insert(addr, region.clone());
        Ok(CoherentBuffer::new(region, addr))
    }

    fn free(&self, buffer: CoherentBuffer) {
        if self
            .state
            .lock()
            .allocations
            .remove(&buffer.device_addr())
            .is_none()
        {
            warn!(addr = buffer.device_addr(), "freeing unknown queue buffer");
        }
    }
}

impl AddressTranslation for HeapQueueMemory {
    fn map(
        &self,
        buffer: &CoherentBuffer,
        size: usize,
        direction: DmaDirection,
        context: ContextId,
    ) -> Result<u64, MailboxError> {
        if size == 0 || size > buffer.len() {
            return Err(MailboxError::InvalidArgument("mapping size exceeds buffer"));
        }
        let mut state = self.state.lock();
        let addr = Self::reserve_iova(&mut state, size)?;
        state.mappings.insert(
            addr,
            Mapping {
                region: buffer.region.clone(),
                size,
                direction,
                context,
            },
        );
        Ok(addr)
    }

    fn unmap(&self, device_addr: u64, size: usize, context: ContextId) {
        let mut state = self.state.lock();
        match state.mappings.get(&device_addr) {
            Some(m) if m.size == size && m.context == context => {
                state.mappings.remove(&device_addr);
            }
            _ => warn!(addr = device_addr, size, "unmap of unknown mapping"),
        }
    }
}
