//! A single mailbox: one command queue, one response queue and the
//! registers that drive them.
//!
//! The host owns the command-queue tail and the response-queue head; the
//! firmware owns the other two. Local copies of the host-owned indices are
//! kept here and published to the device on every change.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::csr::{CsrLayout, RegisterFile, cmd_queue, context, resp_queue};
use crate::error::MailboxError;
use crate::memory::fits_device_address;
use crate::queue::{self, MAX_QUEUE_SIZE};
use crate::types::{Generation, MailboxHandle, MailboxId, QueueRole};

/// What a mailbox was allocated for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Owner {
    Kci,
    Vii,
    P2p,
}

/// Callback invoked by the manager when a mailbox's response doorbell fires.
pub trait MailboxHandler: Send + Sync {
    fn handle_irq(&self, mailbox: &Mailbox);

    /// Called once after the mailbox has been removed from the manager and
    /// disabled, outside the manager's table lock.
    fn detach(&self, _mailbox: &Mailbox) {}
}

impl<F> MailboxHandler for F
where
    F: Fn(&Mailbox) + Send + Sync,
{
    fn handle_irq(&self, mailbox: &Mailbox) {
        self(mailbox)
    }
}

/// Read-only view of one queue for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub device_addr: u64,
    pub capacity: u32,
    pub head: u32,
    pub tail: u32,
}

/// Read-only view of a mailbox for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MailboxSnapshot {
    pub id: MailboxId,
    pub owner: Owner,
    pub enabled: bool,
    pub cmd_queue: QueueSnapshot,
    pub resp_queue: QueueSnapshot,
}

pub struct Mailbox {
    handle: MailboxHandle,
    owner: Owner,
    regs: Arc<dyn RegisterFile>,
    context_csr: usize,
    cmd_csr: usize,
    resp_csr: usize,

    cmd_addr: AtomicU64,
    cmd_size: AtomicU32,
    cmd_tail: AtomicU32,

    resp_addr: AtomicU64,
    resp_size: AtomicU32,
    resp_head: AtomicU32,

    handler: RwLock<Option<Arc<dyn MailboxHandler>>>,
}

impl Mailbox {
    pub(crate) fn new(
        handle: MailboxHandle,
        owner: Owner,
        regs: Arc<dyn RegisterFile>,
        layout: &CsrLayout,
    ) -> Self {
        let index = handle.id.get();
        Self {
            handle,
            owner,
            regs,
            context_csr: layout.context(index),
            cmd_csr: layout.cmd_queue(index),
            resp_csr: layout.resp_queue(index),
            cmd_addr: AtomicU64::new(0),
            cmd_size: AtomicU32::new(0),
            cmd_tail: AtomicU32::new(0),
            resp_addr: AtomicU64::new(0),
            resp_size: AtomicU32::new(0),
            resp_head: AtomicU32::new(0),
            handler: RwLock::new(None),
        }
    }

    pub fn id(&self) -> MailboxId {
        self.handle.id
    }

    pub fn generation(&self) -> Generation {
        self.handle.generation
    }

    pub fn handle(&self) -> MailboxHandle {
        self.handle
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    // -------------------------------------------------------------------------
    // Queue setup
    // -------------------------------------------------------------------------

    /// Program the base address and capacity of one queue and reset its
    /// indices.
    pub fn configure_queue(
        &self,
        role: QueueRole,
        device_addr: u64,
        capacity: u32,
    ) -> Result<(), MailboxError> {
        if capacity == 0 || capacity > MAX_QUEUE_SIZE {
            return Err(MailboxError::InvalidArgument("queue capacity out of range"));
        }
        if !fits_device_address(device_addr) {
            return Err(MailboxError::InvalidArgument(
                "queue address exceeds device address width",
            ));
        }
        let low = device_addr as u32;
        let high = (device_addr >> 32) as u32;

        match role {
            QueueRole::Command => {
                self.write_context(context::CMD_QUEUE_ADDRESS_LOW, low);
                self.write_context(context::CMD_QUEUE_ADDRESS_HIGH, high);
                self.write_context(context::CMD_QUEUE_SIZE, capacity);
                self.cmd_addr.store(device_addr, Ordering::Relaxed);
                self.cmd_size.store(capacity, Ordering::Release);
                self.cmd_tail.store(0, Ordering::Release);
                self.regs.write_sync(self.cmd_csr + cmd_queue::TAIL, 0);
                self.regs.write(self.cmd_csr + cmd_queue::HEAD, 0);
            }
            QueueRole::Response => {
                self.write_context(context::RESP_QUEUE_ADDRESS_LOW, low);
                self.write_context(context::RESP_QUEUE_ADDRESS_HIGH, high);
                self.write_context(context::RESP_QUEUE_SIZE, capacity);
                self.resp_addr.store(device_addr, Ordering::Relaxed);
                self.resp_size.store(capacity, Ordering::Release);
                self.resp_head.store(0, Ordering::Release);
                self.regs.write(self.resp_csr + resp_queue::HEAD, 0);
                self.regs.write(self.resp_csr + resp_queue::TAIL, 0);
            }
        }
        debug!(
            mailbox = self.id().get(),
            ?role,
            addr = device_addr,
            capacity,
            "queue configured"
        );
        Ok(())
    }

    /// Disable the context, zero all four indices and re-enable it.
    pub fn reset(&self) {
        self.disable();
        self.regs.write(self.cmd_csr + cmd_queue::HEAD, 0);
        self.cmd_tail.store(0, Ordering::Release);
        self.regs.write_sync(self.cmd_csr + cmd_queue::TAIL, 0);
        self.resp_head.store(0, Ordering::Release);
        self.regs.write(self.resp_csr + resp_queue::HEAD, 0);
        self.regs.write(self.resp_csr + resp_queue::TAIL, 0);
        self.enable();
    }

    // -------------------------------------------------------------------------
    // Index movement
    // -------------------------------------------------------------------------

    /// Publish `n` new commands to firmware.
    ///
    /// Fails with `ResourceBusy` if firmware has not consumed enough of the
    /// queue to make room.
    pub fn advance_command_tail(&self, n: u32) -> Result<(), MailboxError> {
        let capacity = self.command_capacity();
        if n > capacity {
            return Err(MailboxError::InvalidArgument("advance exceeds queue capacity"));
        }
        let head = self.command_head();
        let tail = self.command_tail();
        if n > capacity - queue::occupancy(head, tail, capacity) {
            return Err(MailboxError::ResourceBusy);
        }
        let tail = queue::advance(tail, n, capacity);
        self.cmd_tail.store(tail, Ordering::Release);
        self.regs.write_sync(self.cmd_csr + cmd_queue::TAIL, tail);
        Ok(())
    }

    /// Release `n` consumed responses back to firmware.
    pub fn advance_response_head(&self, n: u32) -> Result<(), MailboxError> {
        let capacity = self.response_capacity();
        if n > capacity {
            return Err(MailboxError::InvalidArgument("advance exceeds queue capacity"));
        }
        let head = self.response_head();
        let tail = self.response_tail();
        if n > queue::occupancy(head, tail, capacity) {
            return Err(MailboxError::InvalidArgument("not enough unread responses"));
        }
        let head = queue::advance(head, n, capacity);
        self.resp_head.store(head, Ordering::Release);
        self.regs.write(self.resp_csr + resp_queue::HEAD, head);
        Ok(())
    }

    pub fn command_capacity(&self) -> u32 {
        self.cmd_size.load(Ordering::Acquire)
    }

    pub fn response_capacity(&self) -> u32 {
        self.resp_size.load(Ordering::Acquire)
    }

    /// Local command tail.
    pub fn command_tail(&self) -> u32 {
        self.cmd_tail.load(Ordering::Acquire)
    }

    /// Firmware's command head, read from the device.
    pub fn command_head(&self) -> u32 {
        self.regs.read_sync(self.cmd_csr + cmd_queue::HEAD)
    }

    /// Local response head.
    pub fn response_head(&self) -> u32 {
        self.resp_head.load(Ordering::Acquire)
    }

    /// Firmware's response tail, read from the device. Responses up to this
    /// index are visible once this returns.
    pub fn response_tail(&self) -> u32 {
        self.regs.read_sync(self.resp_csr + resp_queue::TAIL)
    }

    pub fn command_queue_full(&self) -> bool {
        queue::is_full(self.command_head(), self.command_tail(), self.command_capacity())
    }

    // -------------------------------------------------------------------------
    // Context and doorbells
    // -------------------------------------------------------------------------

    pub fn enable(&self) {
        self.write_context(context::CONTEXT_ENABLE, 1);
    }

    pub fn disable(&self) {
        self.write_context(context::CONTEXT_ENABLE, 0);
    }

    pub fn is_enabled(&self) -> bool {
        self.regs.read(self.context_csr + context::CONTEXT_ENABLE) != 0
    }

    /// Clear stale doorbells and enable both queue doorbells.
    pub fn init_doorbells(&self) {
        self.regs.write(self.resp_csr + resp_queue::DOORBELL_CLEAR, 1);
        self.write_context(context::CMD_QUEUE_DOORBELL_CLEAR, 1);
        self.write_context(context::CMD_QUEUE_DOORBELL_ENABLE, 1);
        self.write_context(context::RESP_QUEUE_DOORBELL_ENABLE, 1);
    }

    pub fn set_priority(&self, priority: u32) {
        self.write_context(context::PRIORITY, priority);
    }

    /// Whether firmware is interrupted on every command tail update.
    pub fn set_cmd_tail_doorbell(&self, enabled: bool) {
        self.write_context(context::CMD_QUEUE_TAIL_DOORBELL_ENABLE, u32::from(enabled));
    }

    pub fn ring_command_doorbell(&self) {
        self.regs.write_sync(self.cmd_csr + cmd_queue::DOORBELL_SET, 1);
    }

    pub fn response_doorbell_pending(&self) -> bool {
        self.regs.read(self.resp_csr + resp_queue::DOORBELL_STATUS) & 1 != 0
    }

    pub fn clear_response_doorbell(&self) {
        self.regs.write(self.resp_csr + resp_queue::DOORBELL_CLEAR, 1);
    }

    // -------------------------------------------------------------------------
    // Interrupt handler
    // -------------------------------------------------------------------------

    pub fn set_handler(&self, handler: Option<Arc<dyn MailboxHandler>>) {
        *self.handler.write() = handler;
    }

    pub fn has_handler(&self) -> bool {
        self.handler.read().is_some()
    }

    pub(crate) fn fire(&self) {
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler.handle_irq(self);
        }
    }

    pub(crate) fn detach(&self) {
        let handler = self.handler.write().take();
        if let Some(handler) = handler {
            handler.detach(self);
        }
    }

    pub fn snapshot(&self) -> MailboxSnapshot {
        MailboxSnapshot {
            id: self.id(),
            owner: self.owner,
            enabled: self.is_enabled(),
            cmd_queue: QueueSnapshot {
                device_addr: self.cmd_addr.load(Ordering::Relaxed),
                capacity: self.command_capacity(),
                head: self.regs.read(self.cmd_csr + cmd_queue::HEAD),
                tail: self.command_tail(),
            },
            resp_queue: QueueSnapshot {
                device_addr: self.resp_addr.load(Ordering::Relaxed),
                capacity: self.response_capacity(),
                head: self.response_head(),
                tail: self.regs.read(self.resp_csr + resp_queue::TAIL),
            },
        }
    }

    fn write_context(&self, offset: usize, value: u32) {
        self.regs.write(self.context_csr + offset, value);
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("id", &self.handle.id.get())
            .field("generation", &self.handle.generation.get())
            .field("owner", &self.owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::MemRegisterFile;
    use crate::queue::WRAP_BIT;
    use std::sync::atomic::AtomicUsize;

    fn mailbox(index: u32) -> (Arc<MemRegisterFile>, Mailbox, CsrLayout) {
        let layout = CsrLayout::default();
        let regs = Arc::new(MemRegisterFile::for_layout(&layout, index + 1));
        let handle = MailboxHandle {
            id: MailboxId::new(index),
            generation: Generation::new(1),
        };
        let mb = Mailbox::new(handle, Owner::Vii, regs.clone(), &layout);
        (regs, mb, layout)
    }

    #[test]
    fn configure_rejects_bad_capacity_and_address() {
        let (_, mb, _) = mailbox(1);
        for cap in [0, MAX_QUEUE_SIZE + 1] {
            assert!(matches!(
                mb.configure_queue(QueueRole::Command, 0x1000, cap),
                Err(MailboxError::InvalidArgument(_))
            ));
        }
        assert!(matches!(
            mb.configure_queue(QueueRole::Response, 1 << 36, 8),
            Err(MailboxError::InvalidArgument(_))
        ));
        assert_eq!(mb.command_capacity(), 0);
        assert_eq!(mb.response_capacity(), 0);
    }

    #[test]
    fn configure_programs_context_registers() {
        let (regs, mb, layout) = mailbox(2);
        let ctx = layout.context(2);
        mb.configure_queue(QueueRole::Command, 0xa_1234_5000, 16).unwrap();
        assert_eq!(regs.read(ctx + context::CMD_QUEUE_ADDRESS_LOW), 0x1234_5000);
        assert_eq!(regs.read(ctx + context::CMD_QUEUE_ADDRESS_HIGH), 0xa);
        assert_eq!(regs.read(ctx + context::CMD_QUEUE_SIZE), 16);

        mb.configure_queue(QueueRole::Response, 0x8000, 32).unwrap();
        assert_eq!(regs.read(ctx + context::RESP_QUEUE_ADDRESS_LOW), 0x8000);
        assert_eq!(regs.read(ctx + context::RESP_QUEUE_SIZE), 32);
    }

    #[test]
    fn command_tail_stops_at_firmware_head() {
        let (regs, mb, layout) = mailbox(1);
        mb.configure_queue(QueueRole::Command, 0x1000, 4).unwrap();

        mb.advance_command_tail(3).unwrap();
        assert_eq!(regs.read(layout.cmd_queue(1) + cmd_queue::TAIL), 3);
        assert_eq!(mb.advance_command_tail(2), Err(MailboxError::ResourceBusy));
        mb.advance_command_tail(1).unwrap();
        assert!(mb.command_queue_full());
        assert_eq!(mb.command_tail(), WRAP_BIT);

        // firmware consumes two
        regs.write(layout.cmd_queue(1) + cmd_queue::HEAD, 2);
        mb.advance_command_tail(2).unwrap();
        assert_eq!(mb.command_tail(), WRAP_BIT | 2);
        assert_eq!(mb.advance_command_tail(1), Err(MailboxError::ResourceBusy));
    }

    #[test]
    fn advance_beyond_capacity_is_invalid() {
        let (_, mb, _) = mailbox(1);
        mb.configure_queue(QueueRole::Command, 0x1000, 4).unwrap();
        mb.configure_queue(QueueRole::Response, 0x2000, 4).unwrap();
        assert!(matches!(
            mb.advance_command_tail(5),
            Err(MailboxError::InvalidArgument(_))
        ));
        assert!(matches!(
            mb.advance_response_head(5),
            Err(MailboxError::InvalidArgument(_))
        ));
    }

    #[test]
    fn response_head_needs_unread_entries() {
        let (regs, mb, layout) = mailbox(1);
        mb.configure_queue(QueueRole::Response, 0x2000, 4).unwrap();
        assert!(matches!(
            mb.advance_response_head(1),
            Err(MailboxError::InvalidArgument(_))
        ));

        regs.write(layout.resp_queue(1) + resp_queue::TAIL, 3);
        mb.advance_response_head(2).unwrap();
        assert_eq!(regs.read(layout.resp_queue(1) + resp_queue::HEAD), 2);
        assert!(mb.advance_response_head(2).is_err());
        mb.advance_response_head(1).unwrap();
        assert_eq!(mb.response_head(), 3);
    }

    #[test]
    fn reset_zeroes_indices_and_reenables() {
        let (regs, mb, layout) = mailbox(1);
        mb.configure_queue(QueueRole::Command, 0x1000, 4).unwrap();
        mb.configure_queue(QueueRole::Response, 0x2000, 4).unwrap();
        mb.advance_command_tail(2).unwrap();
        regs.write(layout.cmd_queue(1) + cmd_queue::HEAD, 1);
        regs.write(layout.resp_queue(1) + resp_queue::TAIL, 1);

        mb.reset();

        assert_eq!(mb.command_tail(), 0);
        assert_eq!(mb.response_head(), 0);
        assert_eq!(regs.read(layout.cmd_queue(1) + cmd_queue::HEAD), 0);
        assert_eq!(regs.read(layout.cmd_queue(1) + cmd_queue::TAIL), 0);
        assert_eq!(regs.read(layout.resp_queue(1) + resp_queue::TAIL), 0);
        assert!(mb.is_enabled());
    }

    #[test]
    fn init_doorbells_enables_both_queues() {
        let (regs, mb, layout) = mailbox(3);
        mb.init_doorbells();
        let ctx = layout.context(3);
        assert_eq!(regs.read(ctx + context::CMD_QUEUE_DOORBELL_ENABLE), 1);
        assert_eq!(regs.read(ctx + context::RESP_QUEUE_DOORBELL_ENABLE), 1);
        assert_eq!(regs.read(ctx + context::CMD_QUEUE_DOORBELL_CLEAR), 1);
        assert_eq!(regs.read(layout.resp_queue(3) + resp_queue::DOORBELL_CLEAR), 1);
    }

    #[test]
    fn fire_reaches_closure_handler() {
        let (_, mb, _) = mailbox(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        mb.set_handler(Some(Arc::new(move |_: &Mailbox| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        mb.fire();
        mb.fire();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        mb.detach();
        assert!(!mb.has_handler());
        mb.fire();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
