//! VII (virtual inference interface) channels: a mailbox from the VII
//! range with its own queues, used by one device group to submit work
//! directly to firmware.

use std::sync::Arc;

use crate::error::MailboxError;
use crate::kci::{CommandElement, ViiResponseElement};
use crate::mailbox::{Mailbox, MailboxHandler};
use crate::manager::MailboxManager;
use crate::memory::{CoherentBuffer, QueueMemory};
use crate::queue::MAX_QUEUE_SIZE;
use crate::types::{ContextId, QueueRole};

pub const VII_CMD_ELEMENT_SIZE: usize = CommandElement::SIZE;
pub const VII_RESP_ELEMENT_SIZE: usize = ViiResponseElement::SIZE;

/// Queue sizes and scheduling attributes requested for a VII channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViiAttributes {
    /// Command queue size in KiB.
    pub cmd_queue_kib: u32,
    /// Response queue size in KiB.
    pub resp_queue_kib: u32,
    pub priority: u32,
    /// Interrupt firmware on every command tail update.
    pub cmd_tail_doorbell: bool,
}

impl Default for ViiAttributes {
    fn default() -> Self {
        Self {
            cmd_queue_kib: 16,
            resp_queue_kib: 12,
            priority: 0,
            cmd_tail_doorbell: false,
        }
    }
}

/// Number of `element_size` entries that fit in `kib` KiB.
pub fn queue_entries(kib: u32, element_size: usize) -> Result<u32, MailboxError> {
    let entries = u64::from(kib) * 1024 / element_size as u64;
    if entries == 0 || entries > u64::from(MAX_QUEUE_SIZE) {
        return Err(MailboxError::InvalidArgument("VII queue size out of range"));
    }
    Ok(entries as u32)
}

/// An initialised VII channel. Dropping it removes the mailbox and frees
/// its queue memory.
pub struct Vii {
    manager: Arc<MailboxManager>,
    memory: Arc<dyn QueueMemory>,
    mailbox: Arc<Mailbox>,
    cmd_queue: Option<CoherentBuffer>,
    resp_queue: Option<CoherentBuffer>,
}

impl Vii {
    /// Claim a VII mailbox, program its queues and attributes, install
    /// `on_response` as its interrupt handler and enable it.
    pub fn new(
        manager: Arc<MailboxManager>,
        memory: Arc<dyn QueueMemory>,
        attrs: &ViiAttributes,
        on_response: Arc<dyn MailboxHandler>,
    ) -> Result<Self, MailboxError> {
        let cmd_entries = queue_entries(attrs.cmd_queue_kib, VII_CMD_ELEMENT_SIZE)?;
        let resp_entries = queue_entries(attrs.resp_queue_kib, VII_RESP_ELEMENT_SIZE)?;

        let mailbox = manager.allocate_vii()?;
        let mut vii = Self {
            manager,
            memory,
            mailbox,
            cmd_queue: None,
            resp_queue: None,
        };
        // Any early return from here drops `vii`, which undoes the above.
        vii.cmd_queue = Some(vii.setup_queue(QueueRole::Command, cmd_entries)?);
        vii.resp_queue = Some(vii.setup_queue(QueueRole::Response, resp_entries)?);

        vii.mailbox.set_priority(attrs.priority);
        vii.mailbox.set_cmd_tail_doorbell(attrs.cmd_tail_doorbell);
        vii.mailbox.set_handler(Some(on_response));
        vii.mailbox.enable();
        debug!(
            mailbox = vii.mailbox.id().get(),
            cmd_entries, resp_entries, "VII channel ready"
        );
        Ok(vii)
    }

    fn setup_queue(&self, role: QueueRole, entries: u32) -> Result<CoherentBuffer, MailboxError> {
        let element_size = match role {
            QueueRole::Command => VII_CMD_ELEMENT_SIZE,
            QueueRole::Response => VII_RESP_ELEMENT_SIZE,
        };
        let buffer = self.memory.allocate(entries as usize * element_size)?;
        if let Err(e) = self
            .mailbox
            .configure_queue(role, buffer.device_addr(), entries)
        {
            self.memory.free(buffer);
            return Err(e);
        }
        Ok(buffer)
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    /// Device context the group's buffers are mapped into.
    pub fn context_id(&self) -> ContextId {
        ContextId::new(ContextId::VII_BASE.get() + self.mailbox.id().get() - 1)
    }

    pub fn command_queue(&self) -> Option<&CoherentBuffer> {
        self.cmd_queue.as_ref()
    }

    pub fn response_queue(&self) -> Option<&CoherentBuffer> {
        self.resp_queue.as_ref()
    }
}

impl Drop for Vii {
    fn drop(&mut self) {
        if let Err(e) = self.manager.remove(self.mailbox.handle()) {
            debug!(error = %e, "VII mailbox already removed");
        }
        for buffer in [self.cmd_queue.take(), self.resp_queue.take()]
            .into_iter()
            .flatten()
        {
            self.memory.free(buffer);
        }
    }
}

impl std::fmt::Debug for Vii {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vii")
            .field("mailbox", &self.mailbox)
            .field("context", &self.context_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::csr::{MemRegisterFile, RegisterFile, context, resp_queue};
    use crate::memory::HeapQueueMemory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ignore() -> Arc<dyn MailboxHandler> {
        Arc::new(|_: &Mailbox| {})
    }

    fn setup(num_vii: u32) -> (Arc<MemRegisterFile>, Arc<MailboxManager>, Arc<HeapQueueMemory>) {
        let config = ManagerConfig {
            num_mailbox: 1 + num_vii,
            num_vii,
            num_p2p: 0,
            ..ManagerConfig::default()
        };
        let regs = Arc::new(MemRegisterFile::for_layout(&config.csr, config.num_mailbox));
        let manager = Arc::new(MailboxManager::new(config, regs.clone()).unwrap());
        (regs, manager, Arc::new(HeapQueueMemory::new()))
    }

    #[test]
    fn kib_sizes_convert_to_entries() {
        assert_eq!(queue_entries(16, VII_CMD_ELEMENT_SIZE).unwrap(), 512);
        assert_eq!(queue_entries(12, VII_RESP_ELEMENT_SIZE).unwrap(), 512);
        // 1024 entries would need the wrap bit as an index
        assert!(queue_entries(32, VII_CMD_ELEMENT_SIZE).is_err());
        assert_eq!(queue_entries(1, VII_RESP_ELEMENT_SIZE).unwrap(), 42);
        assert!(queue_entries(0, VII_CMD_ELEMENT_SIZE).is_err());
        assert!(queue_entries(64, VII_CMD_ELEMENT_SIZE).is_err());
    }

    #[test]
    fn new_programs_queues_and_attributes() {
        let (regs, manager, memory) = setup(2);
        let attrs = ViiAttributes {
            cmd_queue_kib: 4,
            resp_queue_kib: 3,
            priority: 5,
            cmd_tail_doorbell: true,
        };
        let vii = Vii::new(manager.clone(), memory.clone(), &attrs, ignore()).unwrap();
        let ctx = manager.config().csr.context(vii.mailbox().id().get());

        assert_eq!(vii.mailbox().command_capacity(), 128);
        assert_eq!(vii.mailbox().response_capacity(), 128);
        assert_eq!(regs.read(ctx + context::PRIORITY), 5);
        assert_eq!(regs.read(ctx + context::CMD_QUEUE_TAIL_DOORBELL_ENABLE), 1);
        assert!(vii.mailbox().is_enabled());
        assert_eq!(vii.context_id(), ContextId::new(1));
        assert_eq!(memory.live_allocations(), 2);

        drop(vii);
        assert_eq!(memory.live_allocations(), 0);
        assert_eq!(manager.populated(), 0);
    }

    #[test]
    fn bad_size_allocates_nothing() {
        let (_, manager, memory) = setup(1);
        let attrs = ViiAttributes {
            cmd_queue_kib: 0,
            ..ViiAttributes::default()
        };
        assert!(Vii::new(manager.clone(), memory.clone(), &attrs, ignore()).is_err());
        assert_eq!(manager.populated(), 0);
        assert_eq!(memory.live_allocations(), 0);
    }

    #[test]
    fn exhausted_range_is_reported() {
        let (_, manager, memory) = setup(1);
        let _first =
            Vii::new(manager.clone(), memory.clone(), &ViiAttributes::default(), ignore()).unwrap();
        assert_eq!(
            Vii::new(manager, memory, &ViiAttributes::default(), ignore()).unwrap_err(),
            MailboxError::ResourceExhausted
        );
    }

    #[test]
    fn response_doorbell_reaches_installed_handler() {
        let (regs, manager, memory) = setup(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let vii = Vii::new(
            manager.clone(),
            memory,
            &ViiAttributes::default(),
            Arc::new(move |_: &Mailbox| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        assert!(vii.mailbox().has_handler());

        let resp_csr = manager.config().csr.resp_queue(vii.mailbox().id().get());
        regs.write(resp_csr + resp_queue::DOORBELL_STATUS, 1);
        assert_eq!(manager.dispatch_interrupt(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(vii);
        assert_eq!(manager.populated(), 0);
    }
}
