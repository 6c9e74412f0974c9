//! The fixed table of mailbox slots.
//!
//! Slot 0 is reserved for the KCI. Slots `1 .. 1 + num_vii` serve VII
//! channels and the next `num_p2p` slots serve peer-to-peer channels.
//!
//! Lock order: the table lock may be held while calling into a mailbox
//! handler's `handle_irq`, but nothing holding a KCI-internal lock ever
//! takes the table lock. Handler `detach` runs after the table lock is
//! dropped.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::ManagerConfig;
use crate::csr::RegisterFile;
use crate::error::MailboxError;
use crate::mailbox::{Mailbox, MailboxSnapshot, Owner};
use crate::types::{Generation, MailboxHandle, MailboxId};

struct Table {
    slots: Vec<Option<Arc<Mailbox>>>,
    generations: Vec<Generation>,
}

pub struct MailboxManager {
    config: ManagerConfig,
    regs: Arc<dyn RegisterFile>,
    table: RwLock<Table>,
}

impl MailboxManager {
    pub fn new(config: ManagerConfig, regs: Arc<dyn RegisterFile>) -> Result<Self, MailboxError> {
        config.validate()?;
        let n = config.num_mailbox as usize;
        debug!(
            num_mailbox = config.num_mailbox,
            num_vii = config.num_vii,
            num_p2p = config.num_p2p,
            "mailbox manager created"
        );
        Ok(Self {
            table: RwLock::new(Table {
                slots: vec![None; n],
                generations: vec![Generation::new(0); n],
            }),
            config,
            regs,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn vii_range(&self) -> Range<u32> {
        1..1 + self.config.num_vii
    }

    pub fn p2p_range(&self) -> Range<u32> {
        let start = self.vii_range().end;
        start..start + self.config.num_p2p
    }

    /// Build a mailbox in an empty slot. Caller holds the write lock.
    fn create_locked(&self, table: &mut Table, index: u32, owner: Owner) -> Arc<Mailbox> {
        let i = index as usize;
        debug_assert!(table.slots[i].is_none());
        let generation = table.generations[i].next();
        table.generations[i] = generation;
        let handle = MailboxHandle {
            id: MailboxId::new(index),
            generation,
        };
        let mailbox = Arc::new(Mailbox::new(handle, owner, self.regs.clone(), &self.config.csr));
        mailbox.init_doorbells();
        table.slots[i] = Some(mailbox.clone());
        debug!(mailbox = index, generation = generation.get(), ?owner, "mailbox created");
        mailbox
    }

    /// Disable slot `index` without allocating it.
    fn disable_index(&self, index: u32) {
        let ctx = self.config.csr.context(index);
        self.regs.write(ctx + crate::csr::context::CONTEXT_ENABLE, 0);
    }

    /// Reset, disable and re-arm the doorbells of slot `index` through its
    /// registers alone. Used for slots with no mailbox behind them.
    fn reset_index(&self, index: u32) {
        use crate::csr::{cmd_queue, context, resp_queue};
        let csr = &self.config.csr;
        let (ctx, cmd, resp) = (csr.context(index), csr.cmd_queue(index), csr.resp_queue(index));
        self.disable_index(index);
        self.regs.write(cmd + cmd_queue::HEAD, 0);
        self.regs.write_sync(cmd + cmd_queue::TAIL, 0);
        self.regs.write(resp + resp_queue::HEAD, 0);
        self.regs.write(resp + resp_queue::TAIL, 0);
        self.regs.write(resp + resp_queue::DOORBELL_CLEAR, 1);
        self.regs.write(ctx + context::CMD_QUEUE_DOORBELL_CLEAR, 1);
        self.regs.write(ctx + context::CMD_QUEUE_DOORBELL_ENABLE, 1);
        self.regs.write(ctx + context::RESP_QUEUE_DOORBELL_ENABLE, 1);
    }

    /// Claim the KCI slot.
    pub fn allocate_kci(&self) -> Result<Arc<Mailbox>, MailboxError> {
        let mut table = self.table.write();
        if table.slots[MailboxId::KCI.index()].is_some() {
            return Err(MailboxError::AlreadyInUse);
        }
        Ok(self.create_locked(&mut table, MailboxId::KCI.get(), Owner::Kci))
    }

    /// Claim the first free slot in the VII range.
    pub fn allocate_vii(&self) -> Result<Arc<Mailbox>, MailboxError> {
        let mut table = self.table.write();
        let index = self
            .vii_range()
            .find(|&i| table.slots[i as usize].is_none())
            .ok_or(MailboxError::ResourceExhausted)?;
        Ok(self.create_locked(&mut table, index, Owner::Vii))
    }

    /// Claim the first `n` P2P slots as one transaction.
    ///
    /// The slot at `skip` (relative to the batch) is disabled instead of
    /// allocated and comes back as `None`. Either every slot is claimed or
    /// the table is left untouched: all slots are checked before any is
    /// created, under one write lock.
    pub fn allocate_p2p_batch(
        &self,
        n: u32,
        skip: Option<u32>,
    ) -> Result<Vec<Option<Arc<Mailbox>>>, MailboxError> {
        let range = self.p2p_range();
        if n > range.len() as u32 {
            return Err(MailboxError::InvalidArgument("P2P range smaller than batch"));
        }
        if skip.is_some_and(|s| s >= n) {
            return Err(MailboxError::InvalidArgument("skip index outside batch"));
        }

        let mut table = self.table.write();
        let batch = range.start..range.start + n;
        if batch.clone().any(|i| table.slots[i as usize].is_some()) {
            return Err(MailboxError::ResourceExhausted);
        }

        let mailboxes = batch
            .enumerate()
            .map(|(i, index)| {
                if skip == Some(i as u32) {
                    self.disable_index(index);
                    None
                } else {
                    Some(self.create_locked(&mut table, index, Owner::P2p))
                }
            })
            .collect();
        Ok(mailboxes)
    }

    /// Look up a live mailbox by handle.
    pub fn get(&self, handle: MailboxHandle) -> Option<Arc<Mailbox>> {
        let table = self.table.read();
        table
            .slots
            .get(handle.id.index())?
            .as_ref()
            .filter(|mb| mb.generation() == handle.generation)
            .cloned()
    }

    /// Release a mailbox.
    ///
    /// A handle that no longer matches the table (already removed, or the
    /// slot has since been reallocated) is rejected without touching
    /// anything.
    pub fn remove(&self, handle: MailboxHandle) -> Result<(), MailboxError> {
        let mailbox = {
            let mut table = self.table.write();
            let slot = table.slots.get_mut(handle.id.index());
            match slot {
                Some(slot)
                    if slot
                        .as_ref()
                        .is_some_and(|mb| mb.generation() == handle.generation) =>
                {
                    let mailbox = slot.take();
                    // Disable before the slot can be reused.
                    if let Some(mb) = &mailbox {
                        mb.disable();
                    }
                    mailbox
                }
                _ => None,
            }
        };

        let Some(mailbox) = mailbox else {
            warn!(
                mailbox = handle.id.get(),
                generation = handle.generation.get(),
                "remove with stale mailbox handle"
            );
            return Err(MailboxError::InvalidArgument("stale mailbox handle"));
        };

        mailbox.detach();
        debug!(mailbox = handle.id.get(), "mailbox removed");
        Ok(())
    }

    /// Disable and release every slot.
    pub fn remove_all(&self) {
        let removed: Vec<Arc<Mailbox>> = {
            let mut table = self.table.write();
            let removed: Vec<_> = table.slots.iter_mut().filter_map(Option::take).collect();
            for mailbox in &removed {
                mailbox.disable();
            }
            removed
        };
        // Handler teardown (KCI worker cancellation) runs without the table lock.
        for mailbox in &removed {
            mailbox.detach();
        }
        debug!(count = removed.len(), "all mailboxes removed");
    }

    /// Service pending response doorbells.
    ///
    /// For every populated slot whose response doorbell is set, clears the
    /// doorbell and then runs its handler. Returns how many mailboxes were
    /// serviced.
    pub fn dispatch_interrupt(&self) -> usize {
        let table = self.table.read();
        let mut serviced = 0;
        for mailbox in table.slots.iter().flatten() {
            if mailbox.response_doorbell_pending() {
                mailbox.clear_response_doorbell();
                mailbox.fire();
                serviced += 1;
            }
        }
        serviced
    }

    /// Bring every slot in the VII range back to a known state after the
    /// device lost its context registers, allocated or not.
    ///
    /// Holds the write lock so no VII is claimed halfway through.
    pub fn reset_vii(&self) {
        let table = self.table.write();
        for index in self.vii_range() {
            match &table.slots[index as usize] {
                Some(mailbox) => {
                    mailbox.reset();
                    mailbox.disable();
                    mailbox.init_doorbells();
                }
                None => self.reset_index(index),
            }
        }
        debug!(num_vii = self.config.num_vii, "VII range reset");
    }

    pub fn snapshot(&self) -> Vec<MailboxSnapshot> {
        let table = self.table.read();
        table.slots.iter().flatten().map(|mb| mb.snapshot()).collect()
    }

    pub fn populated(&self) -> usize {
        self.table.read().slots.iter().flatten().count()
    }
}

impl std::fmt::Debug for MailboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxManager")
            .field("config", &self.config)
            .field("populated", &self.populated())
            .finish()
    }
}
