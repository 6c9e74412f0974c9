//! Kernel control interface: the sequenced command/response protocol that
//! runs on mailbox 0.
//!
//! Producers push commands under the submission lock, which assigns
//! strictly increasing sequence numbers. A dedicated worker thread drains
//! the response queue whenever the mailbox interrupt fires and reconciles
//! each response against the wait list of outstanding commands.
//!
//! Lock order, outermost first:
//! - submission (`cmd`) -> queue-room event (`room`)
//! - submission (`cmd`) -> wait list (`waiters`) -> response slot
//! - submission (`cmd`) -> drain (`resp`)
//! - harvest (`harvest`) -> drain (`resp`)
//! - harvest (`harvest`) -> queue-room event (`room`)
//! - harvest (`harvest`) -> wait list (`waiters`) -> response slot
//!
//! The harvest lock covers one fetch and the reconciliation of everything
//! it fetched, so responses reach the wait list in queue order. It is never
//! taken with the submission lock held. The drain lock is released before
//! the wait list is touched, and none of these is held while calling into
//! the mailbox manager.

mod commands;
mod element;

pub use commands::QueueMapping;
pub use element::{
    CommandCode, CommandElement, DmaDescriptor, GroupDetail, ResponseElement, ResponseStatus,
    ViiResponseElement,
};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::KciConfig;
use crate::error::{FirmwareCode, KciError};
use crate::mailbox::{Mailbox, MailboxHandler};
use crate::manager::MailboxManager;
use crate::memory::{AddressTranslation, CoherentBuffer, QueueMemory};
use crate::queue;
use crate::types::QueueRole;

/// Host-side view of a response as delivered to a waiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KciResponse {
    pub seq: u64,
    pub code: u16,
    pub status: ResponseStatus,
    pub retval: u32,
}

/// Where the harvester deposits the response to one command.
#[derive(Debug)]
pub struct ResponseSlot {
    response: Mutex<KciResponse>,
}

impl Default for ResponseSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseSlot {
    pub fn new() -> Self {
        Self {
            response: Mutex::new(KciResponse {
                seq: 0,
                code: 0,
                status: ResponseStatus::Waiting,
                retval: 0,
            }),
        }
    }

    pub fn response(&self) -> KciResponse {
        *self.response.lock()
    }

    pub fn status(&self) -> ResponseStatus {
        self.response.lock().status
    }

    fn arm(&self, seq: u64) {
        let mut r = self.response.lock();
        r.seq = seq;
        r.status = ResponseStatus::Waiting;
    }

    fn complete(&self, resp: &ResponseElement) {
        *self.response.lock() = KciResponse {
            seq: resp.seq,
            code: resp.code,
            status: ResponseStatus::from_u16(resp.status),
            retval: resp.retval,
        };
    }

    fn mark_no_response(&self) {
        self.response.lock().status = ResponseStatus::NoResponse;
    }
}

struct WaitEntry {
    seq: u64,
    slot: Arc<ResponseSlot>,
}

struct CmdState {
    /// Sequence number the next pushed command gets.
    seq: u64,
    queue: Option<CoherentBuffer>,
}

struct RespState {
    queue: Option<CoherentBuffer>,
}

#[derive(Default)]
struct WorkerState {
    pending: bool,
    shutdown: bool,
}

struct KciInner {
    mailbox: Arc<Mailbox>,
    config: KciConfig,

    cmd: Mutex<CmdState>,
    resp: Mutex<RespState>,
    /// Serializes whole harvests between the worker and `harvest_now`.
    harvest: Mutex<()>,
    /// Mirror of `CmdState::seq` readable without the submission lock.
    next_seq: AtomicU64,

    /// Bumped after every harvest; producers waiting for queue room sleep on it.
    room: Mutex<u64>,
    room_cond: Condvar,

    /// Outstanding commands, ascending by sequence number.
    waiters: Mutex<VecDeque<WaitEntry>>,
    wait_cond: Condvar,

    work: Mutex<WorkerState>,
    work_cond: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl KciInner {
    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    fn push(
        &self,
        mut cmd: CommandElement,
        slot: Option<Arc<ResponseSlot>>,
        deadline: Instant,
    ) -> Result<u64, KciError> {
        let mut state = self.cmd.lock();
        let Some(queue) = state.queue.clone() else {
            return Err(KciError::Released);
        };
        let seq = state.seq;
        cmd.seq = seq;

        self.wait_for_room(deadline)?;

        if let Some(slot) = &slot {
            slot.arm(seq);
            self.waiters.lock().push_back(WaitEntry {
                seq,
                slot: slot.clone(),
            });
        }

        let index = queue::real_index(self.mailbox.command_tail()) as usize;
        queue
            .region()
            .write_bytes(index * CommandElement::SIZE, &cmd.encode());
        if let Err(e) = self.mailbox.advance_command_tail(1) {
            if slot.is_some() {
                self.remove_waiter(seq);
            }
            return Err(e.into());
        }
        self.mailbox.ring_command_doorbell();

        state.seq = seq.wrapping_add(1);
        self.next_seq.store(state.seq, Ordering::Release);
        trace!(seq, code = cmd.code, "command pushed");
        Ok(seq)
    }

    /// Block until firmware has consumed enough commands to leave a free slot.
    fn wait_for_room(&self, deadline: Instant) -> Result<(), KciError> {
        let mut events = self.room.lock();
        loop {
            if !self.mailbox.command_queue_full() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                debug!("command queue still full at deadline");
                return Err(KciError::Timeout);
            }
            self.room_cond.wait_until(&mut events, deadline);
        }
    }

    fn wait_for_response(
        &self,
        slot: &ResponseSlot,
        seq: u64,
        deadline: Instant,
    ) -> Result<KciResponse, KciError> {
        let mut waiters = self.waiters.lock();
        loop {
            let resp = slot.response();
            if resp.status != ResponseStatus::Waiting {
                return Ok(resp);
            }
            if Instant::now() >= deadline {
                // A late response must not find this entry.
                waiters.retain(|e| e.seq != seq);
                debug!(seq, "no response before deadline");
                return Err(KciError::Timeout);
            }
            self.wait_cond.wait_until(&mut waiters, deadline);
        }
    }

    fn remove_waiter(&self, seq: u64) {
        self.waiters.lock().retain(|e| e.seq != seq);
    }

    // -------------------------------------------------------------------------
    // Harvesting
    // -------------------------------------------------------------------------

    fn schedule_harvest(&self) {
        let mut state = self.work.lock();
        if state.shutdown || state.pending {
            return;
        }
        state.pending = true;
        self.work_cond.notify_one();
    }

    fn harvest(&self) {
        let _harvesting = self.harvest.lock();
        let responses = self.fetch_responses();

        {
            let mut events = self.room.lock();
            *events = events.wrapping_add(1);
        }
        self.room_cond.notify_all();

        if responses.is_empty() {
            return;
        }
        trace!(count = responses.len(), "harvested responses");
        for resp in &responses {
            self.reconcile(resp);
        }
        self.wait_cond.notify_all();
    }

    /// Copy every available response out of the queue, tagging each as ok.
    fn fetch_responses(&self) -> Vec<ResponseElement> {
        let state = self.resp.lock();
        let Some(queue) = state.queue.as_ref() else {
            return Vec::new();
        };
        let capacity = self.mailbox.response_capacity();
        let mut fetched = Vec::new();

        loop {
            let head = self.mailbox.response_head();
            let tail = self.mailbox.response_tail();
            let count = queue::occupancy(head, tail, capacity);
            if count == 0 {
                break;
            }

            let mut pos = queue::real_index(head);
            for _ in 0..count {
                let mut buf = [0u8; ResponseElement::SIZE];
                queue
                    .region()
                    .read_bytes(pos as usize * ResponseElement::SIZE, &mut buf);
                let mut resp = ResponseElement::decode(&buf);
                resp.status = ResponseStatus::Ok.as_u16();
                fetched.push(resp);
                pos += 1;
                if pos == capacity {
                    pos = 0;
                }
            }

            if let Err(e) = self.mailbox.advance_response_head(count) {
                error!(error = %e, count, "failed to release response entries");
                break;
            }
            // Firmware may be stalled on a full response queue.
            if count == capacity {
                self.mailbox.ring_command_doorbell();
            }
        }
        fetched
    }

    /// Apply one response to the wait list.
    ///
    /// Entries older than the response are failed with `NoResponse`, a
    /// matching entry receives the response, newer entries are left alone.
    fn reconcile(&self, resp: &ResponseElement) {
        let mut waiters = self.waiters.lock();
        let mut matched = false;
        while let Some(front) = waiters.front() {
            if front.seq > resp.seq {
                break;
            }
            let Some(entry) = waiters.pop_front() else {
                break;
            };
            if entry.seq == resp.seq {
                entry.slot.complete(resp);
                matched = true;
                break;
            }
            warn!(seq = entry.seq, answered = resp.seq, "firmware skipped command");
            entry.slot.mark_no_response();
        }
        drop(waiters);

        if !matched {
            if resp.seq >= self.next_seq.load(Ordering::Acquire) {
                warn!(
                    seq = resp.seq,
                    next = self.next_seq.load(Ordering::Relaxed),
                    "response for a sequence number never issued"
                );
            } else {
                trace!(seq = resp.seq, "dropping response with no waiter");
            }
        }
    }

    fn run_worker(self: Arc<Self>) {
        loop {
            {
                let mut state = self.work.lock();
                while !state.pending && !state.shutdown {
                    self.work_cond.wait(&mut state);
                }
                if state.shutdown {
                    break;
                }
                state.pending = false;
            }
            self.harvest();
        }
        trace!("response worker exiting");
    }

    /// Stop the worker and wait for any in-progress harvest to finish.
    fn stop_worker(&self) {
        {
            let mut state = self.work.lock();
            state.shutdown = true;
            state.pending = false;
        }
        self.work_cond.notify_all();

        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("response worker panicked");
        }
    }

    fn take_queues(&self) -> Vec<CoherentBuffer> {
        let cmd = self.cmd.lock().queue.take();
        let resp = self.resp.lock().queue.take();
        cmd.into_iter().chain(resp).collect()
    }
}

/// Interrupt hook installed on the KCI mailbox.
struct KciIrq {
    inner: Weak<KciInner>,
}

impl MailboxHandler for KciIrq {
    fn handle_irq(&self, _mailbox: &Mailbox) {
        if let Some(inner) = self.inner.upgrade() {
            inner.schedule_harvest();
        }
    }

    fn detach(&self, _mailbox: &Mailbox) {
        if let Some(inner) = self.inner.upgrade() {
            inner.stop_worker();
        }
    }
}

/// The KCI protocol engine. Owns mailbox 0 and its two queues.
pub struct KciEngine {
    inner: Arc<KciInner>,
    manager: Arc<MailboxManager>,
    memory: Arc<dyn QueueMemory>,
    translation: Arc<dyn AddressTranslation>,
    released: AtomicBool,
}

impl KciEngine {
    /// Claim the KCI mailbox, allocate and program both queues, and start
    /// the response worker.
    pub fn new(
        manager: Arc<MailboxManager>,
        memory: Arc<dyn QueueMemory>,
        translation: Arc<dyn AddressTranslation>,
        config: KciConfig,
    ) -> Result<Self, KciError> {
        let mailbox = manager.allocate_kci()?;
        let (cmd_queue, resp_queue) =
            match setup_queues(&mailbox, memory.as_ref(), config.queue_size) {
                Ok(queues) => queues,
                Err(e) => {
                    error!(error = %e, "failed to set up KCI queues");
                    let _ = manager.remove(mailbox.handle());
                    return Err(e);
                }
            };
        mailbox.enable();

        let inner = Arc::new(KciInner {
            mailbox: mailbox.clone(),
            config,
            cmd: Mutex::new(CmdState {
                seq: 0,
                queue: Some(cmd_queue),
            }),
            resp: Mutex::new(RespState {
                queue: Some(resp_queue),
            }),
            harvest: Mutex::new(()),
            next_seq: AtomicU64::new(0),
            room: Mutex::new(0),
            room_cond: Condvar::new(),
            waiters: Mutex::new(VecDeque::new()),
            wait_cond: Condvar::new(),
            work: Mutex::new(WorkerState::default()),
            work_cond: Condvar::new(),
            worker: Mutex::new(None),
        });

        let spawned = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("kci-responses".into())
                .spawn(move || inner.run_worker())
        };
        match spawned {
            Ok(handle) => *inner.worker.lock() = Some(handle),
            Err(e) => {
                error!(error = %e, "failed to start KCI response worker");
                let _ = manager.remove(mailbox.handle());
                for buffer in inner.take_queues() {
                    memory.free(buffer);
                }
                return Err(e.into());
            }
        }

        mailbox.set_handler(Some(Arc::new(KciIrq {
            inner: Arc::downgrade(&inner),
        })));
        info!(
            queue_size = inner.config.queue_size,
            timeout_ms = inner.config.timeout.as_millis() as u64,
            "KCI initialised"
        );

        Ok(Self {
            inner,
            manager,
            memory,
            translation,
            released: AtomicBool::new(false),
        })
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.inner.mailbox
    }

    pub fn config(&self) -> &KciConfig {
        &self.inner.config
    }

    /// Enqueue a command, waiting up to the configured timeout for queue
    /// room. Returns the sequence number assigned to it.
    ///
    /// With a `slot`, the response (or `NoResponse`) is deposited there by
    /// the harvester.
    pub fn push_command(
        &self,
        cmd: CommandElement,
        slot: Option<Arc<ResponseSlot>>,
    ) -> Result<u64, KciError> {
        let deadline = Instant::now() + self.inner.config.timeout;
        self.inner.push(cmd, slot, deadline)
    }

    /// Enqueue a command and block until its response arrives.
    ///
    /// Returns the firmware's response code. `timeout` bounds the wait for
    /// queue room and, from the moment the command is submitted, the wait
    /// for the response.
    pub fn push_command_and_wait(
        &self,
        cmd: CommandElement,
        timeout: Duration,
    ) -> Result<u16, KciError> {
        let slot = Arc::new(ResponseSlot::new());
        let seq = self
            .inner
            .push(cmd, Some(slot.clone()), Instant::now() + timeout)?;
        let resp = self
            .inner
            .wait_for_response(&slot, seq, Instant::now() + timeout)?;

        match resp.status {
            ResponseStatus::Ok => {
                if resp.code != FirmwareCode::Ok.as_u16() {
                    warn!(
                        seq,
                        code = resp.code,
                        known = ?FirmwareCode::from_u16(resp.code),
                        "firmware returned error code"
                    );
                }
                Ok(resp.code)
            }
            ResponseStatus::NoResponse => Err(KciError::NoResponse),
            other => Err(KciError::ProtocolError(other.as_u16())),
        }
    }

    /// Drain and reconcile responses on the calling thread.
    pub fn harvest_now(&self) {
        self.inner.harvest();
    }

    /// Sequence numbers still awaiting a response, in list order.
    pub fn outstanding(&self) -> Vec<u64> {
        self.inner.waiters.lock().iter().map(|e| e.seq).collect()
    }

    /// Sequence number the next command will get.
    pub fn next_sequence(&self) -> u64 {
        self.inner.next_seq.load(Ordering::Acquire)
    }

    /// Re-program both queues and doorbells after the device lost its
    /// mailbox state. Queue memory and sequence numbering are kept.
    pub fn reinit(&self) -> Result<(), KciError> {
        let cmd = self.inner.cmd.lock();
        let resp = self.inner.resp.lock();
        let (Some(cmd_queue), Some(resp_queue)) = (&cmd.queue, &resp.queue) else {
            return Err(KciError::Released);
        };
        let mailbox = &self.inner.mailbox;
        let capacity = self.inner.config.queue_size;
        mailbox.configure_queue(QueueRole::Command, cmd_queue.device_addr(), capacity)?;
        mailbox.configure_queue(QueueRole::Response, resp_queue.device_addr(), capacity)?;
        mailbox.init_doorbells();
        mailbox.enable();
        debug!("KCI reinitialised");
        Ok(())
    }

    /// Stop the worker, give the mailbox back and free both queues.
    ///
    /// Safe to call more than once; later calls do nothing.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.stop_worker();

        let handle = self.inner.mailbox.handle();
        if self.manager.get(handle).is_some() {
            let _ = self.manager.remove(handle);
        }
        for buffer in self.inner.take_queues() {
            self.memory.free(buffer);
        }

        let outstanding = self.inner.waiters.lock().len();
        if outstanding > 0 {
            warn!(outstanding, "KCI released with commands awaiting responses");
        }
        debug!("KCI released");
    }
}

impl Drop for KciEngine {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for KciEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KciEngine")
            .field("mailbox", &self.inner.mailbox)
            .field("next_seq", &self.next_sequence())
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

fn setup_queues(
    mailbox: &Mailbox,
    memory: &dyn QueueMemory,
    capacity: u32,
) -> Result<(CoherentBuffer, CoherentBuffer), KciError> {
    let cmd = memory.allocate(capacity as usize * CommandElement::SIZE)?;
    let resp = match memory.allocate(capacity as usize * ResponseElement::SIZE) {
        Ok(resp) => resp,
        Err(e) => {
            memory.free(cmd);
            return Err(e.into());
        }
    };
    let programmed = mailbox
        .configure_queue(QueueRole::Command, cmd.device_addr(), capacity)
        .and_then(|()| mailbox.configure_queue(QueueRole::Response, resp.device_addr(), capacity));
    if let Err(e) = programmed {
        memory.free(cmd);
        memory.free(resp);
        return Err(e.into());
    }
    Ok((cmd, resp))
}
