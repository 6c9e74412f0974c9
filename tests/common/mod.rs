//! Shared fixtures for integration tests: an in-memory device and a tiny
//! firmware model that consumes commands and posts responses the way the
//! real firmware does.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tpu_mailbox::csr::{cmd_queue, resp_queue};
use tpu_mailbox::kci::{CommandElement, ResponseElement};
use tpu_mailbox::queue;
use tpu_mailbox::{
    HeapQueueMemory, KciConfig, KciEngine, Mailbox, MailboxManager, ManagerConfig,
    MemRegisterFile, RegisterFile,
};

static TRACING: Once = Once::new();

/// Install a fmt subscriber once per test binary. Honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        use tracing_subscriber::{EnvFilter, fmt, prelude::*};
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}

/// Register file, queue memory and mailbox table backing one fake device.
pub struct Device {
    pub regs: Arc<MemRegisterFile>,
    pub memory: Arc<HeapQueueMemory>,
    pub manager: Arc<MailboxManager>,
}

impl Device {
    pub fn new(config: ManagerConfig) -> Self {
        init_tracing();
        let regs = Arc::new(MemRegisterFile::for_layout(&config.csr, config.num_mailbox));
        let memory = Arc::new(HeapQueueMemory::new());
        let manager = Arc::new(MailboxManager::new(config, regs.clone()).unwrap());
        Self {
            regs,
            memory,
            manager,
        }
    }

    pub fn kci(&self, queue_size: u32, timeout: Duration) -> KciEngine {
        KciEngine::new(
            self.manager.clone(),
            self.memory.clone(),
            self.memory.clone(),
            KciConfig {
                timeout,
                queue_size,
            },
        )
        .unwrap()
    }

    pub fn firmware(&self) -> Firmware {
        Firmware {
            regs: self.regs.clone(),
            memory: self.memory.clone(),
            manager: self.manager.clone(),
        }
    }
}

/// Device-side view of the mailbox queues.
#[derive(Clone)]
pub struct Firmware {
    regs: Arc<MemRegisterFile>,
    memory: Arc<HeapQueueMemory>,
    manager: Arc<MailboxManager>,
}

impl Firmware {
    /// Pop every command between head and tail, advancing the head CSR.
    pub fn take_commands(&self, mailbox: &Mailbox) -> Vec<CommandElement> {
        let csr = self.manager.config().csr.cmd_queue(mailbox.id().get());
        let snapshot = mailbox.snapshot();
        let capacity = snapshot.cmd_queue.capacity;
        let Some(region) = self.memory.lookup(snapshot.cmd_queue.device_addr) else {
            return Vec::new();
        };

        let mut head = self.regs.read(csr + cmd_queue::HEAD);
        let tail = self.regs.read(csr + cmd_queue::TAIL);
        let count = queue::occupancy(head, tail, capacity);
        if count == 0 {
            return Vec::new();
        }
        let mut commands = Vec::new();
        for _ in 0..count {
            let mut buf = [0u8; CommandElement::SIZE];
            region.read_bytes(
                queue::real_index(head) as usize * CommandElement::SIZE,
                &mut buf,
            );
            commands.push(CommandElement::decode(&buf));
            head = queue::advance(head, 1, capacity);
        }
        self.regs.write(csr + cmd_queue::HEAD, head);
        commands
    }

    /// Append responses at the response tail without raising an interrupt.
    pub fn post(&self, mailbox: &Mailbox, responses: &[ResponseElement]) {
        let csr = self.manager.config().csr.resp_queue(mailbox.id().get());
        let snapshot = mailbox.snapshot();
        let capacity = snapshot.resp_queue.capacity;
        let Some(region) = self.memory.lookup(snapshot.resp_queue.device_addr) else {
            return;
        };

        let mut tail = self.regs.read(csr + resp_queue::TAIL);
        for resp in responses {
            region.write_bytes(
                queue::real_index(tail) as usize * ResponseElement::SIZE,
                &resp.encode(),
            );
            tail = queue::advance(tail, 1, capacity);
        }
        self.regs.write(csr + resp_queue::TAIL, tail);
    }

    /// Raise the response doorbell and deliver the interrupt.
    pub fn interrupt(&self, mailbox: &Mailbox) -> usize {
        let csr = self.manager.config().csr.resp_queue(mailbox.id().get());
        self.regs.write(csr + resp_queue::DOORBELL_STATUS, 1);
        let serviced = self.manager.dispatch_interrupt();
        // Plain memory does not model write-1-to-clear.
        self.regs.write(csr + resp_queue::DOORBELL_STATUS, 0);
        serviced
    }

    /// Consume all pending commands and answer each with `reply`.
    /// Returns the commands that were served.
    pub fn serve(
        &self,
        mailbox: &Mailbox,
        reply: impl Fn(&CommandElement) -> ResponseElement,
    ) -> Vec<CommandElement> {
        let commands = self.take_commands(mailbox);
        if !commands.is_empty() {
            let responses: Vec<_> = commands.iter().map(&reply).collect();
            self.post(mailbox, &responses);
            self.interrupt(mailbox);
        }
        commands
    }

    /// Run `serve` in a loop on a background thread until `stop` is set.
    /// The join handle yields every command seen, in arrival order.
    pub fn spawn(
        self,
        mailbox: Arc<Mailbox>,
        stop: Arc<AtomicBool>,
        reply: impl Fn(&CommandElement) -> ResponseElement + Send + 'static,
    ) -> JoinHandle<Vec<CommandElement>> {
        thread::spawn(move || {
            let mut seen = Vec::new();
            while !stop.load(Ordering::Acquire) {
                let served = self.serve(&mailbox, &reply);
                if served.is_empty() {
                    thread::sleep(Duration::from_micros(200));
                }
                seen.extend(served);
            }
            seen
        })
    }
}

/// Response echoing the command's sequence number with `code`.
pub fn reply(cmd: &CommandElement, code: u16) -> ResponseElement {
    ResponseElement {
        seq: cmd.seq,
        code,
        status: 0,
        retval: 0,
    }
}
