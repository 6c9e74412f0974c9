use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use crate::config::{KciConfig, ManagerConfig};
use crate::csr::{MemRegisterFile, RegisterFile, cmd_queue, resp_queue};
use crate::error::KciError;
use crate::kci::{CommandCode, CommandElement, KciEngine, ResponseElement, ResponseSlot};
use crate::manager::MailboxManager;
use crate::memory::HeapQueueMemory;
use crate::queue::{MAX_QUEUE_SIZE, WRAP_BIT, advance, is_wrapped, occupancy, real_index};

fn queue_position() -> impl Strategy<Value = (u32, u32, bool)> {
    (1..=MAX_QUEUE_SIZE).prop_flat_map(|capacity| (Just(capacity), 0..capacity, any::<bool>()))
}

proptest! {
    #[test]
    fn advance_by_occupancy_reaches_tail(
        (capacity, head_pos, head_wrapped) in queue_position(),
        fill in 0u32..=MAX_QUEUE_SIZE,
    ) {
        let fill = fill % (capacity + 1);
        let head = head_pos | if head_wrapped { WRAP_BIT } else { 0 };
        let tail = advance(head, fill, capacity);

        let count = occupancy(head, tail, capacity);
        prop_assert_eq!(count, fill);
        prop_assert_eq!(advance(head, count, capacity), tail);
    }

    #[test]
    fn wrap_bit_flips_once_per_lap(
        capacity in 1u32..=64,
        steps in prop::collection::vec(0u32..=64, 0..200),
    ) {
        let mut index = 0u32;
        let mut total = 0u64;
        let mut flips = 0u64;

        for step in steps {
            let step = step % (capacity + 1);
            let next = advance(index, step, capacity);
            if is_wrapped(next) != is_wrapped(index) {
                flips += 1;
            }
            prop_assert!(occupancy(index, next, capacity) <= capacity);
            index = next;
            total += u64::from(step);
        }

        prop_assert_eq!(flips, total / u64::from(capacity));
        prop_assert_eq!(u64::from(real_index(index)), total % u64::from(capacity));
    }
}

#[derive(Clone, Debug)]
enum Step {
    /// Submit one command, optionally registering a waiter for it.
    Push { wait: bool },
    /// Submit and wait with a deadline nothing answers before.
    TimedOutWait,
    /// Firmware consumes everything pending and answers the commands whose
    /// bit in `skip` is clear, then the host harvests.
    Answer { skip: u8 },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => any::<bool>().prop_map(|wait| Step::Push { wait }),
        1 => Just(Step::TimedOutWait),
        2 => any::<u8>().prop_map(|skip| Step::Answer { skip }),
    ]
}

struct Device {
    regs: Arc<MemRegisterFile>,
    memory: Arc<HeapQueueMemory>,
    manager: Arc<MailboxManager>,
    kci: KciEngine,
}

impl Device {
    fn new(queue_size: u32) -> Self {
        let config = ManagerConfig::default();
        let regs = Arc::new(MemRegisterFile::for_layout(&config.csr, config.num_mailbox));
        let memory = Arc::new(HeapQueueMemory::new());
        let manager = Arc::new(MailboxManager::new(config, regs.clone()).unwrap());
        let kci = KciEngine::new(
            manager.clone(),
            memory.clone(),
            memory.clone(),
            KciConfig {
                timeout: Duration::from_millis(2),
                queue_size,
            },
        )
        .unwrap();
        Self {
            regs,
            memory,
            manager,
            kci,
        }
    }

    /// Move the command head up to the tail.
    fn consume_commands(&self) {
        let csr = self.manager.config().csr.cmd_queue(0);
        let tail = self.regs.read(csr + cmd_queue::TAIL);
        self.regs.write(csr + cmd_queue::HEAD, tail);
    }

    fn respond(&self, seqs: &[u64]) {
        let csr = self.manager.config().csr.resp_queue(0);
        let mailbox = self.kci.mailbox();
        let capacity = mailbox.response_capacity();
        let region = self
            .memory
            .lookup(mailbox.snapshot().resp_queue.device_addr)
            .unwrap();
        let mut tail = self.regs.read(csr + resp_queue::TAIL);
        for &seq in seqs {
            let resp = ResponseElement {
                seq,
                code: seq as u16,
                status: 0,
                retval: 0,
            };
            region.write_bytes(real_index(tail) as usize * ResponseElement::SIZE, &resp.encode());
            tail = advance(tail, 1, capacity);
        }
        self.regs.write(csr + resp_queue::TAIL, tail);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn wait_list_stays_ascending(steps in prop::collection::vec(step(), 1..40)) {
        let device = Device::new(16);
        let kci = &device.kci;
        // First sequence number firmware has not consumed yet.
        let mut consumed = 0u64;

        for step in steps {
            match step {
                Step::Push { wait } => {
                    let slot = wait.then(|| Arc::new(ResponseSlot::new()));
                    match kci.push_command(CommandElement::new(CommandCode::Ack), slot) {
                        Ok(_) | Err(KciError::Timeout) => {}
                        Err(e) => prop_assert!(false, "push failed: {e}"),
                    }
                }
                Step::TimedOutWait => {
                    let result = kci.push_command_and_wait(
                        CommandElement::new(CommandCode::Ack),
                        Duration::from_millis(1),
                    );
                    prop_assert!(matches!(result, Err(KciError::Timeout)));
                }
                Step::Answer { skip } => {
                    let issued = kci.next_sequence();
                    device.consume_commands();
                    let answered: Vec<u64> = (consumed..issued)
                        .filter(|seq| skip & (1 << (seq % 8)) == 0)
                        .collect();
                    consumed = issued;
                    device.respond(&answered);
                    kci.harvest_now();

                    if let Some(&last) = answered.last() {
                        prop_assert!(kci.outstanding().iter().all(|&seq| seq > last));
                    }
                }
            }

            let outstanding = kci.outstanding();
            prop_assert!(
                outstanding.windows(2).all(|w| w[0] < w[1]),
                "wait list out of order: {:?}",
                outstanding
            );
            prop_assert!(outstanding.iter().all(|&seq| seq < kci.next_sequence()));
        }
    }
}
