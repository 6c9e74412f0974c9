//! Control/status register access.
//!
//! Each mailbox owns three small register blocks: a context block (queue
//! addresses, sizes, doorbell enables), a command-queue block and a
//! response-queue block. Where those blocks live is described by a
//! [`CsrLayout`]; how they are read and written is behind [`RegisterFile`].

use std::sync::atomic::{AtomicU32, Ordering, fence};

/// Byte offsets within a mailbox's context block.
pub mod context {
    pub const CONTEXT_ENABLE: usize = 0x00;
    pub const PRIORITY: usize = 0x04;
    pub const CMD_QUEUE_DOORBELL_ENABLE: usize = 0x08;
    pub const CMD_QUEUE_TAIL_DOORBELL_ENABLE: usize = 0x0c;
    pub const CMD_QUEUE_DOORBELL_CLEAR: usize = 0x10;
    pub const CMD_QUEUE_ADDRESS_LOW: usize = 0x14;
    pub const CMD_QUEUE_ADDRESS_HIGH: usize = 0x18;
    pub const CMD_QUEUE_SIZE: usize = 0x1c;
    pub const RESP_QUEUE_DOORBELL_ENABLE: usize = 0x20;
    pub const RESP_QUEUE_TAIL_DOORBELL_ENABLE: usize = 0x24;
    pub const RESP_QUEUE_ADDRESS_LOW: usize = 0x28;
    pub const RESP_QUEUE_ADDRESS_HIGH: usize = 0x2c;
    pub const RESP_QUEUE_SIZE: usize = 0x30;
    pub const CONFIG_SPARE_0: usize = 0x34;
    pub const CONFIG_SPARE_3: usize = 0x40;

    /// Bytes spanned by the block.
    pub const BLOCK_SIZE: usize = CONFIG_SPARE_3 + 4;
}

/// Byte offsets within a mailbox's command-queue block.
pub mod cmd_queue {
    pub const DOORBELL_SET: usize = 0x00;
    pub const DOORBELL_STATUS: usize = 0x04;
    pub const HEAD: usize = 0x08;
    pub const TAIL: usize = 0x0c;
    pub const CONFIG: usize = 0x10;
    pub const ERROR_STATUS: usize = 0x14;

    pub const BLOCK_SIZE: usize = ERROR_STATUS + 4;
}

/// Byte offsets within a mailbox's response-queue block.
pub mod resp_queue {
    pub const DOORBELL_SET: usize = 0x00;
    pub const DOORBELL_CLEAR: usize = 0x04;
    pub const DOORBELL_STATUS: usize = 0x08;
    pub const HEAD: usize = 0x0c;
    pub const TAIL: usize = 0x10;
    pub const CONFIG: usize = 0x14;
    pub const ERROR_STATUS: usize = 0x18;

    pub const BLOCK_SIZE: usize = ERROR_STATUS + 4;
}

/// 32-bit register access by byte offset.
///
/// `write_sync` must not return until the write has landed: doorbell
/// ordering depends on the index being visible before the ring.
pub trait RegisterFile: Send + Sync {
    fn read(&self, offset: usize) -> u32;

    fn write(&self, offset: usize, value: u32);

    /// Read with a barrier so later memory reads observe at least what the
    /// device had published when this register was written.
    fn read_sync(&self, offset: usize) -> u32 {
        let value = self.read(offset);
        fence(Ordering::Acquire);
        value
    }

    /// Write, then read back to flush any posted write before returning.
    fn write_sync(&self, offset: usize, value: u32) {
        fence(Ordering::Release);
        self.write(offset, value);
        let _ = self.read(offset);
        fence(Ordering::SeqCst);
    }
}

/// Where each mailbox's register blocks live, as a per-index stride from a
/// base offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CsrLayout {
    pub context_base: usize,
    pub context_stride: usize,
    pub cmd_queue_base: usize,
    pub resp_queue_base: usize,
    pub queue_stride: usize,
}

impl Default for CsrLayout {
    fn default() -> Self {
        Self {
            context_base: 0x0,
            context_stride: 0x80,
            cmd_queue_base: 0x1_0000,
            resp_queue_base: 0x1_0800,
            queue_stride: 0x1000,
        }
    }
}

impl CsrLayout {
    pub fn context(&self, index: u32) -> usize {
        self.context_base + index as usize * self.context_stride
    }

    pub fn cmd_queue(&self, index: u32) -> usize {
        self.cmd_queue_base + index as usize * self.queue_stride
    }

    pub fn resp_queue(&self, index: u32) -> usize {
        self.resp_queue_base + index as usize * self.queue_stride
    }

    /// Bytes of register space needed to cover `num_mailbox` mailboxes.
    pub fn span(&self, num_mailbox: u32) -> usize {
        let Some(last) = num_mailbox.checked_sub(1) else {
            return 0;
        };
        [
            self.context(last) + context::BLOCK_SIZE,
            self.cmd_queue(last) + cmd_queue::BLOCK_SIZE,
            self.resp_queue(last) + resp_queue::BLOCK_SIZE,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

/// Register file backed by ordinary memory.
///
/// Used for emulated devices and tests: the "device" side reads and writes
/// the same words through the same trait.
pub struct MemRegisterFile {
    words: Box<[AtomicU32]>,
}

impl MemRegisterFile {
    /// Create a zeroed register file of `bytes` bytes (rounded up to a word).
    pub fn new(bytes: usize) -> Self {
        let words = (0..bytes.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        Self { words }
    }

    /// Create a register file large enough for `num_mailbox` mailboxes laid
    /// out per `layout`.
    pub fn for_layout(layout: &CsrLayout, num_mailbox: u32) -> Self {
        Self::new(layout.span(num_mailbox))
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.words.len() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    fn word(&self, offset: usize) -> Option<&AtomicU32> {
        debug_assert!(offset % 4 == 0, "unaligned register offset {offset:#x}");
        let word = self.words.get(offset / 4);
        debug_assert!(word.is_some(), "register offset {offset:#x} out of range");
        word
    }
}

impl RegisterFile for MemRegisterFile {
    fn read(&self, offset: usize) -> u32 {
        self.word(offset).map_or(0, |w| w.load(Ordering::Acquire))
    }

    fn write(&self, offset: usize, value: u32) {
        if let Some(w) = self.word(offset) {
            w.store(value, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for MemRegisterFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemRegisterFile").field("len", &self.len()).finish()
    }
}
