// src/types.rs

/// Index of a mailbox slot in the manager table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct MailboxId(pub(crate) u32);

impl MailboxId {
    /// The slot reserved for the kernel control interface.
    pub const KCI: MailboxId = MailboxId(0);

    pub fn new(id: u32) -> Self {
        MailboxId(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for MailboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mailbox {}", self.0)
    }
}

/// Generation counter for ABA safety.
///
/// Bumped every time a slot is (re)allocated so a handle to a removed
/// mailbox never matches whatever later occupies the same index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Generation(pub(crate) u32);

impl Generation {
    pub fn new(generation: u32) -> Self {
        Generation(generation)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub(crate) fn next(self) -> Self {
        Generation(self.0.wrapping_add(1))
    }
}

/// Lightweight reference to an allocated mailbox: slot index plus the
/// generation it was allocated under.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MailboxHandle {
    pub id: MailboxId,
    pub generation: Generation,
}

/// Which of the two queues of a mailbox an operation targets.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum QueueRole {
    /// Host produces, firmware consumes.
    Command,
    /// Firmware produces, host consumes.
    Response,
}

/// Device address-space context a mapping belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ContextId(pub(crate) u32);

impl ContextId {
    /// Firmware/kernel context.
    pub const KCI: ContextId = ContextId(0);
    /// First VII context; VII mailbox `n` uses `VII_BASE + n - 1`.
    pub const VII_BASE: ContextId = ContextId(1);

    pub fn new(id: u32) -> Self {
        ContextId(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

/// Direction of a device mapping. Values match what firmware expects in
/// the DMA `flags` field of a command.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DmaDirection {
    Bidirectional = 0,
    ToDevice = 1,
    FromDevice = 2,
    None = 3,
}

impl DmaDirection {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_wraps() {
        assert_eq!(Generation::new(u32::MAX).next(), Generation::new(0));
    }

    #[test]
    fn handles_differ_by_generation() {
        let a = MailboxHandle {
            id: MailboxId::new(3),
            generation: Generation::new(1),
        };
        let b = MailboxHandle {
            generation: a.generation.next(),
            ..a
        };
        assert_ne!(a, b);
    }

    #[test]
    fn dma_direction_wire_values() {
        assert_eq!(DmaDirection::Bidirectional.as_u32(), 0);
        assert_eq!(DmaDirection::ToDevice.as_u32(), 1);
        assert_eq!(DmaDirection::FromDevice.as_u32(), 2);
    }
}
