//! Mailbox transport and kernel control interface (KCI) for Edge TPU style
//! accelerators.
//!
//! A [`Mailbox`] is one command queue plus one response queue living in
//! coherent memory, driven through a small block of control registers. The
//! [`MailboxManager`] hands out mailbox slots (one KCI slot, a VII range and a
//! peer-to-peer range) and fans device interrupts out to them. The
//! [`KciEngine`] runs the sequenced command/response protocol on slot 0.

#[macro_use]
mod macros;

pub mod config;
pub mod csr;
pub mod error;
pub mod kci;
pub mod mailbox;
pub mod manager;
pub mod memory;
pub mod queue;
pub mod region;
pub mod types;
pub mod vii;

pub use config::{KciConfig, ManagerConfig};
pub use csr::{CsrLayout, MemRegisterFile, RegisterFile};
pub use error::{FirmwareCode, KciError, MailboxError};
pub use kci::{
    CommandCode, CommandElement, KciEngine, KciResponse, ResponseElement, ResponseSlot,
    ResponseStatus,
};
pub use mailbox::{Mailbox, MailboxHandler, MailboxSnapshot, Owner};
pub use manager::MailboxManager;
pub use memory::{AddressTranslation, CoherentBuffer, HeapQueueMemory, QueueMemory};
pub use types::{ContextId, DmaDirection, Generation, MailboxHandle, MailboxId, QueueRole};
pub use vii::{Vii, ViiAttributes};

#[cfg(test)]
mod proptests;
