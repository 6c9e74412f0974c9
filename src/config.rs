//! Tunables for the manager and the KCI engine.

use std::time::Duration;

use crate::csr::CsrLayout;
use crate::error::MailboxError;
use crate::queue::MAX_QUEUE_SIZE;

/// Production firmware response timeout.
pub const KCI_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for slow emulated backends.
pub const KCI_EMULATED_TIMEOUT: Duration = Duration::from_secs(60);

pub const TIMEOUT_ENV: &str = "TPU_KCI_TIMEOUT_MS";
pub const QUEUE_SIZE_ENV: &str = "TPU_KCI_QUEUE_SIZE";

/// Configuration for a [`KciEngine`](crate::KciEngine).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KciConfig {
    /// Budget for both queue-room waits and response waits.
    pub timeout: Duration,
    /// Entries in each of the two KCI queues.
    pub queue_size: u32,
}

impl Default for KciConfig {
    fn default() -> Self {
        Self {
            timeout: KCI_TIMEOUT,
            queue_size: MAX_QUEUE_SIZE,
        }
    }
}

impl KciConfig {
    pub fn emulated() -> Self {
        Self {
            timeout: KCI_EMULATED_TIMEOUT,
            ..Self::default()
        }
    }

    /// Defaults overridden by `TPU_KCI_TIMEOUT_MS` and `TPU_KCI_QUEUE_SIZE`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a caller-supplied lookup.
    /// Unparsable or zero values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let timeout = lookup(TIMEOUT_ENV)
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.timeout);
        let queue_size = lookup(QUEUE_SIZE_ENV)
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0 && *v <= MAX_QUEUE_SIZE)
            .unwrap_or(defaults.queue_size);
        Self {
            timeout,
            queue_size,
        }
    }
}

/// Shape of the mailbox table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Total slots, including the KCI slot.
    pub num_mailbox: u32,
    pub num_vii: u32,
    pub num_p2p: u32,
    pub csr: CsrLayout,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            num_mailbox: 16,
            num_vii: 7,
            num_p2p: 4,
            csr: CsrLayout::default(),
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<(), MailboxError> {
        let needed = 1u64 + u64::from(self.num_vii) + u64::from(self.num_p2p);
        if needed > u64::from(self.num_mailbox) {
            return Err(MailboxError::InvalidArgument(
                "KCI, VII and P2P ranges exceed the mailbox count",
            ));
        }
        Ok(())
    }
}
