// src/error.rs

use std::fmt;

/// Errors from mailbox and manager operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailboxError {
    /// Malformed size, address or handle. Nothing was changed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No free slot in the requested mailbox range.
    #[error("no free mailbox in range")]
    ResourceExhausted,

    /// The KCI slot is already claimed.
    #[error("mailbox slot already in use")]
    AlreadyInUse,

    /// The command queue is full right now.
    #[error("queue is full")]
    ResourceBusy,

    /// Queue or buffer memory could not be allocated.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },
}

impl MailboxError {
    /// Transient conditions that may clear without caller intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MailboxError::ResourceBusy | MailboxError::ResourceExhausted)
    }
}

/// Errors from the KCI command/response protocol.
#[derive(Debug, thiserror::Error)]
pub enum KciError {
    /// No queue room, or no response, before the deadline.
    #[error("timed out waiting for firmware")]
    Timeout,

    /// Firmware answered a later command, so this one will never be answered.
    #[error("firmware skipped the command")]
    NoResponse,

    /// The response carried a status that is neither ok nor no-response.
    #[error("unexpected response status {0}")]
    ProtocolError(u16),

    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    /// A payload buffer could not be mapped into the device address space.
    #[error("failed to map {size} byte buffer for the device")]
    MapFailed {
        size: usize,
        #[source]
        source: MailboxError,
    },

    /// The harvesting worker thread could not be started.
    #[error("failed to spawn response worker")]
    Spawn(#[from] std::io::Error),

    /// The engine was released; its queues are gone.
    #[error("KCI engine released")]
    Released,
}

impl KciError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KciError::Timeout => true,
            KciError::Mailbox(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Return codes reported by firmware in a response's `code` field.
///
/// Aligned with gRPC status codes.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FirmwareCode {
    /// Success (not an error)
    Ok = 0,

    // Cancellation & timeouts
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,

    // Request errors
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,

    // Resource errors
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,

    // Firmware-side failures
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl FirmwareCode {
    /// Convert from the raw response value.
    /// Returns None if the value doesn't match a known code.
    pub fn from_u16(val: u16) -> Option<Self> {
        Some(match val {
            0 => FirmwareCode::Ok,
            1 => FirmwareCode::Cancelled,
            2 => FirmwareCode::Unknown,
            3 => FirmwareCode::InvalidArgument,
            4 => FirmwareCode::DeadlineExceeded,
            5 => FirmwareCode::NotFound,
            6 => FirmwareCode::AlreadyExists,
            7 => FirmwareCode::PermissionDenied,
            8 => FirmwareCode::ResourceExhausted,
            9 => FirmwareCode::FailedPrecondition,
            10 => FirmwareCode::Aborted,
            11 => FirmwareCode::OutOfRange,
            12 => FirmwareCode::Unimplemented,
            13 => FirmwareCode::Internal,
            14 => FirmwareCode::Unavailable,
            15 => FirmwareCode::DataLoss,
            16 => FirmwareCode::Unauthenticated,
            _ => return None,
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Check if a command failing with this code may succeed if re-sent.
    ///
    /// - Cancelled (firmware dropped it, e.g. during a reset)
    /// - ResourceExhausted (firmware resources may free up)
    /// - Unavailable (firmware may recover)
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FirmwareCode::Cancelled | FirmwareCode::ResourceExhausted | FirmwareCode::Unavailable
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            FirmwareCode::Ok => "success",
            FirmwareCode::Cancelled => "cancelled",
            FirmwareCode::Unknown => "unknown error",
            FirmwareCode::InvalidArgument => "invalid argument",
            FirmwareCode::DeadlineExceeded => "deadline exceeded",
            FirmwareCode::NotFound => "not found",
            FirmwareCode::AlreadyExists => "already exists",
            FirmwareCode::PermissionDenied => "permission denied",
            FirmwareCode::ResourceExhausted => "resource exhausted",
            FirmwareCode::FailedPrecondition => "failed precondition",
            FirmwareCode::Aborted => "aborted",
            FirmwareCode::OutOfRange => "out of range",
            FirmwareCode::Unimplemented => "not implemented",
            FirmwareCode::Internal => "internal error",
            FirmwareCode::Unavailable => "unavailable",
            FirmwareCode::DataLoss => "data loss",
            FirmwareCode::Unauthenticated => "unauthenticated",
        }
    }
}

impl TryFrom<u16> for FirmwareCode {
    type Error = UnknownFirmwareCode;

    fn try_from(val: u16) -> Result<Self, Self::Error> {
        FirmwareCode::from_u16(val).ok_or(UnknownFirmwareCode(val))
    }
}

impl fmt::Display for FirmwareCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.as_u16())
    }
}

/// Error when converting from an unknown firmware return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownFirmwareCode(pub u16);

impl fmt::Display for UnknownFirmwareCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown firmware code: {}", self.0)
    }
}

impl std::error::Error for UnknownFirmwareCode {}
