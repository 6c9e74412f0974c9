// Tracing macros for tpu-mailbox
//
// These macros forward to the tracing crate.

#![allow(unused_macro_rules)]

// -----------------------------------------------------------------------------
// trace! - Very verbose: per-command pushes, harvested batches
// -----------------------------------------------------------------------------

macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!($($arg)*) }
}

// -----------------------------------------------------------------------------
// debug! - Mailbox lifecycle, queue programming
// -----------------------------------------------------------------------------

macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!($($arg)*) }
}

// -----------------------------------------------------------------------------
// info! - High-level operations, usually for production logs
// -----------------------------------------------------------------------------

macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!($($arg)*) }
}

// -----------------------------------------------------------------------------
// warn! - Recoverable issues: stale handles, skipped responses
// -----------------------------------------------------------------------------

macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!($($arg)*) }
}

// -----------------------------------------------------------------------------
// error! - Failures, things that went wrong
// -----------------------------------------------------------------------------

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!($($arg)*) }
}

// Macros are made available via #[macro_use] on the module in lib.rs
