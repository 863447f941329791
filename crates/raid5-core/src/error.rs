//! Error kinds for the stripe I/O engine.
//!
//! Three kinds only: out-of-memory backpressure, a failed base-device I/O,
//! and a programming contract violation surfaced as invalid input.
//! Anything else from a [`crate::base_device::BaseBdev`] implementation is
//! a contract breach and the engine panics rather than limping on.

use thiserror::Error;

/// The three error kinds the engine itself can produce.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RaidError {
    /// A pool (stripe cache, stripe-request pool) or the base device itself
    /// is out of resources. Callers should retry; the channel retry queue
    /// does this automatically for stripe acquisition.
    #[error("no resources available, retry later")]
    NoMem,
    /// A stripe request failed: a base-device I/O came back unsuccessful,
    /// or more members were degraded than the array tolerates.
    #[error("stripe request failed")]
    Failed,
    /// An iovec mapping request asked for more bytes than the upstream
    /// buffer has. Should be unreachable given correct dispatching.
    #[error("invalid input to stripe engine")]
    InvalidInput,
}

pub type RaidResult<T> = Result<T, RaidError>;
