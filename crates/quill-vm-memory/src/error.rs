//! Error taxonomy for the object memory manager.
//!
//! Transient allocation pressure never surfaces as an error; it is resolved
//! internally by a collection plus a single retry. Everything that does
//! surface is listed here.

use thiserror::Error;

/// Errors surfaced by the object memory manager.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// No generation can satisfy the request, even after a forced full
    /// collection. Fatal for the allocating operation; not retried.
    #[error("object memory exhausted allocating {requested} bytes")]
    Exhausted {
        /// Aligned size of the allocation that could not be satisfied.
        requested: usize,
    },

    /// A native handle was dereferenced after its target was collected.
    #[error("native handle target was collected")]
    InvalidHandle,
}

/// Outcome of an object-lock acquisition.
///
/// `TimedOut` and `Interrupted` are statuses, not errors: the caller decides
/// whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// The lock is held by the calling context.
    Acquired,
    /// The timeout elapsed before the lock could be acquired.
    TimedOut,
    /// The waiting context was interrupted (pending signal).
    Interrupted,
}
