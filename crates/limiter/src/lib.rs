//! Process-wide admission control for asynchronous tasks.
//!
//! [`ConcurrencyLimiter`] bounds how many submitted tasks run at once across
//! every caller that shares it. Tasks are admitted in strict FIFO order, and
//! tasks that have not started yet can be dropped in bulk by group key
//! (typically the id of the file they belong to).
//!
//! The limiter is an explicitly constructed handle: build one, clone it into
//! every component that submits work, and build a fresh one per test.

mod limiter;

pub use limiter::{ConcurrencyLimiter, TaskHandle};

/// Errors observed through a [`TaskHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LimiterError {
    /// The task never produced a result: it was removed from the queue by
    /// [`ConcurrencyLimiter::cancel_group`] before starting, or it panicked.
    #[error("task discarded before completion")]
    Discarded,
}
