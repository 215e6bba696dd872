/// Errors returned by [Limiter](crate::Limiter) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// There is no growth headroom left to provision another slot.
    #[error("max size reached")]
    MaxSizeReached,
    /// There are no provisioned slots left to remove.
    #[error("min size reached")]
    MinSizeReached,
    /// The [Context](crate::Context) was cancelled before the operation completed.
    #[error("context cancelled")]
    Cancelled,
    /// The [Context](crate::Context) deadline passed before the operation completed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    /// The requested sizes do not satisfy `0 <= current_size <= max_size`.
    #[error("invalid limiter size: current size {current_size} must be within 0..={max_size}")]
    InvalidSize { max_size: i64, current_size: i64 },
}

impl Error {
    /// Whether the same call may succeed if retried with a fresh [Context](crate::Context).
    ///
    /// Capacity errors only clear after a resize elsewhere.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}
