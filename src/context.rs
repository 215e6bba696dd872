use std::{future::Future, time::Duration};

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::Error;

/// Bounds how long a waiting operation may wait.
///
/// A context carries an optional [CancellationToken] and an optional deadline. Operations that
/// may wait for a permit take a context and fail with [Error::Cancelled] or
/// [Error::DeadlineExceeded] once either fires, without changing the limiter.
///
/// [Context::background()] never fires.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context which is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Cancel waiting operations when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Fail waiting operations once `deadline` has passed.
    ///
    /// An earlier deadline already set on this context is kept.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Fail waiting operations after `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The reason this context is done, or `None` if operations may still proceed.
    ///
    /// Cancellation takes precedence over an expired deadline.
    pub fn err(&self) -> Option<Error> {
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Some(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    /// Drive `fut` until it completes or this context is done.
    ///
    /// If the context is already done `fut` is never polled. `fut` is dropped on failure, so it
    /// must undo any partial work in its destructor.
    pub(crate) async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Error> {
        if let Some(err) = self.err() {
            return Err(err);
        }

        tokio::select! {
            biased;

            _ = cancelled(self.cancel.as_ref()) => Err(Error::Cancelled),
            _ = expired(self.deadline) => Err(Error::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn background_never_fires() {
        let ctx = Context::background();
        assert_eq!(ctx.err(), None);
        assert_eq!(ctx.run(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn cancelled_before_running() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = Context::background().with_cancellation(token);

        assert_eq!(ctx.err(), Some(Error::Cancelled));
        let mut polled = false;
        let res = ctx.run(async { polled = true }).await;
        assert_eq!(res, Err(Error::Cancelled));
        assert!(!polled);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_pending_future() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));

        let res = ctx.run(std::future::pending::<()>()).await;
        assert_eq!(res, Err(Error::DeadlineExceeded));
        assert_eq!(ctx.err(), Some(Error::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_deadline_wins() {
        let now = Instant::now();
        let ctx = Context::background()
            .with_deadline(now + Duration::from_secs(1))
            .with_deadline(now + Duration::from_secs(5));

        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn cancellation_interrupts_pending_future() {
        let token = CancellationToken::new();
        let ctx = Context::background().with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::task::yield_now().await;
            token.cancel();
        });

        let res = ctx.run(std::future::pending::<()>()).await;
        assert_eq!(res, Err(Error::Cancelled));
        canceller.await.unwrap();
    }
}
