use std::{
    future::Future,
    pin::Pin,
    sync::{Mutex, MutexGuard, PoisonError},
    task::{self, Poll, Waker},
    time::Duration,
};

use pin_list::PinList;
use pin_project_lite::pin_project;
use tracing::{debug, trace};

use crate::{Context, DecrementMode, Error, LimiterOptions};

/// Limits the number of concurrent jobs, with a capacity that can be resized at runtime.
///
/// Concurrency is limited through the use of [Permit]s. Acquire a permit to run a job, and release
/// the permit once the job is finished.
///
/// The limiter owns a pool of `max_size` permits. Only `current_size` of them are provisioned, the
/// rest are held back by the limiter as growth headroom. [Limiter::increment()] provisions one
/// more permit out of the headroom, [Limiter::decrement()] takes one permit out of circulation
/// again, waiting for a job to finish if all permits are in use.
///
/// Waiters are served in the order they started waiting. A released permit is handed directly to
/// the oldest waiter, so [Limiter::try_acquire()] never jumps the queue.
#[derive(Debug)]
pub struct Limiter {
    max_size: i64,
    decrement_mode: DecrementMode,
    pool: Mutex<Pool>,
}

type WaiterTypes = dyn pin_list::Types<
    Id = pin_list::id::Checked,
    Protected = Waker,
    Removed = (),
    Unprotected = (),
>;

/// Permit accounting and logical sizes, all updated under one lock.
///
/// `permits + reserved + in_flight == max_size` at all times.
#[derive(Debug)]
struct Pool {
    waiters: PinList<WaiterTypes>,

    /// Obtainable without waiting. Non-zero only while nobody is waiting.
    permits: i64,
    /// Held by the limiter itself.
    reserved: i64,
    /// Held by callers, including permits handed to a waiter which hasn't woken up yet.
    in_flight: i64,

    current_size: i64,
    headroom: i64,
}

/// A concurrency permit, required to run a job.
///
/// The permit is returned to the [Limiter] when dropped.
#[must_use = "the permit is released as soon as it is dropped"]
#[derive(Debug)]
pub struct Permit<'l> {
    limiter: &'l Limiter,
}

/// A snapshot of the state of the [Limiter].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterState {
    max_size: i64,
    current_size: i64,
    headroom: i64,
    available: i64,
    in_flight: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    /// Hand the permit to the caller.
    Use,
    /// Keep the permit in the limiter, shrinking the usable capacity.
    Reserve,
}

impl Limiter {
    /// Create a limiter with `max_size` permits, of which `current_size` are provisioned.
    ///
    /// Fails if `0 <= current_size <= max_size` does not hold, or if `ctx` is already done.
    pub fn new(ctx: &Context, max_size: i64, current_size: i64) -> Result<Self, Error> {
        if current_size < 0 || current_size > max_size {
            return Err(Error::InvalidSize {
                max_size,
                current_size,
            });
        }
        if let Some(err) = ctx.err() {
            debug!(max_size, current_size, %err, "limiter construction aborted");
            return Err(err);
        }

        // Nobody else can hold permits yet, so reserving the unprovisioned ones never waits.
        let reserved = max_size - current_size;
        trace!(max_size, current_size, "limiter created");

        Ok(Self {
            max_size,
            decrement_mode: DecrementMode::default(),
            pool: Mutex::new(Pool {
                waiters: PinList::new(pin_list::id::Checked::new()),
                permits: current_size,
                reserved,
                in_flight: 0,
                current_size,
                headroom: reserved,
            }),
        })
    }

    /// Create a limiter from [LimiterOptions].
    pub fn from_options(ctx: &Context, options: &LimiterOptions) -> Result<Self, Error> {
        Ok(Self::new(ctx, options.max_size, options.current_size())?
            .with_decrement_mode(options.decrement_mode))
    }

    /// Choose how [Limiter::decrement()] updates the logical sizes.
    pub fn with_decrement_mode(mut self, mode: DecrementMode) -> Self {
        self.decrement_mode = mode;
        self
    }

    pub fn decrement_mode(&self) -> DecrementMode {
        self.decrement_mode
    }

    /// Provision one more permit out of the growth headroom.
    ///
    /// The new permit goes straight to the oldest waiter, if any. Never waits.
    ///
    /// Fails with [Error::MaxSizeReached] when there is no headroom left.
    pub fn increment(&self) -> Result<(), Error> {
        let waker = {
            let mut pool = self.lock();
            // `reserved` only differs from `headroom` in legacy mode, where it stops the pool from
            // ever holding more than `max_size` permits.
            if pool.headroom == 0 || pool.reserved == 0 {
                debug!(
                    current_size = pool.current_size,
                    headroom = pool.headroom,
                    "increment rejected"
                );
                return Err(Error::MaxSizeReached);
            }

            pool.reserved -= 1;
            pool.current_size += 1;
            pool.headroom -= 1;
            let waker = pool.release_one();
            pool.check(self.max_size);

            trace!(
                current_size = pool.current_size,
                headroom = pool.headroom,
                "limiter incremented"
            );
            waker
        };

        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Take one permit out of circulation, waiting for a job to finish if none are available.
    ///
    /// Fails with [Error::MinSizeReached] without waiting when there are no provisioned permits.
    /// If `ctx` is done first, fails with its error and leaves the limiter unchanged.
    pub async fn decrement(&self, ctx: &Context) -> Result<(), Error> {
        let current_size = self.lock().current_size;
        if current_size == 0 {
            debug!("decrement rejected");
            return Err(Error::MinSizeReached);
        }

        // Checked again on the first poll, a concurrent decrement may have won the race. Once
        // queued, the decrement waits for a permit even if the size drops to zero meanwhile.
        let res = ctx.run(self.wait(Claim::Reserve)).await.and_then(|res| res);
        if let Err(err) = &res {
            debug!(%err, "decrement failed");
        }
        res
    }

    /// Acquire a concurrency [Permit], waiting until one is available.
    ///
    /// If `ctx` is done first, fails with its error without consuming a permit.
    pub async fn acquire(&self, ctx: &Context) -> Result<Permit<'_>, Error> {
        ctx.run(self.wait(Claim::Use)).await??;
        Ok(Permit { limiter: self })
    }

    /// Acquire a concurrency [Permit], waiting for `duration` if there are none available.
    ///
    /// Fails with [Error::DeadlineExceeded] if there are none available after `duration`.
    pub async fn acquire_timeout(&self, duration: Duration) -> Result<Permit<'_>, Error> {
        self.acquire(&Context::background().with_timeout(duration)).await
    }

    /// Try to immediately acquire a concurrency [Permit].
    ///
    /// Returns `None` if there are none available, including when others are already waiting.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut pool = self.lock();
        if pool.permits == 0 {
            return None;
        }
        pool.permits -= 1;
        pool.in_flight += 1;
        pool.check(self.max_size);
        drop(pool);

        Some(Permit { limiter: self })
    }

    /// The current state of the limiter.
    pub fn state(&self) -> LimiterState {
        let pool = self.lock();
        LimiterState {
            max_size: self.max_size,
            current_size: pool.current_size,
            headroom: pool.headroom,
            available: pool.permits,
            in_flight: pool.in_flight,
        }
    }

    fn wait(&self, claim: Claim) -> Acquire<'_> {
        Acquire {
            limiter: self,
            claim,
            node: pin_list::Node::new(),
        }
    }

    fn release(&self) {
        let waker = {
            let mut pool = self.lock();
            pool.in_flight -= 1;
            let waker = pool.release_one();
            pool.check(self.max_size);
            waker
        };

        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Nothing under the lock can panic midway, so a poisoned pool is still consistent.
    fn lock(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Pool {
    /// Put one permit back into circulation, handing it to the oldest waiter if there is one.
    ///
    /// The caller must wake the returned waker after unlocking.
    fn release_one(&mut self) -> Option<Waker> {
        match self.waiters.cursor_front_mut().remove_current(()) {
            Ok(waker) => {
                // still in flight, now on behalf of the waiter
                self.in_flight += 1;
                Some(waker)
            }
            Err(()) => {
                self.permits += 1;
                None
            }
        }
    }

    /// Move a permit held by a finished `decrement` into the limiter's reserve.
    fn reserve_in_flight(&mut self, mode: DecrementMode) {
        self.in_flight -= 1;
        self.reserved += 1;
        match mode {
            DecrementMode::Shrink => {
                self.current_size -= 1;
                self.headroom += 1;
            }
            DecrementMode::Legacy => {
                self.current_size += 1;
                self.headroom -= 1;
            }
        }
        trace!(
            current_size = self.current_size,
            headroom = self.headroom,
            "limiter decremented"
        );
    }

    fn check(&self, max_size: i64) {
        debug_assert_eq!(self.permits + self.reserved + self.in_flight, max_size);
        debug_assert!(self.permits >= 0 && self.reserved >= 0 && self.in_flight >= 0);
    }
}

impl Permit<'_> {
    /// Return the permit to the [Limiter]. Equivalent to dropping it.
    pub fn release(self) {
        drop(self);
    }

    /// Keep the permit in use for the lifetime of the [Limiter].
    ///
    /// A forgotten permit can't be removed by [Limiter::decrement()] either.
    pub fn forget(self) {
        std::mem::forget(self);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

impl LimiterState {
    /// The total number of permits the limiter can ever provision.
    pub fn max_size(&self) -> i64 {
        self.max_size
    }
    /// The number of provisioned permits.
    pub fn current_size(&self) -> i64 {
        self.current_size
    }
    /// How many more permits [Limiter::increment()] may provision.
    pub fn headroom(&self) -> i64 {
        self.headroom
    }
    /// The number of permits obtainable without waiting.
    pub fn available(&self) -> i64 {
        self.available
    }
    /// The number of permits held by jobs.
    pub fn in_flight(&self) -> i64 {
        self.in_flight
    }
}

pin_project! {
    struct Acquire<'l> {
        limiter: &'l Limiter,
        claim: Claim,
        #[pin]
        node: pin_list::Node<WaiterTypes>,
    }

    impl PinnedDrop for Acquire<'_> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            let node = match this.node.initialized_mut() {
                // The future was cancelled before it could complete.
                Some(initialized) => initialized,
                // The future has completed already (or never waited); we don't have to do
                // anything.
                None => return,
            };

            let mut pool = this.limiter.lock();

            let waker = match node.reset(&mut pool.waiters) {
                // Still queued, nothing was handed to us.
                (pin_list::NodeData::Linked(_waker), ()) => None,

                // A permit was handed to us but we aren't around to take it. Pass it on to the
                // next waiter, or back to the pool.
                (pin_list::NodeData::Removed(()), ()) => {
                    pool.in_flight -= 1;
                    pool.release_one()
                }
            };
            pool.check(this.limiter.max_size);
            drop(pool);

            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

impl Future for Acquire<'_> {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        let limiter = *this.limiter;

        let mut guard = limiter.lock();
        let pool = &mut *guard;

        if let Some(node) = this.node.as_mut().initialized_mut() {
            // Check whether a permit has been handed to us, only continuing if so.
            if let Err(node) = node.take_removed(&pool.waiters) {
                // If not, re-register our waker and pend.
                if let Some(waker) = node.protected_mut(&mut pool.waiters) {
                    if !waker.will_wake(cx.waker()) {
                        *waker = cx.waker().clone();
                    }
                }
                return Poll::Pending;
            }
        } else {
            if *this.claim == Claim::Reserve && pool.current_size == 0 {
                return Poll::Ready(Err(Error::MinSizeReached));
            }

            if pool.permits == 0 {
                trace!(claim = ?this.claim, "waiting for a permit");
                pool.waiters.push_back(this.node, cx.waker().clone(), ());
                return Poll::Pending;
            }

            pool.permits -= 1;
            pool.in_flight += 1;
        }

        if *this.claim == Claim::Reserve {
            pool.reserve_in_flight(limiter.decrement_mode);
        }
        pool.check(limiter.max_size);

        Poll::Ready(Ok(()))
    }
}
