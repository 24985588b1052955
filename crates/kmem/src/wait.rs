//! FIFO wait queue for threads blocked on a resource.
//!
//! A wait queue is owned by the structure it guards and lives inside that
//! structure's critical section. The protocol is:
//!
//! 1. With the owner's lock held, find the resource unavailable and
//!    [`enqueue`](WaitQueue::enqueue) the calling thread.
//! 2. Release the lock, then [`suspend`](WaitTicket::suspend) on the ticket.
//! 3. If the deadline passes first, re-take the lock and
//!    [`cancel`](WaitQueue::cancel) the ticket. Cancellation and wakeup both
//!    happen under the owner's lock, so exactly one of them decides the
//!    outcome.
//!
//! Because the thread is queued before the lock is released, a wakeup that
//! arrives between "found unavailable" and "suspended" is recorded in the
//! ticket rather than lost.
//!
//! ```text
//!             enqueue                wake_one
//! REQUESTED ----------> SUSPENDED ------------> SATISFIED
//!                           |  \
//!                    cancel |   \ wake_all
//!                           v    v
//!                    TIMED_OUT  ABORTED
//! ```

use alloc::{collections::vec_deque::VecDeque, sync::Arc};
use core::{fmt, marker::PhantomData, mem, time::Duration};

use spin::Mutex;

use crate::sched::Scheduler;

/// How long a blocking request may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::IsVariant)]
pub enum Timeout {
    /// Fail immediately instead of waiting.
    NoWait,
    /// Wait at most the given duration.
    After(Duration),
    /// Wait until woken.
    Forever,
}

impl Timeout {
    /// Returns `true` if a request with this timeout may never suspend.
    #[must_use]
    pub fn is_non_blocking(self) -> bool {
        match self {
            Self::After(d) => d.is_zero(),
            _ => self.is_no_wait(),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::After(d)
    }
}

/// The terminal outcome of a wait.
#[derive(Debug, PartialEq, Eq, derive_more::IsVariant)]
pub enum WakeReason<T> {
    /// Woken by [`WaitQueue::wake_one`] with a payload.
    Woken(T),
    /// The deadline passed before a wakeup arrived.
    TimedOut,
    /// Woken by [`WaitQueue::wake_all`] because the resource was torn down.
    Aborted,
}

#[derive(Debug)]
enum SlotState<T> {
    Pending,
    Done(WakeReason<T>),
    Taken,
}

struct Waiter<T, S>
where
    S: Scheduler,
{
    thread: S::Thread,
    state: Mutex<SlotState<T>>,
}

impl<T, S> Waiter<T, S>
where
    S: Scheduler,
{
    fn complete(&self, reason: WakeReason<T>) {
        {
            let mut state = self.state.lock();
            assert!(
                matches!(*state, SlotState::Pending),
                "waiter completed twice"
            );
            *state = SlotState::Done(reason);
        }
        S::resume(&self.thread);
    }

    fn try_take(&self) -> Option<WakeReason<T>> {
        let mut state = self.state.lock();
        match mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Done(reason) => Some(reason),
            SlotState::Pending => {
                *state = SlotState::Pending;
                None
            }
            SlotState::Taken => panic!("wait outcome taken twice"),
        }
    }
}

/// A FIFO queue of suspended threads, each waiting for a payload of type `T`.
pub struct WaitQueue<T, S>
where
    S: Scheduler,
{
    waiters: VecDeque<Arc<Waiter<T, S>>>,
}

impl<T, S> Default for WaitQueue<T, S>
where
    S: Scheduler,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S> fmt::Debug for WaitQueue<T, S>
where
    S: Scheduler,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("len", &self.waiters.len())
            .finish()
    }
}

impl<T, S> WaitQueue<T, S>
where
    S: Scheduler,
{
    /// Creates an empty wait queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    /// Returns the number of threads currently waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Returns `true` if no thread is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Queues the calling thread at the tail.
    ///
    /// Must be called with the owner's lock held. The returned ticket is
    /// suspended on after the lock is released.
    pub fn enqueue(&mut self) -> WaitTicket<T, S> {
        let waiter = Arc::new(Waiter {
            thread: S::current(),
            state: Mutex::new(SlotState::Pending),
        });
        self.waiters.push_back(Arc::clone(&waiter));
        WaitTicket {
            waiter,
            _scheduler: PhantomData,
        }
    }

    /// Hands `payload` to the longest-waiting thread and resumes it.
    ///
    /// Returns the payload back if nobody is waiting.
    pub fn wake_one(&mut self, payload: T) -> Result<(), T> {
        let Some(waiter) = self.waiters.pop_front() else {
            return Err(payload);
        };
        waiter.complete(WakeReason::Woken(payload));
        Ok(())
    }

    /// Resumes every waiter with [`WakeReason::Aborted`].
    ///
    /// Returns the number of threads woken.
    pub fn wake_all(&mut self) -> usize {
        let count = self.waiters.len();
        for waiter in self.waiters.drain(..) {
            waiter.complete(WakeReason::Aborted);
        }
        count
    }

    /// Settles a ticket whose deadline has passed.
    ///
    /// Must be called with the owner's lock held. If a wakeup already
    /// reached the ticket, its outcome is returned; otherwise the ticket is
    /// removed from the queue and [`WakeReason::TimedOut`] is returned.
    pub fn cancel(&mut self, ticket: &WaitTicket<T, S>) -> WakeReason<T> {
        if let Some(reason) = ticket.waiter.try_take() {
            return reason;
        }
        let Some(index) = self
            .waiters
            .iter()
            .position(|w| Arc::ptr_eq(w, &ticket.waiter))
        else {
            panic!("pending waiter missing from its queue");
        };
        self.waiters.remove(index);
        *ticket.waiter.state.lock() = SlotState::Taken;
        WakeReason::TimedOut
    }
}

/// The calling thread's place in a [`WaitQueue`].
pub struct WaitTicket<T, S>
where
    S: Scheduler,
{
    waiter: Arc<Waiter<T, S>>,
    _scheduler: PhantomData<fn() -> S>,
}

impl<T, S> WaitTicket<T, S>
where
    S: Scheduler,
{
    /// Suspends the calling thread until the ticket is woken or `timeout`
    /// elapses.
    ///
    /// Must be called without the owner's lock held. Returns `None` when the
    /// deadline passed with no wakeup; the caller must then settle the
    /// ticket with [`WaitQueue::cancel`] under the owner's lock.
    pub fn suspend(&self, timeout: Timeout) -> Option<WakeReason<T>> {
        let deadline = match timeout {
            Timeout::NoWait => Some(S::now()),
            Timeout::After(d) => Some(S::now().saturating_add(d)),
            Timeout::Forever => None,
        };
        loop {
            if let Some(reason) = self.waiter.try_take() {
                return Some(reason);
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = S::now();
                    if now >= deadline {
                        return None;
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            S::suspend(remaining);
        }
    }
}
