//! Thread suspension services consumed from the scheduler.
//!
//! The allocators never create, schedule, or prioritise threads themselves.
//! Blocking pool allocation only needs four things from the surrounding
//! kernel: a handle for the running thread, a monotonic clock, a way to put
//! the running thread to sleep, and a way to wake a sleeping one. The
//! [`Scheduler`] trait is that seam.

use core::time::Duration;

/// Thread suspension and wakeup supplied by the kernel scheduler.
///
/// Implementations may return from [`suspend`](Self::suspend) spuriously;
/// callers always re-check their wakeup condition.
pub trait Scheduler {
    /// A handle identifying a thread that can later be resumed.
    type Thread: Send + Sync;

    /// Returns a handle to the calling thread.
    fn current() -> Self::Thread;

    /// Returns the time elapsed since an arbitrary fixed point.
    ///
    /// Must be monotonic.
    fn now() -> Duration;

    /// Suspends the calling thread until it is resumed or `timeout` elapses.
    ///
    /// `None` suspends without a time bound.
    ///
    /// A [`resume`](Self::resume) that happens before the calling thread
    /// suspends must not be lost: the next `suspend` returns immediately.
    fn suspend(timeout: Option<Duration>);

    /// Makes a suspended thread runnable again.
    fn resume(thread: &Self::Thread);
}

#[cfg(any(test, feature = "std"))]
pub use self::host::StdScheduler;

#[cfg(any(test, feature = "std"))]
mod host {
    use core::time::Duration;
    use std::{
        thread::{self, Thread},
        time::Instant,
    };

    use spin::once::Once;

    use super::Scheduler;

    static EPOCH: Once<Instant> = Once::new();

    /// A [`Scheduler`] for hosted builds that maps kernel threads onto
    /// `std::thread`.
    ///
    /// Suspension uses the thread park token, which already has the required
    /// "resume before suspend is remembered" semantics.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct StdScheduler;

    impl Scheduler for StdScheduler {
        type Thread = Thread;

        fn current() -> Self::Thread {
            thread::current()
        }

        fn now() -> Duration {
            EPOCH.call_once(Instant::now).elapsed()
        }

        fn suspend(timeout: Option<Duration>) {
            match timeout {
                Some(timeout) => thread::park_timeout(timeout),
                None => thread::park(),
            }
        }

        fn resume(thread: &Self::Thread) {
            thread.unpark();
        }
    }

}
