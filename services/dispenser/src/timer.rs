//! Cancellable one-shot timer
//!
//! The expiry callback runs on a dedicated thread at most once. Cancellation and
//! expiry race on a single state word: whichever gets there first wins and the
//! other becomes a no-op.

use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Pending,
    Cancelled,
    Fired,
}

struct Shared {
    state: Mutex<TimerState>,
    cv: Condvar,
}

/// Handle to a pending timer; dropping it cancels the timer
pub struct OneShotTimer {
    shared: Arc<Shared>,
}

impl OneShotTimer {
    pub fn start<F>(name: &str, timeout: Duration, on_expiry: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::Pending),
            cv: Condvar::new(),
        });
        let deadline = Instant::now() + timeout;

        let thread_shared = shared.clone();
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                {
                    let mut state = thread_shared.state.lock();
                    while *state == TimerState::Pending {
                        if thread_shared.cv.wait_until(&mut state, deadline).timed_out() {
                            break;
                        }
                    }
                    if *state != TimerState::Pending {
                        trace!("Timer cancelled before expiry");
                        return;
                    }
                    *state = TimerState::Fired;
                }
                on_expiry();
            })?;

        Ok(Self { shared })
    }

    /// Returns `true` if the timer was still pending and will now never fire
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.state.lock();
        if *state != TimerState::Pending {
            return false;
        }
        *state = TimerState::Cancelled;
        self.shared.cv.notify_all();
        true
    }

    pub fn is_pending(&self) -> bool {
        *self.shared.state.lock() == TimerState::Pending
    }

    pub fn has_fired(&self) -> bool {
        *self.shared.state.lock() == TimerState::Fired
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Tests can use unwrap()
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counter() -> (Arc<AtomicU32>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn wait_for(count: &AtomicU32, expected: u32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if count.load(Ordering::SeqCst) == expected {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_fires_once_after_timeout() {
        let (count, callback) = counter();
        let timer = OneShotTimer::start("t", Duration::from_millis(20), callback).unwrap();
        assert!(timer.is_pending());
        assert!(wait_for(&count, 1));
        assert!(timer.has_fired());
        assert!(!timer.cancel(), "cancelling after expiry is a no-op");
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_prevents_expiry() {
        let (count, callback) = counter();
        let timer = OneShotTimer::start("t", Duration::from_millis(50), callback).unwrap();
        assert!(timer.cancel());
        assert!(!timer.cancel());
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_cancels() {
        let (count, callback) = counter();
        drop(OneShotTimer::start("t", Duration::from_millis(30), callback).unwrap());
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
