//! Process-wide switch over the notification path.
//!
//! Pausing stops every root's IO thread from applying buffered filesystem
//! changes (and so from resolving cookies through notifications) and stops
//! subscription delivery. Crawls, recrawls and new watches are unaffected.
//!
//! Work on the notification path runs under a [`DeliveryPermit`]. `pause`
//! returns only once every outstanding permit has been dropped, so a caller
//! that sees the ack can rely on no further notification-driven change being
//! applied until `unpause`.

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PauseAck {
    pub paused: bool,
    /// False when the call found the controller already in the requested
    /// state.
    pub changed: bool,
    pub epoch: u64,
}

#[derive(Debug, Default)]
struct PauseInner {
    paused: bool,
    epoch: u64,
    in_flight: usize,
}

#[derive(Debug, Default)]
pub struct PauseController {
    paused: AtomicBool,
    inner: Mutex<PauseInner>,
    changed: Condvar,
}

/// Held while notification-path work is applied; see the module docs.
#[derive(Debug)]
pub struct DeliveryPermit<'a> {
    controller: &'a PauseController,
}

impl Drop for DeliveryPermit<'_> {
    fn drop(&mut self) {
        let mut inner = self.controller.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if inner.in_flight == 0 {
            self.controller.changed.notify_all();
        }
    }
}

impl PauseController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub fn pause(&self) -> PauseAck {
        let mut inner = self.inner.lock();
        if inner.paused {
            return PauseAck {
                paused: true,
                changed: false,
                epoch: inner.epoch,
            };
        }
        inner.paused = true;
        inner.epoch += 1;
        self.paused.store(true, Ordering::Release);

        // Ack barrier: wait out whatever was admitted under the old regime.
        while inner.in_flight > 0 {
            self.changed.wait(&mut inner);
        }
        tracing::info!(epoch = inner.epoch, "watchers paused");
        PauseAck {
            paused: true,
            changed: true,
            epoch: inner.epoch,
        }
    }

    pub fn unpause(&self) -> PauseAck {
        let mut inner = self.inner.lock();
        if !inner.paused {
            return PauseAck {
                paused: false,
                changed: false,
                epoch: inner.epoch,
            };
        }
        inner.paused = false;
        inner.epoch += 1;
        self.paused.store(false, Ordering::Release);
        self.changed.notify_all();
        tracing::info!(epoch = inner.epoch, "watchers unpaused");
        PauseAck {
            paused: false,
            changed: true,
            epoch: inner.epoch,
        }
    }

    /// Non-blocking admission used by the IO threads.
    pub fn try_admit(&self) -> Option<DeliveryPermit<'_>> {
        if self.is_paused() {
            return None;
        }
        let mut inner = self.inner.lock();
        if inner.paused {
            return None;
        }
        inner.in_flight += 1;
        Some(DeliveryPermit { controller: self })
    }

    /// Wait up to `timeout` for the controller to be unpaused, then admit.
    pub fn admit_timeout(&self, timeout: Duration) -> Option<DeliveryPermit<'_>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.paused {
            if self.changed.wait_until(&mut inner, deadline).timed_out() && inner.paused {
                return None;
            }
        }
        inner.in_flight += 1;
        Some(DeliveryPermit { controller: self })
    }
}

#[cfg(test)]
mod tests {
    use super::PauseController;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn repeated_pause_and_unpause_are_noops() {
        let pause = PauseController::new();
        let first = pause.pause();
        assert!(first.paused && first.changed);
        let again = pause.pause();
        assert!(again.paused && !again.changed);
        assert_eq!(first.epoch, again.epoch);

        let resumed = pause.unpause();
        assert!(!resumed.paused && resumed.changed);
        let resumed_again = pause.unpause();
        assert!(!resumed_again.changed);
        assert_eq!(pause.epoch(), 2);
    }

    #[test]
    fn unpause_without_pause_is_ack() {
        let pause = PauseController::new();
        let ack = pause.unpause();
        assert!(!ack.paused);
        assert!(!ack.changed);
        assert_eq!(ack.epoch, 0);
    }

    #[test]
    fn paused_controller_refuses_admission() {
        let pause = PauseController::new();
        assert!(pause.try_admit().is_some());
        pause.pause();
        assert!(pause.try_admit().is_none());
        assert!(pause.admit_timeout(Duration::from_millis(30)).is_none());
        pause.unpause();
        assert!(pause.try_admit().is_some());
    }

    #[test]
    fn pause_waits_for_in_flight_delivery() {
        let pause = PauseController::new();
        thread::scope(|scope| {
            let permit = pause.try_admit().expect("admitted");
            let holder = scope.spawn(move || {
                thread::sleep(Duration::from_millis(150));
                drop(permit);
            });
            let started = Instant::now();
            let ack = pause.pause();
            assert!(ack.changed);
            assert!(
                started.elapsed() >= Duration::from_millis(100),
                "pause returned before in-flight work drained"
            );
            holder.join().expect("join");
        });
    }

    #[test]
    fn admit_timeout_wakes_on_unpause() {
        let pause = PauseController::new();
        pause.pause();
        thread::scope(|scope| {
            let waiter = scope.spawn(|| pause.admit_timeout(Duration::from_secs(5)).is_some());
            thread::sleep(Duration::from_millis(50));
            pause.unpause();
            assert!(waiter.join().expect("join"));
        });
    }
}
