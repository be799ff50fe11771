//! Cooperative tick ownership and wake-up events shared by both engines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Token held by whichever thread is currently running an engine's tick.
///
/// Acquisition never blocks, so a caller that fails to take the token can
/// sleep and let the current owner make progress.
#[derive(Debug, Default)]
pub(crate) struct TickOwner {
    owned: AtomicBool,
}

impl TickOwner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn try_take(&self) -> bool {
        self.owned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        let was_owned = self.owned.swap(false, Ordering::AcqRel);
        debug_assert!(was_owned, "released a tick owner that was not taken");
    }

    /// Spin until the token is taken.
    pub(crate) fn take_blocking(&self) {
        while !self.try_take() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Manual-reset event.
#[derive(Debug, Default)]
pub(crate) struct Event {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    pub(crate) fn new(signaled: bool) -> Self {
        Self {
            signaled: Mutex::new(signaled),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn trigger(&self) {
        *self.signaled.lock() = true;
        self.condvar.notify_all();
    }

    pub(crate) fn reset(&self) {
        *self.signaled.lock() = false;
    }

    /// Wait until triggered or until `timeout` passes. Returns whether it was triggered.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            self.condvar.wait_for(&mut signaled, timeout);
        }
        *signaled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_tick_owner_is_exclusive() {
        let owner = TickOwner::new();
        assert!(owner.try_take());
        assert!(!owner.try_take());
        owner.release();
        assert!(owner.try_take());
        owner.release();
    }

    #[test]
    fn test_event_wakes_waiter() {
        let event = Arc::new(Event::new(false));
        assert!(!event.wait(Duration::from_millis(1)));

        let waiter = {
            let event = Arc::clone(&event);
            std::thread::spawn(move || event.wait(Duration::from_secs(5)))
        };
        event.trigger();
        assert!(waiter.join().unwrap());

        event.reset();
        assert!(!event.wait(Duration::from_millis(1)));
    }
}
