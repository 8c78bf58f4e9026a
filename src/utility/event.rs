//! A waitable one-shot flag for shutdown and stop signalling.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A monotonic false-to-true flag that threads can wait on with a timeout.
/// Used for the shutdown event (set from the signal thread) and the
/// offloader's stop event.
#[derive(Default)]
pub struct Event {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake all waiters. Idempotent.
    pub fn set(&self) {
        let mut state = self.state.lock().unwrap();
        *state = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    /// Wait until the flag is set or `timeout` elapses. Returns whether the
    /// flag is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |set| !*set)
            .unwrap();
        *state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn unset_times_out() {
        let event = Event::new();
        assert!(!event.wait_timeout(Duration::from_millis(10)));
        assert!(!event.is_set());
    }

    #[test]
    fn set_wakes_waiter() {
        let event = Arc::new(Event::new());
        let waiter = {
            let event = Arc::clone(&event);
            std::thread::spawn(move || event.wait_timeout(Duration::from_secs(5)))
        };
        event.set();
        assert!(waiter.join().unwrap());
        assert!(event.is_set());
        // still set afterwards
        assert!(event.wait_timeout(Duration::ZERO));
    }
}
