use parking_lot::{Condvar, Mutex};

/// Binary cross-thread event a worker parks on. `set` is sticky: a wake
/// delivered before the worker reaches [`ParkEvent::wait`] is not lost, it
/// is consumed by the next wait.
#[derive(Debug, Default)]
pub(crate) struct ParkEvent {
    set: Mutex<bool>,
    cond: Condvar,
}

impl ParkEvent {
    /// Block until the event is set, consuming it.
    pub(crate) fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
        *set = false;
    }

    /// Set the event, waking the parked worker if there is one.
    pub(crate) fn set(&self) {
        let mut set = self.set.lock();
        *set = true;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn set_before_wait_is_not_lost() {
        let event = ParkEvent::default();
        event.set();
        event.wait();
    }

    #[test]
    fn wait_is_consumed() {
        let event = Arc::new(ParkEvent::default());
        event.set();
        event.wait();

        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        event.set();
        waiter.join().unwrap();
    }

    #[test]
    fn wakes_parked_thread() {
        let event = Arc::new(ParkEvent::default());
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait())
        };
        event.set();
        waiter.join().unwrap();
    }
}
