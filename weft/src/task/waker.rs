use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::Waker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WakerState {
    Empty = 0,
    Updating = 1,
    Ready = 2,
    Waking = 3,
}

impl From<u8> for WakerState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Empty,
            1 => Self::Updating,
            2 => Self::Ready,
            3 => Self::Waking,
            _ => unreachable!("invalid waker state"),
        }
    }
}

/// Single-slot waker cell coordinating one registering side (a join handle
/// being polled) with one waking side (task completion). `wake` is terminal:
/// once it fires, later registrations report completion instead of storing.
#[derive(Debug, Default)]
pub(crate) struct AtomicWaker {
    state: AtomicU8,
    waker: UnsafeCell<Option<Waker>>,
}

// Safety: the state machine grants the `waker` cell to exactly one side at a
// time (`Updating` excludes the waker until the registrar publishes, and
// `Waking` excludes the registrar permanently).
unsafe impl Send for AtomicWaker {}
unsafe impl Sync for AtomicWaker {}

impl AtomicWaker {
    /// Fire the stored waker, if any. Must be called at most once.
    pub(crate) fn wake(&self) {
        let state: WakerState = self
            .state
            .swap(WakerState::Waking as u8, Ordering::AcqRel)
            .into();

        assert_ne!(state, WakerState::Waking, "join waker woken twice");
        if state == WakerState::Ready {
            unsafe { &mut *self.waker.get() }
                .take()
                .expect("waker state was Ready without a waker")
                .wake();
        }
    }

    /// Store (or clear, with `None`) the registered waker. Returns `false`
    /// when the wake already fired, in which case nothing was stored and the
    /// registrar should consume the result instead of waiting.
    pub(crate) fn update(&self, waker_ref: Option<&Waker>) -> bool {
        let state: WakerState = self.state.load(Ordering::Acquire).into();
        match state {
            WakerState::Empty | WakerState::Ready => {}
            WakerState::Updating => unreachable!("concurrent waker registration"),
            WakerState::Waking => return false,
        }

        if let Err(observed) = self.state.compare_exchange(
            state as u8,
            WakerState::Updating as u8,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            assert_eq!(WakerState::from(observed), WakerState::Waking);
            return false;
        }

        match mem::replace(unsafe { &mut *self.waker.get() }, waker_ref.cloned()) {
            Some(_stale) => assert_eq!(state, WakerState::Ready),
            None => assert_eq!(state, WakerState::Empty),
        }

        let new_state = match waker_ref {
            Some(_) => WakerState::Ready,
            None => WakerState::Empty,
        };
        if let Err(observed) = self.state.compare_exchange(
            WakerState::Updating as u8,
            new_state as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            // The wake fired mid-update; it saw `Updating` and left the cell
            // to us.
            assert_eq!(WakerState::from(observed), WakerState::Waking);
            unsafe { *self.waker.get() = None };
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWake(AtomicUsize);

    impl Wake for CountingWake {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn wake_fires_registered_waker() {
        let cell = AtomicWaker::default();
        let counter = Arc::new(CountingWake(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));

        assert!(cell.update(Some(&waker)));
        cell.wake();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn update_after_wake_reports_completion() {
        let cell = AtomicWaker::default();
        cell.wake();

        let counter = Arc::new(CountingWake(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        assert!(!cell.update(Some(&waker)));
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn re_registration_replaces_the_waker() {
        let cell = AtomicWaker::default();
        let first = Arc::new(CountingWake(AtomicUsize::new(0)));
        let second = Arc::new(CountingWake(AtomicUsize::new(0)));

        assert!(cell.update(Some(&Waker::from(Arc::clone(&first)))));
        assert!(cell.update(Some(&Waker::from(Arc::clone(&second)))));
        cell.wake();

        assert_eq!(first.0.load(Ordering::SeqCst), 0);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clearing_prevents_the_wake() {
        let cell = AtomicWaker::default();
        let counter = Arc::new(CountingWake(AtomicUsize::new(0)));

        assert!(cell.update(Some(&Waker::from(Arc::clone(&counter)))));
        assert!(cell.update(None));
        cell.wake();
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }
}
