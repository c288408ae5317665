use crate::pool::worker::Worker;
use bitflags::bitflags;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

bitflags! {
    /// Flag nibble of the idle-queue word. `POLLING` is reserved here: it is
    /// the global run queue's consumer lock and lives in that queue's tail
    /// word, not in `idle_queue`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct IdleFlags: usize {
        const POLLING = 0b0001;
        const WAKING = 0b0010;
        const NOTIFIED = 0b0100;
        const SHUTDOWN = 0b1000;
    }
}

const FLAGS_BITS: u32 = 4;
const ABA_BITS: u32 = 8;
const ABA_SHIFT: u32 = FLAGS_BITS;
const INDEX_SHIFT: u32 = FLAGS_BITS + ABA_BITS;

#[cfg(target_pointer_width = "64")]
const INDEX_BITS: u32 = 32;
#[cfg(target_pointer_width = "32")]
const INDEX_BITS: u32 = 16;

pub(crate) const ABA_MASK: usize = (1 << ABA_BITS) - 1;
const INDEX_MASK: usize = (1 << INDEX_BITS) - 1;

/// Hard cap on pool size: the idle-queue word must be able to carry any slot
/// index plus one (indices are published 1-based so 0 can mean "empty").
pub(crate) const MAX_SLOTS: usize = INDEX_MASK - 1;

/// Decoded view of the pool's `idle_queue` word:
/// `[ top-slot-index | aba-tag | flags ]`.
///
/// `top` is 1-based (0 = empty stack). The ABA tag is bumped on every push
/// so a pop whose top slot was recycled underneath it fails its CAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IdleState {
    pub(crate) top: usize,
    pub(crate) aba: usize,
    pub(crate) flags: IdleFlags,
}

impl IdleState {
    pub(crate) fn bump_aba(&self) -> usize {
        (self.aba + 1) & ABA_MASK
    }
}

impl From<usize> for IdleState {
    fn from(value: usize) -> Self {
        Self {
            top: (value >> INDEX_SHIFT) & INDEX_MASK,
            aba: (value >> ABA_SHIFT) & ABA_MASK,
            flags: IdleFlags::from_bits_truncate(value),
        }
    }
}

impl From<IdleState> for usize {
    fn from(state: IdleState) -> usize {
        debug_assert!(state.top <= INDEX_MASK);
        debug_assert!(state.aba <= ABA_MASK);
        (state.top << INDEX_SHIFT) | (state.aba << ABA_SHIFT) | state.flags.bits()
    }
}

/// Decoded view of one slot word. The two low bits tag the state; the rest
/// of the word is the payload.
///
/// Permitted transitions: `Free -> Spawning -> Associated -> Shutdown`.
/// `Spawning -> Associated` is performed by the new worker itself;
/// `Associated -> Shutdown` by the worker on exit. Only `Free` and
/// `Associated` slots are ever linked into the idle stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// Member of the idle stack; the payload is the 1-based index of the
    /// next free slot below it (0 = end of stack).
    Free { next: usize },

    /// A live worker occupies this slot.
    Associated(NonNull<Worker>),

    /// The worker exited; a join handle (possibly null, for the worker run
    /// inline on the caller's thread) awaits the final join.
    Shutdown(*mut thread::JoinHandle<()>),

    /// A waker is mid-way through creating this worker; the handle is
    /// published into this state once the OS thread exists.
    Spawning(*mut thread::JoinHandle<()>),
}

const TAG_MASK: usize = 0b11;
const TAG_FREE: usize = 0b00;
const TAG_ASSOCIATED: usize = 0b01;
const TAG_SHUTDOWN: usize = 0b10;
const TAG_SPAWNING: usize = 0b11;

impl SlotState {
    fn encode(self) -> usize {
        match self {
            SlotState::Free { next } => {
                debug_assert!(next <= INDEX_MASK);
                (next << 2) | TAG_FREE
            }
            SlotState::Associated(worker) => {
                let bits = worker.as_ptr() as usize;
                debug_assert_eq!(bits & TAG_MASK, 0);
                bits | TAG_ASSOCIATED
            }
            SlotState::Shutdown(handle) => {
                let bits = handle as usize;
                debug_assert_eq!(bits & TAG_MASK, 0);
                bits | TAG_SHUTDOWN
            }
            SlotState::Spawning(handle) => {
                let bits = handle as usize;
                debug_assert_eq!(bits & TAG_MASK, 0);
                bits | TAG_SPAWNING
            }
        }
    }

    fn decode(value: usize) -> Self {
        let payload = value & !TAG_MASK;
        match value & TAG_MASK {
            TAG_FREE => SlotState::Free { next: payload >> 2 },
            TAG_ASSOCIATED => SlotState::Associated(
                NonNull::new(payload as *mut Worker).expect("associated slot with null worker"),
            ),
            TAG_SHUTDOWN => SlotState::Shutdown(payload as *mut thread::JoinHandle<()>),
            TAG_SPAWNING => SlotState::Spawning(payload as *mut thread::JoinHandle<()>),
            _ => unreachable!(),
        }
    }
}

/// One tagged atomic word per configured worker: the state and its payload
/// transition together in single atomic operations.
#[derive(Debug)]
pub(crate) struct Slot(AtomicUsize);

impl Slot {
    pub(crate) fn new(state: SlotState) -> Self {
        Self(AtomicUsize::new(state.encode()))
    }

    pub(crate) fn load(&self, order: Ordering) -> SlotState {
        SlotState::decode(self.0.load(order))
    }

    pub(crate) fn store(&self, state: SlotState, order: Ordering) {
        self.0.store(state.encode(), order);
    }

    pub(crate) fn swap(&self, state: SlotState, order: Ordering) -> SlotState {
        SlotState::decode(self.0.swap(state.encode(), order))
    }

    pub(crate) fn compare_exchange(
        &self,
        current: SlotState,
        new: SlotState,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), SlotState> {
        self.0
            .compare_exchange(current.encode(), new.encode(), success, failure)
            .map(|_| ())
            .map_err(SlotState::decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_state_round_trips() {
        let state = IdleState {
            top: 7,
            aba: 0x5a,
            flags: IdleFlags::WAKING | IdleFlags::NOTIFIED,
        };
        assert_eq!(IdleState::from(usize::from(state)), state);
    }

    #[test]
    fn idle_aba_wraps() {
        let state = IdleState {
            top: 1,
            aba: ABA_MASK,
            flags: IdleFlags::empty(),
        };
        assert_eq!(state.bump_aba(), 0);
    }

    #[test]
    fn free_slot_round_trips() {
        let slot = Slot::new(SlotState::Free { next: 42 });
        assert_eq!(slot.load(Ordering::Relaxed), SlotState::Free { next: 42 });
    }

    #[test]
    fn shutdown_and_spawning_carry_null_handles() {
        let slot = Slot::new(SlotState::Spawning(std::ptr::null_mut()));
        assert_eq!(
            slot.load(Ordering::Relaxed),
            SlotState::Spawning(std::ptr::null_mut())
        );

        slot.store(SlotState::Shutdown(std::ptr::null_mut()), Ordering::Relaxed);
        assert_eq!(
            slot.load(Ordering::Relaxed),
            SlotState::Shutdown(std::ptr::null_mut())
        );
    }

    #[test]
    fn compare_exchange_reports_observed_state() {
        let slot = Slot::new(SlotState::Free { next: 0 });
        let err = slot
            .compare_exchange(
                SlotState::Free { next: 1 },
                SlotState::Spawning(std::ptr::null_mut()),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap_err();
        assert_eq!(err, SlotState::Free { next: 0 });
    }
}
