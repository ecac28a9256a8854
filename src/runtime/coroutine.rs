// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Shared coroutine handles.
//!
//! A coroutine is a boxed future stored in the task slab of its home
//! worker. The [`Coroutine`] handle is the cross-thread half: it carries
//! the atomic scheduling state and a reference to the home worker so that
//! signallers on any thread can hand the coroutine back to the worker's
//! ready-queue. All `Wait -> Ready` transitions go through a
//! compare-and-swap, so when a timer and a signal race, exactly one of
//! them enqueues the coroutine.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::scheduler::{
    Message,
    WorkerShared,
};
use ::std::{
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            AtomicU8,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    task::Wake,
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Source of process-unique coroutine ids.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Scheduling state of a coroutine.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    /// Created or running between suspension points.
    Init = 0,
    /// Suspended; owned by at most one wait-set (or a timer).
    Wait = 1,
    /// Enqueued on its home worker's ready-queue.
    Ready = 2,
    /// Being polled by its home worker.
    Running = 3,
    /// Completed; the future has been dropped.
    Done = 4,
}

/// Cross-thread handle to a coroutine.
pub struct Coroutine {
    /// Process-unique identity (wait-set key).
    id: u64,
    /// Scheduling state; see [`CoroutineState`].
    state: AtomicU8,
    /// Whether the most recent wake-up was caused by the coroutine's own timer.
    timed_out: AtomicBool,
    /// Bumped on every resumption; a timer armed for an earlier epoch is stale.
    epoch: AtomicU64,
    /// Slot of the boxed future in the home worker's task slab.
    key: AtomicUsize,
    /// The worker responsible for resuming this coroutine.
    worker: Arc<WorkerShared>,
}

/// Shared reference to a coroutine.
pub type CoroutineRef = Arc<Coroutine>;

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Coroutine {
    /// Creates a handle homed on the given worker.
    pub fn new(worker: Arc<WorkerShared>) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(CoroutineState::Init as u8),
            timed_out: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            key: AtomicUsize::new(usize::MAX),
            worker,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn worker(&self) -> &Arc<WorkerShared> {
        &self.worker
    }

    pub fn state(&self) -> CoroutineState {
        CoroutineState::from(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: CoroutineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Attempts the `Wait -> Ready` transition. Returns `true` iff the
    /// caller won the race and is now responsible for enqueueing the
    /// coroutine on its home worker.
    pub fn try_ready(&self) -> bool {
        self.state
            .compare_exchange(
                CoroutineState::Wait as u8,
                CoroutineState::Ready as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Hands this coroutine to its home worker's ready-queue. Must only be
    /// called after a successful transition to `Ready`.
    pub fn schedule(self: Arc<Self>) {
        let worker: Arc<WorkerShared> = self.worker.clone();
        worker.enqueue(Message::Resume(self));
    }

    /// Makes the coroutine ready and enqueues it, regardless of whether it
    /// is suspended (`Wait`) or the wake-up races the current poll
    /// (`Running`). Loses gracefully against a concurrent signaller or
    /// timer: only the winning transition enqueues.
    pub fn wake(self: Arc<Self>) {
        loop {
            let observed: CoroutineState = self.state();
            match observed {
                CoroutineState::Wait | CoroutineState::Running => {
                    if self
                        .state
                        .compare_exchange(
                            observed as u8,
                            CoroutineState::Ready as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.schedule();
                        return;
                    }
                },
                _ => return,
            }
        }
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    pub fn set_timed_out(&self, value: bool) {
        self.timed_out.store(value, Ordering::Release);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Marks the start of a new resumption, invalidating timers armed for
    /// earlier suspensions.
    pub fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Raw state compare-and-swap; used by the worker to park a coroutine
    /// whose pending poll did not come from one of our suspension points.
    pub(crate) fn state_cas(&self, from: CoroutineState, to: CoroutineState) -> Result<(), CoroutineState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(CoroutineState::from)
    }

    pub fn key(&self) -> usize {
        self.key.load(Ordering::Acquire)
    }

    pub fn set_key(&self, key: usize) {
        self.key.store(key, Ordering::Release);
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<u8> for CoroutineState {
    fn from(v: u8) -> Self {
        match v {
            0 => CoroutineState::Init,
            1 => CoroutineState::Wait,
            2 => CoroutineState::Ready,
            3 => CoroutineState::Running,
            4 => CoroutineState::Done,
            _ => unreachable!("invalid coroutine state: {:?}", v),
        }
    }
}

/// Lets the worker poll coroutines with a standard [`std::task::Waker`],
/// so wake-ups coming through the waker follow the same hand-off protocol
/// as the synchronization primitives.
impl Wake for Coroutine {
    fn wake(self: Arc<Self>) {
        Coroutine::wake(self);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Coroutine,
        CoroutineState,
    };
    use crate::runtime::scheduler::WorkerShared;
    use ::anyhow::Result;
    use ::std::sync::Arc;

    #[test]
    fn state_roundtrip() -> Result<()> {
        for state in [
            CoroutineState::Init,
            CoroutineState::Wait,
            CoroutineState::Ready,
            CoroutineState::Running,
            CoroutineState::Done,
        ] {
            crate::ensure_eq!(CoroutineState::from(state as u8), state);
        }
        Ok(())
    }

    #[test]
    fn ready_transition_is_exclusive() -> Result<()> {
        let worker: Arc<WorkerShared> = WorkerShared::new_for_test(0)?;
        let co: Coroutine = Coroutine::new(worker);

        // Not suspended yet: nothing to transition.
        crate::ensure_eq!(co.try_ready(), false);

        // Exactly one of two racing signallers may win.
        co.set_state(CoroutineState::Wait);
        crate::ensure_eq!(co.try_ready(), true);
        crate::ensure_eq!(co.try_ready(), false);
        crate::ensure_eq!(co.state(), CoroutineState::Ready);
        Ok(())
    }
}
