// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    coroutine::{
        CoroutineRef,
        CoroutineState,
    },
    scheduler::{
        self,
        NOT_A_COROUTINE,
    },
    suspend::suspend,
};
use ::std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A one-shot, self-resetting signal between coroutines.
///
/// `signal()` wakes every coroutine currently waiting; with no waiters it
/// leaves a sticky bit that the next `wait()` consumes. Waiters may live
/// on any worker and `signal()` may be called from any worker or plain OS
/// thread.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

struct EventInner {
    state: Mutex<EventState>,
}

struct EventState {
    /// Sticky bit, set by a signal that found no waiters and consumed by
    /// exactly one subsequent wait.
    signaled: bool,
    /// Coroutines suspended in `wait`, keyed by coroutine id so a timed-out
    /// waiter can remove itself.
    waiters: HashMap<u64, CoroutineRef>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Event {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventInner {
                state: Mutex::new(EventState {
                    signaled: false,
                    waiters: HashMap::new(),
                }),
            }),
        }
    }

    /// Blocks the calling coroutine until a signal is observed. A pending
    /// sticky signal is consumed without suspending.
    pub async fn wait(&self) {
        let co: CoroutineRef = {
            let scheduler = scheduler::current().expect(NOT_A_COROUTINE);
            let co: CoroutineRef = scheduler.running();
            let mut state = self.inner.state.lock().expect("event mutex cannot be poisoned");
            if state.signaled {
                state.signaled = false;
                return;
            }
            co.set_state(CoroutineState::Wait);
            state.waiters.insert(co.id(), co.clone());
            co
        };

        suspend().await;
        co.set_state(CoroutineState::Init);
    }

    /// As [`Self::wait`], with a deadline. Returns `true` iff a signal was
    /// consumed. On timeout the waiter takes itself back out of the
    /// wait-set; finding itself already gone means a racing signal moved
    /// it first, but the deadline still decides the return value.
    pub async fn timed_wait(&self, ms: u64) -> bool {
        let co: CoroutineRef = {
            let scheduler = scheduler::current().expect(NOT_A_COROUTINE);
            let co: CoroutineRef = scheduler.running();
            {
                let mut state = self.inner.state.lock().expect("event mutex cannot be poisoned");
                if state.signaled {
                    state.signaled = false;
                    return true;
                }
                co.set_state(CoroutineState::Wait);
                state.waiters.insert(co.id(), co.clone());
            }
            scheduler.add_timer(ms);
            co
        };

        suspend().await;

        let timed_out: bool = co.timed_out();
        if timed_out {
            let mut state = self.inner.state.lock().expect("event mutex cannot be poisoned");
            state.waiters.remove(&co.id());
        }
        co.set_state(CoroutineState::Init);
        !timed_out
    }

    /// Wakes all waiting coroutines, or sets the sticky bit when nobody
    /// waits. The waiter set is detached under the lock and the wake-ups
    /// run outside it, so the hand-off never holds the event lock. A
    /// coroutine whose timer already made it ready loses the
    /// compare-and-swap and is left to the scheduler: the signal is lost
    /// to that coroutine but observed by the others.
    pub fn signal(&self) {
        let woken: Vec<CoroutineRef> = {
            let mut state = self.inner.state.lock().expect("event mutex cannot be poisoned");
            if state.waiters.is_empty() {
                state.signaled = true;
                return;
            }
            state.waiters.drain().map(|(_, co)| co).collect()
        };

        for co in woken {
            if co.try_ready() {
                co.schedule();
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}
