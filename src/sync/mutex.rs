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
    collections::VecDeque,
    sync::Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Cooperative mutex with strict FIFO hand-off.
///
/// `unlock()` transfers ownership directly to the oldest waiter without
/// clearing the locked bit, so a third coroutine can never steal the lock
/// between release and re-acquisition. Lock and unlock may happen on
/// different workers.
#[derive(Clone)]
pub struct Mutex {
    inner: Arc<MutexInner>,
}

struct MutexInner {
    state: ::std::sync::Mutex<MutexState>,
}

struct MutexState {
    locked: bool,
    /// Coroutines suspended in `lock`, oldest first.
    waiters: VecDeque<CoroutineRef>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Mutex {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MutexInner {
                state: ::std::sync::Mutex::new(MutexState {
                    locked: false,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Attempts to take the lock without suspending. Callable from any
    /// context.
    pub fn try_lock(&self) -> bool {
        let mut state = self.inner.state.lock().expect("mutex state cannot be poisoned");
        if state.locked {
            false
        } else {
            state.locked = true;
            true
        }
    }

    /// Takes the lock, suspending the calling coroutine at the tail of the
    /// FIFO when the lock is held. Must be called in a coroutine.
    pub async fn lock(&self) {
        let waiting: Option<CoroutineRef> = {
            let scheduler = scheduler::current().expect(NOT_A_COROUTINE);
            let mut state = self.inner.state.lock().expect("mutex state cannot be poisoned");
            if !state.locked {
                state.locked = true;
                None
            } else {
                let co: CoroutineRef = scheduler.running();
                co.set_state(CoroutineState::Wait);
                state.waiters.push_back(co.clone());
                Some(co)
            }
        };

        if let Some(co) = waiting {
            suspend().await;
            // Resumed by a hand-off from unlock(): the lock is already ours.
            co.set_state(CoroutineState::Init);
        }
    }

    /// Releases the lock. With waiters pending, ownership moves to the
    /// head of the FIFO and the locked bit stays set.
    pub fn unlock(&self) {
        let next: Option<CoroutineRef> = {
            let mut state = self.inner.state.lock().expect("mutex state cannot be poisoned");
            debug_assert!(state.locked, "unlock of an unlocked mutex");
            match state.waiters.pop_front() {
                Some(co) => Some(co),
                None => {
                    state.locked = false;
                    None
                },
            }
        };

        if let Some(co) = next {
            let handed_off: bool = co.try_ready();
            debug_assert!(handed_off, "mutex waiter woken by someone else");
            if handed_off {
                co.schedule();
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Mutex;
    use ::anyhow::Result;

    #[test]
    fn try_lock_and_unlock() -> Result<()> {
        let mutex: Mutex = Mutex::new();

        crate::ensure_eq!(mutex.try_lock(), true);
        crate::ensure_eq!(mutex.try_lock(), false);
        mutex.unlock();
        crate::ensure_eq!(mutex.try_lock(), true);
        mutex.unlock();
        Ok(())
    }

    #[test]
    fn clones_share_state() -> Result<()> {
        let mutex: Mutex = Mutex::new();
        let alias: Mutex = mutex.clone();

        crate::ensure_eq!(mutex.try_lock(), true);
        crate::ensure_eq!(alias.try_lock(), false);
        alias.unlock();
        crate::ensure_eq!(alias.try_lock(), true);
        alias.unlock();
        Ok(())
    }
}
