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
    reactor::Direction,
    scheduler::{
        self,
        Scheduler,
        NOT_A_COROUTINE,
    },
    suspend::suspend,
};
use ::std::{
    os::unix::prelude::RawFd,
    rc::Rc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A scoped binding of `(fd, direction)` to the worker's reactor.
///
/// Construction arms edge-triggered interest; [`IoEvent::wait`] suspends
/// the running coroutine until the reactor reports readiness or the
/// deadline elapses. Dropping the handle disarms interest for this
/// direction unless `close`/`shutdown` already removed the fd.
pub struct IoEvent {
    fd: RawFd,
    dir: Direction,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl IoEvent {
    /// Binds `(fd, dir)` and arms interest. Must be called in a coroutine.
    pub fn new(fd: RawFd, dir: Direction) -> Self {
        let scheduler: Rc<Scheduler> = scheduler::current().expect(NOT_A_COROUTINE);
        if let Err(e) = scheduler.reactor().add_interest(fd, dir) {
            warn!("new(): cannot arm interest (fd={:?}, dir={:?}): {:?}", fd, dir, e);
        }
        Self { fd, dir }
    }

    /// Suspends the running coroutine until the fd is ready in this
    /// direction (`true`) or the deadline elapses (`false`). A negative
    /// `ms` waits forever; a wait without deadline only returns after a
    /// readiness report.
    pub async fn wait(&self, ms: i64) -> bool {
        let co: CoroutineRef = {
            let scheduler: Rc<Scheduler> = scheduler::current().expect(NOT_A_COROUTINE);
            let co: CoroutineRef = scheduler.running();
            scheduler.reactor().set_waiter(self.fd, self.dir, co.clone());
            co.set_state(CoroutineState::Wait);
            if ms >= 0 {
                scheduler.add_timer(ms as u64);
            }
            co
        };

        suspend().await;

        if ms >= 0 && co.timed_out() {
            let scheduler: Rc<Scheduler> = scheduler::current().expect(NOT_A_COROUTINE);
            scheduler.reactor().clear_waiter(self.fd, self.dir);
            co.set_state(CoroutineState::Init);
            return false;
        }
        co.set_state(CoroutineState::Init);
        true
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for IoEvent {
    fn drop(&mut self) {
        if let Some(scheduler) = scheduler::current() {
            scheduler.reactor().del_interest(self.fd, self.dir);
        }
    }
}
