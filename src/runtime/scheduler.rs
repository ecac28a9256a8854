// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Per-worker cooperative scheduler.
//!
//! Each worker is one OS thread running one event loop. Coroutines of a
//! worker run serially; there is no preemption between suspension points.
//! Cross-worker wake-ups go through [`WorkerShared`]: an injector queue
//! plus an eventfd that interrupts the worker's `epoll_wait`. A wake-up
//! from the worker's own thread takes a fast path straight into the local
//! ready-queue.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    coroutine::{
        CoroutineRef,
        CoroutineState,
    },
    reactor::Reactor,
    timer::{
        TimerEntry,
        TimerHeap,
    },
    RuntimeShared,
};
use ::slab::Slab;
use ::std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    mem,
    os::unix::prelude::RawFd,
    pin::Pin,
    rc::Rc,
    sync::{
        Arc,
        Mutex,
    },
    task::{
        Context,
        Poll,
        Waker,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Panic message for core APIs invoked outside a coroutine context.
pub const NOT_A_COROUTINE: &str = "operation requires a coroutine context";

//======================================================================================================================
// Structures
//======================================================================================================================

/// Type-erased coroutine body. The future must be `Send` because it is
/// built on the spawning thread and shipped to its home worker; once
/// inserted in the task slab it is only ever polled there.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Work handed to a worker from any thread.
pub enum Message {
    /// A freshly spawned coroutine and its handle.
    Spawn(BoxFuture, CoroutineRef),
    /// A suspended coroutine that became ready.
    Resume(CoroutineRef),
}

/// Cross-thread half of a worker: everything a remote signaller needs to
/// hand a coroutine back to its home worker.
pub struct WorkerShared {
    /// Worker identity, in `[0, scheduler_num())`.
    id: usize,
    /// Inbound spawns and resumes from other threads.
    injector: Mutex<VecDeque<Message>>,
    /// Wakes the worker out of `epoll_wait`.
    waker_fd: RawFd,
}

/// A coroutine body parked in the task slab. The future is taken out of
/// the cell while it is being polled.
struct TaskCell {
    future: Option<BoxFuture>,
    co: CoroutineRef,
}

/// Thread-local half of a worker.
pub struct Scheduler {
    shared: Arc<WorkerShared>,
    runtime: Arc<RuntimeShared>,
    /// Storage for coroutine bodies; slot index = `Coroutine::key`.
    tasks: RefCell<Slab<TaskCell>>,
    /// Coroutines to poll, in hand-off order.
    ready: RefCell<VecDeque<CoroutineRef>>,
    timers: RefCell<TimerHeap>,
    reactor: Reactor,
    /// The coroutine currently being polled.
    running: RefCell<Option<CoroutineRef>>,
    /// Callbacks to run on this thread after the event loop exits.
    cleanup_cbs: RefCell<Vec<Box<dyn FnOnce()>>>,
}

thread_local! {
    /// The scheduler driving the current thread, if this thread is a worker.
    static CURRENT: RefCell<Option<Rc<Scheduler>>> = RefCell::new(None);
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Returns the scheduler of the calling thread, or `None` when the caller
/// is not on a worker.
pub(crate) fn current() -> Option<Rc<Scheduler>> {
    CURRENT.with(|current| current.borrow().clone())
}

pub(crate) fn set_current(scheduler: Option<Rc<Scheduler>>) {
    CURRENT.with(|current| *current.borrow_mut() = scheduler);
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl WorkerShared {
    pub fn new(id: usize, waker_fd: RawFd) -> Self {
        Self {
            id,
            injector: Mutex::new(VecDeque::new()),
            waker_fd,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn waker_fd(&self) -> RawFd {
        self.waker_fd
    }

    /// Hands work to this worker. When called from the worker's own
    /// thread the message goes straight into the local queues; otherwise
    /// it lands in the injector and the worker is kicked out of
    /// `epoll_wait`.
    pub fn enqueue(&self, msg: Message) {
        if let Some(scheduler) = current() {
            if ::std::ptr::eq(Arc::as_ptr(&scheduler.shared), self) {
                scheduler.dispatch(msg);
                return;
            }
        }
        self.injector
            .lock()
            .expect("injector mutex cannot be poisoned")
            .push_back(msg);
        self.wake();
    }

    /// Interrupts the worker's `epoll_wait`.
    pub fn wake(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.waker_fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }

    #[cfg(test)]
    pub fn new_for_test(id: usize) -> Result<Arc<Self>, crate::runtime::fail::Fail> {
        let waker_fd: RawFd = crate::pal::linux::eventfd()?;
        Ok(Arc::new(Self::new(id, waker_fd)))
    }
}

impl Scheduler {
    pub fn new(runtime: Arc<RuntimeShared>, shared: Arc<WorkerShared>, reactor: Reactor) -> Self {
        Self {
            shared,
            runtime,
            tasks: RefCell::new(Slab::new()),
            ready: RefCell::new(VecDeque::new()),
            timers: RefCell::new(TimerHeap::new()),
            reactor,
            running: RefCell::new(None),
            cleanup_cbs: RefCell::new(Vec::new()),
        }
    }

    /// Worker identity, in `[0, scheduler_num())`.
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Total worker count of the runtime this worker belongs to.
    pub fn scheduler_num(&self) -> usize {
        self.runtime.scheduler_num()
    }

    pub(crate) fn runtime(&self) -> &Arc<RuntimeShared> {
        &self.runtime
    }

    pub(crate) fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// The currently executing coroutine on this worker.
    pub fn running(&self) -> CoroutineRef {
        self.running.borrow().clone().expect(NOT_A_COROUTINE)
    }

    /// Arms a timer owned by the running coroutine. If it fires before
    /// another wake-up, the coroutine is made ready and [`Self::timeout`]
    /// reports `true` for that resumption.
    pub fn add_timer(&self, ms: u64) {
        let co: CoroutineRef = self.running();
        co.set_timed_out(false);
        let expiry: Instant = Instant::now() + Duration::from_millis(ms);
        self.timers.borrow_mut().push(expiry, co.clone(), co.epoch());
    }

    /// Whether the most recent wake-up of the running coroutine was caused
    /// by its own timer.
    pub fn timeout(&self) -> bool {
        self.running().timed_out()
    }

    /// Registers a callback to run on this worker after its event loop
    /// exits.
    pub fn add_cleanup_cb(&self, cb: Box<dyn FnOnce()>) {
        self.cleanup_cbs.borrow_mut().push(cb);
    }

    /// Accepts a message on the worker's own thread.
    fn dispatch(&self, msg: Message) {
        match msg {
            Message::Spawn(future, co) => self.insert_task(future, co),
            Message::Resume(co) => self.ready.borrow_mut().push_back(co),
        }
    }

    fn insert_task(&self, future: BoxFuture, co: CoroutineRef) {
        let key: usize = self.tasks.borrow_mut().insert(TaskCell {
            future: Some(future),
            co: co.clone(),
        });
        co.set_key(key);
        trace!("insert_task(): worker={:?}, co={:?}, key={:?}", self.id(), co.id(), key);
        self.ready.borrow_mut().push_back(co);
    }

    /// Runs the event loop until the runtime asks the workers to stop,
    /// then drops pending coroutines and flushes cleanup callbacks.
    pub fn run(self: &Rc<Self>) {
        trace!("run(): worker={:?} started", self.id());
        while !self.runtime.stopped() {
            self.drain_injector();
            self.run_ready();
            let timeout_ms: i32 = self.poll_timeout();
            if let Err(e) = self.reactor.poll(timeout_ms) {
                error!("run(): reactor failure on worker {:?}: {:?}", self.id(), e);
                break;
            }
            self.fire_timers();
        }

        // Drop pending coroutine bodies first: their destructors may still
        // deregister I/O interest with the reactor.
        self.tasks.borrow_mut().clear();
        self.ready.borrow_mut().clear();

        let cbs: Vec<Box<dyn FnOnce()>> = mem::take(&mut *self.cleanup_cbs.borrow_mut());
        trace!("run(): worker={:?} flushing {:?} cleanup callbacks", self.id(), cbs.len());
        for cb in cbs {
            cb();
        }
    }

    fn drain_injector(&self) {
        let msgs: VecDeque<Message> = {
            let mut injector = self
                .shared
                .injector
                .lock()
                .expect("injector mutex cannot be poisoned");
            mem::take(&mut *injector)
        };
        for msg in msgs {
            self.dispatch(msg);
        }
    }

    /// Polls the coroutines that are ready right now. Coroutines made
    /// ready while this batch runs are handled on the next loop iteration,
    /// so the reactor and the timers cannot be starved.
    fn run_ready(&self) {
        let batch: usize = self.ready.borrow().len();
        for _ in 0..batch {
            let co: CoroutineRef = match self.ready.borrow_mut().pop_front() {
                Some(co) => co,
                None => break,
            };
            self.poll_task(co);
        }
    }

    fn poll_task(&self, co: CoroutineRef) {
        let key: usize = co.key();
        let mut future: BoxFuture = {
            let mut tasks = self.tasks.borrow_mut();
            match tasks.get_mut(key) {
                // Guard against slot reuse: a stale resume for a completed
                // coroutine must not poll its successor.
                Some(cell) if Arc::ptr_eq(&cell.co, &co) => match cell.future.take() {
                    Some(future) => future,
                    None => return,
                },
                _ => return,
            }
        };

        co.bump_epoch();
        co.set_state(CoroutineState::Running);
        *self.running.borrow_mut() = Some(co.clone());
        let waker: Waker = Waker::from(co.clone());
        let mut context: Context = Context::from_waker(&waker);
        let result: Poll<()> = future.as_mut().poll(&mut context);
        *self.running.borrow_mut() = None;

        match result {
            Poll::Ready(()) => {
                co.set_state(CoroutineState::Done);
                self.tasks.borrow_mut().try_remove(key);
            },
            Poll::Pending => {
                if let Some(cell) = self.tasks.borrow_mut().get_mut(key) {
                    cell.future = Some(future);
                }
                self.park_after_pending(&co);
            },
        }
    }

    /// After a pending poll the coroutine is normally already in `Wait`
    /// (our suspension points park it themselves). If it is still
    /// `Running` or `Init`, the pending came from a plain future; park it
    /// so its waker can revive it. A wake-up that raced the poll has
    /// already enqueued the coroutine and needs nothing from us.
    fn park_after_pending(&self, co: &CoroutineRef) {
        loop {
            match co.state() {
                CoroutineState::Running => {
                    if co
                        .state_cas(CoroutineState::Running, CoroutineState::Wait)
                        .is_ok()
                    {
                        return;
                    }
                },
                CoroutineState::Init => {
                    if co.state_cas(CoroutineState::Init, CoroutineState::Wait).is_ok() {
                        return;
                    }
                },
                _ => return,
            }
        }
    }

    /// Deadline for the next `epoll_wait`: zero when work is pending,
    /// the next timer deadline when one is armed, forever otherwise.
    fn poll_timeout(&self) -> i32 {
        if !self.ready.borrow().is_empty() {
            return 0;
        }
        if !self
            .shared
            .injector
            .lock()
            .expect("injector mutex cannot be poisoned")
            .is_empty()
        {
            return 0;
        }
        match self.timers.borrow().next_deadline() {
            Some(deadline) => {
                let now: Instant = Instant::now();
                if deadline <= now {
                    0
                } else {
                    // Round up so the deadline has passed when we wake.
                    let ms: u128 = deadline.duration_since(now).as_millis() + 1;
                    ms.min(i32::MAX as u128) as i32
                }
            },
            None => -1,
        }
    }

    /// Wakes coroutines whose deadline passed. A timer armed for an
    /// earlier suspension (epoch mismatch) or beaten by a signaller
    /// (failed CAS) is a no-op.
    fn fire_timers(&self) {
        let due: Vec<TimerEntry> = self.timers.borrow_mut().expire(Instant::now());
        for entry in due {
            if entry.co.epoch() == entry.epoch && entry.co.try_ready() {
                entry.co.set_timed_out(true);
                entry.co.schedule();
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for WorkerShared {
    fn drop(&mut self) {
        if unsafe { libc::close(self.waker_fd) } != 0 {
            let errno: i32 = crate::pal::linux::last_errno();
            warn!("drop(): failed to close eventfd (errno={:?})", errno);
        }
    }
}
