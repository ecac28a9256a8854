// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod coroutine;
pub mod fail;
pub mod io_event;
pub mod logging;
pub mod reactor;
pub mod scheduler;
pub(crate) mod suspend;
pub mod timer;

pub use self::{
    io_event::IoEvent,
    reactor::Direction,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    pal::linux,
    runtime::{
        coroutine::{
            Coroutine,
            CoroutineRef,
            CoroutineState,
        },
        fail::Fail,
        reactor::Reactor,
        scheduler::{
            BoxFuture,
            Message,
            Scheduler,
            WorkerShared,
            NOT_A_COROUTINE,
        },
    },
};
use ::std::{
    future::Future,
    os::unix::prelude::RawFd,
    rc::Rc,
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    thread::{
        self,
        JoinHandle,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// State shared between the runtime handle and all of its workers.
pub(crate) struct RuntimeShared {
    workers: Vec<Arc<WorkerShared>>,
    /// Round-robin cursor for spawn placement.
    next_worker: AtomicUsize,
    stop: AtomicBool,
}

/// A pool of cooperative workers, each one OS thread running one event
/// loop. Coroutines are spawned onto a worker and stay there: wake-ups
/// always target the coroutine's home worker.
pub struct Runtime {
    shared: Arc<RuntimeShared>,
    threads: Vec<JoinHandle<()>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl RuntimeShared {
    pub fn scheduler_num(&self) -> usize {
        self.workers.len()
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Spawns a coroutine on the next worker in round-robin order.
    fn spawn_boxed(&self, future: BoxFuture) {
        let index: usize = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker: Arc<WorkerShared> = self.workers[index].clone();
        let co: CoroutineRef = Arc::new(Coroutine::new(worker.clone()));
        co.set_state(CoroutineState::Ready);
        worker.enqueue(Message::Spawn(future, co));
    }
}

impl Runtime {
    /// Starts a runtime with `nworkers` workers.
    pub fn new(nworkers: usize) -> Result<Self, Fail> {
        if nworkers == 0 {
            return Err(Fail::new(libc::EINVAL, "runtime needs at least one worker"));
        }
        logging::initialize();

        let mut workers: Vec<Arc<WorkerShared>> = Vec::with_capacity(nworkers);
        let mut epoll_fds: Vec<RawFd> = Vec::with_capacity(nworkers);
        for id in 0..nworkers {
            let waker_fd: RawFd = match linux::eventfd() {
                Ok(fd) => fd,
                Err(e) => {
                    close_fds(&epoll_fds);
                    return Err(e);
                },
            };
            // The WorkerShared owns (and closes) the eventfd from here on.
            workers.push(Arc::new(WorkerShared::new(id, waker_fd)));
            match linux::epoll_create() {
                Ok(fd) => epoll_fds.push(fd),
                Err(e) => {
                    close_fds(&epoll_fds);
                    return Err(e);
                },
            }
        }

        let shared: Arc<RuntimeShared> = Arc::new(RuntimeShared {
            workers,
            next_worker: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        });

        let mut threads: Vec<JoinHandle<()>> = Vec::with_capacity(nworkers);
        for (id, epoll_fd) in epoll_fds.into_iter().enumerate() {
            let runtime: Arc<RuntimeShared> = shared.clone();
            let worker: Arc<WorkerShared> = shared.workers[id].clone();
            let thread: JoinHandle<()> = thread::Builder::new()
                .name(format!("corio-worker-{}", id))
                .spawn(move || worker_main(runtime, worker, epoll_fd))
                .expect("failed to spawn worker thread");
            threads.push(thread);
        }

        Ok(Self { shared, threads })
    }

    /// Spawns a coroutine. The future only needs `Send` for the hand-off
    /// to its home worker; it is polled on that worker alone afterwards.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shared.spawn_boxed(Box::pin(future));
    }

    /// Total worker count; fixed at startup.
    pub fn scheduler_num(&self) -> usize {
        self.shared.scheduler_num()
    }

    /// Stops the event loops, runs per-worker cleanup callbacks on their
    /// owning threads, and joins the workers. Pending coroutines are
    /// dropped without resuming.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if !self.shared.stop.swap(true, Ordering::SeqCst) {
            for worker in &self.shared.workers {
                worker.wake();
            }
        }
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("shutdown(): worker thread panicked");
            }
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Body of a worker thread.
fn worker_main(runtime: Arc<RuntimeShared>, worker: Arc<WorkerShared>, epoll_fd: RawFd) {
    let reactor: Reactor = match Reactor::new(epoll_fd, worker.waker_fd()) {
        Ok(reactor) => reactor,
        Err(e) => {
            error!("worker_main(): worker {:?} failed to start: {:?}", worker.id(), e);
            unsafe {
                libc::close(epoll_fd);
            }
            return;
        },
    };
    let sched: Rc<Scheduler> = Rc::new(Scheduler::new(runtime, worker, reactor));
    scheduler::set_current(Some(sched.clone()));
    sched.run();
    scheduler::set_current(None);
}

fn close_fds(fds: &[RawFd]) {
    for &fd in fds {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Spawns a coroutine onto the runtime of the calling coroutine. Panics
/// outside a coroutine context.
pub fn spawn<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let runtime: Arc<RuntimeShared> = {
        let scheduler: Rc<Scheduler> = scheduler::current().expect(NOT_A_COROUTINE);
        scheduler.runtime().clone()
    };
    runtime.spawn_boxed(Box::pin(future));
}

/// Suspends the running coroutine for at least `ms` milliseconds.
pub async fn sleep(ms: u64) {
    let co: CoroutineRef = {
        let scheduler: Rc<Scheduler> = scheduler::current().expect(NOT_A_COROUTINE);
        let co: CoroutineRef = scheduler.running();
        co.set_state(CoroutineState::Wait);
        scheduler.add_timer(ms);
        co
    };
    suspend::suspend().await;
    co.set_state(CoroutineState::Init);
}

/// Identity of the worker driving the calling thread. Panics when the
/// caller is not on a worker (coroutine bodies and per-worker cleanup
/// callbacks both qualify).
pub fn worker_id() -> usize {
    scheduler::current().expect(NOT_A_COROUTINE).id()
}

/// Worker count of the runtime driving the calling thread. Panics when
/// the caller is not on a worker.
pub fn scheduler_num() -> usize {
    scheduler::current().expect(NOT_A_COROUTINE).scheduler_num()
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}
