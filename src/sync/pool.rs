// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Per-worker object free-lists.
//!
//! A pool keeps one free-list per worker; `pop`/`push`/`size` only ever
//! touch the list of the worker the calling coroutine runs on, so pooled
//! objects never migrate between workers. Lists come into existence
//! lazily, and the first use on a worker registers a cleanup callback
//! there: teardown always runs on the owning thread, so a `destroy`
//! callback can never race with a live user of the list.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::scheduler::{
    self,
    Scheduler,
    NOT_A_COROUTINE,
};
use ::std::{
    rc::Rc,
    sync::{
        Arc,
        Mutex,
        OnceLock,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Object factory for [`Pool::pop`] on an empty free-list.
pub type CreateFn<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Finalizer for items evicted at capacity or left over at teardown.
pub type DestroyFn<T> = Box<dyn Fn(T) + Send + Sync>;

/// A per-worker object pool with optional lifecycle callbacks and a
/// capacity cap. All operations must run in a coroutine.
pub struct Pool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

struct PoolInner<T: Send + 'static> {
    /// One free-list slot per worker; sized on first use from the worker
    /// count of the calling runtime. The mutex makes the slots shareable
    /// across threads, but each one is only ever locked by its owner.
    shelves: OnceLock<Box<[Mutex<Option<Vec<T>>>]>>,
    create: Option<CreateFn<T>>,
    destroy: Option<DestroyFn<T>>,
    maxcap: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T: Send + 'static> Pool<T> {
    /// A pool without callbacks and without a capacity cap.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                shelves: OnceLock::new(),
                create: None,
                destroy: None,
                maxcap: usize::MAX,
            }),
        }
    }

    /// A pool with lifecycle callbacks and a per-worker capacity cap.
    /// Without a `destroy` callback the cap has no effect.
    pub fn with_callbacks(create: CreateFn<T>, destroy: DestroyFn<T>, maxcap: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                shelves: OnceLock::new(),
                create: Some(create),
                destroy: Some(destroy),
                maxcap,
            }),
        }
    }

    /// Pops an object from this worker's free-list, falling back to the
    /// `create` callback (if any) when the list is empty.
    pub fn pop(&self) -> Option<T> {
        let scheduler: Rc<Scheduler> = scheduler::current().expect(NOT_A_COROUTINE);
        {
            let mut shelf = PoolInner::shelf(&self.inner, &scheduler);
            let items: &mut Vec<T> = shelf.as_mut().expect("shelf was just created");
            if let Some(item) = items.pop() {
                return Some(item);
            }
        }
        self.inner.create.as_ref().map(|create| create())
    }

    /// Pushes an object onto this worker's free-list. At capacity, and
    /// with a `destroy` callback configured, the object is destroyed
    /// instead.
    pub fn push(&self, item: T) {
        let scheduler: Rc<Scheduler> = scheduler::current().expect(NOT_A_COROUTINE);
        let evicted: Option<T> = {
            let mut shelf = PoolInner::shelf(&self.inner, &scheduler);
            let items: &mut Vec<T> = shelf.as_mut().expect("shelf was just created");
            if self.inner.destroy.is_none() || items.len() < self.inner.maxcap {
                items.push(item);
                None
            } else {
                Some(item)
            }
        };
        if let Some(item) = evicted {
            if let Some(destroy) = self.inner.destroy.as_ref() {
                destroy(item);
            }
        }
    }

    /// Number of objects in this worker's free-list. Not a global count.
    pub fn size(&self) -> usize {
        let scheduler: Rc<Scheduler> = scheduler::current().expect(NOT_A_COROUTINE);
        let slot: &Mutex<Option<Vec<T>>> = &self.inner.shelves(&scheduler)[scheduler.id()];
        match slot.lock().expect("pool shelf cannot be poisoned").as_ref() {
            Some(items) => items.len(),
            None => 0,
        }
    }
}

impl<T: Send + 'static> PoolInner<T> {
    /// The shelf array, sized from the calling worker's runtime.
    fn shelves(&self, scheduler: &Rc<Scheduler>) -> &[Mutex<Option<Vec<T>>>] {
        self.shelves.get_or_init(|| {
            (0..scheduler.scheduler_num())
                .map(|_| Mutex::new(None))
                .collect::<Vec<Mutex<Option<Vec<T>>>>>()
                .into_boxed_slice()
        })
    }

    /// Locks this worker's shelf, creating the free-list (and registering
    /// its cleanup with the worker) on first use.
    fn shelf<'a>(
        inner: &'a Arc<Self>,
        scheduler: &Rc<Scheduler>,
    ) -> ::std::sync::MutexGuard<'a, Option<Vec<T>>> {
        let id: usize = scheduler.id();
        let mut shelf = inner.shelves(scheduler)[id]
            .lock()
            .expect("pool shelf cannot be poisoned");
        if shelf.is_none() {
            *shelf = Some(Vec::with_capacity(128));
            let pool: Arc<Self> = inner.clone();
            scheduler.add_cleanup_cb(Box::new(move || pool.cleanup(id)));
        }
        shelf
    }

    /// Destroys the remaining items of one worker's free-list. Runs on the
    /// owning worker after its event loop exits.
    fn cleanup(&self, id: usize) {
        let shelves: &[Mutex<Option<Vec<T>>>] = match self.shelves.get() {
            Some(shelves) => shelves,
            None => return,
        };
        let items: Option<Vec<T>> = shelves[id]
            .lock()
            .expect("pool shelf cannot be poisoned")
            .take();
        if let Some(items) = items {
            trace!("cleanup(): worker={:?} destroying {:?} pooled items", id, items.len());
            if let Some(destroy) = self.destroy.as_ref() {
                for item in items {
                    destroy(item);
                }
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<T: Send + 'static> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}
