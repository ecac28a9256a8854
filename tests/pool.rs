// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! End-to-end tests for the per-worker object pool.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::corio::{
    runtime,
    sync::Pool,
    Runtime,
};
use ::crossbeam_channel::{
    unbounded,
    Receiver,
    Sender,
};
use ::std::{
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

//======================================================================================================================
// Standalone Tests
//======================================================================================================================

/// Pushing past the capacity cap destroys the surplus item exactly once
/// and leaves the free-list at the cap.
#[test]
fn push_at_capacity_destroys_surplus() -> Result<()> {
    let rt: Runtime = Runtime::new(1)?;
    let created: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let (destroyed_tx, destroyed_rx): (Sender<usize>, Receiver<usize>) = unbounded();

    let pool: Pool<usize> = {
        let created: Arc<AtomicUsize> = created.clone();
        Pool::with_callbacks(
            Box::new(move || created.fetch_add(1, Ordering::SeqCst)),
            Box::new(move |item| {
                destroyed_tx.send(item).expect("test channel cannot be closed");
            }),
            2,
        )
    };

    let (tx, rx): (Sender<usize>, Receiver<usize>) = unbounded();
    {
        let pool: Pool<usize> = pool.clone();
        rt.spawn(async move {
            let a: usize = pool.pop().expect("create callback is configured");
            let b: usize = pool.pop().expect("create callback is configured");
            let c: usize = pool.pop().expect("create callback is configured");
            pool.push(a);
            pool.push(b);
            pool.push(c);
            tx.send(pool.size()).expect("test channel cannot be closed");
        });
    }

    ::corio::ensure_eq!(rx.recv_timeout(RECV_TIMEOUT)?, 2);
    ::corio::ensure_eq!(created.load(Ordering::SeqCst), 3);
    // Exactly one item was destroyed: the one pushed at the cap.
    ::corio::ensure_eq!(destroyed_rx.recv_timeout(RECV_TIMEOUT)?, 2);
    ::corio::ensure_eq!(destroyed_rx.try_recv().is_err(), true);

    rt.shutdown();
    Ok(())
}

/// Free-lists are per worker: a push is visible to a later pop on the same
/// worker (LIFO) and invisible to the other workers.
#[test]
fn free_lists_are_worker_local() -> Result<()> {
    let rt: Runtime = Runtime::new(2)?;
    let pool: Pool<String> = Pool::new();
    let (tx, rx): (Sender<(usize, Option<String>, usize)>, Receiver<(usize, Option<String>, usize)>) = unbounded();

    // Spawn placement is round-robin, so the first coroutine lands on
    // worker 0 and the second on worker 1.
    {
        let pool: Pool<String> = pool.clone();
        let tx: Sender<(usize, Option<String>, usize)> = tx.clone();
        rt.spawn(async move {
            pool.push("token".to_string());
            let popped: Option<String> = pool.pop();
            tx.send((runtime::worker_id(), popped, pool.size()))
                .expect("test channel cannot be closed");
        });
    }
    let (first_worker, first_popped, first_size): (usize, Option<String>, usize) =
        rx.recv_timeout(RECV_TIMEOUT)?;
    ::corio::ensure_eq!(first_popped, Some("token".to_string()));
    ::corio::ensure_eq!(first_size, 0);

    {
        let pool: Pool<String> = pool.clone();
        let tx: Sender<(usize, Option<String>, usize)> = tx.clone();
        rt.spawn(async move {
            // Without a create callback an empty local list pops nothing,
            // no matter what the other workers pushed.
            pool.push("other".to_string());
            let popped: Option<String> = pool.pop();
            let leftover: Option<String> = pool.pop();
            tx.send((runtime::worker_id(), leftover.or(popped), pool.size()))
                .expect("test channel cannot be closed");
        });
    }
    let (second_worker, second_popped, second_size): (usize, Option<String>, usize) =
        rx.recv_timeout(RECV_TIMEOUT)?;
    ::corio::ensure_neq!(second_worker, first_worker);
    ::corio::ensure_eq!(second_popped, Some("other".to_string()));
    ::corio::ensure_eq!(second_size, 0);

    rt.shutdown();
    Ok(())
}

/// At shutdown every leftover item is destroyed on the worker that owns
/// its free-list.
#[test]
fn cleanup_runs_on_owning_worker() -> Result<()> {
    const WORKERS: usize = 2;
    const ITEMS_PER_WORKER: usize = 3;

    let rt: Runtime = Runtime::new(WORKERS)?;
    let (destroyed_tx, destroyed_rx): (Sender<(usize, usize)>, Receiver<(usize, usize)>) = unbounded();

    let pool: Pool<usize> = Pool::with_callbacks(
        Box::new(|| 0),
        Box::new(move |item| {
            // Cleanup callbacks run on the owning worker, where the worker
            // id is still observable.
            destroyed_tx
                .send((runtime::worker_id(), item))
                .expect("test channel cannot be closed");
        }),
        usize::MAX,
    );

    let (tx, rx): (Sender<()>, Receiver<()>) = unbounded();
    for _ in 0..WORKERS {
        let pool: Pool<usize> = pool.clone();
        let tx: Sender<()> = tx.clone();
        rt.spawn(async move {
            for _ in 0..ITEMS_PER_WORKER {
                // Tag each pooled item with the worker that pushed it.
                pool.push(runtime::worker_id());
            }
            tx.send(()).expect("test channel cannot be closed");
        });
    }
    for _ in 0..WORKERS {
        rx.recv_timeout(RECV_TIMEOUT)?;
    }

    rt.shutdown();

    let mut destroyed: usize = 0;
    while let Ok((destroying_worker, tag)) = destroyed_rx.try_recv() {
        ::corio::ensure_eq!(destroying_worker, tag);
        destroyed += 1;
    }
    ::corio::ensure_eq!(destroyed, WORKERS * ITEMS_PER_WORKER);
    Ok(())
}
