// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! End-to-end tests for the cross-coroutine synchronization primitives.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::corio::{
    runtime,
    sync::{
        Event,
        Mutex,
    },
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
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// A generous bound on how long any single hand-off may take.
const RECV_TIMEOUT: Duration = Duration::from_secs(10);

//======================================================================================================================
// Standalone Tests
//======================================================================================================================

/// Coroutines that queued on a held mutex must acquire it in arrival order.
#[test]
fn mutex_hand_off_is_fifo() -> Result<()> {
    let rt: Runtime = Runtime::new(1)?;
    let mutex: Mutex = Mutex::new();
    let (tx, rx): (Sender<usize>, Receiver<usize>) = unbounded();

    // The holder grabs the lock first and keeps it long enough for all
    // contenders to line up in the wait-queue.
    {
        let mutex: Mutex = mutex.clone();
        rt.spawn(async move {
            mutex.lock().await;
            runtime::sleep(100).await;
            mutex.unlock();
        });
    }
    for i in 1..=8 {
        let mutex: Mutex = mutex.clone();
        let tx: Sender<usize> = tx.clone();
        rt.spawn(async move {
            mutex.lock().await;
            tx.send(i).expect("test channel cannot be closed");
            mutex.unlock();
        });
    }

    for expected in 1..=8 {
        ::corio::ensure_eq!(rx.recv_timeout(RECV_TIMEOUT)?, expected);
    }
    rt.shutdown();
    Ok(())
}

/// The mutex excludes coroutines that run in true parallel on different
/// workers, even when the critical section suspends.
#[test]
fn mutex_excludes_across_workers() -> Result<()> {
    const TASKS: usize = 4;
    const ROUNDS: usize = 25;

    let rt: Runtime = Runtime::new(2)?;
    let mutex: Mutex = Mutex::new();
    let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let (tx, rx): (Sender<()>, Receiver<()>) = unbounded();

    for _ in 0..TASKS {
        let mutex: Mutex = mutex.clone();
        let counter: Arc<AtomicUsize> = counter.clone();
        let tx: Sender<()> = tx.clone();
        rt.spawn(async move {
            for _ in 0..ROUNDS {
                mutex.lock().await;
                // A read-suspend-write cycle loses updates unless the lock
                // actually excludes the other workers.
                let observed: usize = counter.load(Ordering::Relaxed);
                runtime::sleep(1).await;
                counter.store(observed + 1, Ordering::Relaxed);
                mutex.unlock();
            }
            tx.send(()).expect("test channel cannot be closed");
        });
    }

    for _ in 0..TASKS {
        rx.recv_timeout(RECV_TIMEOUT)?;
    }
    ::corio::ensure_eq!(counter.load(Ordering::Relaxed), TASKS * ROUNDS);
    rt.shutdown();
    Ok(())
}

/// One signal wakes every waiter; the wait-set is then empty again.
#[test]
fn event_signal_is_broadcast() -> Result<()> {
    const WAITERS: usize = 5;

    let rt: Runtime = Runtime::new(2)?;
    let event: Event = Event::new();
    let (tx, rx): (Sender<usize>, Receiver<usize>) = unbounded();

    for i in 0..WAITERS {
        let event: Event = event.clone();
        let tx: Sender<usize> = tx.clone();
        rt.spawn(async move {
            event.wait().await;
            tx.send(i).expect("test channel cannot be closed");
        });
    }

    // Give the waiters time to park; nobody may resume before the signal.
    thread::sleep(Duration::from_millis(100));
    ::corio::ensure_eq!(rx.try_recv().is_err(), true);

    event.signal();
    for _ in 0..WAITERS {
        rx.recv_timeout(RECV_TIMEOUT)?;
    }

    // The broadcast consumed the whole wait-set: a later waiter blocks.
    let event2: Event = event.clone();
    let (tx2, rx2): (Sender<bool>, Receiver<bool>) = unbounded();
    rt.spawn(async move {
        let woken: bool = event2.timed_wait(100).await;
        tx2.send(woken).expect("test channel cannot be closed");
    });
    ::corio::ensure_eq!(rx2.recv_timeout(RECV_TIMEOUT)?, false);

    rt.shutdown();
    Ok(())
}

/// A signal with no waiters is sticky: the next wait consumes it without
/// blocking, and only that one.
#[test]
fn event_signal_is_sticky_once() -> Result<()> {
    let rt: Runtime = Runtime::new(1)?;
    let event: Event = Event::new();
    let (tx, rx): (Sender<(bool, bool, u128)>, Receiver<(bool, bool, u128)>) = unbounded();

    event.signal();
    rt.spawn(async move {
        let start: Instant = Instant::now();
        let first: bool = event.timed_wait(1000).await;
        let latency: u128 = start.elapsed().as_millis();
        let second: bool = event.timed_wait(50).await;
        tx.send((first, second, latency)).expect("test channel cannot be closed");
    });

    let (first, second, latency): (bool, bool, u128) = rx.recv_timeout(RECV_TIMEOUT)?;
    ::corio::ensure_eq!(first, true);
    ::corio::ensure_eq!(second, false);
    // The sticky bit is consumed immediately, not after the deadline.
    ::corio::ensure_eq!(latency < 500, true);

    rt.shutdown();
    Ok(())
}

/// A waiter and a latecomer: the waiter resumes on the signal, the
/// latecomer consumes the sticky bit of a second signal.
#[test]
fn event_waiter_then_latecomer() -> Result<()> {
    let rt: Runtime = Runtime::new(2)?;
    let event: Event = Event::new();
    let (tx, rx): (Sender<bool>, Receiver<bool>) = unbounded();

    {
        let event: Event = event.clone();
        let tx: Sender<bool> = tx.clone();
        rt.spawn(async move {
            let woken: bool = event.timed_wait(1000).await;
            tx.send(woken).expect("test channel cannot be closed");
        });
    }
    thread::sleep(Duration::from_millis(50));
    event.signal();
    ::corio::ensure_eq!(rx.recv_timeout(RECV_TIMEOUT)?, true);

    event.signal();
    {
        let event: Event = event.clone();
        let tx: Sender<bool> = tx.clone();
        rt.spawn(async move {
            let woken: bool = event.timed_wait(1000).await;
            tx.send(woken).expect("test channel cannot be closed");
        });
    }
    ::corio::ensure_eq!(rx.recv_timeout(RECV_TIMEOUT)?, true);

    rt.shutdown();
    Ok(())
}

/// An expired wait reports the deadline and leaves the event usable.
#[test]
fn event_timed_wait_expires() -> Result<()> {
    let rt: Runtime = Runtime::new(1)?;
    let event: Event = Event::new();
    let (tx, rx): (Sender<(bool, u128)>, Receiver<(bool, u128)>) = unbounded();

    rt.spawn(async move {
        let start: Instant = Instant::now();
        let woken: bool = event.timed_wait(50).await;
        tx.send((woken, start.elapsed().as_millis()))
            .expect("test channel cannot be closed");
    });

    let (woken, elapsed): (bool, u128) = rx.recv_timeout(RECV_TIMEOUT)?;
    ::corio::ensure_eq!(woken, false);
    ::corio::ensure_eq!(elapsed >= 50, true);

    rt.shutdown();
    Ok(())
}

/// When a timer and a signal race, the waiter resumes exactly once: it
/// either consumed the signal or it timed out, never both, never neither.
#[test]
fn no_lost_wakeups_under_race() -> Result<()> {
    const ROUNDS: usize = 200;

    let rt: Runtime = Runtime::new(2)?;
    for round in 0..ROUNDS {
        let event: Event = Event::new();
        let (tx, rx): (Sender<bool>, Receiver<bool>) = unbounded();
        {
            let event: Event = event.clone();
            rt.spawn(async move {
                let woken: bool = event.timed_wait(2).await;
                tx.send(woken).expect("test channel cannot be closed");
            });
        }

        // Sweep the signal across the deadline window.
        thread::sleep(Duration::from_micros((round as u64 * 37) % 4000));
        event.signal();

        // Exactly one resumption, with one of the two outcomes.
        let _woken: bool = rx.recv_timeout(RECV_TIMEOUT)?;
        ::corio::ensure_eq!(rx.try_recv().is_err(), true);
    }
    rt.shutdown();
    Ok(())
}

/// Cooperative sleep suspends for at least the requested time without
/// blocking the worker.
#[test]
fn sleep_suspends_cooperatively() -> Result<()> {
    let rt: Runtime = Runtime::new(1)?;
    let (tx, rx): (Sender<&'static str>, Receiver<&'static str>) = unbounded();

    {
        let tx: Sender<&'static str> = tx.clone();
        rt.spawn(async move {
            runtime::sleep(100).await;
            tx.send("sleeper").expect("test channel cannot be closed");
        });
    }
    {
        let tx: Sender<&'static str> = tx.clone();
        rt.spawn(async move {
            tx.send("runner").expect("test channel cannot be closed");
        });
    }

    // The second coroutine runs while the first one sleeps.
    ::corio::ensure_eq!(rx.recv_timeout(RECV_TIMEOUT)?, "runner");
    ::corio::ensure_eq!(rx.recv_timeout(RECV_TIMEOUT)?, "sleeper");

    rt.shutdown();
    Ok(())
}
