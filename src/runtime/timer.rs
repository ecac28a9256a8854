// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::coroutine::CoroutineRef;
use ::core::cmp::Reverse;
use ::std::{
    collections::BinaryHeap,
    time::Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A pending deadline owned by a suspended coroutine.
pub struct TimerEntry {
    pub expiry: Instant,
    pub co: CoroutineRef,
    /// Epoch of the coroutine when the timer was armed. The entry is stale
    /// (and must be ignored) if the coroutine resumed in the meantime.
    pub epoch: u64,
}

/// Per-worker timer heap, keyed by deadline. There is no explicit
/// cancellation: stale entries simply fail the epoch check when they pop.
pub struct TimerHeap {
    // Use a reverse to get a min heap.
    heap: BinaryHeap<Reverse<TimerEntry>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, expiry: Instant, co: CoroutineRef, epoch: u64) {
        self.heap.push(Reverse(TimerEntry { expiry, co, epoch }));
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.expiry)
    }

    /// Pops every entry whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut due: Vec<TimerEntry> = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if now < entry.expiry {
                break;
            }
            let entry: TimerEntry = self
                .heap
                .pop()
                .expect("should have an entry because we were able to peek")
                .0;
            due.push(entry);
        }
        due
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl PartialEq for TimerEntry {
    fn eq(&self, other: &TimerEntry) -> bool {
        // Entries are only ever compared by expiration time.
        self.expiry == other.expiry
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<core::cmp::Ordering> {
        self.expiry.partial_cmp(&other.expiry)
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &TimerEntry) -> core::cmp::Ordering {
        self.expiry.cmp(&other.expiry)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::TimerHeap;
    use crate::runtime::{
        coroutine::Coroutine,
        scheduler::WorkerShared,
    };
    use ::anyhow::Result;
    use ::std::{
        sync::Arc,
        time::{
            Duration,
            Instant,
        },
    };

    #[test]
    fn expire_pops_in_deadline_order() -> Result<()> {
        let worker: Arc<WorkerShared> = WorkerShared::new_for_test(0)?;
        let now: Instant = Instant::now();
        let mut heap: TimerHeap = TimerHeap::new();

        let co_late = Arc::new(Coroutine::new(worker.clone()));
        let co_early = Arc::new(Coroutine::new(worker));
        heap.push(now + Duration::from_millis(20), co_late.clone(), 0);
        heap.push(now + Duration::from_millis(10), co_early.clone(), 0);

        crate::ensure_eq!(heap.next_deadline(), Some(now + Duration::from_millis(10)));

        // Nothing is due yet.
        crate::ensure_eq!(heap.expire(now).len(), 0);

        // The earlier deadline pops first.
        let due = heap.expire(now + Duration::from_millis(15));
        crate::ensure_eq!(due.len(), 1);
        crate::ensure_eq!(due[0].co.id(), co_early.id());

        let due = heap.expire(now + Duration::from_millis(25));
        crate::ensure_eq!(due.len(), 1);
        crate::ensure_eq!(due[0].co.id(), co_late.id());
        Ok(())
    }
}
