// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    future::Future,
    pin::Pin,
    task::{
        Context,
        Poll,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// The single suspension point of the runtime.
///
/// The first poll returns [`Poll::Pending`] and hands control back to the
/// worker's event loop; the caller must already have parked the running
/// coroutine (state set to `Wait`, handle stored in a wait-set, timer
/// armed, ...). The future completes on the next poll, which only happens
/// after the coroutine went through the ready-queue again.
struct Suspend {
    yielded: bool,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Suspends the running coroutine until it is re-enqueued on its home
/// worker's ready-queue.
pub(crate) async fn suspend() {
    Suspend { yielded: false }.await
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Future for Suspend {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _context: &mut Context) -> Poll<Self::Output> {
        let self_: &mut Self = self.get_mut();
        if !self_.yielded {
            self_.yielded = true;
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Suspend;
    use ::anyhow::Result;
    use ::futures::task::noop_waker_ref;
    use ::std::{
        future::Future,
        pin::Pin,
        task::{
            Context,
            Poll,
        },
    };

    #[test]
    fn suspend_completes_on_second_poll() -> Result<()> {
        let mut ctx: Context = Context::from_waker(noop_waker_ref());
        let mut suspend: Suspend = Suspend { yielded: false };

        crate::ensure_eq!(Future::poll(Pin::new(&mut suspend), &mut ctx), Poll::Pending);
        crate::ensure_eq!(Future::poll(Pin::new(&mut suspend), &mut ctx), Poll::Ready(()));
        Ok(())
    }
}
