// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Per-worker epoll reactor.
//!
//! Interest is edge-triggered: readiness is reported once per transition
//! and consumers must retry the syscall until it would block. Each fd has
//! at most one waiting coroutine per direction; a readiness report takes
//! the waiter out of the table and hands it to the ready-queue. The
//! worker's eventfd is registered here as well, so cross-thread hand-offs
//! can interrupt `epoll_wait`.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    pal::linux,
    runtime::{
        coroutine::CoroutineRef,
        fail::Fail,
    },
};
use ::std::{
    cell::RefCell,
    collections::HashMap,
    os::unix::prelude::RawFd,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Maximum number of events harvested per `epoll_wait` call.
const EPOLL_BATCH_SIZE: usize = 256;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Direction of I/O interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Registration state for one fd.
#[derive(Default)]
struct FdEntry {
    /// Currently armed epoll event mask (without `EPOLLET`).
    events: u32,
    /// Coroutine suspended until the fd becomes readable.
    reader: Option<CoroutineRef>,
    /// Coroutine suspended until the fd becomes writable.
    writer: Option<CoroutineRef>,
}

/// Edge-triggered epoll reactor owned by one worker.
pub struct Reactor {
    epoll_fd: RawFd,
    /// The owning worker's eventfd; registered with epoll, drained here.
    waker_fd: RawFd,
    /// fd -> registration mapping.
    table: RefCell<HashMap<RawFd, FdEntry>>,
    /// Reusable event buffer for `epoll_wait`.
    events: RefCell<Vec<libc::epoll_event>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Direction {
    fn to_epoll_events(self) -> u32 {
        match self {
            Direction::Read => libc::EPOLLIN as u32,
            Direction::Write => libc::EPOLLOUT as u32,
        }
    }
}

impl Reactor {
    /// Builds a reactor around a pre-created epoll instance and the owning
    /// worker's eventfd. The eventfd is registered level-triggered so a
    /// pending hand-off keeps interrupting `epoll_wait` until drained.
    pub fn new(epoll_fd: RawFd, waker_fd: RawFd) -> Result<Self, Fail> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: waker_fd as u64,
        };
        if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, waker_fd, &mut ev) } != 0 {
            let errno: i32 = linux::last_errno();
            let cause: String = format!("failed to register eventfd with epoll (errno={:?})", errno);
            error!("new(): {}", cause);
            return Err(Fail::new(errno, &cause));
        }
        Ok(Self {
            epoll_fd,
            waker_fd,
            table: RefCell::new(HashMap::new()),
            events: RefCell::new(vec![libc::epoll_event { events: 0, u64: 0 }; EPOLL_BATCH_SIZE]),
        })
    }

    /// Arms edge-triggered interest in one direction of an fd. A no-op if
    /// that direction is already armed.
    pub fn add_interest(&self, fd: RawFd, dir: Direction) -> Result<(), Fail> {
        let mut table = self.table.borrow_mut();
        let entry: &mut FdEntry = table.entry(fd).or_default();
        let bit: u32 = dir.to_epoll_events();
        if entry.events & bit != 0 {
            return Ok(());
        }

        let was_unarmed: bool = entry.events == 0;
        let armed: u32 = entry.events | bit;
        let op: i32 = if was_unarmed {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: armed | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) } != 0 {
            let errno: i32 = linux::last_errno();
            if was_unarmed {
                table.remove(&fd);
            }
            let cause: String = format!("failed to arm interest (fd={:?}, errno={:?})", fd, errno);
            error!("add_interest(): {}", cause);
            return Err(Fail::new(errno, &cause));
        }
        entry.events = armed;
        Ok(())
    }

    /// Disarms interest in one direction of an fd, dropping its waiter.
    /// Tolerates fds that were closed or never registered.
    pub fn del_interest(&self, fd: RawFd, dir: Direction) {
        let mut table = self.table.borrow_mut();
        let entry: &mut FdEntry = match table.get_mut(&fd) {
            Some(entry) => entry,
            None => return,
        };
        match dir {
            Direction::Read => entry.reader = None,
            Direction::Write => entry.writer = None,
        }
        let bit: u32 = dir.to_epoll_events();
        if entry.events & bit == 0 {
            return;
        }
        entry.events &= !bit;
        let remaining: u32 = entry.events;
        if remaining == 0 {
            table.remove(&fd);
            self.epoll_ctl_lenient(libc::EPOLL_CTL_DEL, fd, 0);
        } else {
            self.epoll_ctl_lenient(libc::EPOLL_CTL_MOD, fd, remaining | libc::EPOLLET as u32);
        }
    }

    /// Drops every registration of an fd. Called before the fd is closed
    /// so the reactor cannot fire on a reused descriptor.
    pub fn del_fd(&self, fd: RawFd) {
        if self.table.borrow_mut().remove(&fd).is_some() {
            self.epoll_ctl_lenient(libc::EPOLL_CTL_DEL, fd, 0);
        }
    }

    /// Parks a coroutine as the single waiter of (fd, direction),
    /// re-arming interest if close/shutdown removed it in the meantime.
    pub fn set_waiter(&self, fd: RawFd, dir: Direction, co: CoroutineRef) {
        if !self.table.borrow().contains_key(&fd) {
            if let Err(e) = self.add_interest(fd, dir) {
                warn!("set_waiter(): cannot re-arm interest (fd={:?}): {:?}", fd, e);
            }
        }
        let mut table = self.table.borrow_mut();
        let entry: &mut FdEntry = table.entry(fd).or_default();
        let slot: &mut Option<CoroutineRef> = match dir {
            Direction::Read => &mut entry.reader,
            Direction::Write => &mut entry.writer,
        };
        debug_assert!(slot.is_none(), "one waiter per direction per fd");
        *slot = Some(co);
    }

    /// Removes a parked waiter (after its deadline elapsed).
    pub fn clear_waiter(&self, fd: RawFd, dir: Direction) {
        if let Some(entry) = self.table.borrow_mut().get_mut(&fd) {
            match dir {
                Direction::Read => entry.reader = None,
                Direction::Write => entry.writer = None,
            }
        }
    }

    /// Runs one poll cycle, blocking up to `timeout_ms` (`-1` = forever).
    /// Waiters of ready fds are moved to the ready-queue; errors and
    /// hang-ups wake both directions so the retried syscall can report the
    /// actual failure.
    pub fn poll(&self, timeout_ms: i32) -> Result<(), Fail> {
        let nevents: usize = {
            let mut events = self.events.borrow_mut();
            let rc: i32 = unsafe {
                libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), EPOLL_BATCH_SIZE as i32, timeout_ms)
            };
            if rc < 0 {
                let errno: i32 = linux::last_errno();
                if errno == libc::EINTR {
                    return Ok(());
                }
                let cause: String = format!("epoll_wait failed (errno={:?})", errno);
                error!("poll(): {}", cause);
                return Err(Fail::new(errno, &cause));
            }
            rc as usize
        };

        let mut woken: Vec<CoroutineRef> = Vec::new();
        {
            let events = self.events.borrow();
            let mut table = self.table.borrow_mut();
            for ev in events[..nevents].iter() {
                let fd: RawFd = ev.u64 as RawFd;
                if fd == self.waker_fd {
                    self.drain_waker();
                    continue;
                }
                let entry: &mut FdEntry = match table.get_mut(&fd) {
                    Some(entry) => entry,
                    None => continue,
                };
                let hangup: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
                if ev.events & (libc::EPOLLIN as u32 | hangup) != 0 {
                    if let Some(co) = entry.reader.take() {
                        woken.push(co);
                    }
                }
                if ev.events & (libc::EPOLLOUT as u32 | hangup) != 0 {
                    if let Some(co) = entry.writer.take() {
                        woken.push(co);
                    }
                }
            }
        }

        // The table borrow is released before the hand-off: scheduling
        // pushes straight into this worker's ready-queue.
        for co in woken {
            if co.try_ready() {
                co.schedule();
            }
        }
        Ok(())
    }

    /// Resets the eventfd counter.
    fn drain_waker(&self) {
        let mut buf: u64 = 0;
        unsafe {
            libc::read(self.waker_fd, &mut buf as *mut u64 as *mut libc::c_void, 8);
        }
    }

    fn epoll_ctl_lenient(&self, op: i32, fd: RawFd, events: u32) {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) } != 0 {
            let errno: i32 = linux::last_errno();
            // ENOENT / EBADF are expected when the fd was already closed.
            if errno != libc::ENOENT && errno != libc::EBADF {
                warn!("epoll_ctl failed (op={:?}, fd={:?}, errno={:?})", op, fd, errno);
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Reactor {
    fn drop(&mut self) {
        // The eventfd is owned (and closed) by the worker handle.
        if unsafe { libc::close(self.epoll_fd) } != 0 {
            let errno: i32 = linux::last_errno();
            warn!("drop(): failed to close epoll fd (errno={:?})", errno);
        }
    }
}
