// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use nix::poll::{poll, PollFd, PollFlags};
use std::{
    cell::{Cell, RefCell},
    future::Future,
    os::unix::io::RawFd,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
    time::Duration,
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// One parked wait for fd readiness. Error conditions wake the waiter as
/// well; the subsequent system call reports the fault.
struct FdWait {
    fd: RawFd,
    write: bool,
    fired: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

struct Inner {
    waiters: Vec<Rc<FdWait>>,
}

/// Readiness registry over `poll(2)`: maps file descriptors to the set of
/// coroutines waiting on them.
#[derive(Clone)]
pub struct Poller {
    inner: Rc<RefCell<Inner>>,
}

/// Future completing once the awaited fd becomes ready.
pub struct FdFuture {
    poller: Poller,
    wait: Rc<FdWait>,
    registered: Cell<bool>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Poller].
impl Poller {
    /// Creates an empty poller.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                waiters: Vec::new(),
            })),
        }
    }

    /// Waits until `fd` is readable.
    pub fn wait_in(&self, fd: RawFd) -> FdFuture {
        self.wait(fd, false)
    }

    /// Waits until `fd` is writable.
    pub fn wait_out(&self, fd: RawFd) -> FdFuture {
        self.wait(fd, true)
    }

    fn wait(&self, fd: RawFd, write: bool) -> FdFuture {
        FdFuture {
            poller: self.clone(),
            wait: Rc::new(FdWait {
                fd,
                write,
                fired: Cell::new(false),
                waker: RefCell::new(None),
            }),
            registered: Cell::new(false),
        }
    }

    /// Returns true if any coroutine is parked on an fd.
    pub fn has_waiters(&self) -> bool {
        !self.inner.borrow().waiters.is_empty()
    }

    /// Polls all awaited fds once, waking the ready waiters. `None` blocks
    /// until an event arrives; `Some(d)` bounds the wait.
    pub fn pump(&self, timeout: Option<Duration>) {
        let mut fds: Vec<PollFd> = {
            let inner = self.inner.borrow();
            inner
                .waiters
                .iter()
                .map(|w| {
                    let flags = if w.write {
                        PollFlags::POLLOUT
                    } else {
                        PollFlags::POLLIN
                    };
                    PollFd::new(w.fd, flags)
                })
                .collect()
        };
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        };
        match poll(&mut fds, timeout_ms) {
            Ok(0) => return,
            Ok(_) => (),
            // EINTR: retry on the next pump.
            Err(_) => return,
        }
        let mut woken = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            let mut index = 0;
            inner.waiters.retain(|w| {
                let revents = fds[index].revents().unwrap_or_else(PollFlags::empty);
                index += 1;
                let wanted = if w.write {
                    PollFlags::POLLOUT
                } else {
                    PollFlags::POLLIN
                };
                let fault = PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL;
                if revents.intersects(wanted | fault) {
                    w.fired.set(true);
                    if let Some(waker) = w.waker.borrow_mut().take() {
                        woken.push(waker);
                    }
                    false
                } else {
                    true
                }
            });
        }
        for waker in woken {
            waker.wake();
        }
    }

    fn deregister(&self, wait: &Rc<FdWait>) {
        let mut inner = self.inner.borrow_mut();
        inner.waiters.retain(|w| !Rc::ptr_eq(w, wait));
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Default trait implementation for [Poller].
impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

/// Future trait implementation for [FdFuture].
impl Future for FdFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<()> {
        let self_ = self.get_mut();
        if self_.wait.fired.get() {
            return Poll::Ready(());
        }
        *self_.wait.waker.borrow_mut() = Some(ctx.waker().clone());
        if !self_.registered.get() {
            self_
                .poller
                .inner
                .borrow_mut()
                .waiters
                .push(self_.wait.clone());
            self_.registered.set(true);
        }
        Poll::Pending
    }
}

/// Drop trait implementation for [FdFuture].
impl Drop for FdFuture {
    fn drop(&mut self) {
        if self.registered.get() && !self.wait.fired.get() {
            self.poller.deregister(&self.wait);
        }
    }
}
