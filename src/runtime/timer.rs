// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
    time::Instant,
};

//==============================================================================
// Constants & Structures
//==============================================================================

struct Inner {
    /// Current instant when running on the virtual clock; `None` means the
    /// monotonic system clock.
    virtual_now: Option<Instant>,
    entries: BTreeMap<(Instant, u64), Waker>,
    seq: u64,
}

/// Ordered map of absolute deadlines to wakers, over either the monotonic
/// clock or a virtual clock that the runtime advances when idle.
#[derive(Clone)]
pub struct Timer {
    inner: Rc<RefCell<Inner>>,
}

/// Future completing once the clock reaches `deadline`.
pub struct WaitFuture {
    timer: Timer,
    deadline: Instant,
    key: Option<(Instant, u64)>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Timer].
impl Timer {
    /// Creates a timer over the monotonic system clock.
    pub fn monotonic() -> Self {
        Self::new(None)
    }

    /// Creates a timer over a virtual clock starting at `now`.
    pub fn virtual_from(now: Instant) -> Self {
        Self::new(Some(now))
    }

    fn new(virtual_now: Option<Instant>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                virtual_now,
                entries: BTreeMap::new(),
                seq: 0,
            })),
        }
    }

    /// Reads the clock.
    pub fn now(&self) -> Instant {
        self.inner.borrow().virtual_now.unwrap_or_else(Instant::now)
    }

    /// Returns true when running on the virtual clock.
    pub fn is_virtual(&self) -> bool {
        self.inner.borrow().virtual_now.is_some()
    }

    /// Moves the virtual clock forward to `t`. The clock never goes back.
    pub fn advance_to(&self, t: Instant) {
        let mut inner = self.inner.borrow_mut();
        if let Some(now) = inner.virtual_now {
            if t > now {
                inner.virtual_now = Some(t);
            }
        }
    }

    /// Earliest registered deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.borrow().entries.keys().next().map(|(t, _)| *t)
    }

    /// Wakes every entry whose deadline has passed.
    pub fn wake_expired(&self) {
        let now = self.now();
        let mut expired = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            while let Some(&key) = inner.entries.keys().next() {
                if key.0 > now {
                    break;
                }
                if let Some(waker) = inner.entries.remove(&key) {
                    expired.push(waker);
                }
            }
        }
        for waker in expired {
            waker.wake();
        }
    }

    /// Returns a future that completes at `deadline`.
    pub fn wait_until(&self, deadline: Instant) -> WaitFuture {
        WaitFuture {
            timer: self.clone(),
            deadline,
            key: None,
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Future trait implementation for [WaitFuture].
impl Future for WaitFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<()> {
        let self_ = self.get_mut();
        if self_.timer.now() >= self_.deadline {
            if let Some(key) = self_.key.take() {
                self_.timer.inner.borrow_mut().entries.remove(&key);
            }
            return Poll::Ready(());
        }
        let mut inner = self_.timer.inner.borrow_mut();
        let key = match self_.key {
            Some(key) => key,
            None => {
                inner.seq += 1;
                let key = (self_.deadline, inner.seq);
                self_.key = Some(key);
                key
            }
        };
        inner.entries.insert(key, ctx.waker().clone());
        Poll::Pending
    }
}

/// Drop trait implementation for [WaitFuture].
impl Drop for WaitFuture {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.timer.inner.borrow_mut().entries.remove(&key);
        }
    }
}
