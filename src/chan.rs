// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Channels: the sole primitive for inter-coroutine rendezvous. A channel
//! with capacity zero pairs senders and receivers in arrival order; a
//! bounded channel buffers up to its capacity. Channels live in the handle
//! table and share handle duplication and close semantics with sockets.

use crate::{
    fail::Fail,
    runtime::Deadline,
    table::SocketObject,
};
use async_trait::async_trait;
use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::VecDeque,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

//==============================================================================
// Constants & Structures
//==============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum ChanState {
    Open,
    /// No more senders; buffered items drain, then receives fail with Pipe.
    Done,
    /// Last handle closed; parked operations fail with Canceled.
    Closed,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Pipe,
    Canceled,
}

struct SendWait<T> {
    item: RefCell<Option<T>>,
    outcome: Cell<Option<Outcome>>,
    waker: RefCell<Option<Waker>>,
}

struct RecvWait<T> {
    item: RefCell<Option<T>>,
    outcome: Cell<Option<Outcome>>,
    waker: RefCell<Option<Waker>>,
}

struct ChanInner<T> {
    capacity: usize,
    buf: VecDeque<T>,
    senders: VecDeque<Rc<SendWait<T>>>,
    receivers: VecDeque<Rc<RecvWait<T>>>,
    state: ChanState,
}

/// Channel carrying items of type `T`.
pub struct ChannelObject<T: 'static> {
    inner: Rc<RefCell<ChanInner<T>>>,
}

/// Future for a blocking channel send.
pub struct SendFuture<T: 'static> {
    chan: Rc<RefCell<ChanInner<T>>>,
    item: Option<T>,
    wait: Option<Rc<SendWait<T>>>,
}

/// Future for a blocking channel receive.
pub struct RecvFuture<T: 'static> {
    chan: Rc<RefCell<ChanInner<T>>>,
    wait: Option<Rc<RecvWait<T>>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

fn wake(waker: &RefCell<Option<Waker>>) {
    if let Some(waker) = waker.borrow_mut().take() {
        waker.wake();
    }
}

/// Associate functions for [ChannelObject].
impl<T: 'static> ChannelObject<T> {
    /// Creates a channel. Capacity zero makes a rendezvous channel.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ChanInner {
                capacity,
                buf: VecDeque::new(),
                senders: VecDeque::new(),
                receivers: VecDeque::new(),
                state: ChanState::Open,
            })),
        }
    }

    /// Sends one item, blocking until a receiver takes it or buffer space
    /// frees up.
    pub fn send(&self, item: T) -> SendFuture<T> {
        SendFuture {
            chan: self.inner.clone(),
            item: Some(item),
            wait: None,
        }
    }

    /// Receives one item, blocking until one is available.
    pub fn recv(&self) -> RecvFuture<T> {
        RecvFuture {
            chan: self.inner.clone(),
            wait: None,
        }
    }

    /// Signals that no more items will be sent. Buffered items remain
    /// receivable; parked operations fail with Pipe.
    pub fn done_now(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.state != ChanState::Open {
            return;
        }
        inner.state = ChanState::Done;
        for sender in inner.senders.drain(..) {
            sender.outcome.set(Some(Outcome::Pipe));
            wake(&sender.waker);
        }
        for receiver in inner.receivers.drain(..) {
            receiver.outcome.set(Some(Outcome::Pipe));
            wake(&receiver.waker);
        }
    }

    fn close_now(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.state = ChanState::Closed;
        inner.buf.clear();
        for sender in inner.senders.drain(..) {
            sender.outcome.set(Some(Outcome::Canceled));
            wake(&sender.waker);
        }
        for receiver in inner.receivers.drain(..) {
            receiver.outcome.set(Some(Outcome::Canceled));
            wake(&receiver.waker);
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// SocketObject trait implementation for [ChannelObject].
#[async_trait(?Send)]
impl<T: 'static> SocketObject for ChannelObject<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn done(&self, _deadline: Deadline) -> Result<(), Fail> {
        self.done_now();
        Ok(())
    }

    fn close(&self) {
        self.close_now();
    }
}

/// Future trait implementation for [SendFuture].
impl<T: 'static> Future for SendFuture<T> {
    type Output = Result<(), Fail>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
        // SAFETY: SendFuture never relies on pinning guarantees (no
        // self-referential data); T is moved freely via `Option::take`.
        let self_ = unsafe { self.get_unchecked_mut() };
        if let Some(wait) = &self_.wait {
            return match wait.outcome.get() {
                Some(Outcome::Delivered) => Poll::Ready(Ok(())),
                Some(Outcome::Pipe) => Poll::Ready(Err(Fail::Pipe {})),
                Some(Outcome::Canceled) => Poll::Ready(Err(Fail::Canceled {})),
                None => {
                    *wait.waker.borrow_mut() = Some(ctx.waker().clone());
                    Poll::Pending
                }
            };
        }
        let chan = self_.chan.clone();
        let mut inner = chan.borrow_mut();
        match inner.state {
            ChanState::Open => (),
            ChanState::Done => return Poll::Ready(Err(Fail::Pipe {})),
            ChanState::Closed => return Poll::Ready(Err(Fail::Canceled {})),
        }
        if let Some(receiver) = inner.receivers.pop_front() {
            *receiver.item.borrow_mut() = self_.item.take();
            receiver.outcome.set(Some(Outcome::Delivered));
            wake(&receiver.waker);
            return Poll::Ready(Ok(()));
        }
        if inner.buf.len() < inner.capacity {
            if let Some(item) = self_.item.take() {
                inner.buf.push_back(item);
            }
            return Poll::Ready(Ok(()));
        }
        let wait = Rc::new(SendWait {
            item: RefCell::new(self_.item.take()),
            outcome: Cell::new(None),
            waker: RefCell::new(Some(ctx.waker().clone())),
        });
        inner.senders.push_back(wait.clone());
        self_.wait = Some(wait);
        Poll::Pending
    }
}

/// Drop trait implementation for [SendFuture].
impl<T: 'static> Drop for SendFuture<T> {
    fn drop(&mut self) {
        if let Some(wait) = self.wait.take() {
            if wait.outcome.get().is_none() {
                let mut inner = self.chan.borrow_mut();
                inner.senders.retain(|s| !Rc::ptr_eq(s, &wait));
            }
        }
    }
}

/// Future trait implementation for [RecvFuture].
impl<T: 'static> Future for RecvFuture<T> {
    type Output = Result<T, Fail>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
        let self_ = self.get_mut();
        if let Some(wait) = &self_.wait {
            return match wait.outcome.get() {
                Some(Outcome::Delivered) => match wait.item.borrow_mut().take() {
                    Some(item) => Poll::Ready(Ok(item)),
                    None => unreachable!(),
                },
                Some(Outcome::Pipe) => Poll::Ready(Err(Fail::Pipe {})),
                Some(Outcome::Canceled) => Poll::Ready(Err(Fail::Canceled {})),
                None => {
                    *wait.waker.borrow_mut() = Some(ctx.waker().clone());
                    Poll::Pending
                }
            };
        }
        let chan = self_.chan.clone();
        let mut inner = chan.borrow_mut();
        if let Some(item) = inner.buf.pop_front() {
            // Keep FIFO order: refill the freed slot from a parked sender.
            if let Some(sender) = inner.senders.pop_front() {
                if let Some(queued) = sender.item.borrow_mut().take() {
                    inner.buf.push_back(queued);
                }
                sender.outcome.set(Some(Outcome::Delivered));
                wake(&sender.waker);
            }
            return Poll::Ready(Ok(item));
        }
        if let Some(sender) = inner.senders.pop_front() {
            let item = sender.item.borrow_mut().take();
            sender.outcome.set(Some(Outcome::Delivered));
            wake(&sender.waker);
            return match item {
                Some(item) => Poll::Ready(Ok(item)),
                None => unreachable!(),
            };
        }
        match inner.state {
            ChanState::Open => (),
            ChanState::Done => return Poll::Ready(Err(Fail::Pipe {})),
            ChanState::Closed => return Poll::Ready(Err(Fail::Canceled {})),
        }
        let wait = Rc::new(RecvWait {
            item: RefCell::new(None),
            outcome: Cell::new(None),
            waker: RefCell::new(Some(ctx.waker().clone())),
        });
        inner.receivers.push_back(wait.clone());
        self_.wait = Some(wait);
        Poll::Pending
    }
}

/// Drop trait implementation for [RecvFuture].
impl<T: 'static> Drop for RecvFuture<T> {
    fn drop(&mut self) {
        if let Some(wait) = self.wait.take() {
            if wait.outcome.get().is_none() {
                let mut inner = self.chan.borrow_mut();
                inner.receivers.retain(|r| !Rc::ptr_eq(r, &wait));
            }
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
