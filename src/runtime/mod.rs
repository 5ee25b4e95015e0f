// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Cooperative single-threaded runtime. Exactly one coroutine runs at a
//! time; preemption happens only at suspension points (fd waits, timer
//! waits, channel operations, explicit yields). The runtime value owns the
//! scheduler, the timer, the poller and the handle table; independent
//! runtimes may coexist, one per thread.

mod poller;
mod scheduler;
mod timer;
mod waker;

pub use scheduler::TaskHandle;

use crate::{
    chan::ChannelObject,
    fail::Fail,
    table::{Handle, HandleTable, SocketObject},
};
use futures::{
    future::{self, Either},
    pin_mut,
    task::ArcWake,
};
use poller::Poller;
use scheduler::Scheduler;
use std::{
    future::Future,
    os::unix::io::RawFd,
    pin::Pin,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};
use timer::Timer;

//==============================================================================
// Constants & Structures
//==============================================================================

/// Absolute time at which a suspending call gives up with `Timedout`.
/// `None` means no deadline.
pub type Deadline = Option<Instant>;

/// Number of consecutive task resumes between polls for external events.
/// Keeps a tight loop of ready coroutines from starving fd and timer wakeups.
const SCHED_RESUME_LIMIT: usize = 103;

/// Wakeup flag for the future driven by [Runtime::run].
struct MainWaker {
    woken: AtomicBool,
}

#[derive(Clone)]
pub struct Runtime {
    scheduler: Scheduler,
    timer: Timer,
    poller: Poller,
    table: HandleTable,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Runtime].
impl Runtime {
    /// Creates a runtime over the monotonic clock.
    pub fn new() -> Self {
        Self::with_timer(Timer::monotonic())
    }

    /// Creates a runtime over a virtual clock that jumps to the next timer
    /// deadline whenever the runtime is idle. Timing-sensitive tests run on
    /// this clock.
    pub fn with_virtual_clock() -> Self {
        Self::with_timer(Timer::virtual_from(Instant::now()))
    }

    fn with_timer(timer: Timer) -> Self {
        Self {
            scheduler: Scheduler::new(),
            timer,
            poller: Poller::new(),
            table: HandleTable::new(),
        }
    }

    /// Reads the runtime clock.
    pub fn now(&self) -> Instant {
        self.timer.now()
    }

    /// Spawns a coroutine. Dropping the returned handle cancels it.
    pub fn spawn<F: Future<Output = ()> + 'static>(&self, future: F) -> TaskHandle {
        self.scheduler.spawn(future)
    }

    /// Drives `future` to completion, scheduling spawned coroutines and
    /// polling for fd readiness and timer expiry in between.
    pub fn run<F: Future>(&self, future: F) -> F::Output {
        let mut future = Box::pin(future);
        let main = Arc::new(MainWaker {
            woken: AtomicBool::new(true),
        });
        let waker = futures::task::waker(main.clone());
        let mut ctx = Context::from_waker(&waker);
        let mut resumes = 0;
        loop {
            if main.woken.swap(false, Ordering::SeqCst) {
                if let Poll::Ready(output) = future.as_mut().poll(&mut ctx) {
                    return output;
                }
            }
            // Drain the ready queue, FIFO.
            let mut progressed = false;
            while let Some(id) = self.scheduler.pop_ready() {
                self.scheduler.resume(id);
                progressed = true;
                resumes += 1;
                if resumes >= SCHED_RESUME_LIMIT {
                    resumes = 0;
                    self.poller.pump(Some(Duration::from_millis(0)));
                    self.timer.wake_expired();
                }
                if main.woken.load(Ordering::SeqCst) {
                    break;
                }
            }
            self.timer.wake_expired();
            if progressed || main.woken.load(Ordering::SeqCst) {
                continue;
            }
            // Idle: block on external events or advance the virtual clock.
            let next = self.timer.next_deadline();
            if self.timer.is_virtual() {
                if self.poller.has_waiters() {
                    self.poller.pump(Some(Duration::from_millis(1)));
                } else if let Some(t) = next {
                    self.timer.advance_to(t);
                } else {
                    // Nothing can make progress; mirror a blocked event loop.
                    std::thread::sleep(Duration::from_millis(1));
                }
            } else {
                let timeout = next.map(|t| t.saturating_duration_since(self.timer.now()));
                if self.poller.has_waiters() || timeout.is_some() {
                    self.poller.pump(timeout);
                } else {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            self.timer.wake_expired();
        }
    }

    /// Suspends the calling coroutine until the deadline passes. `None`
    /// sleeps forever (until canceled).
    pub async fn msleep(&self, deadline: Deadline) -> Result<(), Fail> {
        match deadline {
            None => future::pending().await,
            Some(t) => {
                self.timer.wait_until(t).await;
                Ok(())
            }
        }
    }

    /// Reschedules the calling coroutine behind the ready queue.
    pub async fn yield_now(&self) {
        YieldFuture { polled: false }.await
    }

    /// Races `operation` against the deadline. The operation is polled
    /// first, so an already-expired deadline still grants one attempt.
    pub(crate) async fn timeout<T, F>(&self, deadline: Deadline, operation: F) -> Result<T, Fail>
    where
        F: Future<Output = Result<T, Fail>>,
    {
        match deadline {
            None => operation.await,
            Some(t) => {
                let sleep = self.timer.wait_until(t);
                pin_mut!(operation);
                pin_mut!(sleep);
                match future::select(operation, sleep).await {
                    Either::Left((result, _)) => result,
                    Either::Right(((), _)) => Err(Fail::Timedout {}),
                }
            }
        }
    }

    /// Waits until `fd` is readable.
    pub(crate) async fn wait_in(&self, fd: RawFd, deadline: Deadline) -> Result<(), Fail> {
        let poller = self.poller.clone();
        self.timeout(deadline, async move {
            poller.wait_in(fd).await;
            Ok(())
        })
        .await
    }

    /// Waits until `fd` is writable.
    pub(crate) async fn wait_out(&self, fd: RawFd, deadline: Deadline) -> Result<(), Fail> {
        let poller = self.poller.clone();
        self.timeout(deadline, async move {
            poller.wait_out(fd).await;
            Ok(())
        })
        .await
    }

    //==========================================================================
    // Handle operations
    //==========================================================================

    /// Inserts a socket object into the handle table.
    pub fn hmake(&self, object: Rc<dyn SocketObject>) -> Handle {
        self.table.insert(object)
    }

    /// Looks an object up by handle.
    pub fn object(&self, h: Handle) -> Result<Rc<dyn SocketObject>, Fail> {
        self.table.get(h)
    }

    /// Creates a second handle referring to the same object.
    pub fn hdup(&self, h: Handle) -> Result<Handle, Fail> {
        self.table.dup(h)
    }

    /// Closes a handle; the destructor of the underlying object runs when
    /// its last handle is closed.
    pub fn hclose(&self, h: Handle) -> Result<(), Fail> {
        trace!("hclose(): h={:?}", h);
        self.table.close(h)
    }

    /// Signals end-of-stream to the peer; propagates down the layer stack.
    pub async fn hdone(&self, h: Handle, deadline: Deadline) -> Result<(), Fail> {
        let object = self.table.get(h)?;
        object.done(deadline).await
    }

    //==========================================================================
    // Bytestream operations
    //==========================================================================

    /// Sends bytes over a bytestream socket.
    pub async fn bsend(&self, h: Handle, buf: &[u8], deadline: Deadline) -> Result<(), Fail> {
        self.bsendl(h, &[buf], deadline).await
    }

    /// Scatter-gather variant of [bsend](Self::bsend).
    pub async fn bsendl(&self, h: Handle, iol: &[&[u8]], deadline: Deadline) -> Result<(), Fail> {
        let object = self.table.get(h)?;
        let stream = object.as_stream().ok_or(Fail::NotSupported {
            details: "not a bytestream socket",
        })?;
        stream.bsendl(iol, deadline).await
    }

    /// Receives exactly `buf.len()` bytes from a bytestream socket.
    pub async fn brecv(&self, h: Handle, buf: &mut [u8], deadline: Deadline) -> Result<(), Fail> {
        self.brecvl(h, &mut [buf], deadline).await
    }

    /// Scatter-gather variant of [brecv](Self::brecv): fills the whole list.
    pub async fn brecvl(
        &self,
        h: Handle,
        iol: &mut [&mut [u8]],
        deadline: Deadline,
    ) -> Result<(), Fail> {
        let object = self.table.get(h)?;
        let stream = object.as_stream().ok_or(Fail::NotSupported {
            details: "not a bytestream socket",
        })?;
        stream.brecvl(iol, deadline).await
    }

    //==========================================================================
    // Message operations
    //==========================================================================

    /// Sends one message over a message socket.
    pub async fn msend(&self, h: Handle, buf: &[u8], deadline: Deadline) -> Result<(), Fail> {
        self.msendl(h, &[buf], deadline).await
    }

    /// Scatter-gather variant of [msend](Self::msend).
    pub async fn msendl(&self, h: Handle, iol: &[&[u8]], deadline: Deadline) -> Result<(), Fail> {
        let object = self.table.get(h)?;
        let message = object.as_message().ok_or(Fail::NotSupported {
            details: "not a message socket",
        })?;
        message.msendl(iol, deadline).await
    }

    /// Receives one message; returns its size.
    pub async fn mrecv(
        &self,
        h: Handle,
        buf: &mut [u8],
        deadline: Deadline,
    ) -> Result<usize, Fail> {
        self.mrecvl(h, &mut [buf], deadline).await
    }

    /// Scatter-gather variant of [mrecv](Self::mrecv).
    pub async fn mrecvl(
        &self,
        h: Handle,
        iol: &mut [&mut [u8]],
        deadline: Deadline,
    ) -> Result<usize, Fail> {
        let object = self.table.get(h)?;
        let message = object.as_message().ok_or(Fail::NotSupported {
            details: "not a message socket",
        })?;
        message.mrecvl(iol, deadline).await
    }

    //==========================================================================
    // Channel operations
    //==========================================================================

    /// Creates a channel carrying items of type `T`. Capacity zero makes a
    /// rendezvous channel.
    pub fn chmake<T: 'static>(&self, capacity: usize) -> Handle {
        self.hmake(Rc::new(ChannelObject::<T>::new(capacity)))
    }

    /// Sends an item into a channel.
    pub async fn chsend<T: 'static>(
        &self,
        h: Handle,
        item: T,
        deadline: Deadline,
    ) -> Result<(), Fail> {
        let object = self.table.get(h)?;
        let channel = object
            .as_any()
            .downcast_ref::<ChannelObject<T>>()
            .ok_or(Fail::Invalid {
                details: "channel item type mismatch",
            })?;
        self.timeout(deadline, channel.send(item)).await
    }

    /// Receives an item from a channel.
    pub async fn chrecv<T: 'static>(&self, h: Handle, deadline: Deadline) -> Result<T, Fail> {
        let object = self.table.get(h)?;
        let channel = object
            .as_any()
            .downcast_ref::<ChannelObject<T>>()
            .ok_or(Fail::Invalid {
                details: "channel item type mismatch",
            })?;
        self.timeout(deadline, channel.recv()).await
    }

    /// Signals that no more items will be sent into the channel.
    pub async fn chdone(&self, h: Handle) -> Result<(), Fail> {
        self.hdone(h, None).await
    }

    /// Takes a private reference to a socket a layer is being stacked on:
    /// the caller's handle is consumed.
    pub(crate) fn take_private(&self, s: Handle) -> Result<Handle, Fail> {
        let owned = self.hdup(s)?;
        self.hclose(s)?;
        Ok(owned)
    }
}

//==============================================================================
// Helper Futures
//==============================================================================

struct YieldFuture {
    polled: bool,
}

/// Future trait implementation for [YieldFuture].
impl Future for YieldFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<()> {
        let self_ = self.get_mut();
        if self_.polled {
            Poll::Ready(())
        } else {
            self_.polled = true;
            ctx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Default trait implementation for [Runtime].
impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// ArcWake trait implementation for [MainWaker].
impl ArcWake for MainWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.woken.store(true, Ordering::SeqCst);
    }
}
