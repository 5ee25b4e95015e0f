// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Keep-alive layer. Every message at this level carries a one-byte prefix:
//! 'D' for user data, 'K' for a keep-alive ping. A worker coroutine emits
//! 'K' whenever `send_interval` passes without a user send. On the receive
//! side, silence longer than `recv_interval` latches the layer into a
//! sticky `ConnectionReset`; this is the only place a missed deadline
//! escalates into a connection error.

use crate::{
    fail::Fail,
    runtime::{Deadline, Runtime, TaskHandle},
    table::{Handle, MessageSocket, SocketObject},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    any::Any,
    cell::{Cell, RefCell},
    rc::Rc,
    time::{Duration, Instant},
};

//==============================================================================
// Constants & Structures
//==============================================================================

const DATA_PREFIX: u8 = b'D';
const PING_PREFIX: u8 = b'K';

/// Keep-alive message layer.
pub struct KeepaliveSock {
    rt: Runtime,
    s: Cell<Option<Handle>>,
    recv_interval: Option<Duration>,
    sendch: Option<Handle>,
    ackch: Option<Handle>,
    sender: RefCell<Option<TaskHandle>>,
    last_recv: Cell<Instant>,
    err: RefCell<Option<Fail>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Attaches the keep-alive layer atop a message handle, consuming it.
/// `None` disables the respective direction.
pub fn attach(
    rt: &Runtime,
    s: Handle,
    send_interval: Option<Duration>,
    recv_interval: Option<Duration>,
) -> Result<Handle, Fail> {
    let object = rt.object(s)?;
    if object.as_message().is_none() {
        return Err(Fail::NotSupported {
            details: "keepalive requires a message socket",
        });
    }
    drop(object);
    let s = rt.take_private(s)?;
    let (sendch, ackch, sender) = match send_interval {
        Some(interval) => {
            let sendch = rt.chmake::<Bytes>(0);
            let ackch = rt.chmake::<Result<(), Fail>>(0);
            let sender = rt.spawn(sender_loop(rt.clone(), s, interval, sendch, ackch));
            (Some(sendch), Some(ackch), Some(sender))
        }
        None => (None, None, None),
    };
    Ok(rt.hmake(Rc::new(KeepaliveSock {
        rt: rt.clone(),
        s: Cell::new(Some(s)),
        recv_interval,
        sendch,
        ackch,
        sender: RefCell::new(sender),
        last_recv: Cell::new(rt.now()),
        err: RefCell::new(None),
    })))
}

/// Detaches the keep-alive layer, returning the underlying handle.
pub fn detach(rt: &Runtime, h: Handle) -> Result<Handle, Fail> {
    let object = rt.object(h)?;
    let sock = object
        .as_any()
        .downcast_ref::<KeepaliveSock>()
        .ok_or(Fail::NotSupported {
            details: "not a keepalive socket",
        })?;
    let underlying = match sock.s.take() {
        Some(underlying) => underlying,
        None => return Err(Fail::BadHandle {}),
    };
    let kept = rt.hdup(underlying)?;
    sock.s.set(Some(underlying));
    drop(object);
    rt.hclose(h)?;
    Ok(kept)
}

/// Keep-alive sender coroutine: forwards user messages with the 'D' prefix
/// and fills silent gaps with 'K' pings.
async fn sender_loop(
    rt: Runtime,
    s: Handle,
    send_interval: Duration,
    sendch: Handle,
    ackch: Handle,
) {
    // Last time something was sent.
    let mut last = rt.now();
    loop {
        let payload = match rt.chrecv::<Bytes>(sendch, Some(last + send_interval)).await {
            Ok(payload) => payload,
            Err(Fail::Timedout {}) => {
                // Errors here are assumed temporary; a failed ping must not
                // break the layer.
                let _ = rt.msend(s, &[PING_PREFIX], None).await;
                last = rt.now();
                continue;
            }
            // The layer is shutting down.
            Err(_) => return,
        };
        let prefix = [DATA_PREFIX];
        let frame: [&[u8]; 2] = [&prefix, &payload];
        let result = rt.msendl(s, &frame, None).await;
        last = rt.now();
        let failed = result.is_err();
        if rt.chsend(ackch, result, None).await.is_err() {
            return;
        }
        if failed {
            return;
        }
    }
}

/// Associate functions for [KeepaliveSock].
impl KeepaliveSock {
    fn latch(&self, error: Fail) -> Fail {
        let mut err = self.err.borrow_mut();
        if err.is_none() {
            *err = Some(error.clone());
        }
        error
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// SocketObject trait implementation for [KeepaliveSock].
#[async_trait(?Send)]
impl SocketObject for KeepaliveSock {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_message(&self) -> Option<&dyn MessageSocket> {
        Some(self)
    }

    fn close(&self) {
        // Cancel the worker before tearing down its channels.
        self.sender.borrow_mut().take();
        if let Some(ackch) = self.ackch {
            let _ = self.rt.hclose(ackch);
        }
        if let Some(sendch) = self.sendch {
            let _ = self.rt.hclose(sendch);
        }
        if let Some(s) = self.s.take() {
            let _ = self.rt.hclose(s);
        }
    }
}

/// MessageSocket trait implementation for [KeepaliveSock].
#[async_trait(?Send)]
impl MessageSocket for KeepaliveSock {
    async fn msendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<(), Fail> {
        if let Some(error) = self.err.borrow().clone() {
            return Err(error);
        }
        let s = self.s.get().ok_or(Fail::BadHandle {})?;
        let (sendch, ackch) = match (self.sendch, self.ackch) {
            (Some(sendch), Some(ackch)) => (sendch, ackch),
            // Send-side keep-alives are off: frame and forward in place.
            _ => {
                let prefix = [DATA_PREFIX];
                let mut list: Vec<&[u8]> = Vec::with_capacity(iol.len() + 1);
                list.push(&prefix);
                list.extend_from_slice(iol);
                return self.rt.msendl(s, &list, deadline).await;
            }
        };
        // The send happens in the worker coroutine.
        let payload = Bytes::from(crate::iol::gather(iol));
        self.rt.chsend(sendch, payload, deadline).await?;
        // Wait till the worker is done.
        self.rt.chrecv::<Result<(), Fail>>(ackch, deadline).await?
    }

    async fn mrecvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize, Fail> {
        let s = self.s.get().ok_or(Fail::BadHandle {})?;
        if let Some(error) = self.err.borrow().clone() {
            return Err(error);
        }
        loop {
            // The keep-alive deadline only applies when it is tighter than
            // the caller's; with monitoring off only the caller's counts.
            let (effective, fail_on_deadline) = match self.recv_interval {
                Some(recv_interval) => {
                    let lapse = self.last_recv.get() + recv_interval;
                    match deadline {
                        Some(deadline) if deadline < lapse => (Some(deadline), false),
                        _ => (Some(lapse), true),
                    }
                }
                None => (deadline, false),
            };
            let mut prefix = [0u8; 1];
            let received = {
                let mut list = with_prefix(&mut prefix, iol);
                self.rt.mrecvl(s, &mut list, effective).await
            };
            let sz = match received {
                Ok(sz) => sz,
                Err(Fail::Timedout {}) if fail_on_deadline => {
                    return Err(self.latch(Fail::ConnectionReset {}))
                }
                Err(error) => return Err(error),
            };
            self.last_recv.set(self.rt.now());
            if sz == 0 {
                return Err(Fail::Protocol {
                    details: "keepalive frame without prefix",
                });
            }
            match prefix[0] {
                DATA_PREFIX => return Ok(sz - 1),
                // Transparently consume pings.
                PING_PREFIX => continue,
                _ => {
                    return Err(Fail::Protocol {
                        details: "keepalive unknown prefix",
                    })
                }
            }
        }
    }
}

/// Builds a receive list with a one-byte prefix slot in front.
fn with_prefix<'a>(prefix: &'a mut [u8; 1], iol: &'a mut [&mut [u8]]) -> Vec<&'a mut [u8]> {
    let mut list: Vec<&mut [u8]> = Vec::with_capacity(iol.len() + 1);
    list.push(&mut prefix[..]);
    for seg in iol.iter_mut() {
        list.push(&mut **seg);
    }
    list
}
