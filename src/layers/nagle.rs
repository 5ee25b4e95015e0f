// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Nagle batching layer: small sends accumulate in a buffer until it holds
//! `batch` bytes or `interval` elapses, whichever comes first. The buffering
//! runs in a worker coroutine fed through a (work, ack) channel pair; sends
//! at least `batch` bytes long bypass the buffer. Receives forward directly.

use crate::{
    fail::Fail,
    iol,
    runtime::{Deadline, Runtime, TaskHandle},
    table::{Handle, SocketObject, StreamSocket},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{any::Any, cell::Cell, cell::RefCell, rc::Rc, time::Duration};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Work item for the batching coroutine.
enum Work {
    Data(Bytes),
    Flush,
}

/// Nagle batching layer.
pub struct NagleSock {
    rt: Runtime,
    s: Cell<Option<Handle>>,
    sendch: Handle,
    ackch: Handle,
    sender: RefCell<Option<TaskHandle>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Attaches the batching layer atop a bytestream handle, consuming it.
/// `interval == None` batches on size alone.
pub fn attach(
    rt: &Runtime,
    s: Handle,
    batch: usize,
    interval: Option<Duration>,
) -> Result<Handle, Fail> {
    if batch == 0 {
        return Err(Fail::Invalid {
            details: "batch size must be positive",
        });
    }
    let object = rt.object(s)?;
    if object.as_stream().is_none() {
        return Err(Fail::NotSupported {
            details: "nagle requires a bytestream socket",
        });
    }
    drop(object);
    let s = rt.take_private(s)?;
    let sendch = rt.chmake::<Work>(0);
    let ackch = rt.chmake::<Result<(), Fail>>(0);
    let sender = rt.spawn(sender_loop(rt.clone(), s, batch, interval, sendch, ackch));
    Ok(rt.hmake(Rc::new(NagleSock {
        rt: rt.clone(),
        s: Cell::new(Some(s)),
        sendch,
        ackch,
        sender: RefCell::new(Some(sender)),
    })))
}

/// Detaches the batching layer, flushing any buffered bytes to the
/// underlying socket before handing it back.
pub async fn detach(rt: &Runtime, h: Handle, deadline: Deadline) -> Result<Handle, Fail> {
    let object = rt.object(h)?;
    let sock = object
        .as_any()
        .downcast_ref::<NagleSock>()
        .ok_or(Fail::NotSupported {
            details: "not a nagle socket",
        })?;
    rt.chsend(sock.sendch, Work::Flush, deadline).await?;
    rt.chrecv::<Result<(), Fail>>(sock.ackch, deadline).await??;
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

/// Batching coroutine. Lives until the layer is closed or the underlying
/// socket fails; a failure is reported through the ack channel and ends the
/// worker.
async fn sender_loop(
    rt: Runtime,
    s: Handle,
    batch: usize,
    interval: Option<Duration>,
    sendch: Handle,
    ackch: Handle,
) {
    let mut buf: Vec<u8> = Vec::with_capacity(batch);
    let mut last = rt.now();
    loop {
        let deadline = match interval {
            Some(interval) if !buf.is_empty() => Some(last + interval),
            _ => None,
        };
        let work = match rt.chrecv::<Work>(sendch, deadline).await {
            Ok(work) => work,
            Err(Fail::Timedout {}) => {
                // Interval expired: flush the buffer.
                if rt.bsend(s, &buf, None).await.is_err() {
                    return;
                }
                buf.clear();
                last = rt.now();
                continue;
            }
            // The layer is shutting down.
            Err(_) => return,
        };
        let ack = match work {
            Work::Data(data) => {
                if buf.len() + data.len() < batch {
                    buf.extend_from_slice(&data);
                    Ok(())
                } else {
                    let mut result = Ok(());
                    if !buf.is_empty() {
                        result = rt.bsend(s, &buf, None).await;
                        buf.clear();
                        last = rt.now();
                    }
                    if result.is_ok() {
                        if data.len() < batch {
                            buf.extend_from_slice(&data);
                        } else {
                            // Big chunk: no point batching it.
                            result = rt.bsend(s, &data, None).await;
                            last = rt.now();
                        }
                    }
                    result
                }
            }
            Work::Flush => {
                let result = if buf.is_empty() {
                    Ok(())
                } else {
                    rt.bsend(s, &buf, None).await
                };
                buf.clear();
                last = rt.now();
                result
            }
        };
        let failed = ack.is_err();
        if rt.chsend(ackch, ack, None).await.is_err() {
            return;
        }
        if failed {
            return;
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// SocketObject trait implementation for [NagleSock].
#[async_trait(?Send)]
impl SocketObject for NagleSock {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_stream(&self) -> Option<&dyn StreamSocket> {
        Some(self)
    }

    fn close(&self) {
        // Cancel the worker before tearing down its channels.
        self.sender.borrow_mut().take();
        let _ = self.rt.hclose(self.ackch);
        let _ = self.rt.hclose(self.sendch);
        if let Some(s) = self.s.take() {
            let _ = self.rt.hclose(s);
        }
    }
}

/// StreamSocket trait implementation for [NagleSock].
#[async_trait(?Send)]
impl StreamSocket for NagleSock {
    async fn bsendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<(), Fail> {
        // The send happens in the worker coroutine.
        let payload = Bytes::from(iol::gather(iol));
        self.rt
            .chsend(self.sendch, Work::Data(payload), deadline)
            .await?;
        // Wait till the worker is done.
        self.rt
            .chrecv::<Result<(), Fail>>(self.ackch, deadline)
            .await?
    }

    async fn brecvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<(), Fail> {
        let s = self.s.get().ok_or(Fail::BadHandle {})?;
        self.rt.brecvl(s, iol, deadline).await
    }
}
