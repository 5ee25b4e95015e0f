// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Message throttler: the per-message analog of the byte throttler. A quota
//! of messages per interval, refilled when empty.

use crate::{
    fail::Fail,
    runtime::{Deadline, Runtime},
    table::{Handle, MessageSocket, SocketObject},
};
use async_trait::async_trait;
use std::{
    any::Any,
    cell::Cell,
    rc::Rc,
    time::{Duration, Instant},
};

//==============================================================================
// Constants & Structures
//==============================================================================

struct Quota {
    full: usize,
    remaining: Cell<usize>,
    interval: Duration,
    last: Cell<Instant>,
}

/// Message throttling layer.
pub struct MthrottlerSock {
    rt: Runtime,
    s: Handle,
    send: Option<Quota>,
    recv: Option<Quota>,
}

//==============================================================================
// Associate Functions
//==============================================================================

fn quota(rt: &Runtime, throughput: u64, interval: Duration) -> Result<Option<Quota>, Fail> {
    if throughput == 0 {
        return Ok(None);
    }
    if interval.is_zero() {
        return Err(Fail::Invalid {
            details: "throttler interval must be positive",
        });
    }
    let full = (throughput as u128 * interval.as_millis() / 1000) as usize;
    Ok(Some(Quota {
        full,
        remaining: Cell::new(full),
        interval,
        last: Cell::new(rt.now()),
    }))
}

/// Attaches the message throttler atop a message handle, consuming it.
/// A zero throughput disables throttling for that direction.
pub fn attach(
    rt: &Runtime,
    s: Handle,
    send_throughput: u64,
    send_interval: Duration,
    recv_throughput: u64,
    recv_interval: Duration,
) -> Result<Handle, Fail> {
    let send = quota(rt, send_throughput, send_interval)?;
    let recv = quota(rt, recv_throughput, recv_interval)?;
    let object = rt.object(s)?;
    if object.as_message().is_none() {
        return Err(Fail::NotSupported {
            details: "mthrottler requires a message socket",
        });
    }
    drop(object);
    let s = rt.take_private(s)?;
    Ok(rt.hmake(Rc::new(MthrottlerSock {
        rt: rt.clone(),
        s,
        send,
        recv,
    })))
}

/// Detaches the throttler, returning the underlying handle.
pub fn detach(rt: &Runtime, h: Handle) -> Result<Handle, Fail> {
    let object = rt.object(h)?;
    let sock = object
        .as_any()
        .downcast_ref::<MthrottlerSock>()
        .ok_or(Fail::NotSupported {
            details: "not an mthrottler socket",
        })?;
    let underlying = rt.hdup(sock.s)?;
    drop(object);
    rt.hclose(h)?;
    Ok(underlying)
}

/// Associate functions for [Quota].
impl Quota {
    async fn charge(&self, rt: &Runtime) -> Result<(), Fail> {
        if self.remaining.get() == 0 {
            rt.msleep(Some(self.last.get() + self.interval)).await?;
            self.remaining.set(self.full);
            self.last.set(rt.now());
        }
        Ok(())
    }

    fn consume(&self) {
        self.remaining.set(self.remaining.get() - 1);
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// SocketObject trait implementation for [MthrottlerSock].
#[async_trait(?Send)]
impl SocketObject for MthrottlerSock {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_message(&self) -> Option<&dyn MessageSocket> {
        Some(self)
    }

    fn close(&self) {
        let _ = self.rt.hclose(self.s);
    }
}

/// MessageSocket trait implementation for [MthrottlerSock].
#[async_trait(?Send)]
impl MessageSocket for MthrottlerSock {
    async fn msendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<(), Fail> {
        if let Some(quota) = &self.send {
            quota.charge(&self.rt).await?;
            self.rt.msendl(self.s, iol, deadline).await?;
            quota.consume();
            Ok(())
        } else {
            self.rt.msendl(self.s, iol, deadline).await
        }
    }

    async fn mrecvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize, Fail> {
        if let Some(quota) = &self.recv {
            quota.charge(&self.rt).await?;
            let sz = self.rt.mrecvl(self.s, iol, deadline).await?;
            quota.consume();
            Ok(sz)
        } else {
            self.rt.mrecvl(self.s, iol, deadline).await
        }
    }
}
