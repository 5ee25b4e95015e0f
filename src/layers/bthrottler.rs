// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Bytestream throttler: a token bucket per direction. The bucket holds
//! `throughput × interval / 1000` bytes and refills to full every
//! `interval`. A send drains as much as the bucket holds, sleeps until the
//! next refill, and repeats until the list is exhausted.

use crate::{
    fail::Fail,
    iol,
    runtime::{Deadline, Runtime},
    table::{Handle, SocketObject, StreamSocket},
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

struct Bucket {
    full: usize,
    remaining: Cell<usize>,
    interval: Duration,
    last: Cell<Instant>,
}

/// Byte throttling layer.
pub struct BthrottlerSock {
    rt: Runtime,
    s: Handle,
    send: Option<Bucket>,
    recv: Option<Bucket>,
}

//==============================================================================
// Associate Functions
//==============================================================================

fn bucket(rt: &Runtime, throughput: u64, interval: Duration) -> Result<Option<Bucket>, Fail> {
    if throughput == 0 {
        return Ok(None);
    }
    if interval.is_zero() {
        return Err(Fail::Invalid {
            details: "throttler interval must be positive",
        });
    }
    let full = (throughput as u128 * interval.as_millis() / 1000) as usize;
    Ok(Some(Bucket {
        full,
        remaining: Cell::new(full),
        interval,
        last: Cell::new(rt.now()),
    }))
}

/// Attaches the byte throttler atop a bytestream handle, consuming it.
/// A zero throughput disables throttling for that direction.
pub fn attach(
    rt: &Runtime,
    s: Handle,
    send_throughput: u64,
    send_interval: Duration,
    recv_throughput: u64,
    recv_interval: Duration,
) -> Result<Handle, Fail> {
    let send = bucket(rt, send_throughput, send_interval)?;
    let recv = bucket(rt, recv_throughput, recv_interval)?;
    let object = rt.object(s)?;
    if object.as_stream().is_none() {
        return Err(Fail::NotSupported {
            details: "bthrottler requires a bytestream socket",
        });
    }
    drop(object);
    let s = rt.take_private(s)?;
    Ok(rt.hmake(Rc::new(BthrottlerSock {
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
        .downcast_ref::<BthrottlerSock>()
        .ok_or(Fail::NotSupported {
            details: "not a bthrottler socket",
        })?;
    let underlying = rt.hdup(sock.s)?;
    drop(object);
    rt.hclose(h)?;
    Ok(underlying)
}

/// Associate functions for [Bucket].
impl Bucket {
    /// Waits for the next refill and renews the capacity.
    async fn refill(&self, rt: &Runtime) -> Result<(), Fail> {
        rt.msleep(Some(self.last.get() + self.interval)).await?;
        self.remaining.set(self.full);
        self.last.set(rt.now());
        Ok(())
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// SocketObject trait implementation for [BthrottlerSock].
#[async_trait(?Send)]
impl SocketObject for BthrottlerSock {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_stream(&self) -> Option<&dyn StreamSocket> {
        Some(self)
    }

    fn close(&self) {
        let _ = self.rt.hclose(self.s);
    }
}

/// StreamSocket trait implementation for [BthrottlerSock].
#[async_trait(?Send)]
impl StreamSocket for BthrottlerSock {
    async fn bsendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<(), Fail> {
        let bucket = match &self.send {
            Some(bucket) => bucket,
            None => return self.rt.bsendl(self.s, iol, deadline).await,
        };
        let mut bytes = iol::len(iol);
        if bytes == 0 {
            return Ok(());
        }
        let mut pos = 0;
        loop {
            let remaining = bucket.remaining.get();
            if remaining > 0 {
                let tosend = core::cmp::min(bytes, remaining);
                let window = iol::slice(iol, pos, tosend);
                self.rt.bsendl(self.s, &window, deadline).await?;
                bucket.remaining.set(remaining - tosend);
                pos += tosend;
                bytes -= tosend;
                if bytes == 0 {
                    return Ok(());
                }
            }
            bucket.refill(&self.rt).await?;
        }
    }

    async fn brecvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<(), Fail> {
        let bucket = match &self.recv {
            Some(bucket) => bucket,
            None => return self.rt.brecvl(self.s, iol, deadline).await,
        };
        let mut bytes = iol::len_mut(iol);
        if bytes == 0 {
            return Ok(());
        }
        let mut pos = 0;
        loop {
            let remaining = bucket.remaining.get();
            if remaining > 0 {
                let torecv = core::cmp::min(bytes, remaining);
                {
                    let mut window = iol::slice_mut(iol, pos, torecv);
                    self.rt.brecvl(self.s, &mut window, deadline).await?;
                }
                bucket.remaining.set(remaining - torecv);
                pos += torecv;
                bytes -= torecv;
                if bytes == 0 {
                    return Ok(());
                }
            }
            bucket.refill(&self.rt).await?;
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use crate::{
        fail::Fail,
        iol,
        runtime::{Deadline, Runtime},
        table::{SocketObject, StreamSocket},
    };
    use async_trait::async_trait;
    use std::{any::Any, cell::RefCell, rc::Rc, time::Duration, time::Instant};

    /// Bytestream double recording when and how much was written.
    struct MockStream {
        rt: Runtime,
        chunks: Rc<RefCell<Vec<(Instant, usize)>>>,
    }

    #[async_trait(?Send)]
    impl SocketObject for MockStream {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_stream(&self) -> Option<&dyn StreamSocket> {
            Some(self)
        }
    }

    #[async_trait(?Send)]
    impl StreamSocket for MockStream {
        async fn bsendl(&self, iol: &[&[u8]], _deadline: Deadline) -> Result<(), Fail> {
            self.chunks
                .borrow_mut()
                .push((self.rt.now(), iol::len(iol)));
            Ok(())
        }

        async fn brecvl(&self, _iol: &mut [&mut [u8]], _deadline: Deadline) -> Result<(), Fail> {
            Ok(())
        }
    }

    #[test]
    fn send_respects_the_token_bucket() {
        let rt = Runtime::with_virtual_clock();
        let chunks = Rc::new(RefCell::new(Vec::new()));
        let mock = Rc::new(MockStream {
            rt: rt.clone(),
            chunks: chunks.clone(),
        });
        let s = rt.hmake(mock);
        // 1000 B/s refreshed every 100 ms: 100-byte buckets.
        let throttled =
            super::attach(&rt, s, 1000, Duration::from_millis(100), 0, Duration::ZERO).unwrap();
        let rt2 = rt.clone();
        let elapsed = rt.run(async move {
            let start = rt2.now();
            rt2.bsend(throttled, &[0u8; 1000], None).await.unwrap();
            rt2.now() - start
        });
        // First bucket drains immediately; nine refills follow.
        assert_eq!(elapsed, Duration::from_millis(900));
        let chunks = chunks.borrow();
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|(_, len)| *len == 100));
    }

    #[test]
    fn zero_throughput_passes_through() {
        let rt = Runtime::with_virtual_clock();
        let chunks = Rc::new(RefCell::new(Vec::new()));
        let mock = Rc::new(MockStream {
            rt: rt.clone(),
            chunks: chunks.clone(),
        });
        let s = rt.hmake(mock);
        let throttled = super::attach(&rt, s, 0, Duration::ZERO, 0, Duration::ZERO).unwrap();
        let rt2 = rt.clone();
        let elapsed = rt.run(async move {
            let start = rt2.now();
            rt2.bsend(throttled, &[0u8; 4096], None).await.unwrap();
            rt2.now() - start
        });
        assert_eq!(elapsed, Duration::ZERO);
        assert_eq!(chunks.borrow().len(), 1);
    }
}
