// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! In-process message pair: two handles over a duplicated pair of channels.
//! The data channel carries the gathered payload; the acknowledgment channel
//! returns the received length, or an oversize sentinel that surfaces as
//! `MessageTooLong` on both sides without breaking the stream.

use crate::{
    chan::ChannelObject,
    fail::Fail,
    iol,
    runtime::{Deadline, Runtime},
    table::{Handle, MessageSocket, SocketObject},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{any::Any, rc::Rc};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Acknowledgment value for a message that did not fit the receive list.
const MSG_TOO_BIG: u64 = u64::MAX;

/// One endpoint of an in-process pair.
pub struct InprocSock {
    rt: Runtime,
    data: Handle,
    ack: Handle,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Creates a connected pair of in-process message sockets.
pub fn pair(rt: &Runtime) -> Result<(Handle, Handle), Fail> {
    let data1 = rt.chmake::<Bytes>(0);
    let data2 = rt.hdup(data1)?;
    let ack1 = rt.chmake::<u64>(0);
    let ack2 = rt.hdup(ack1)?;
    let a = rt.hmake(Rc::new(InprocSock {
        rt: rt.clone(),
        data: data1,
        ack: ack1,
    }));
    let b = rt.hmake(Rc::new(InprocSock {
        rt: rt.clone(),
        data: data2,
        ack: ack2,
    }));
    trace!("inproc::pair(): a={:?} b={:?}", a, b);
    Ok((a, b))
}

/// Associate functions for [InprocSock].
impl InprocSock {
    fn channel_done<T: 'static>(&self, h: Handle) {
        if let Ok(object) = self.rt.object(h) {
            if let Some(channel) = object.as_any().downcast_ref::<ChannelObject<T>>() {
                channel.done_now();
            }
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// SocketObject trait implementation for [InprocSock].
#[async_trait(?Send)]
impl SocketObject for InprocSock {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_message(&self) -> Option<&dyn MessageSocket> {
        Some(self)
    }

    async fn done(&self, _deadline: Deadline) -> Result<(), Fail> {
        self.channel_done::<Bytes>(self.data);
        Ok(())
    }

    fn close(&self) {
        // Closing the channel handles signals done on them first.
        let _ = self.rt.hclose(self.data);
        let _ = self.rt.hclose(self.ack);
    }
}

/// MessageSocket trait implementation for [InprocSock].
#[async_trait(?Send)]
impl MessageSocket for InprocSock {
    async fn msendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<(), Fail> {
        let len = iol::len(iol) as u64;
        let payload = Bytes::from(iol::gather(iol));
        self.rt.chsend(self.data, payload, deadline).await?;
        let confirmation: u64 = self.rt.chrecv(self.ack, deadline).await?;
        if confirmation == MSG_TOO_BIG {
            return Err(Fail::MessageTooLong {});
        }
        if confirmation != len {
            return Err(Fail::Protocol {
                details: "acknowledgment length mismatch",
            });
        }
        Ok(())
    }

    async fn mrecvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize, Fail> {
        let payload: Bytes = self.rt.chrecv(self.data, deadline).await?;
        if payload.len() > iol::len_mut(iol) {
            self.rt.chsend(self.ack, MSG_TOO_BIG, deadline).await?;
            return Err(Fail::MessageTooLong {});
        }
        iol::scatter(iol, &payload);
        self.rt
            .chsend(self.ack, payload.len() as u64, deadline)
            .await?;
        Ok(payload.len())
    }
}
