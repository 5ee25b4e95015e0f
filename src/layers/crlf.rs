// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! CRLF framing: a message layer over a bytestream where each message is
//! one line terminated by `\r\n`. A bare carriage return inside a line is
//! ordinary data. A line longer than the receive list fails with
//! `MessageTooLong`.

use crate::{
    fail::Fail,
    iol,
    runtime::{Deadline, Runtime},
    table::{Handle, MessageSocket, SocketObject},
};
use async_trait::async_trait;
use std::{any::Any, cell::Cell, rc::Rc};

//==============================================================================
// Constants & Structures
//==============================================================================

/// CRLF message layer.
pub struct CrlfSock {
    rt: Runtime,
    s: Cell<Option<Handle>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Attaches the CRLF layer atop a bytestream handle, consuming it.
pub fn attach(rt: &Runtime, s: Handle) -> Result<Handle, Fail> {
    let object = rt.object(s)?;
    if object.as_stream().is_none() {
        return Err(Fail::NotSupported {
            details: "crlf requires a bytestream socket",
        });
    }
    drop(object);
    let s = rt.take_private(s)?;
    Ok(rt.hmake(Rc::new(CrlfSock {
        rt: rt.clone(),
        s: Cell::new(Some(s)),
    })))
}

/// Detaches the CRLF layer, returning the underlying handle untouched: no
/// end-of-stream signal reaches it.
pub fn detach(rt: &Runtime, h: Handle) -> Result<Handle, Fail> {
    let object = rt.object(h)?;
    let sock = object
        .as_any()
        .downcast_ref::<CrlfSock>()
        .ok_or(Fail::NotSupported {
            details: "not a crlf socket",
        })?;
    let underlying = match sock.s.take() {
        Some(underlying) => underlying,
        None => return Err(Fail::BadHandle {}),
    };
    drop(object);
    rt.hclose(h)?;
    Ok(underlying)
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// SocketObject trait implementation for [CrlfSock].
#[async_trait(?Send)]
impl SocketObject for CrlfSock {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_message(&self) -> Option<&dyn MessageSocket> {
        Some(self)
    }

    async fn done(&self, deadline: Deadline) -> Result<(), Fail> {
        let s = self.s.get().ok_or(Fail::BadHandle {})?;
        self.rt.hdone(s, deadline).await
    }

    fn close(&self) {
        if let Some(s) = self.s.take() {
            let _ = self.rt.hclose(s);
        }
    }
}

/// MessageSocket trait implementation for [CrlfSock].
#[async_trait(?Send)]
impl MessageSocket for CrlfSock {
    async fn msendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<(), Fail> {
        let s = self.s.get().ok_or(Fail::BadHandle {})?;
        let mut list: Vec<&[u8]> = Vec::with_capacity(iol.len() + 1);
        list.extend_from_slice(iol);
        list.push(b"\r\n");
        self.rt.bsendl(s, &list, deadline).await
    }

    async fn mrecvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize, Fail> {
        let s = self.s.get().ok_or(Fail::BadHandle {})?;
        let total = iol::len_mut(iol);
        let mut pos = 0;
        let mut pending_cr = false;
        loop {
            let mut byte = [0u8; 1];
            self.rt.brecv(s, &mut byte, deadline).await?;
            if pending_cr {
                if byte[0] == b'\n' {
                    return Ok(pos);
                }
                // The carriage return was data after all.
                if pos >= total {
                    return Err(Fail::MessageTooLong {});
                }
                iol::scatter_at(iol, pos, b"\r");
                pos += 1;
                pending_cr = false;
            }
            if byte[0] == b'\r' {
                pending_cr = true;
                continue;
            }
            if pos >= total {
                return Err(Fail::MessageTooLong {});
            }
            iol::scatter_at(iol, pos, &byte);
            pos += 1;
        }
    }
}
