// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Message tracer: the message-capability analog of the bytestream tracer.

use crate::{
    fail::Fail,
    layers::btrace::{hex_dump, hex_dump_mut},
    runtime::{Deadline, Runtime},
    table::{Handle, MessageSocket, SocketObject},
};
use async_trait::async_trait;
use std::{any::Any, cell::Cell, rc::Rc};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Tracing message layer.
pub struct MtraceSock {
    rt: Runtime,
    s: Cell<Option<Handle>>,
    /// This layer's own handle, for the log tag.
    h: Cell<Handle>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Attaches the tracer atop a message handle, consuming it.
pub fn attach(rt: &Runtime, s: Handle) -> Result<Handle, Fail> {
    let object = rt.object(s)?;
    if object.as_message().is_none() {
        return Err(Fail::NotSupported {
            details: "mtrace requires a message socket",
        });
    }
    drop(object);
    let s = rt.take_private(s)?;
    let sock = Rc::new(MtraceSock {
        rt: rt.clone(),
        s: Cell::new(Some(s)),
        h: Cell::new(0),
    });
    let h = rt.hmake(sock.clone());
    sock.h.set(h);
    Ok(h)
}

/// Detaches the tracer, returning the underlying handle untouched: no
/// end-of-stream signal reaches it.
pub fn detach(rt: &Runtime, h: Handle) -> Result<Handle, Fail> {
    let object = rt.object(h)?;
    let sock = object
        .as_any()
        .downcast_ref::<MtraceSock>()
        .ok_or(Fail::NotSupported {
            details: "not an mtrace socket",
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

/// SocketObject trait implementation for [MtraceSock].
#[async_trait(?Send)]
impl SocketObject for MtraceSock {
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

/// MessageSocket trait implementation for [MtraceSock].
#[async_trait(?Send)]
impl MessageSocket for MtraceSock {
    async fn msendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<(), Fail> {
        let s = self.s.get().ok_or(Fail::BadHandle {})?;
        debug!(
            "msendl({}, 0x{}, {})",
            self.h.get(),
            hex_dump(iol),
            crate::iol::len(iol)
        );
        self.rt.msendl(s, iol, deadline).await
    }

    async fn mrecvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize, Fail> {
        let s = self.s.get().ok_or(Fail::BadHandle {})?;
        let sz = self.rt.mrecvl(s, iol, deadline).await?;
        debug!("mrecvl({}, 0x{}, {})", self.h.get(), hex_dump_mut(iol), sz);
        Ok(sz)
    }
}
