// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Bytestream tracer: a passthrough layer that logs a hex dump of every
//! send and receive, tagged with the layer's own handle id.

use crate::{
    fail::Fail,
    runtime::{Deadline, Runtime},
    table::{Handle, SocketObject, StreamSocket},
};
use async_trait::async_trait;
use std::{any::Any, cell::Cell, rc::Rc};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Tracing bytestream layer.
pub struct BtraceSock {
    rt: Runtime,
    s: Cell<Option<Handle>>,
    /// This layer's own handle, for the log tag.
    h: Cell<Handle>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Attaches the tracer atop a bytestream handle, consuming it.
pub fn attach(rt: &Runtime, s: Handle) -> Result<Handle, Fail> {
    let object = rt.object(s)?;
    if object.as_stream().is_none() {
        return Err(Fail::NotSupported {
            details: "btrace requires a bytestream socket",
        });
    }
    drop(object);
    let s = rt.take_private(s)?;
    let sock = Rc::new(BtraceSock {
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
        .downcast_ref::<BtraceSock>()
        .ok_or(Fail::NotSupported {
            details: "not a btrace socket",
        })?;
    let underlying = match sock.s.take() {
        Some(underlying) => underlying,
        None => return Err(Fail::BadHandle {}),
    };
    drop(object);
    rt.hclose(h)?;
    Ok(underlying)
}

pub(crate) fn hex_dump(iol: &[&[u8]]) -> String {
    let mut out = String::new();
    for seg in iol {
        for byte in *seg {
            out.push_str(&format!("{:02x}", byte));
        }
    }
    out
}

pub(crate) fn hex_dump_mut(iol: &[&mut [u8]]) -> String {
    let mut out = String::new();
    for seg in iol {
        for byte in seg.iter() {
            out.push_str(&format!("{:02x}", byte));
        }
    }
    out
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// SocketObject trait implementation for [BtraceSock].
#[async_trait(?Send)]
impl SocketObject for BtraceSock {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_stream(&self) -> Option<&dyn StreamSocket> {
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

/// StreamSocket trait implementation for [BtraceSock].
#[async_trait(?Send)]
impl StreamSocket for BtraceSock {
    async fn bsendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<(), Fail> {
        let s = self.s.get().ok_or(Fail::BadHandle {})?;
        debug!(
            "bsendl({}, 0x{}, {})",
            self.h.get(),
            hex_dump(iol),
            crate::iol::len(iol)
        );
        self.rt.bsendl(s, iol, deadline).await
    }

    async fn brecvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<(), Fail> {
        let s = self.s.get().ok_or(Fail::BadHandle {})?;
        self.rt.brecvl(s, iol, deadline).await?;
        debug!(
            "brecvl({}, 0x{}, {})",
            self.h.get(),
            hex_dump_mut(iol),
            crate::iol::len_mut(iol)
        );
        Ok(())
    }
}
