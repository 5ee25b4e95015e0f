// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Handle table and capability dispatch. Every socket-like object is named
//! by a small integer handle; handles are reference counted and the
//! object's destructor runs exactly once, when the last handle is closed.

use crate::{fail::Fail, runtime::Deadline};
use async_trait::async_trait;
use futures::task::noop_waker;
use slab::Slab;
use std::{
    any::Any,
    cell::{Cell, RefCell},
    future::Future,
    rc::Rc,
    task::Context,
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Handle. The sole public identity of sockets, channels and listeners.
pub type Handle = u32;

/// Bytestream capability: unframed, ordered, reliable octet stream.
/// `brecvl` fills the whole list.
#[async_trait(?Send)]
pub trait StreamSocket {
    async fn bsendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<(), Fail>;
    async fn brecvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<(), Fail>;
}

/// Message capability: framed, ordered, atomic per-message delivery.
/// `mrecvl` returns the size of the one message received.
#[async_trait(?Send)]
pub trait MessageSocket {
    async fn msendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<(), Fail>;
    async fn mrecvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize, Fail>;
}

/// Listener capability.
#[async_trait(?Send)]
pub trait Listener {
    async fn accept(&self, deadline: Deadline) -> Result<Handle, Fail>;
}

/// A socket object advertises at most one of the bytestream and message
/// capabilities, plus optional end-of-stream and teardown hooks. Concrete
/// types remain reachable through `as_any` for layer-specific queries.
#[async_trait(?Send)]
pub trait SocketObject: Any {
    fn as_any(&self) -> &dyn Any;

    /// Bytestream capability, if advertised.
    fn as_stream(&self) -> Option<&dyn StreamSocket> {
        None
    }

    /// Message capability, if advertised.
    fn as_message(&self) -> Option<&dyn MessageSocket> {
        None
    }

    /// Listener capability, if advertised.
    fn as_listener(&self) -> Option<&dyn Listener> {
        None
    }

    /// Signals end-of-stream to the peer.
    async fn done(&self, _deadline: Deadline) -> Result<(), Fail> {
        Err(Fail::NotSupported {
            details: "done not supported on this socket",
        })
    }

    /// Destructor hook; runs once, when the last handle is closed. In-flight
    /// operations have been canceled by then.
    fn close(&self) {}
}

struct Entry {
    object: Rc<dyn SocketObject>,
    /// Handles referring to this object; shared across duplicated entries.
    refs: Rc<Cell<u32>>,
}

struct Inner {
    table: Slab<Entry>,
}

/// Handle table. Slots may be reused after a close and a subsequent insert.
#[derive(Clone)]
pub struct HandleTable {
    inner: Rc<RefCell<Inner>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [HandleTable].
impl HandleTable {
    /// Creates an empty handle table.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner { table: Slab::new() })),
        }
    }

    /// Inserts an object, returning its first handle.
    pub fn insert(&self, object: Rc<dyn SocketObject>) -> Handle {
        let mut inner = self.inner.borrow_mut();
        let entry = Entry {
            object,
            refs: Rc::new(Cell::new(1)),
        };
        inner.table.insert(entry) as Handle
    }

    /// Gets the object associated with a handle.
    pub fn get(&self, h: Handle) -> Result<Rc<dyn SocketObject>, Fail> {
        let inner = self.inner.borrow();
        match inner.table.get(h as usize) {
            Some(entry) => Ok(entry.object.clone()),
            None => Err(Fail::BadHandle {}),
        }
    }

    /// Allocates a second handle referring to the same object.
    pub fn dup(&self, h: Handle) -> Result<Handle, Fail> {
        let mut inner = self.inner.borrow_mut();
        let entry = match inner.table.get(h as usize) {
            Some(entry) => Entry {
                object: entry.object.clone(),
                refs: entry.refs.clone(),
            },
            None => return Err(Fail::BadHandle {}),
        };
        entry.refs.set(entry.refs.get() + 1);
        Ok(inner.table.insert(entry) as Handle)
    }

    /// Releases a handle. Closing the last handle of an object signals
    /// end-of-stream to the peer, then runs the destructor.
    pub fn close(&self, h: Handle) -> Result<(), Fail> {
        let (object, last) = {
            let mut inner = self.inner.borrow_mut();
            if !inner.table.contains(h as usize) {
                return Err(Fail::BadHandle {});
            }
            let entry = inner.table.remove(h as usize);
            entry.refs.set(entry.refs.get() - 1);
            (entry.object, entry.refs.get() == 0)
        };
        // The signal and the destructor may close other handles; the table
        // borrow is released first.
        if last {
            // Teardown cannot suspend: a done that would block is abandoned
            // after one poll.
            let waker = noop_waker();
            let mut ctx = Context::from_waker(&waker);
            let mut done = object.done(None);
            let _ = done.as_mut().poll(&mut ctx);
            drop(done);
            object.close();
        }
        Ok(())
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Default trait implementation for [HandleTable].
impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
