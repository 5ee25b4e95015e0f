// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Composable protocol layers over a cooperative socket runtime. Transports
//! (TCP, UDP, in-process pairs) and layers (TLS, WebSocket, NaCl, LZ4,
//! throttlers, batching, keep-alives, HTTP line framing, tracing) all live
//! behind small integer handles and speak one of two capability tables:
//! bytestream or message. A single-threaded cooperative scheduler with
//! deadlines and cancellation underpins everything.

#[macro_use]
extern crate log;

mod chan;
mod fail;
mod fd;
mod runtime;
mod table;

pub mod iol;
pub mod layers;
pub mod transport;
pub mod uri;

pub use crate::{
    chan::ChannelObject,
    fail::Fail,
    runtime::{Deadline, Runtime, TaskHandle},
    table::{Handle, Listener, MessageSocket, SocketObject, StreamSocket},
};
