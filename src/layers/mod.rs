// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Protocol layers. Each layer wraps the handle of the socket below it,
//! translating operations while itself advertising the bytestream or message
//! capability. Attaching transfers ownership of the underlying handle to
//! the layer; detaching hands it back.

pub mod bthrottler;
pub mod btrace;
pub mod crlf;
pub mod http;
pub mod keepalive;
pub mod lz4;
pub mod mthrottler;
pub mod mtrace;
pub mod nacl;
pub mod nagle;
pub mod tls;
pub mod websock;
