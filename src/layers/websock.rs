// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! WebSocket framing (RFC 6455): single binary data frames on send,
//! continuation reassembly on recv. Clients mask with fresh CSPRNG bytes;
//! servers send in the clear and require masked input. Each direction
//! carries a one-shot error latch: once a framing error is observed, every
//! later call fails the same way until the layer is closed.

use crate::{
    fail::Fail,
    iol,
    runtime::{Deadline, Runtime},
    table::{Handle, MessageSocket, SocketObject},
};
use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use rand::{rngs::OsRng, RngCore};
use std::{any::Any, cell::RefCell, rc::Rc};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Scratch size for streaming the mask over large payloads.
const TXBUF_SIZE: usize = 2048;

const OP_CONTINUATION: u8 = 0;
const OP_TEXT: u8 = 1;
const OP_BINARY: u8 = 2;
const OP_CLOSE: u8 = 8;
const OP_PING: u8 = 9;
const OP_PONG: u8 = 10;

/// Side of the WebSocket conversation; decides the mask direction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    Client,
    Server,
}

/// WebSocket message layer over a bytestream.
pub struct WebsockSock {
    rt: Runtime,
    s: Handle,
    client: bool,
    txerr: RefCell<Option<Fail>>,
    rxerr: RefCell<Option<Fail>>,
    txbuf: RefCell<Vec<u8>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Attaches the WebSocket layer atop a bytestream handle, consuming it.
pub fn attach(rt: &Runtime, s: Handle, mode: Mode) -> Result<Handle, Fail> {
    let object = rt.object(s)?;
    if object.as_stream().is_none() {
        return Err(Fail::NotSupported {
            details: "websock requires a bytestream socket",
        });
    }
    drop(object);
    let s = rt.take_private(s)?;
    Ok(rt.hmake(Rc::new(WebsockSock {
        rt: rt.clone(),
        s,
        client: mode == Mode::Client,
        txerr: RefCell::new(None),
        rxerr: RefCell::new(None),
        txbuf: RefCell::new(Vec::with_capacity(TXBUF_SIZE)),
    })))
}

/// Graceful detach would require draining a close handshake; the protocol
/// layer does not implement it.
pub fn detach(_rt: &Runtime, _h: Handle) -> Result<Handle, Fail> {
    Err(Fail::NotSupported {
        details: "websock detach",
    })
}

/// Associate functions for [WebsockSock].
impl WebsockSock {
    fn latch_tx(&self, error: Fail) -> Fail {
        let mut txerr = self.txerr.borrow_mut();
        if txerr.is_none() {
            *txerr = Some(error.clone());
        }
        error
    }

    fn latch_rx(&self, error: Fail) -> Fail {
        let mut rxerr = self.rxerr.borrow_mut();
        if rxerr.is_none() {
            *rxerr = Some(error.clone());
        }
        error
    }

    /// Encodes the fixed header for a binary frame of `len` bytes. Returns
    /// the number of header bytes used.
    fn encode_header(buf: &mut [u8; 14], len: usize) -> usize {
        buf[0] = 0x80 | OP_BINARY;
        if len > 0xffff {
            buf[1] = 127;
            BigEndian::write_u64(&mut buf[2..10], len as u64);
            10
        } else if len > 125 {
            buf[1] = 126;
            BigEndian::write_u16(&mut buf[2..4], len as u16);
            4
        } else {
            buf[1] = len as u8;
            2
        }
    }

    async fn send_masked(&self, iol: &[&[u8]], mask: [u8; 4], deadline: Deadline) -> Result<(), Fail> {
        let mut txbuf = self.txbuf.try_borrow_mut().map_err(|_| Fail::Invalid {
            details: "concurrent send on one websock socket",
        })?;
        txbuf.clear();
        // Stream the payload through the scratch buffer so that masking
        // never allocates proportionally to the message.
        let mut phase = 0usize;
        for seg in iol {
            let mut off = 0;
            while off < seg.len() {
                let room = TXBUF_SIZE - txbuf.len();
                let take = core::cmp::min(room, seg.len() - off);
                txbuf.extend_from_slice(&seg[off..off + take]);
                off += take;
                if txbuf.len() == TXBUF_SIZE {
                    phase = self.flush_masked(&mut txbuf, mask, phase, deadline).await?;
                }
            }
        }
        if !txbuf.is_empty() {
            self.flush_masked(&mut txbuf, mask, phase, deadline).await?;
        }
        Ok(())
    }

    async fn flush_masked(
        &self,
        txbuf: &mut Vec<u8>,
        mask: [u8; 4],
        phase: usize,
        deadline: Deadline,
    ) -> Result<usize, Fail> {
        for (i, byte) in txbuf.iter_mut().enumerate() {
            *byte ^= mask[(phase + i) & 3];
        }
        let phase = phase + txbuf.len();
        self.rt
            .bsend(self.s, txbuf, deadline)
            .await
            .map_err(|e| self.latch_tx(e))?;
        txbuf.clear();
        Ok(phase)
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// SocketObject trait implementation for [WebsockSock].
#[async_trait(?Send)]
impl SocketObject for WebsockSock {
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

/// MessageSocket trait implementation for [WebsockSock].
#[async_trait(?Send)]
impl MessageSocket for WebsockSock {
    async fn msendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<(), Fail> {
        if let Some(error) = self.txerr.borrow().clone() {
            return Err(error);
        }
        let len = iol::len(iol);
        let mut hdr = [0u8; 14];
        let mut sz = Self::encode_header(&mut hdr, len);
        if !self.client {
            // Server sends unmasked: header and payload in one batch.
            let mut list: Vec<&[u8]> = Vec::with_capacity(iol.len() + 1);
            list.push(&hdr[..sz]);
            list.extend_from_slice(iol);
            return self
                .rt
                .bsendl(self.s, &list, deadline)
                .await
                .map_err(|e| self.latch_tx(e));
        }
        // Client sends masked.
        let mut mask = [0u8; 4];
        OsRng.fill_bytes(&mut mask);
        hdr[1] |= 0x80;
        hdr[sz..sz + 4].copy_from_slice(&mask);
        sz += 4;
        self.rt
            .bsend(self.s, &hdr[..sz], deadline)
            .await
            .map_err(|e| self.latch_tx(e))?;
        self.send_masked(iol, mask, deadline).await
    }

    async fn mrecvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize, Fail> {
        if let Some(error) = self.rxerr.borrow().clone() {
            return Err(error);
        }
        let total = iol::len_mut(iol);
        let mut pos = 0usize;
        loop {
            let mut hdr = [0u8; 2];
            self.rt
                .brecv(self.s, &mut hdr, deadline)
                .await
                .map_err(|e| self.latch_rx(e))?;
            if hdr[0] & 0x70 != 0 {
                return Err(self.latch_rx(Fail::Protocol {
                    details: "websock reserved bits set",
                }));
            }
            match hdr[0] & 0x0f {
                OP_CONTINUATION | OP_TEXT | OP_BINARY => (),
                OP_CLOSE => return Err(self.latch_rx(Fail::Pipe {})),
                OP_PING | OP_PONG => {
                    return Err(self.latch_rx(Fail::Protocol {
                        details: "websock control frame",
                    }))
                }
                _ => {
                    return Err(self.latch_rx(Fail::Protocol {
                        details: "websock unknown opcode",
                    }))
                }
            }
            // Clients expect unmasked frames, servers masked ones.
            let masked = hdr[1] & 0x80 != 0;
            if masked == self.client {
                return Err(self.latch_rx(Fail::Protocol {
                    details: "websock mask direction mismatch",
                }));
            }
            let mut sz = (hdr[1] & 0x7f) as u64;
            if sz == 126 {
                let mut ext = [0u8; 2];
                self.rt
                    .brecv(self.s, &mut ext, deadline)
                    .await
                    .map_err(|e| self.latch_rx(e))?;
                sz = BigEndian::read_u16(&ext) as u64;
            } else if sz == 127 {
                let mut ext = [0u8; 8];
                self.rt
                    .brecv(self.s, &mut ext, deadline)
                    .await
                    .map_err(|e| self.latch_rx(e))?;
                sz = BigEndian::read_u64(&ext);
            }
            let mut mask = [0u8; 4];
            if masked {
                self.rt
                    .brecv(self.s, &mut mask, deadline)
                    .await
                    .map_err(|e| self.latch_rx(e))?;
            }
            let sz = sz as usize;
            if pos + sz > total {
                return Err(self.latch_rx(Fail::MessageTooLong {}));
            }
            {
                let mut window = iol::slice_mut(iol, pos, sz);
                self.rt
                    .brecvl(self.s, &mut window, deadline)
                    .await
                    .map_err(|e| self.latch_rx(e))?;
                if masked {
                    let mut phase = 0usize;
                    for seg in window.iter_mut() {
                        for byte in seg.iter_mut() {
                            *byte ^= mask[phase & 3];
                            phase += 1;
                        }
                    }
                }
            }
            pos += sz;
            // FIN terminates the reassembly.
            if hdr[0] & 0x80 != 0 {
                break;
            }
        }
        Ok(pos)
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::WebsockSock;
    use byteorder::{BigEndian, ByteOrder};

    #[test]
    fn header_small_payload() {
        let mut hdr = [0u8; 14];
        let sz = WebsockSock::encode_header(&mut hdr, 5);
        assert_eq!(sz, 2);
        assert_eq!(hdr[0], 0x82);
        assert_eq!(hdr[1], 5);
    }

    #[test]
    fn header_medium_payload() {
        let mut hdr = [0u8; 14];
        let sz = WebsockSock::encode_header(&mut hdr, 300);
        assert_eq!(sz, 4);
        assert_eq!(hdr[1], 126);
        assert_eq!(BigEndian::read_u16(&hdr[2..4]), 300);
    }

    #[test]
    fn header_large_payload() {
        let mut hdr = [0u8; 14];
        let sz = WebsockSock::encode_header(&mut hdr, 0x1_0000);
        assert_eq!(sz, 10);
        assert_eq!(hdr[1], 127);
        assert_eq!(BigEndian::read_u64(&hdr[2..10]), 0x1_0000);
    }
}
