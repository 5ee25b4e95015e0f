// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! LZ4 message layer: each message travels as one LZ4 frame with the
//! uncompressed size recorded in the frame header. A frame without the
//! content size is a protocol violation; a content size larger than the
//! receive list fails with `MessageTooLong` before any decompression.

use crate::{
    fail::Fail,
    iol,
    runtime::{Deadline, Runtime},
    table::{Handle, MessageSocket, SocketObject},
};
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use lz4_flex::frame::{FrameDecoder, FrameEncoder, FrameInfo};
use std::{any::Any, cell::RefCell, io::Read, io::Write, rc::Rc};

//==============================================================================
// Constants & Structures
//==============================================================================

const LZ4_MAGIC: u32 = 0x184D2204;
/// FLG bit: content size present.
const FLG_CONTENT_SIZE: u8 = 0x08;

/// LZ4 message layer.
pub struct Lz4Sock {
    rt: Runtime,
    s: Handle,
    /// Scratch for inbound compressed frames, grown on demand.
    rxbuf: RefCell<Vec<u8>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Attaches the LZ4 layer atop a message handle, consuming it.
pub fn attach(rt: &Runtime, s: Handle) -> Result<Handle, Fail> {
    let object = rt.object(s)?;
    if object.as_message().is_none() {
        return Err(Fail::NotSupported {
            details: "lz4 requires a message socket",
        });
    }
    drop(object);
    let s = rt.take_private(s)?;
    Ok(rt.hmake(Rc::new(Lz4Sock {
        rt: rt.clone(),
        s,
        rxbuf: RefCell::new(Vec::new()),
    })))
}

/// Detaches the LZ4 layer, returning the underlying handle.
pub fn detach(rt: &Runtime, h: Handle) -> Result<Handle, Fail> {
    let object = rt.object(h)?;
    let sock = object
        .as_any()
        .downcast_ref::<Lz4Sock>()
        .ok_or(Fail::NotSupported {
            details: "not an lz4 socket",
        })?;
    let underlying = rt.hdup(sock.s)?;
    drop(object);
    rt.hclose(h)?;
    Ok(underlying)
}

/// Reads the declared content size out of an LZ4 frame header.
fn content_size_of(frame: &[u8]) -> Result<u64, Fail> {
    if frame.len() < 6 || LittleEndian::read_u32(&frame[..4]) != LZ4_MAGIC {
        return Err(Fail::Protocol {
            details: "lz4 frame magic",
        });
    }
    let flg = frame[4];
    if flg >> 6 != 0b01 {
        return Err(Fail::Protocol {
            details: "lz4 frame version",
        });
    }
    // The content size is required by this protocol.
    if flg & FLG_CONTENT_SIZE == 0 {
        return Err(Fail::Protocol {
            details: "lz4 content size missing",
        });
    }
    if frame.len() < 14 {
        return Err(Fail::Protocol {
            details: "lz4 frame truncated",
        });
    }
    Ok(LittleEndian::read_u64(&frame[6..14]))
}

fn compress(payload: &[u8]) -> Result<Vec<u8>, Fail> {
    let info = FrameInfo::new().content_size(Some(payload.len() as u64));
    let mut encoder = FrameEncoder::with_frame_info(info, Vec::new());
    encoder.write_all(payload).map_err(|_| Fail::Protocol {
        details: "lz4 compression",
    })?;
    encoder.finish().map_err(|_| Fail::Protocol {
        details: "lz4 compression",
    })
}

fn decompress(frame: &[u8], expected: usize) -> Result<Vec<u8>, Fail> {
    let mut decoder = FrameDecoder::new(frame);
    let mut out = vec![0u8; expected];
    decoder.read_exact(&mut out).map_err(|_| Fail::Protocol {
        details: "lz4 decompression",
    })?;
    // The frame must not carry more than its header declared.
    let mut extra = [0u8; 1];
    match decoder.read(&mut extra) {
        Ok(0) => Ok(out),
        _ => Err(Fail::Protocol {
            details: "lz4 content size mismatch",
        }),
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// SocketObject trait implementation for [Lz4Sock].
#[async_trait(?Send)]
impl SocketObject for Lz4Sock {
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

/// MessageSocket trait implementation for [Lz4Sock].
#[async_trait(?Send)]
impl MessageSocket for Lz4Sock {
    async fn msendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<(), Fail> {
        let payload = iol::gather(iol);
        let frame = compress(&payload)?;
        self.rt.msend(self.s, &frame, deadline).await
    }

    async fn mrecvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize, Fail> {
        let mut rxbuf = self.rxbuf.try_borrow_mut().map_err(|_| Fail::Invalid {
            details: "concurrent receive on one lz4 socket",
        })?;
        let total = iol::len_mut(iol);
        // Worst-case compressed size for an incompressible message, plus
        // frame envelope.
        let bound = lz4_flex::block::get_maximum_output_size(total) + 32;
        if rxbuf.len() < bound {
            rxbuf.resize(bound, 0);
        }
        let sz = {
            let limit = rxbuf.len();
            self.rt.mrecv(self.s, &mut rxbuf[..limit], deadline).await?
        };
        // A missing content size is rejected here; zero is an empty message.
        let declared = content_size_of(&rxbuf[..sz])?;
        if declared > total as u64 {
            return Err(Fail::MessageTooLong {});
        }
        let payload = decompress(&rxbuf[..sz], declared as usize)?;
        iol::scatter(iol, &payload);
        Ok(payload.len())
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
