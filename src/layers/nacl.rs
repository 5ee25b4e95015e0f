// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! NaCl secretbox layer: symmetric authenticated encryption per message.
//! Frame layout is `nonce(24) ‖ ciphertext`, where the ciphertext carries
//! the authentication tag. The send nonce starts at a CSPRNG value and is
//! incremented as a little-endian 256-bit counter per message.

use crate::{
    fail::Fail,
    iol,
    runtime::{Deadline, Runtime},
    table::{Handle, MessageSocket, SocketObject},
};
use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use sodiumoxide::crypto::secretbox;
use std::{any::Any, cell::RefCell, rc::Rc};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Length of the key in bytes.
pub const KEY_SIZE: usize = secretbox::KEYBYTES;

/// NaCl message layer.
pub struct NaclSock {
    rt: Runtime,
    s: Handle,
    key: secretbox::Key,
    send_nonce: RefCell<[u8; secretbox::NONCEBYTES]>,
    /// Scratch buffers, grown on demand.
    txbuf: RefCell<Vec<u8>>,
    rxbuf: RefCell<Vec<u8>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Attaches the NaCl layer atop a message handle, consuming it.
pub fn attach(rt: &Runtime, s: Handle, key: &[u8]) -> Result<Handle, Fail> {
    let key = secretbox::Key::from_slice(key).ok_or(Fail::Invalid {
        details: "key must be 32 bytes",
    })?;
    let object = rt.object(s)?;
    if object.as_message().is_none() {
        return Err(Fail::NotSupported {
            details: "nacl requires a message socket",
        });
    }
    drop(object);
    sodiumoxide::init().map_err(|_| Fail::Invalid {
        details: "crypto library initialization",
    })?;
    let mut send_nonce = [0u8; secretbox::NONCEBYTES];
    OsRng.fill_bytes(&mut send_nonce);
    let s = rt.take_private(s)?;
    Ok(rt.hmake(Rc::new(NaclSock {
        rt: rt.clone(),
        s,
        key,
        send_nonce: RefCell::new(send_nonce),
        txbuf: RefCell::new(Vec::new()),
        rxbuf: RefCell::new(Vec::new()),
    })))
}

/// Detaches the NaCl layer, returning the underlying handle.
pub fn detach(rt: &Runtime, h: Handle) -> Result<Handle, Fail> {
    let object = rt.object(h)?;
    let sock = object
        .as_any()
        .downcast_ref::<NaclSock>()
        .ok_or(Fail::NotSupported {
            details: "not a nacl socket",
        })?;
    let underlying = rt.hdup(sock.s)?;
    drop(object);
    rt.hclose(h)?;
    Ok(underlying)
}

/// Increments a little-endian counter nonce, with carry.
fn bump_nonce(nonce: &mut [u8; secretbox::NONCEBYTES]) {
    for byte in nonce.iter_mut() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// SocketObject trait implementation for [NaclSock].
#[async_trait(?Send)]
impl SocketObject for NaclSock {
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

/// MessageSocket trait implementation for [NaclSock].
#[async_trait(?Send)]
impl MessageSocket for NaclSock {
    async fn msendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<(), Fail> {
        let mut txbuf = self.txbuf.try_borrow_mut().map_err(|_| Fail::Invalid {
            details: "concurrent send on one nacl socket",
        })?;
        let nonce = {
            let mut send_nonce = self.send_nonce.borrow_mut();
            bump_nonce(&mut send_nonce);
            *send_nonce
        };
        txbuf.clear();
        iol::gather_into(iol, &mut txbuf);
        let sealed = secretbox::seal(
            &txbuf,
            &secretbox::Nonce(nonce),
            &self.key,
        );
        // nonce ‖ ciphertext
        txbuf.clear();
        txbuf.extend_from_slice(&nonce);
        txbuf.extend_from_slice(&sealed);
        self.rt.msend(self.s, &txbuf, deadline).await
    }

    async fn mrecvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize, Fail> {
        let mut rxbuf = self.rxbuf.try_borrow_mut().map_err(|_| Fail::Invalid {
            details: "concurrent receive on one nacl socket",
        })?;
        let total = iol::len_mut(iol);
        let need = secretbox::NONCEBYTES + secretbox::MACBYTES + total;
        if rxbuf.len() < need {
            rxbuf.resize(need, 0);
        }
        let sz = {
            let limit = rxbuf.len().min(need);
            self.rt.mrecv(self.s, &mut rxbuf[..limit], deadline).await?
        };
        if sz < secretbox::NONCEBYTES + secretbox::MACBYTES {
            return Err(Fail::Protocol {
                details: "nacl frame too short",
            });
        }
        let nonce = secretbox::Nonce::from_slice(&rxbuf[..secretbox::NONCEBYTES]).ok_or(
            Fail::Protocol {
                details: "nacl nonce",
            },
        )?;
        let plaintext = secretbox::open(&rxbuf[secretbox::NONCEBYTES..sz], &nonce, &self.key)
            .map_err(|_| Fail::AccessDenied {})?;
        iol::scatter(iol, &plaintext);
        Ok(plaintext.len())
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use sodiumoxide::crypto::secretbox;

    #[test]
    fn nonce_increments_little_endian() {
        let mut nonce = [0u8; secretbox::NONCEBYTES];
        super::bump_nonce(&mut nonce);
        assert_eq!(nonce[0], 1);
        nonce[0] = 0xff;
        super::bump_nonce(&mut nonce);
        assert_eq!(nonce[0], 0);
        assert_eq!(nonce[1], 1);
    }
}
