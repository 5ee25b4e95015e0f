// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! UDP transport: one datagram per message. A remote address given at open
//! time is sticky; sends without an explicit destination fall back to it.
//! A send into a full kernel buffer succeeds silently, matching kernel
//! semantics for dropped datagrams.

use crate::{
    fail::Fail,
    fd,
    runtime::{Deadline, Runtime},
    table::{Handle, MessageSocket, SocketObject},
};
use async_trait::async_trait;
use nix::{
    errno::Errno,
    sys::socket::{self, AddressFamily, InetAddr, MsgFlags, SockAddr, SockFlag, SockType},
    sys::uio::IoVec,
    Error,
};
use std::{any::Any, net::SocketAddr, os::unix::io::RawFd, rc::Rc};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Open UDP socket.
pub struct UdpSocket {
    rt: Runtime,
    fd: RawFd,
    remote: Option<SocketAddr>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Opens a UDP socket. `local` binds; `remote` becomes the sticky
/// destination.
pub fn open(
    rt: &Runtime,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
) -> Result<Handle, Fail> {
    trace!("udp::open(): local={:?} remote={:?}", local, remote);
    if let (Some(l), Some(r)) = (&local, &remote) {
        if l.is_ipv4() != r.is_ipv4() {
            return Err(Fail::Invalid {
                details: "mismatched address families",
            });
        }
    }
    let probe = local.or(remote).ok_or(Fail::Invalid {
        details: "neither local nor remote address",
    })?;
    let family = if probe.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };
    let fd = socket::socket(family, SockType::Datagram, SockFlag::empty(), None)
        .map_err(Fail::from_nix)?;
    if let Err(e) = fd::unblock(fd) {
        fd::close(fd);
        return Err(e);
    }
    if let Some(local) = local {
        let addr = SockAddr::new_inet(InetAddr::from_std(&local));
        if let Err(e) = socket::bind(fd, &addr) {
            fd::close(fd);
            return Err(Fail::from_nix(e));
        }
    }
    Ok(rt.hmake(Rc::new(UdpSocket {
        rt: rt.clone(),
        fd,
        remote,
    })))
}

/// Returns the bound local address, useful after binding port zero.
pub fn local_addr(rt: &Runtime, h: Handle) -> Result<SocketAddr, Fail> {
    let object = rt.object(h)?;
    let sock = object
        .as_any()
        .downcast_ref::<UdpSocket>()
        .ok_or(Fail::NotSupported {
            details: "not a udp socket",
        })?;
    match socket::getsockname(sock.fd).map_err(Fail::from_nix)? {
        SockAddr::Inet(inet) => Ok(inet.to_std()),
        _ => Err(Fail::Invalid {
            details: "unexpected socket address family",
        }),
    }
}

/// Sends one datagram to `addr`, or to the sticky remote when absent.
pub async fn sendl_to(
    rt: &Runtime,
    h: Handle,
    addr: Option<SocketAddr>,
    iol: &[&[u8]],
) -> Result<(), Fail> {
    let object = rt.object(h)?;
    let sock = object
        .as_any()
        .downcast_ref::<UdpSocket>()
        .ok_or(Fail::NotSupported {
            details: "not a udp socket",
        })?;
    sock.send_datagram(addr, iol)
}

/// Receives one datagram, returning its size and origin.
pub async fn recvl_from(
    rt: &Runtime,
    h: Handle,
    iol: &mut [&mut [u8]],
    deadline: Deadline,
) -> Result<(usize, SocketAddr), Fail> {
    let object = rt.object(h)?;
    let sock = object
        .as_any()
        .downcast_ref::<UdpSocket>()
        .ok_or(Fail::NotSupported {
            details: "not a udp socket",
        })?;
    sock.recv_datagram(iol, deadline).await
}

/// Associate functions for [UdpSocket].
impl UdpSocket {
    fn send_datagram(&self, addr: Option<SocketAddr>, iol: &[&[u8]]) -> Result<(), Fail> {
        let dst = match addr.or(self.remote) {
            Some(dst) => dst,
            None => {
                return Err(Fail::Invalid {
                    details: "no destination address",
                })
            }
        };
        let dst = SockAddr::new_inet(InetAddr::from_std(&dst));
        let iov: Vec<IoVec<&[u8]>> = iol.iter().map(|seg| IoVec::from_slice(seg)).collect();
        match socket::sendmsg(self.fd, &iov, &[], MsgFlags::empty(), Some(&dst)) {
            Ok(_) => Ok(()),
            // A full buffer silently drops the datagram, as the kernel may.
            Err(e) if is_would_block(&e) => Ok(()),
            Err(e) => Err(Fail::from_nix(e)),
        }
    }

    async fn recv_datagram(
        &self,
        iol: &mut [&mut [u8]],
        deadline: Deadline,
    ) -> Result<(usize, SocketAddr), Fail> {
        loop {
            let received = {
                let iov: Vec<IoVec<&mut [u8]>> = iol
                    .iter_mut()
                    .map(|seg| IoVec::from_mut_slice(seg))
                    .collect();
                socket::recvmsg(self.fd, &iov, None, MsgFlags::empty())
                    .map(|msg| (msg.bytes, msg.address))
            };
            match received {
                Ok((sz, Some(SockAddr::Inet(inet)))) => return Ok((sz, inet.to_std())),
                Ok((_, _)) => {
                    return Err(Fail::Invalid {
                        details: "unexpected datagram source address",
                    })
                }
                Err(e) if is_would_block(&e) => self.rt.wait_in(self.fd, deadline).await?,
                Err(e) => return Err(Fail::from_nix(e)),
            }
        }
    }
}

fn is_would_block(error: &Error) -> bool {
    matches!(
        error,
        Error::Sys(nix::errno::EWOULDBLOCK) | Error::Sys(Errno::EAGAIN)
    )
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// SocketObject trait implementation for [UdpSocket].
#[async_trait(?Send)]
impl SocketObject for UdpSocket {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_message(&self) -> Option<&dyn MessageSocket> {
        Some(self)
    }

    fn close(&self) {
        // Keep lingering on: the kernel may still be flushing queued
        // datagrams.
        let _ = nix::unistd::close(self.fd);
    }
}

/// MessageSocket trait implementation for [UdpSocket].
#[async_trait(?Send)]
impl MessageSocket for UdpSocket {
    async fn msendl(&self, iol: &[&[u8]], _deadline: Deadline) -> Result<(), Fail> {
        self.send_datagram(None, iol)
    }

    async fn mrecvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<usize, Fail> {
        let (sz, _) = self.recv_datagram(iol, deadline).await?;
        Ok(sz)
    }
}
