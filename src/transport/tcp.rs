// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! TCP transport: a listener handle and bytestream connection handles over
//! non-blocking kernel sockets.

use crate::{
    fail::Fail,
    fd::{self, RxBuffer},
    runtime::{Deadline, Runtime},
    table::{Handle, Listener, SocketObject, StreamSocket},
};
use async_trait::async_trait;
use nix::sys::socket::{self, AddressFamily, InetAddr, SockAddr, SockFlag, SockType, Shutdown};
use std::{any::Any, cell::RefCell, net::SocketAddr, os::unix::io::RawFd, rc::Rc};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Listening TCP socket.
pub struct TcpListener {
    rt: Runtime,
    fd: RawFd,
}

/// Established TCP connection.
pub struct TcpSocket {
    rt: Runtime,
    fd: RawFd,
    rxbuf: RefCell<RxBuffer>,
}

//==============================================================================
// Associate Functions
//==============================================================================

fn family_of(addr: &SocketAddr) -> AddressFamily {
    if addr.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    }
}

fn open_socket(addr: &SocketAddr) -> Result<RawFd, Fail> {
    let fd = socket::socket(
        family_of(addr),
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(Fail::from_nix)?;
    fd::unblock(fd)?;
    Ok(fd)
}

/// Starts listening on `local`. The returned handle advertises the listener
/// capability only.
pub fn listen(rt: &Runtime, local: SocketAddr, backlog: usize) -> Result<Handle, Fail> {
    trace!("tcp::listen(): local={:?} backlog={:?}", local, backlog);
    if backlog == 0 {
        return Err(Fail::Invalid {
            details: "backlog length",
        });
    }
    let fd = open_socket(&local)?;
    let addr = SockAddr::new_inet(InetAddr::from_std(&local));
    if let Err(e) = socket::bind(fd, &addr).and_then(|_| socket::listen(fd, backlog)) {
        fd::close(fd);
        return Err(Fail::from_nix(e));
    }
    Ok(rt.hmake(Rc::new(TcpListener { rt: rt.clone(), fd })))
}

/// Accepts one connection from a listener handle.
pub async fn accept(rt: &Runtime, l: Handle, deadline: Deadline) -> Result<Handle, Fail> {
    let object = rt.object(l)?;
    let listener = object.as_listener().ok_or(Fail::NotSupported {
        details: "not a listener socket",
    })?;
    listener.accept(deadline).await
}

/// Connects to `remote`, returning a bytestream handle.
pub async fn connect(rt: &Runtime, remote: SocketAddr, deadline: Deadline) -> Result<Handle, Fail> {
    trace!("tcp::connect(): remote={:?}", remote);
    let fd = open_socket(&remote)?;
    let addr = SockAddr::new_inet(InetAddr::from_std(&remote));
    if let Err(e) = fd::connect(rt, fd, &addr, deadline).await {
        fd::close(fd);
        return Err(e);
    }
    Ok(rt.hmake(Rc::new(TcpSocket::new(rt.clone(), fd))))
}

/// Returns the local address of a listener handle, useful after binding to
/// an ephemeral port.
pub fn local_addr(rt: &Runtime, h: Handle) -> Result<SocketAddr, Fail> {
    let object = rt.object(h)?;
    let fd = if let Some(listener) = object.as_any().downcast_ref::<TcpListener>() {
        listener.fd
    } else if let Some(conn) = object.as_any().downcast_ref::<TcpSocket>() {
        conn.fd
    } else {
        return Err(Fail::NotSupported {
            details: "not a tcp socket",
        });
    };
    match socket::getsockname(fd).map_err(Fail::from_nix)? {
        SockAddr::Inet(inet) => Ok(inet.to_std()),
        _ => Err(Fail::Invalid {
            details: "unexpected socket address family",
        }),
    }
}

/// Associate functions for [TcpSocket].
impl TcpSocket {
    pub(crate) fn new(rt: Runtime, fd: RawFd) -> Self {
        Self {
            rt,
            fd,
            rxbuf: RefCell::new(RxBuffer::new()),
        }
    }

    /// Raw descriptor of the connection; layers that drive the fd directly
    /// (TLS) reach it through here.
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// SocketObject trait implementation for [TcpListener].
#[async_trait(?Send)]
impl SocketObject for TcpListener {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_listener(&self) -> Option<&dyn Listener> {
        Some(self)
    }

    fn close(&self) {
        fd::close(self.fd);
    }
}

/// Listener trait implementation for [TcpListener].
#[async_trait(?Send)]
impl Listener for TcpListener {
    async fn accept(&self, deadline: Deadline) -> Result<Handle, Fail> {
        let fd = fd::accept(&self.rt, self.fd, deadline).await?;
        trace!("tcp::accept(): fd={:?}", fd);
        Ok(self
            .rt
            .hmake(Rc::new(TcpSocket::new(self.rt.clone(), fd))))
    }
}

/// SocketObject trait implementation for [TcpSocket].
#[async_trait(?Send)]
impl SocketObject for TcpSocket {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_stream(&self) -> Option<&dyn StreamSocket> {
        Some(self)
    }

    async fn done(&self, _deadline: Deadline) -> Result<(), Fail> {
        socket::shutdown(self.fd, Shutdown::Write).map_err(Fail::from_nix)
    }

    fn close(&self) {
        fd::close(self.fd);
    }
}

/// StreamSocket trait implementation for [TcpSocket].
#[async_trait(?Send)]
impl StreamSocket for TcpSocket {
    async fn bsendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<(), Fail> {
        fd::send(&self.rt, self.fd, iol, deadline).await
    }

    async fn brecvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<(), Fail> {
        // One receiver at a time; interleaved receives are the caller's
        // responsibility and are refused rather than corrupted.
        let mut rxbuf = self.rxbuf.try_borrow_mut().map_err(|_| Fail::Invalid {
            details: "concurrent receive on one tcp socket",
        })?;
        fd::recv(&self.rt, self.fd, &mut rxbuf, iol, deadline).await
    }
}
