// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Non-blocking fd send/recv with readiness waits. Sends and receives try
//! the system call first and fall back to the poller only when the kernel
//! reports EAGAIN. Receives coalesce into a per-socket buffer to amortize
//! system calls; large reads bypass the buffer to avoid double copies.

use crate::{fail::Fail, iol, runtime::{Deadline, Runtime}};
use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, OFlag},
    sys::socket::{self, sockopt, MsgFlags, SockAddr},
    sys::uio::IoVec,
    unistd, Error,
};
use std::os::unix::io::RawFd;

//==============================================================================
// Constants & Structures
//==============================================================================

/// Size of the per-socket receive buffer.
pub const RXBUF_SIZE: usize = 2048;

/// Per-socket receive buffer. Small receives are served from it; receives
/// larger than the buffer read straight into the caller's list.
pub struct RxBuffer {
    data: [u8; RXBUF_SIZE],
    len: usize,
    pos: usize,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [RxBuffer].
impl RxBuffer {
    /// Creates an empty receive buffer.
    pub fn new() -> Self {
        Self {
            data: [0; RXBUF_SIZE],
            len: 0,
            pos: 0,
        }
    }

    fn available(&self) -> usize {
        self.len - self.pos
    }

    /// Copies buffered bytes into the list at `offset`; returns the count.
    fn drain_into(&mut self, iol: &mut [&mut [u8]], offset: usize) -> usize {
        let take = core::cmp::min(self.available(), iol::len_mut(iol) - offset);
        if take == 0 {
            return 0;
        }
        let copied = iol::scatter_at(iol, offset, &self.data[self.pos..self.pos + take]);
        self.pos += copied;
        if self.pos == self.len {
            self.pos = 0;
            self.len = 0;
        }
        copied
    }
}

fn would_block(error: &Error) -> bool {
    matches!(
        error,
        Error::Sys(nix::errno::EWOULDBLOCK) | Error::Sys(Errno::EAGAIN)
    )
}

fn io_fail(error: Error) -> Fail {
    match error {
        Error::Sys(Errno::EPIPE) => Fail::ConnectionReset {},
        e => Fail::from_nix(e),
    }
}

/// Switches the socket to non-blocking mode, allows rapid reuse of the local
/// address and, where available, suppresses SIGPIPE.
pub fn unblock(fd: RawFd) -> Result<(), Fail> {
    let opt = fcntl(fd, FcntlArg::F_GETFL).unwrap_or(0);
    let opt = OFlag::from_bits_truncate(opt) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(opt)).map_err(Fail::from_nix)?;
    socket::setsockopt(fd, sockopt::ReuseAddr, &true).map_err(Fail::from_nix)?;
    Ok(())
}

/// Initiates a connect and waits until the handshake resolves.
pub async fn connect(
    rt: &Runtime,
    fd: RawFd,
    addr: &SockAddr,
    deadline: Deadline,
) -> Result<(), Fail> {
    match socket::connect(fd, addr) {
        Ok(()) => return Ok(()),
        Err(Error::Sys(Errno::EINPROGRESS)) => (),
        Err(e) => return Err(Fail::from_nix(e)),
    }
    // Connect is in progress; wait until it resolves, then collect the
    // outcome from the socket.
    rt.wait_out(fd, deadline).await?;
    let err = socket::getsockopt(fd, sockopt::SocketError).map_err(Fail::from_nix)?;
    if err != 0 {
        return Err(Fail::from_errno(Errno::from_i32(err)));
    }
    Ok(())
}

/// Accepts one connection, waiting for one to arrive if necessary.
pub async fn accept(rt: &Runtime, fd: RawFd, deadline: Deadline) -> Result<RawFd, Fail> {
    loop {
        match socket::accept(fd) {
            Ok(newfd) => {
                unblock(newfd)?;
                return Ok(newfd);
            }
            // Connection aborted by the peer; grab the next one.
            Err(Error::Sys(Errno::ECONNABORTED)) => continue,
            Err(e) if would_block(&e) => rt.wait_in(fd, deadline).await?,
            Err(e) => return Err(Fail::from_nix(e)),
        }
    }
}

fn iovecs_at<'a>(iol: &'a [&'a [u8]], mut skip: usize) -> Vec<IoVec<&'a [u8]>> {
    let mut out = Vec::with_capacity(iol.len());
    for seg in iol {
        let seglen = seg.len();
        if skip >= seglen {
            skip -= seglen;
            continue;
        }
        out.push(IoVec::from_slice(&seg[skip..]));
        skip = 0;
    }
    out
}

fn iovecs_at_mut<'a>(iol: &'a mut [&mut [u8]], mut skip: usize) -> Vec<IoVec<&'a mut [u8]>> {
    let mut out = Vec::with_capacity(iol.len());
    for seg in iol.iter_mut() {
        let seglen = seg.len();
        if skip >= seglen {
            skip -= seglen;
            continue;
        }
        out.push(IoVec::from_mut_slice(&mut seg[skip..]));
        skip = 0;
    }
    out
}

/// Sends the whole list over the fd.
pub async fn send(
    rt: &Runtime,
    fd: RawFd,
    iol: &[&[u8]],
    deadline: Deadline,
) -> Result<(), Fail> {
    let total = iol::len(iol);
    let mut pos = 0;
    while pos < total {
        let iov = iovecs_at(iol, pos);
        match socket::sendmsg(fd, &iov, &[], MsgFlags::from_bits_truncate(libc::MSG_NOSIGNAL), None) {
            Ok(sz) => pos += sz,
            Err(e) if would_block(&e) => rt.wait_out(fd, deadline).await?,
            Err(e) => return Err(io_fail(e)),
        }
    }
    Ok(())
}

/// Receives into the list without buffering; fills it completely.
async fn recv_direct(
    rt: &Runtime,
    fd: RawFd,
    iol: &mut [&mut [u8]],
    mut pos: usize,
    deadline: Deadline,
) -> Result<(), Fail> {
    let total = iol::len_mut(iol);
    while pos < total {
        let sz = {
            let iov = iovecs_at_mut(iol, pos);
            socket::recvmsg(fd, &iov, None, MsgFlags::empty()).map(|m| m.bytes)
        };
        match sz {
            Ok(0) => return Err(Fail::Pipe {}),
            Ok(sz) => pos += sz,
            Err(e) if would_block(&e) => rt.wait_in(fd, deadline).await?,
            Err(e) => return Err(io_fail(e)),
        }
    }
    Ok(())
}

/// Receives exactly the bytes the list covers, serving small reads from the
/// receive buffer.
pub async fn recv(
    rt: &Runtime,
    fd: RawFd,
    rxbuf: &mut RxBuffer,
    iol: &mut [&mut [u8]],
    deadline: Deadline,
) -> Result<(), Fail> {
    let total = iol::len_mut(iol);
    let mut pos = rxbuf.drain_into(iol, 0);
    if pos == total {
        return Ok(());
    }
    // A large remainder is read straight into the caller's buffers.
    if total - pos > RXBUF_SIZE {
        return recv_direct(rt, fd, iol, pos, deadline).await;
    }
    loop {
        // Speculative recv first; poll only after the kernel has nothing.
        match socket::recv(fd, &mut rxbuf.data, MsgFlags::empty()) {
            Ok(0) => return Err(Fail::Pipe {}),
            Ok(sz) => {
                rxbuf.len = sz;
                rxbuf.pos = 0;
                pos += rxbuf.drain_into(iol, pos);
                if pos == total {
                    return Ok(());
                }
            }
            Err(e) if would_block(&e) => rt.wait_in(fd, deadline).await?,
            Err(e) => return Err(io_fail(e)),
        }
    }
}

/// Closes the fd, discarding any pending outbound data.
pub fn close(fd: RawFd) {
    // If SO_LINGER cannot be set, never mind and continue anyway.
    let lng = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let _ = socket::setsockopt(fd, sockopt::Linger, &lng);
    let _ = unistd::close(fd);
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Default trait implementation for [RxBuffer].
impl Default for RxBuffer {
    fn default() -> Self {
        Self::new()
    }
}
