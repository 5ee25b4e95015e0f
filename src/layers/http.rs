// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! HTTP line framing over a CRLF transport: request lines, status lines and
//! header fields, nothing more. Parsing is strict about token structure but
//! tolerates runs of spaces between tokens. Receive errors latch; a broken
//! parse poisons the socket until it is closed.

use crate::{
    fail::Fail,
    layers::crlf,
    runtime::{Deadline, Runtime},
    table::{Handle, SocketObject},
};
use async_trait::async_trait;
use std::{any::Any, cell::Cell, cell::RefCell, rc::Rc};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Bound on the length of one received line.
const RXBUF_SIZE: usize = 1024;

/// Characters disallowed in header field names.
const FIELD_NAME_FORBIDDEN: &[u8] = b"(),/:;<=>?@[\\]{}\" \t";

/// HTTP line layer. It advertises neither bytestream nor message
/// capability; its operations are the functions of this module.
pub struct HttpSock {
    rt: Runtime,
    /// Underlying CRLF socket.
    s: Cell<Option<Handle>>,
    rxerr: RefCell<Option<Fail>>,
    rxbuf: RefCell<[u8; RXBUF_SIZE]>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Attaches the HTTP layer atop a bytestream handle, consuming it.
pub fn attach(rt: &Runtime, s: Handle) -> Result<Handle, Fail> {
    let object = rt.object(s)?;
    if object.as_stream().is_none() {
        return Err(Fail::NotSupported {
            details: "http requires a bytestream socket",
        });
    }
    drop(object);
    let s = rt.take_private(s)?;
    // Wrap the underlying socket into the CRLF protocol.
    let crlf_sock = crlf::attach(rt, s)?;
    Ok(rt.hmake(Rc::new(HttpSock {
        rt: rt.clone(),
        s: Cell::new(Some(crlf_sock)),
        rxerr: RefCell::new(None),
        rxbuf: RefCell::new([0; RXBUF_SIZE]),
    })))
}

/// Detaches the HTTP layer, returning the underlying bytestream handle.
pub fn detach(rt: &Runtime, h: Handle) -> Result<Handle, Fail> {
    let object = rt.object(h)?;
    let sock = object
        .as_any()
        .downcast_ref::<HttpSock>()
        .ok_or(Fail::NotSupported {
            details: "not an http socket",
        })?;
    let crlf_sock = match sock.s.take() {
        Some(crlf_sock) => crlf_sock,
        None => return Err(Fail::BadHandle {}),
    };
    let underlying = crlf::detach(rt, crlf_sock)?;
    drop(object);
    rt.hclose(h)?;
    Ok(underlying)
}

fn socket_of(rt: &Runtime, h: Handle) -> Result<(Rc<dyn SocketObject>, Handle), Fail> {
    let object = rt.object(h)?;
    let crlf_sock = object
        .as_any()
        .downcast_ref::<HttpSock>()
        .ok_or(Fail::NotSupported {
            details: "not an http socket",
        })?
        .s
        .get()
        .ok_or(Fail::BadHandle {})?;
    Ok((object, crlf_sock))
}

/// Sends `METHOD SP resource SP HTTP/1.1`.
pub async fn sendrequest(
    rt: &Runtime,
    h: Handle,
    command: &str,
    resource: &str,
    deadline: Deadline,
) -> Result<(), Fail> {
    if command.contains(' ') || resource.contains(' ') {
        return Err(Fail::Invalid {
            details: "command and resource must not contain spaces",
        });
    }
    let (_object, s) = socket_of(rt, h)?;
    rt.msendl(
        s,
        &[command.as_bytes(), b" ", resource.as_bytes(), b" HTTP/1.1"],
        deadline,
    )
    .await
}

/// Receives a request line, returning `(method, resource)`.
pub async fn recvrequest(
    rt: &Runtime,
    h: Handle,
    deadline: Deadline,
) -> Result<(String, String), Fail> {
    let line = recv_line(rt, h, deadline).await?;
    latch_parse(rt, h, parse_request(&line))
}

/// Sends `HTTP/1.1 SP code SP reason`.
pub async fn sendstatus(
    rt: &Runtime,
    h: Handle,
    status: u16,
    reason: &str,
    deadline: Deadline,
) -> Result<(), Fail> {
    if !(100..=599).contains(&status) {
        return Err(Fail::Invalid {
            details: "status code out of range",
        });
    }
    let (_object, s) = socket_of(rt, h)?;
    let digits = [
        b'0' + (status / 100) as u8,
        b'0' + (status / 10 % 10) as u8,
        b'0' + (status % 10) as u8,
        b' ',
    ];
    rt.msendl(s, &[b"HTTP/1.1 ", &digits, reason.as_bytes()], deadline)
        .await
}

/// Receives a status line, returning `(code, reason)`.
pub async fn recvstatus(rt: &Runtime, h: Handle, deadline: Deadline) -> Result<(u16, String), Fail> {
    let line = recv_line(rt, h, deadline).await?;
    latch_parse(rt, h, parse_status(&line))
}

/// Sends `name: value` with the value stripped of outer spaces.
pub async fn sendfield(
    rt: &Runtime,
    h: Handle,
    name: &str,
    value: &str,
    deadline: Deadline,
) -> Result<(), Fail> {
    if name.is_empty() || name.bytes().any(|b| FIELD_NAME_FORBIDDEN.contains(&b)) {
        return Err(Fail::Protocol {
            details: "field name contains forbidden characters",
        });
    }
    let value = value.trim_matches(' ');
    if value.is_empty() {
        return Err(Fail::Protocol {
            details: "field value is empty",
        });
    }
    let (_object, s) = socket_of(rt, h)?;
    rt.msendl(s, &[name.as_bytes(), b": ", value.as_bytes()], deadline)
        .await
}

/// Receives a `name: value` field line.
pub async fn recvfield(
    rt: &Runtime,
    h: Handle,
    deadline: Deadline,
) -> Result<(String, String), Fail> {
    let line = recv_line(rt, h, deadline).await?;
    latch_parse(rt, h, parse_field(&line))
}

async fn recv_line(rt: &Runtime, h: Handle, deadline: Deadline) -> Result<String, Fail> {
    let (object, s) = socket_of(rt, h)?;
    let sock = match object.as_any().downcast_ref::<HttpSock>() {
        Some(sock) => sock,
        None => return Err(Fail::BadHandle {}),
    };
    if let Some(error) = sock.rxerr.borrow().clone() {
        return Err(error);
    }
    let mut rxbuf = sock.rxbuf.try_borrow_mut().map_err(|_| Fail::Invalid {
        details: "concurrent receive on one http socket",
    })?;
    let sz = match rt.mrecv(s, &mut rxbuf[..], deadline).await {
        Ok(sz) => sz,
        Err(error) => {
            let mut rxerr = sock.rxerr.borrow_mut();
            if rxerr.is_none() {
                *rxerr = Some(error.clone());
            }
            return Err(error);
        }
    };
    match std::str::from_utf8(&rxbuf[..sz]) {
        Ok(line) => Ok(line.to_string()),
        Err(_) => Err(Fail::Protocol {
            details: "http line is not valid text",
        }),
    }
}

/// Latches a parse failure into the socket's sticky receive error.
fn latch_parse<T>(rt: &Runtime, h: Handle, result: Result<T, Fail>) -> Result<T, Fail> {
    if let Err(error) = &result {
        if let Ok(object) = rt.object(h) {
            if let Some(sock) = object.as_any().downcast_ref::<HttpSock>() {
                let mut rxerr = sock.rxerr.borrow_mut();
                if rxerr.is_none() {
                    *rxerr = Some(error.clone());
                }
            }
        }
    }
    result
}

//==============================================================================
// Parsing
//==============================================================================

/// Splits the leading non-space token; tolerates runs of spaces.
fn token<'a>(line: &'a str) -> Result<(&'a str, &'a str), Fail> {
    let line = line.trim_start_matches(' ');
    let end = line.find(' ').unwrap_or(line.len());
    if end == 0 {
        return Err(Fail::Protocol {
            details: "missing token",
        });
    }
    Ok((&line[..end], &line[end..]))
}

fn parse_request(line: &str) -> Result<(String, String), Fail> {
    let (command, rest) = token(line)?;
    let (resource, rest) = token(rest)?;
    let (protocol, rest) = token(rest)?;
    if protocol != "HTTP/1.1" {
        return Err(Fail::Protocol {
            details: "unexpected protocol version",
        });
    }
    if !rest.trim_matches(' ').is_empty() {
        return Err(Fail::Protocol {
            details: "trailing data after request line",
        });
    }
    Ok((command.to_string(), resource.to_string()))
}

fn parse_status(line: &str) -> Result<(u16, String), Fail> {
    let (protocol, rest) = token(line)?;
    if protocol != "HTTP/1.1" {
        return Err(Fail::Protocol {
            details: "unexpected protocol version",
        });
    }
    let (code, rest) = token(rest)?;
    // Exactly three decimal digits.
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Fail::Protocol {
            details: "malformed status code",
        });
    }
    let status = code
        .parse::<u16>()
        .map_err(|_| Fail::Protocol {
            details: "malformed status code",
        })?;
    let reason = rest.trim_matches(' ');
    Ok((status, reason.to_string()))
}

fn parse_field(line: &str) -> Result<(String, String), Fail> {
    let line = line.trim_start_matches(' ');
    let colon = line.find(':').ok_or(Fail::Protocol {
        details: "field line without a colon",
    })?;
    let name = line[..colon].trim_end_matches(' ');
    if name.is_empty() {
        return Err(Fail::Protocol {
            details: "empty field name",
        });
    }
    if name.contains(' ') || name.bytes().any(|b| FIELD_NAME_FORBIDDEN.contains(&b)) {
        return Err(Fail::Protocol {
            details: "field name contains forbidden characters",
        });
    }
    let value = line[colon + 1..].trim_matches(' ');
    Ok((name.to_string(), value.to_string()))
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// SocketObject trait implementation for [HttpSock].
#[async_trait(?Send)]
impl SocketObject for HttpSock {
    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn done(&self, deadline: Deadline) -> Result<(), Fail> {
        match self.s.get() {
            Some(s) => self.rt.hdone(s, deadline).await,
            None => Err(Fail::BadHandle {}),
        }
    }

    fn close(&self) {
        if let Some(s) = self.s.take() {
            let _ = self.rt.hclose(s);
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use crate::fail::Fail;

    #[test]
    fn request_line_parses() {
        let (method, resource) = super::parse_request("GET /x HTTP/1.1").unwrap();
        assert_eq!(method, "GET");
        assert_eq!(resource, "/x");
    }

    #[test]
    fn request_line_tolerates_extra_spaces() {
        let (method, resource) = super::parse_request("  GET   /x    HTTP/1.1  ").unwrap();
        assert_eq!(method, "GET");
        assert_eq!(resource, "/x");
    }

    #[test]
    fn request_line_rejects_wrong_protocol() {
        assert!(super::parse_request("GET /x HTTP/1.0").is_err());
        assert!(super::parse_request("GET /x").is_err());
    }

    #[test]
    fn status_line_parses() {
        let (code, reason) = super::parse_status("HTTP/1.1 200 OK computer").unwrap();
        assert_eq!(code, 200);
        assert_eq!(reason, "OK computer");
    }

    #[test]
    fn status_code_must_be_three_digits() {
        assert!(super::parse_status("HTTP/1.1 99 too-short").is_err());
        assert!(super::parse_status("HTTP/1.1 2000 too-long").is_err());
        assert!(super::parse_status("HTTP/1.1 2x0 mixed").is_err());
    }

    #[test]
    fn field_line_parses_and_strips() {
        let (name, value) = super::parse_field("Host:   example.org  ").unwrap();
        assert_eq!(name, "Host");
        assert_eq!(value, "example.org");
    }

    #[test]
    fn field_name_charset_is_enforced() {
        assert_eq!(
            super::parse_field("Bad{Name}: x"),
            Err(Fail::Protocol {
                details: "field name contains forbidden characters"
            })
        );
    }
}
