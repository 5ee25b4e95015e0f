// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use custom_error::custom_error;
use nix::errno::Errno;

//==============================================================================
// Constants & Structures
//==============================================================================

custom_error! { #[derive(Clone, PartialEq, Eq)] pub Fail
    Invalid{ details: &'static str }      = "invalid argument: {details}",
    OutOfMemory{}                         = "out of memory",
    NotSupported{ details: &'static str } = "operation not supported: {details}",
    BadHandle{}                           = "bad handle",
    Timedout{}                            = "deadline expired",
    Canceled{}                            = "operation canceled",
    Pipe{}                                = "peer closed the stream",
    ConnectionReset{}                     = "connection reset",
    MessageTooLong{}                      = "message too long for receive buffer",
    Protocol{ details: &'static str }     = "protocol violation: {details}",
    AccessDenied{}                        = "authentication failed",
    Errno{ errno: i32 }                   = "system error: errno {errno}",
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Fail].
impl Fail {
    /// Maps a raw errno onto the failure taxonomy.
    pub fn from_errno(errno: Errno) -> Fail {
        match errno {
            Errno::ENOMEM => Fail::OutOfMemory {},
            Errno::EBADF => Fail::BadHandle {},
            Errno::ETIMEDOUT => Fail::Timedout {},
            Errno::ECANCELED => Fail::Canceled {},
            Errno::EPIPE => Fail::Pipe {},
            Errno::ECONNRESET => Fail::ConnectionReset {},
            Errno::EMSGSIZE => Fail::MessageTooLong {},
            Errno::EPROTO => Fail::Protocol {
                details: "protocol error",
            },
            Errno::EACCES => Fail::AccessDenied {},
            e => Fail::Errno { errno: e as i32 },
        }
    }

    /// Maps a `nix` error onto the failure taxonomy.
    pub fn from_nix(error: nix::Error) -> Fail {
        match error {
            nix::Error::Sys(errno) => Fail::from_errno(errno),
            _ => Fail::Invalid {
                details: "malformed system call argument",
            },
        }
    }
}
