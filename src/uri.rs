// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Small URI splitter: scheme, userinfo, host, port, path, query and
//! fragment as borrowed substrings of the input. Component presence is
//! carried by the `Option` fields.

use crate::fail::Fail;

//==============================================================================
// Constants & Structures
//==============================================================================

/// Parsed URI. All slices borrow from the input.
#[derive(Debug, PartialEq, Eq)]
pub struct Uri<'a> {
    pub scheme: Option<&'a str>,
    pub userinfo: Option<&'a str>,
    pub host: Option<&'a str>,
    pub port: Option<u16>,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub fragment: Option<&'a str>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Splits a URI of the shape
/// `[scheme://][userinfo@]host[:port][/path][?query][#fragment]`.
pub fn parse(input: &str) -> Result<Uri<'_>, Fail> {
    let (rest, fragment) = match input.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment)),
        None => (input, None),
    };
    let (rest, query) = match rest.split_once('?') {
        Some((rest, query)) => (rest, Some(query)),
        None => (rest, None),
    };
    let (scheme, rest) = match rest.split_once("://") {
        Some((scheme, rest)) => {
            if scheme.is_empty()
                || !scheme
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'-' || b == b'.')
            {
                return Err(Fail::Invalid {
                    details: "malformed uri scheme",
                });
            }
            (Some(scheme), rest)
        }
        None => (None, rest),
    };
    let (authority, path) = match rest.find('/') {
        Some(slash) => (&rest[..slash], &rest[slash..]),
        None => (rest, ""),
    };
    let (userinfo, hostport) = match authority.rsplit_once('@') {
        Some((userinfo, hostport)) => (Some(userinfo), hostport),
        None => (None, authority),
    };
    // Bracketed IPv6 literals keep their colons.
    let (host, port) = if let Some(bracketed) = hostport.strip_prefix('[') {
        match bracketed.split_once(']') {
            Some((host, "")) => (host, None),
            Some((host, rest)) => match rest.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => {
                    return Err(Fail::Invalid {
                        details: "malformed uri authority",
                    })
                }
            },
            None => {
                return Err(Fail::Invalid {
                    details: "unterminated ipv6 literal",
                })
            }
        }
    } else {
        match hostport.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (hostport, None),
        }
    };
    let port = match port {
        Some(port) => Some(port.parse::<u16>().map_err(|_| Fail::Invalid {
            details: "malformed uri port",
        })?),
        None => None,
    };
    Ok(Uri {
        scheme,
        userinfo,
        host: if host.is_empty() { None } else { Some(host) },
        port,
        path,
        query,
        fragment,
    })
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    #[test]
    fn full_uri_splits() {
        let uri = super::parse("wss://alice:pw@example.org:8443/chat?room=1#top").unwrap();
        assert_eq!(uri.scheme, Some("wss"));
        assert_eq!(uri.userinfo, Some("alice:pw"));
        assert_eq!(uri.host, Some("example.org"));
        assert_eq!(uri.port, Some(8443));
        assert_eq!(uri.path, "/chat");
        assert_eq!(uri.query, Some("room=1"));
        assert_eq!(uri.fragment, Some("top"));
    }

    #[test]
    fn bare_host_has_no_optionals() {
        let uri = super::parse("example.org").unwrap();
        assert_eq!(uri.scheme, None);
        assert_eq!(uri.userinfo, None);
        assert_eq!(uri.host, Some("example.org"));
        assert_eq!(uri.port, None);
        assert_eq!(uri.path, "");
        assert_eq!(uri.query, None);
        assert_eq!(uri.fragment, None);
    }

    #[test]
    fn ipv6_literal_keeps_colons() {
        let uri = super::parse("tcp://[::1]:5555/x").unwrap();
        assert_eq!(uri.host, Some("::1"));
        assert_eq!(uri.port, Some(5555));
        assert_eq!(uri.path, "/x");
    }

    #[test]
    fn bad_port_is_rejected() {
        assert!(super::parse("http://example.org:99999/").is_err());
        assert!(super::parse("http://example.org:x/").is_err());
    }
}
