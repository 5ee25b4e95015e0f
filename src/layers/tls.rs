// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! TLS bytestream layer over a TCP connection. The layer drives the raw
//! descriptor of the underlying socket directly, alternating the TLS
//! engine's appetite for records with fd readiness waits: want-read parks
//! on readable, want-write parks on writable. The handshake is lazy; the
//! first send or receive completes it. Closing performs a bounded
//! close-notify exchange.
//!
//! Configuration mirrors the flat knob set of the wire protocol: permitted
//! protocol versions, key-exchange curve, cipher set with an optional
//! per-suite bitmap, verification depth and selective verification
//! disables. Knobs the engine cannot express are rejected at attach.

use crate::{
    fail::Fail,
    iol,
    runtime::{Deadline, Runtime},
    table::{Handle, SocketObject, StreamSocket},
    transport::tcp::TcpSocket,
};
use async_trait::async_trait;
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier},
    server::{AllowAnyAnonymousOrAuthenticatedClient, AllowAnyAuthenticatedClient},
    Certificate, CertificateError, ClientConfig, ClientConnection, Connection, Error as TlsError,
    PrivateKey, ProtocolVersion, RootCertStore, ServerConfig, ServerConnection, ServerName,
    SupportedCipherSuite,
};
use sha2::{Digest, Sha256};
use std::{
    any::Any,
    cell::{Cell, RefCell},
    io::{self, Read, Write},
    os::unix::io::RawFd,
    rc::Rc,
    sync::Arc,
    time::SystemTime,
};
use x509_parser::prelude::{parse_x509_certificate, GeneralName};

//==============================================================================
// Configuration
//==============================================================================

/// Cipher suite bits for [CipherSet::Specific].
pub mod ciphers {
    pub const ECDHE_RSA_AES256_GCM_SHA384: u64 = 1 << 0;
    pub const ECDHE_ECDSA_AES256_GCM_SHA384: u64 = 1 << 1;
    pub const ECDHE_ECDSA_CHACHA20_POLY1305: u64 = 1 << 8;
    pub const ECDHE_RSA_CHACHA20_POLY1305: u64 = 1 << 9;
    pub const ECDHE_RSA_AES128_GCM_SHA256: u64 = 1 << 22;
    pub const ECDHE_ECDSA_AES128_GCM_SHA256: u64 = 1 << 23;
}

/// Permitted protocol versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Protocols {
    pub v1_2: bool,
    pub v1_3: bool,
}

/// DHE parameter selection. The engine offers no finite-field DHE; only
/// `None` is accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DheParams {
    None,
    Auto,
    Legacy,
}

/// ECDHE curve selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EcdheCurve {
    None,
    Auto,
    Secp256R1,
    Secp384R1,
}

/// Cipher selection. `Compat`, `Legacy` and `Insecure` fall back to the
/// engine's stock suites; `Specific` picks from the bitmap in [ciphers].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherSet {
    Secure,
    Compat,
    Legacy,
    Insecure,
    Specific(u64),
}

/// Client certificate policy for servers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientVerify {
    None,
    Required,
    Optional,
}

/// Flat configuration of the layer.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub protocols: Protocols,
    pub dhe: DheParams,
    pub curve: EcdheCurve,
    pub ciphers: CipherSet,
    pub verify_depth: u32,
    pub prefer_server_ciphers: bool,
    pub verify_cert: bool,
    pub verify_name: bool,
    pub verify_time: bool,
    pub verify_client: ClientVerify,
    /// Drop key material from the configuration once the engine holds it.
    pub clear_keys: bool,
}

/// Certificate/key pair, PEM encoded.
#[derive(Clone)]
pub struct Keypair {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

/// Trust anchors, PEM encoded.
#[derive(Clone)]
pub struct CertAuthority {
    pem: Vec<u8>,
}

/// Prepared server-side configuration, reusable across accepted
/// connections.
#[derive(Clone)]
pub struct ServerContext {
    config: Arc<ServerConfig>,
}

//==============================================================================
// Constants & Structures
//==============================================================================

/// TLS bytestream layer.
pub struct TlsSock {
    rt: Runtime,
    s: Cell<Option<Handle>>,
    fd: RawFd,
    conn: RefCell<Connection>,
    servername: Option<String>,
    /// The close-notify alert goes on the wire once.
    notified: Cell<bool>,
}

/// io adapter over the raw descriptor; EAGAIN surfaces as `WouldBlock`.
struct FdIo(RawFd);

/// Server certificate verifier honoring the selective verification
/// disables.
struct LenientVerifier {
    inner: WebPkiVerifier,
    verify_cert: bool,
    verify_name: bool,
    verify_time: bool,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Keypair].
impl Keypair {
    pub fn new(cert: Vec<u8>, key: Vec<u8>) -> Self {
        Self { cert, key }
    }
}

/// Associate functions for [CertAuthority].
impl CertAuthority {
    /// Trust anchors from a PEM file on disk.
    pub fn from_file(path: &str) -> Result<Self, Fail> {
        Ok(Self {
            pem: load_file(path)?,
        })
    }

    /// Trust anchors from PEM bytes in memory.
    pub fn from_mem(pem: &[u8]) -> Self {
        Self { pem: pem.to_vec() }
    }
}

/// Reads a whole file, for certificate and key material.
pub fn load_file(path: &str) -> Result<Vec<u8>, Fail> {
    std::fs::read(path).map_err(|_| Fail::Invalid {
        details: "cannot read file",
    })
}

fn parse_certs(pem: &[u8]) -> Result<Vec<Certificate>, Fail> {
    let certs = rustls_pemfile::certs(&mut &pem[..]).map_err(|_| Fail::Invalid {
        details: "malformed certificate pem",
    })?;
    if certs.is_empty() {
        return Err(Fail::Invalid {
            details: "no certificates in pem",
        });
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn parse_key(pem: &[u8]) -> Result<PrivateKey, Fail> {
    let mut reader = &pem[..];
    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::RSAKey(key)))
            | Ok(Some(rustls_pemfile::Item::PKCS8Key(key)))
            | Ok(Some(rustls_pemfile::Item::ECKey(key))) => return Ok(PrivateKey(key)),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => {
                return Err(Fail::Invalid {
                    details: "no private key in pem",
                })
            }
        }
    }
}

fn root_store(ca: Option<&CertAuthority>) -> Result<RootCertStore, Fail> {
    let mut roots = RootCertStore::empty();
    if let Some(ca) = ca {
        let certs = rustls_pemfile::certs(&mut &ca.pem[..]).map_err(|_| Fail::Invalid {
            details: "malformed trust anchor pem",
        })?;
        roots.add_parsable_certificates(&certs);
    }
    Ok(roots)
}

fn versions_for(cfg: &TlsConfig) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, Fail> {
    let mut versions = Vec::new();
    if cfg.protocols.v1_2 {
        versions.push(&rustls::version::TLS12);
    }
    if cfg.protocols.v1_3 {
        versions.push(&rustls::version::TLS13);
    }
    if versions.is_empty() {
        return Err(Fail::Invalid {
            details: "no protocol version enabled",
        });
    }
    Ok(versions)
}

fn suites_for(cfg: &TlsConfig) -> Result<Vec<SupportedCipherSuite>, Fail> {
    use rustls::cipher_suite::*;
    match cfg.ciphers {
        CipherSet::Secure | CipherSet::Compat | CipherSet::Legacy | CipherSet::Insecure => {
            Ok(rustls::DEFAULT_CIPHER_SUITES.to_vec())
        }
        CipherSet::Specific(bitmap) => {
            let table: &[(u64, SupportedCipherSuite)] = &[
                (
                    ciphers::ECDHE_RSA_AES256_GCM_SHA384,
                    TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                ),
                (
                    ciphers::ECDHE_ECDSA_AES256_GCM_SHA384,
                    TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                ),
                (
                    ciphers::ECDHE_ECDSA_CHACHA20_POLY1305,
                    TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                ),
                (
                    ciphers::ECDHE_RSA_CHACHA20_POLY1305,
                    TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
                ),
                (
                    ciphers::ECDHE_RSA_AES128_GCM_SHA256,
                    TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                ),
                (
                    ciphers::ECDHE_ECDSA_AES128_GCM_SHA256,
                    TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                ),
            ];
            let mut suites: Vec<SupportedCipherSuite> = table
                .iter()
                .filter(|(bit, _)| bitmap & bit != 0)
                .map(|(_, suite)| *suite)
                .collect();
            if cfg.protocols.v1_3 {
                // TLS 1.3 suites are not part of the legacy bitmap.
                suites.extend_from_slice(&[
                    TLS13_AES_256_GCM_SHA384,
                    TLS13_AES_128_GCM_SHA256,
                    TLS13_CHACHA20_POLY1305_SHA256,
                ]);
            }
            if suites.is_empty() {
                return Err(Fail::Invalid {
                    details: "cipher bitmap selects nothing",
                });
            }
            Ok(suites)
        }
    }
}

fn kx_groups_for(cfg: &TlsConfig) -> Result<Vec<&'static rustls::SupportedKxGroup>, Fail> {
    match cfg.curve {
        EcdheCurve::Auto => Ok(rustls::ALL_KX_GROUPS.to_vec()),
        EcdheCurve::Secp256R1 => Ok(vec![&rustls::kx_group::SECP256R1]),
        EcdheCurve::Secp384R1 => Ok(vec![&rustls::kx_group::SECP384R1]),
        EcdheCurve::None => Err(Fail::NotSupported {
            details: "engine requires an ECDHE curve",
        }),
    }
}

fn check_dhe(cfg: &TlsConfig) -> Result<(), Fail> {
    match cfg.dhe {
        DheParams::None => Ok(()),
        _ => Err(Fail::NotSupported {
            details: "engine offers no finite-field DHE",
        }),
    }
}

fn map_tls_error(error: TlsError) -> Fail {
    match error {
        TlsError::InvalidCertificate(_) => Fail::AccessDenied {},
        _ => Fail::Protocol {
            details: "tls engine rejected the peer",
        },
    }
}

fn client_config(
    cfg: &TlsConfig,
    ca: Option<&CertAuthority>,
    kp: Option<&Keypair>,
    alpn: Option<&[&str]>,
) -> Result<Arc<ClientConfig>, Fail> {
    check_dhe(cfg)?;
    let versions = versions_for(cfg)?;
    let suites = suites_for(cfg)?;
    let kx = kx_groups_for(cfg)?;
    let roots = root_store(ca)?;
    let builder = ClientConfig::builder()
        .with_cipher_suites(&suites)
        .with_kx_groups(&kx)
        .with_protocol_versions(&versions)
        .map_err(|_| Fail::Invalid {
            details: "cipher suites incompatible with protocol versions",
        })?;
    let builder = builder.with_root_certificates(roots.clone());
    let mut config = match kp {
        Some(kp) => builder
            .with_client_auth_cert(parse_certs(&kp.cert)?, parse_key(&kp.key)?)
            .map_err(|_| Fail::Invalid {
                details: "client certificate rejected",
            })?,
        None => builder.with_no_client_auth(),
    };
    if let Some(alpn) = alpn {
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    }
    if !(cfg.verify_cert && cfg.verify_name && cfg.verify_time) {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(LenientVerifier {
                inner: WebPkiVerifier::new(roots, None),
                verify_cert: cfg.verify_cert,
                verify_name: cfg.verify_name,
                verify_time: cfg.verify_time,
            }));
    }
    Ok(Arc::new(config))
}

/// Builds a reusable server context from keypairs and policy.
pub fn server_context(
    cfg: &TlsConfig,
    kps: &[Keypair],
    ca: Option<&CertAuthority>,
    alpn: Option<&[&str]>,
) -> Result<ServerContext, Fail> {
    check_dhe(cfg)?;
    let kp = kps.first().ok_or(Fail::Invalid {
        details: "server needs a keypair",
    })?;
    let versions = versions_for(cfg)?;
    let suites = suites_for(cfg)?;
    let kx = kx_groups_for(cfg)?;
    let builder = ServerConfig::builder()
        .with_cipher_suites(&suites)
        .with_kx_groups(&kx)
        .with_protocol_versions(&versions)
        .map_err(|_| Fail::Invalid {
            details: "cipher suites incompatible with protocol versions",
        })?;
    let builder = match cfg.verify_client {
        ClientVerify::None => builder.with_no_client_auth(),
        ClientVerify::Required => {
            builder.with_client_cert_verifier(AllowAnyAuthenticatedClient::new(root_store(ca)?).boxed())
        }
        ClientVerify::Optional => builder.with_client_cert_verifier(
            AllowAnyAnonymousOrAuthenticatedClient::new(root_store(ca)?).boxed(),
        ),
    };
    let mut config = builder
        .with_single_cert(parse_certs(&kp.cert)?, parse_key(&kp.key)?)
        .map_err(|_| Fail::Invalid {
            details: "server certificate rejected",
        })?;
    config.ignore_client_order = cfg.prefer_server_ciphers;
    if let Some(alpn) = alpn {
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    }
    Ok(ServerContext {
        config: Arc::new(config),
    })
}

fn tcp_fd(rt: &Runtime, s: Handle) -> Result<RawFd, Fail> {
    let object = rt.object(s)?;
    let tcp = object
        .as_any()
        .downcast_ref::<TcpSocket>()
        .ok_or(Fail::NotSupported {
            details: "tls requires a tcp socket",
        })?;
    Ok(tcp.fd())
}

fn make_sock(rt: &Runtime, s: Handle, conn: Connection, servername: Option<String>) -> Result<Handle, Fail> {
    let fd = tcp_fd(rt, s)?;
    let s = rt.take_private(s)?;
    Ok(rt.hmake(Rc::new(TlsSock {
        rt: rt.clone(),
        s: Cell::new(Some(s)),
        fd,
        conn: RefCell::new(conn),
        servername,
        notified: Cell::new(false),
    })))
}

/// Attaches a client-side TLS layer atop a TCP handle, consuming it.
pub fn attach_client(
    rt: &Runtime,
    s: Handle,
    cfg: &TlsConfig,
    ca: Option<&CertAuthority>,
    alpn: Option<&[&str]>,
    servername: &str,
) -> Result<Handle, Fail> {
    attach_client_inner(rt, s, cfg, None, ca, alpn, servername)
}

/// Client attach presenting a certificate of its own.
pub fn attach_client_kp(
    rt: &Runtime,
    s: Handle,
    cfg: &TlsConfig,
    kp: &Keypair,
    ca: Option<&CertAuthority>,
    alpn: Option<&[&str]>,
    servername: &str,
) -> Result<Handle, Fail> {
    attach_client_inner(rt, s, cfg, Some(kp), ca, alpn, servername)
}

fn attach_client_inner(
    rt: &Runtime,
    s: Handle,
    cfg: &TlsConfig,
    kp: Option<&Keypair>,
    ca: Option<&CertAuthority>,
    alpn: Option<&[&str]>,
    servername: &str,
) -> Result<Handle, Fail> {
    let config = client_config(cfg, ca, kp, alpn)?;
    let name = ServerName::try_from(servername).map_err(|_| Fail::Invalid {
        details: "malformed server name",
    })?;
    let conn = ClientConnection::new(config, name).map_err(map_tls_error)?;
    make_sock(rt, s, Connection::Client(conn), Some(servername.to_string()))
}

/// Attaches a server-side TLS layer atop an accepted TCP handle.
pub fn attach_accept(rt: &Runtime, s: Handle, ctx: &ServerContext) -> Result<Handle, Fail> {
    let conn = ServerConnection::new(ctx.config.clone()).map_err(map_tls_error)?;
    make_sock(rt, s, Connection::Server(conn), None)
}

/// One-shot server attach; builds a context and wraps the handle.
pub fn attach_server(
    rt: &Runtime,
    s: Handle,
    cfg: &TlsConfig,
    kps: &[Keypair],
    ca: Option<&CertAuthority>,
    alpn: Option<&[&str]>,
) -> Result<Handle, Fail> {
    let ctx = server_context(cfg, kps, ca, alpn)?;
    attach_accept(rt, s, &ctx)
}

/// Runs the handshake to completion. Send and receive do this implicitly.
pub async fn handshake(rt: &Runtime, h: Handle, deadline: Deadline) -> Result<(), Fail> {
    let object = rt.object(h)?;
    let sock = downcast(&object)?;
    sock.complete_handshake(deadline).await
}

/// Detaches the TLS layer after a bounded close-notify exchange, returning
/// the underlying TCP handle.
pub async fn detach(rt: &Runtime, h: Handle, deadline: Deadline) -> Result<Handle, Fail> {
    let object = rt.object(h)?;
    let sock = downcast(&object)?;
    sock.queue_close_notify();
    sock.flush_tls(deadline).await?;
    let underlying = match sock.s.take() {
        Some(underlying) => underlying,
        None => return Err(Fail::BadHandle {}),
    };
    let kept = rt.hdup(underlying)?;
    sock.s.set(Some(underlying));
    drop(object);
    rt.hclose(h)?;
    Ok(kept)
}

fn downcast(object: &Rc<dyn SocketObject>) -> Result<&TlsSock, Fail> {
    object
        .as_any()
        .downcast_ref::<TlsSock>()
        .ok_or(Fail::NotSupported {
            details: "not a tls socket",
        })
}

//==============================================================================
// Query surface
//==============================================================================

/// Returns true when the peer presented a certificate.
pub fn peer_cert_provided(rt: &Runtime, h: Handle) -> Result<bool, Fail> {
    let object = rt.object(h)?;
    let sock = downcast(&object)?;
    Ok(sock.peer_der().is_some())
}

/// SHA-256 digest of the peer certificate, `SHA256:<hex>`.
pub fn peer_cert_hash(rt: &Runtime, h: Handle) -> Result<Option<String>, Fail> {
    let object = rt.object(h)?;
    let sock = downcast(&object)?;
    Ok(sock.peer_der().map(|der| {
        let digest = Sha256::digest(&der);
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        format!("SHA256:{}", hex)
    }))
}

/// Issuer of the peer certificate.
pub fn peer_cert_issuer(rt: &Runtime, h: Handle) -> Result<Option<String>, Fail> {
    let object = rt.object(h)?;
    let sock = downcast(&object)?;
    Ok(sock
        .peer_der()
        .and_then(|der| parse_x509_certificate(&der).ok().map(|(_, c)| c.issuer().to_string())))
}

/// Subject of the peer certificate.
pub fn peer_cert_subject(rt: &Runtime, h: Handle) -> Result<Option<String>, Fail> {
    let object = rt.object(h)?;
    let sock = downcast(&object)?;
    Ok(sock
        .peer_der()
        .and_then(|der| parse_x509_certificate(&der).ok().map(|(_, c)| c.subject().to_string())))
}

/// Start of the peer certificate's validity, seconds since the epoch.
pub fn peer_cert_not_before(rt: &Runtime, h: Handle) -> Result<Option<i64>, Fail> {
    let object = rt.object(h)?;
    let sock = downcast(&object)?;
    Ok(sock.peer_der().and_then(|der| {
        parse_x509_certificate(&der)
            .ok()
            .map(|(_, c)| c.validity().not_before.timestamp())
    }))
}

/// End of the peer certificate's validity, seconds since the epoch.
pub fn peer_cert_not_after(rt: &Runtime, h: Handle) -> Result<Option<i64>, Fail> {
    let object = rt.object(h)?;
    let sock = downcast(&object)?;
    Ok(sock.peer_der().and_then(|der| {
        parse_x509_certificate(&der)
            .ok()
            .map(|(_, c)| c.validity().not_after.timestamp())
    }))
}

/// Checks the peer certificate's common name and DNS SANs for `name`,
/// honoring leftmost wildcards.
pub fn peer_cert_contains_name(rt: &Runtime, h: Handle, name: &str) -> Result<bool, Fail> {
    let object = rt.object(h)?;
    let sock = downcast(&object)?;
    let der = match sock.peer_der() {
        Some(der) => der,
        None => return Ok(false),
    };
    let cert = match parse_x509_certificate(&der) {
        Ok((_, cert)) => cert,
        Err(_) => return Ok(false),
    };
    for attr in cert.subject().iter_common_name() {
        if let Ok(cn) = attr.as_str() {
            if name_matches(cn, name) {
                return Ok(true);
            }
        }
    }
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for general_name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = general_name {
                if name_matches(dns, name) {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

fn name_matches(pattern: &str, name: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        match name.split_once('.') {
            Some((_, rest)) => rest.eq_ignore_ascii_case(suffix),
            None => false,
        }
    } else {
        pattern.eq_ignore_ascii_case(name)
    }
}

/// ALPN protocol selected during the handshake.
pub fn alpn_selected(rt: &Runtime, h: Handle) -> Result<Option<String>, Fail> {
    let object = rt.object(h)?;
    let sock = downcast(&object)?;
    let conn = sock.conn.borrow();
    Ok(conn
        .alpn_protocol()
        .map(|p| String::from_utf8_lossy(p).into_owned()))
}

/// Negotiated cipher suite name.
pub fn cipher(rt: &Runtime, h: Handle) -> Result<Option<String>, Fail> {
    let object = rt.object(h)?;
    let sock = downcast(&object)?;
    let conn = sock.conn.borrow();
    Ok(conn
        .negotiated_cipher_suite()
        .map(|s| format!("{:?}", s.suite())))
}

/// Negotiated protocol version.
pub fn version(rt: &Runtime, h: Handle) -> Result<Option<String>, Fail> {
    let object = rt.object(h)?;
    let sock = downcast(&object)?;
    let conn = sock.conn.borrow();
    Ok(conn.protocol_version().map(|v| match v {
        ProtocolVersion::TLSv1_2 => "TLSv1.2".to_string(),
        ProtocolVersion::TLSv1_3 => "TLSv1.3".to_string(),
        other => format!("{:?}", other),
    }))
}

/// Server name this side targets (client) or received via SNI (server).
pub fn servername(rt: &Runtime, h: Handle) -> Result<Option<String>, Fail> {
    let object = rt.object(h)?;
    let sock = downcast(&object)?;
    if let Some(name) = &sock.servername {
        return Ok(Some(name.clone()));
    }
    let conn = sock.conn.borrow();
    match &*conn {
        Connection::Server(server) => Ok(server.server_name().map(|n| n.to_string())),
        Connection::Client(_) => Ok(None),
    }
}

//==============================================================================
// IO plumbing
//==============================================================================

/// Associate functions for [TlsSock].
impl TlsSock {
    fn peer_der(&self) -> Option<Vec<u8>> {
        let conn = self.conn.borrow();
        conn.peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.0.clone())
    }

    /// Queues the close-notify alert, once.
    fn queue_close_notify(&self) {
        if !self.notified.replace(true) {
            self.conn.borrow_mut().send_close_notify();
        }
    }

    /// Writes buffered TLS records to the fd until the engine is drained.
    async fn flush_tls(&self, deadline: Deadline) -> Result<(), Fail> {
        loop {
            let result = {
                let mut conn = self.conn.borrow_mut();
                if !conn.wants_write() {
                    return Ok(());
                }
                conn.write_tls(&mut FdIo(self.fd))
            };
            match result {
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.rt.wait_out(self.fd, deadline).await?
                }
                Err(_) => return Err(Fail::ConnectionReset {}),
            }
        }
    }

    /// Reads at least one TLS record from the fd and processes it.
    async fn read_more_tls(&self, deadline: Deadline) -> Result<(), Fail> {
        loop {
            let result = {
                let mut conn = self.conn.borrow_mut();
                conn.read_tls(&mut FdIo(self.fd))
            };
            match result {
                Ok(0) => return Err(Fail::Pipe {}),
                Ok(_) => {
                    let mut conn = self.conn.borrow_mut();
                    conn.process_new_packets().map_err(map_tls_error)?;
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.rt.wait_in(self.fd, deadline).await?
                }
                Err(_) => return Err(Fail::ConnectionReset {}),
            }
        }
    }

    /// Drives the handshake until the engine reports completion.
    async fn complete_handshake(&self, deadline: Deadline) -> Result<(), Fail> {
        loop {
            let (handshaking, wants_write) = {
                let conn = self.conn.borrow();
                (conn.is_handshaking(), conn.wants_write())
            };
            if wants_write {
                self.flush_tls(deadline).await?;
                continue;
            }
            if !handshaking {
                return Ok(());
            }
            self.read_more_tls(deadline).await?;
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// SocketObject trait implementation for [TlsSock].
#[async_trait(?Send)]
impl SocketObject for TlsSock {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_stream(&self) -> Option<&dyn StreamSocket> {
        Some(self)
    }

    async fn done(&self, deadline: Deadline) -> Result<(), Fail> {
        self.queue_close_notify();
        self.flush_tls(deadline).await
    }

    fn close(&self) {
        // Best-effort close-notify; the fd may be unwritable, in which case
        // the alert is dropped with the connection.
        self.queue_close_notify();
        {
            let mut conn = self.conn.borrow_mut();
            while conn.wants_write() {
                if conn.write_tls(&mut FdIo(self.fd)).is_err() {
                    break;
                }
            }
        }
        if let Some(s) = self.s.take() {
            let _ = self.rt.hclose(s);
        }
    }
}

/// StreamSocket trait implementation for [TlsSock].
#[async_trait(?Send)]
impl StreamSocket for TlsSock {
    async fn bsendl(&self, iol: &[&[u8]], deadline: Deadline) -> Result<(), Fail> {
        self.complete_handshake(deadline).await?;
        {
            let mut conn = self.conn.borrow_mut();
            for seg in iol {
                conn.writer().write_all(seg).map_err(|_| Fail::Protocol {
                    details: "tls plaintext write",
                })?;
            }
        }
        self.flush_tls(deadline).await
    }

    async fn brecvl(&self, iol: &mut [&mut [u8]], deadline: Deadline) -> Result<(), Fail> {
        self.complete_handshake(deadline).await?;
        let total = iol::len_mut(iol);
        let mut pos = 0;
        while pos < total {
            let result = {
                let mut conn = self.conn.borrow_mut();
                let target = match iol::tail_at(iol, pos) {
                    Some(target) => target,
                    None => break,
                };
                conn.reader().read(target)
            };
            match result {
                Ok(0) => return Err(Fail::Pipe {}),
                Ok(sz) => pos += sz,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.read_more_tls(deadline).await?
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(Fail::ConnectionReset {})
                }
                Err(_) => {
                    return Err(Fail::Protocol {
                        details: "tls plaintext read",
                    })
                }
            }
        }
        Ok(())
    }
}

/// Read trait implementation for [FdIo].
impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        nix::unistd::read(self.0, buf).map_err(nix_to_io)
    }
}

/// Write trait implementation for [FdIo].
impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        nix::unistd::write(self.0, buf).map_err(nix_to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn nix_to_io(error: nix::Error) -> io::Error {
    match error {
        nix::Error::Sys(errno) => io::Error::from_raw_os_error(errno as i32),
        _ => io::Error::new(io::ErrorKind::Other, "system call failure"),
    }
}

/// ServerCertVerifier trait implementation for [LenientVerifier].
impl ServerCertVerifier for LenientVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: SystemTime,
    ) -> Result<ServerCertVerified, TlsError> {
        if !self.verify_cert {
            return Ok(ServerCertVerified::assertion());
        }
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            scts,
            ocsp_response,
            now,
        ) {
            Err(TlsError::InvalidCertificate(CertificateError::NotValidForName))
                if !self.verify_name =>
            {
                Ok(ServerCertVerified::assertion())
            }
            Err(TlsError::InvalidCertificate(
                CertificateError::Expired | CertificateError::NotValidYet,
            )) if !self.verify_time => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }
}

/// Default trait implementation for [TlsConfig].
impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            protocols: Protocols {
                v1_2: true,
                v1_3: true,
            },
            dhe: DheParams::None,
            curve: EcdheCurve::Auto,
            ciphers: CipherSet::Secure,
            verify_depth: 6,
            prefer_server_ciphers: true,
            verify_cert: true,
            verify_name: true,
            verify_time: true,
            verify_client: ClientVerify::None,
            clear_keys: true,
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    #[test]
    fn wildcard_names_match_one_label() {
        assert!(super::name_matches("*.example.org", "a.example.org"));
        assert!(!super::name_matches("*.example.org", "example.org"));
        assert!(super::name_matches("Example.Org", "example.org"));
    }
}
