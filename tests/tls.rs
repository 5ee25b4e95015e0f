// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use catstack::{
    layers::tls::{self, CertAuthority, Keypair, TlsConfig},
    transport::tcp,
    Runtime,
};

mod common;

fn test_identity() -> (Keypair, CertAuthority) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_pem = cert.serialize_pem().unwrap();
    let key_pem = cert.serialize_private_key_pem();
    (
        Keypair::new(cert_pem.clone().into_bytes(), key_pem.into_bytes()),
        CertAuthority::from_mem(cert_pem.as_bytes()),
    )
}

//==============================================================================
// Handshake & data
//==============================================================================

/// Tests an encrypted echo with certificate verification against the test
/// authority, plus the connection query surface.
#[test]
fn tls_echo_with_verification() {
    common::init();
    let (keypair, authority) = test_identity();
    let rt = Runtime::new();
    let rt2 = rt.clone();
    rt.run(async move {
        let listener = tcp::listen(&rt2, "127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = tcp::local_addr(&rt2, listener).unwrap();
        let ctx =
            tls::server_context(&TlsConfig::default(), &[keypair], None, Some(&["echo/1"]))
                .unwrap();
        let server = rt2.spawn({
            let rt = rt2.clone();
            async move {
                let conn = tcp::accept(&rt, listener, None).await.unwrap();
                let secured = tls::attach_accept(&rt, conn, &ctx).unwrap();
                let mut buf = [0u8; 4];
                rt.brecv(secured, &mut buf, None).await.unwrap();
                rt.bsend(secured, &buf, None).await.unwrap();
                let mut eof = [0u8; 1];
                let _ = rt.brecv(secured, &mut eof, None).await;
            }
        });
        let conn = tcp::connect(&rt2, addr, None).await.unwrap();
        let secured = tls::attach_client(
            &rt2,
            conn,
            &TlsConfig::default(),
            Some(&authority),
            Some(&["echo/1"]),
            "localhost",
        )
        .unwrap();
        rt2.bsend(secured, b"ping", None).await.unwrap();
        let mut buf = [0u8; 4];
        rt2.brecv(secured, &mut buf, None).await.unwrap();
        assert_eq!(&buf, b"ping");

        // Query surface.
        assert!(tls::peer_cert_provided(&rt2, secured).unwrap());
        assert!(tls::peer_cert_contains_name(&rt2, secured, "localhost").unwrap());
        assert!(tls::peer_cert_hash(&rt2, secured)
            .unwrap()
            .unwrap()
            .starts_with("SHA256:"));
        assert!(tls::version(&rt2, secured).unwrap().is_some());
        assert!(tls::cipher(&rt2, secured).unwrap().is_some());
        assert_eq!(
            tls::alpn_selected(&rt2, secured).unwrap().as_deref(),
            Some("echo/1")
        );
        assert_eq!(
            tls::servername(&rt2, secured).unwrap().as_deref(),
            Some("localhost")
        );
        let not_before = tls::peer_cert_not_before(&rt2, secured).unwrap().unwrap();
        let not_after = tls::peer_cert_not_after(&rt2, secured).unwrap().unwrap();
        assert!(not_before < not_after);

        drop(server);
        rt2.hclose(secured).unwrap();
        rt2.hclose(listener).unwrap();
    });
}

/// Tests that disabling certificate verification connects without any
/// trust anchors, and that an explicit handshake works before any data.
#[test]
fn tls_no_verify_and_explicit_handshake() {
    common::init();
    let (keypair, _authority) = test_identity();
    let rt = Runtime::new();
    let rt2 = rt.clone();
    rt.run(async move {
        let listener = tcp::listen(&rt2, "127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = tcp::local_addr(&rt2, listener).unwrap();
        let ctx = tls::server_context(&TlsConfig::default(), &[keypair], None, None).unwrap();
        let server = rt2.spawn({
            let rt = rt2.clone();
            async move {
                let conn = tcp::accept(&rt, listener, None).await.unwrap();
                let secured = tls::attach_accept(&rt, conn, &ctx).unwrap();
                let mut buf = [0u8; 2];
                rt.brecv(secured, &mut buf, None).await.unwrap();
                rt.bsend(secured, &buf, None).await.unwrap();
                let mut eof = [0u8; 1];
                let _ = rt.brecv(secured, &mut eof, None).await;
            }
        });
        let conn = tcp::connect(&rt2, addr, None).await.unwrap();
        let config = TlsConfig {
            verify_cert: false,
            ..TlsConfig::default()
        };
        let secured = tls::attach_client(&rt2, conn, &config, None, None, "localhost").unwrap();
        tls::handshake(&rt2, secured, None).await.unwrap();
        rt2.bsend(secured, b"ok", None).await.unwrap();
        let mut buf = [0u8; 2];
        rt2.brecv(secured, &mut buf, None).await.unwrap();
        assert_eq!(&buf, b"ok");
        drop(server);
        rt2.hclose(secured).unwrap();
        rt2.hclose(listener).unwrap();
    });
}
