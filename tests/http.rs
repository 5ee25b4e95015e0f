// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use catstack::{layers::http, transport::tcp, Fail, Runtime};

mod common;

//==============================================================================
// Request / response exchange
//==============================================================================

/// Tests a request, header fields and a status line across a connection.
#[test]
fn http_exchange() {
    common::init();
    let rt = Runtime::new();
    let rt2 = rt.clone();
    rt.run(async move {
        let listener = tcp::listen(&rt2, "127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = tcp::local_addr(&rt2, listener).unwrap();
        let server = rt2.spawn({
            let rt = rt2.clone();
            async move {
                let conn = tcp::accept(&rt, listener, None).await.unwrap();
                let h = http::attach(&rt, conn).unwrap();
                let (method, resource) = http::recvrequest(&rt, h, None).await.unwrap();
                assert_eq!(method, "GET");
                assert_eq!(resource, "/x");
                let (name, value) = http::recvfield(&rt, h, None).await.unwrap();
                assert_eq!(name, "Host");
                assert_eq!(value, "example.org");
                http::sendstatus(&rt, h, 200, "OK", None).await.unwrap();
                http::sendfield(&rt, h, "Content-Length", "0", None)
                    .await
                    .unwrap();
            }
        });
        let conn = tcp::connect(&rt2, addr, None).await.unwrap();
        let h = http::attach(&rt2, conn).unwrap();
        http::sendrequest(&rt2, h, "GET", "/x", None).await.unwrap();
        http::sendfield(&rt2, h, "Host", "  example.org ", None)
            .await
            .unwrap();
        let (status, reason) = http::recvstatus(&rt2, h, None).await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(reason, "OK");
        let (name, value) = http::recvfield(&rt2, h, None).await.unwrap();
        assert_eq!(name, "Content-Length");
        assert_eq!(value, "0");
        while !server.has_completed() {
            rt2.yield_now().await;
        }
        rt2.hclose(h).unwrap();
        rt2.hclose(listener).unwrap();
    });
}

//==============================================================================
// Validation
//==============================================================================

/// Tests send-side validation: spaces in tokens, status range, field name
/// charset, empty values.
#[test]
fn http_send_validation() {
    common::init();
    let rt = Runtime::new();
    let rt2 = rt.clone();
    rt.run(async move {
        let listener = tcp::listen(&rt2, "127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = tcp::local_addr(&rt2, listener).unwrap();
        let server = rt2.spawn({
            let rt = rt2.clone();
            async move {
                let _conn = tcp::accept(&rt, listener, None).await.unwrap();
                let _ = rt.msleep(None).await;
            }
        });
        let conn = tcp::connect(&rt2, addr, None).await.unwrap();
        let h = http::attach(&rt2, conn).unwrap();
        assert!(matches!(
            http::sendrequest(&rt2, h, "GET IT", "/x", None).await,
            Err(Fail::Invalid { .. })
        ));
        assert!(matches!(
            http::sendstatus(&rt2, h, 99, "nope", None).await,
            Err(Fail::Invalid { .. })
        ));
        assert!(matches!(
            http::sendfield(&rt2, h, "Bad:Name", "x", None).await,
            Err(Fail::Protocol { .. })
        ));
        assert!(matches!(
            http::sendfield(&rt2, h, "Name", "   ", None).await,
            Err(Fail::Protocol { .. })
        ));
        drop(server);
        rt2.hclose(h).unwrap();
        rt2.hclose(listener).unwrap();
    });
}

/// Tests that a malformed peer line latches the receive direction.
#[test]
fn http_recv_latches_parse_errors() {
    common::init();
    let rt = Runtime::new();
    let rt2 = rt.clone();
    rt.run(async move {
        let listener = tcp::listen(&rt2, "127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = tcp::local_addr(&rt2, listener).unwrap();
        let server = rt2.spawn({
            let rt = rt2.clone();
            async move {
                let conn = tcp::accept(&rt, listener, None).await.unwrap();
                rt.bsend(conn, b"GET /x SPDY/9\r\nGET /y HTTP/1.1\r\n", None)
                    .await
                    .unwrap();
                let mut eof = [0u8; 1];
                let _ = rt.brecv(conn, &mut eof, None).await;
            }
        });
        let conn = tcp::connect(&rt2, addr, None).await.unwrap();
        let h = http::attach(&rt2, conn).unwrap();
        assert!(matches!(
            http::recvrequest(&rt2, h, None).await,
            Err(Fail::Protocol { .. })
        ));
        // Sticky: the well-formed second line is never looked at.
        assert!(matches!(
            http::recvrequest(&rt2, h, None).await,
            Err(Fail::Protocol { .. })
        ));
        drop(server);
        rt2.hclose(h).unwrap();
        rt2.hclose(listener).unwrap();
    });
}
