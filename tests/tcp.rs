// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use catstack::{
    transport::{tcp, udp},
    Fail, Runtime,
};
use std::time::Duration;

mod common;

//==============================================================================
// TCP
//==============================================================================

/// Tests an echo exchange over the loopback interface.
#[test]
fn tcp_echo() {
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
                let mut buf = [0u8; 5];
                rt.brecv(conn, &mut buf, None).await.unwrap();
                rt.bsend(conn, &buf, None).await.unwrap();
            }
        });
        let conn = tcp::connect(&rt2, addr, None).await.unwrap();
        rt2.bsend(conn, b"hello", None).await.unwrap();
        let mut buf = [0u8; 5];
        rt2.brecv(conn, &mut buf, None).await.unwrap();
        assert_eq!(&buf, b"hello");
        drop(server);
        rt2.hclose(conn).unwrap();
        rt2.hclose(listener).unwrap();
    });
}

/// Tests that a receive larger than the internal buffer arrives intact.
#[test]
fn tcp_large_transfer() {
    common::init();
    let rt = Runtime::new();
    let rt2 = rt.clone();
    rt.run(async move {
        let listener = tcp::listen(&rt2, "127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = tcp::local_addr(&rt2, listener).unwrap();
        let payload: Vec<u8> = (0..65536u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let server = rt2.spawn({
            let rt = rt2.clone();
            async move {
                let conn = tcp::accept(&rt, listener, None).await.unwrap();
                rt.bsend(conn, &payload, None).await.unwrap();
                // Hold the connection until the peer has read everything.
                let mut eof = [0u8; 1];
                let _ = rt.brecv(conn, &mut eof, None).await;
            }
        });
        let conn = tcp::connect(&rt2, addr, None).await.unwrap();
        let mut buf = vec![0u8; expected.len()];
        rt2.brecv(conn, &mut buf, None).await.unwrap();
        assert_eq!(buf, expected);
        rt2.hclose(conn).unwrap();
        drop(server);
        rt2.hclose(listener).unwrap();
    });
}

/// Tests that a receive deadline expires on a silent connection.
#[test]
fn tcp_recv_deadline() {
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
                // Stay silent but keep the connection up.
                let mut eof = [0u8; 1];
                let _ = rt.brecv(conn, &mut eof, None).await;
            }
        });
        let conn = tcp::connect(&rt2, addr, None).await.unwrap();
        let mut buf = [0u8; 1];
        let deadline = Some(rt2.now() + Duration::from_millis(50));
        assert_eq!(
            rt2.brecv(conn, &mut buf, deadline).await,
            Err(Fail::Timedout {})
        );
        drop(server);
        rt2.hclose(conn).unwrap();
        rt2.hclose(listener).unwrap();
    });
}

/// Tests that shutdown propagates as end-of-stream to the peer.
#[test]
fn tcp_done_signals_pipe() {
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
                rt.hdone(conn, None).await.unwrap();
                // Hold the socket open while the client observes EOF.
                let mut eof = [0u8; 1];
                let _ = rt.brecv(conn, &mut eof, None).await;
            }
        });
        let conn = tcp::connect(&rt2, addr, None).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(rt2.brecv(conn, &mut buf, None).await, Err(Fail::Pipe {}));
        drop(server);
        rt2.hclose(conn).unwrap();
        rt2.hclose(listener).unwrap();
    });
}

//==============================================================================
// UDP
//==============================================================================

/// Tests a datagram exchange, explicit destination one way and the sticky
/// remote the other.
#[test]
fn udp_exchange() {
    common::init();
    let rt = Runtime::new();
    let rt2 = rt.clone();
    rt.run(async move {
        let a = udp::open(&rt2, Some("127.0.0.1:0".parse().unwrap()), None).unwrap();
        let a_addr = udp::local_addr(&rt2, a).unwrap();
        let b = udp::open(&rt2, Some("127.0.0.1:0".parse().unwrap()), Some(a_addr)).unwrap();
        let b_addr = udp::local_addr(&rt2, b).unwrap();

        // Explicit destination.
        let iol: [&[u8]; 1] = [b"ping"];
        udp::sendl_to(&rt2, a, Some(b_addr), &iol).await.unwrap();
        let mut buf = [0u8; 16];
        let deadline = Some(rt2.now() + Duration::from_secs(2));
        let mut list: [&mut [u8]; 1] = [&mut buf];
        let (sz, from) = udp::recvl_from(&rt2, b, &mut list, deadline).await.unwrap();
        assert_eq!(sz, 4);
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(from, a_addr);

        // Sticky remote.
        rt2.msend(b, b"pong", None).await.unwrap();
        let mut buf = [0u8; 16];
        let sz = rt2.mrecv(a, &mut buf, deadline).await.unwrap();
        assert_eq!(sz, 4);
        assert_eq!(&buf[..4], b"pong");

        // No destination anywhere is an error.
        assert!(matches!(
            rt2.msend(a, b"nowhere", None).await,
            Err(Fail::Invalid { .. })
        ));

        rt2.hclose(a).unwrap();
        rt2.hclose(b).unwrap();
    });
}
