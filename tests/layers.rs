// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use catstack::{
    layers::{crlf, keepalive, lz4, mthrottler, nacl},
    transport::{inproc, tcp},
    Fail, Runtime,
};
use std::{cell::Cell, rc::Rc, time::Duration};

mod common;

//==============================================================================
// NaCl
//==============================================================================

/// Tests the NaCl frame layout: 24-byte nonce, 16-byte tag, payload.
#[test]
fn nacl_frame_layout() {
    common::init();
    let rt = Runtime::new();
    let rt2 = rt.clone();
    rt.run(async move {
        let (a, b) = inproc::pair(&rt2).unwrap();
        let key = [0u8; 32];
        let sealed = nacl::attach(&rt2, a, &key).unwrap();
        let sender = rt2.spawn({
            let rt = rt2.clone();
            async move {
                rt.msend(sealed, b"abc", None).await.unwrap();
            }
        });
        let mut frame = [0u8; 64];
        let sz = rt2.mrecv(b, &mut frame, None).await.unwrap();
        // nonce(24) + tag(16) + payload(3)
        assert_eq!(sz, 43);
        drop(sender);
        rt2.hclose(sealed).unwrap();
        rt2.hclose(b).unwrap();
    });
}

/// Tests an encrypted round trip and that a single tampered bit fails
/// authentication.
#[test]
fn nacl_roundtrip_and_tamper() {
    common::init();
    let rt = Runtime::new();
    let rt2 = rt.clone();
    rt.run(async move {
        let (a, b) = inproc::pair(&rt2).unwrap();
        let key = [7u8; 32];
        let sealed = nacl::attach(&rt2, a, &key).unwrap();

        // Round trip through the raw side and back.
        let relay = rt2.spawn({
            let rt = rt2.clone();
            async move {
                let mut frame = [0u8; 64];
                let sz = rt.mrecv(b, &mut frame, None).await.unwrap();
                // Echo the frame untouched: it must authenticate.
                rt.msend(b, &frame[..sz], None).await.unwrap();
                // Then echo it with one flipped payload bit.
                let mut tampered = frame;
                tampered[sz - 1] ^= 0x01;
                rt.msend(b, &tampered[..sz], None).await.unwrap();
            }
        });
        rt2.msend(sealed, b"abc", None).await.unwrap();
        let mut buf = [0u8; 16];
        let sz = rt2.mrecv(sealed, &mut buf, None).await.unwrap();
        assert_eq!(&buf[..sz], b"abc");
        assert_eq!(
            rt2.mrecv(sealed, &mut buf, None).await,
            Err(Fail::AccessDenied {})
        );
        drop(relay);
        rt2.hclose(sealed).unwrap();
    });
}

/// Tests that a short key is refused.
#[test]
fn nacl_rejects_short_key() {
    common::init();
    let rt = Runtime::new();
    let (a, b) = inproc::pair(&rt).unwrap();
    assert!(matches!(
        nacl::attach(&rt, a, b"short"),
        Err(Fail::Invalid { .. })
    ));
    rt.hclose(a).unwrap();
    rt.hclose(b).unwrap();
}

//==============================================================================
// LZ4
//==============================================================================

/// Tests a compressed round trip over the in-process pair.
#[test]
fn lz4_roundtrip() {
    common::init();
    let rt = Runtime::new();
    let rt2 = rt.clone();
    rt.run(async move {
        let (a, b) = inproc::pair(&rt2).unwrap();
        let zipped_a = lz4::attach(&rt2, a).unwrap();
        let zipped_b = lz4::attach(&rt2, b).unwrap();
        let message = b"round and round and round it goes".repeat(8);
        let expected = message.clone();
        let sender = rt2.spawn({
            let rt = rt2.clone();
            async move {
                rt.msend(zipped_a, &message, None).await.unwrap();
            }
        });
        let mut buf = vec![0u8; expected.len()];
        let sz = rt2.mrecv(zipped_b, &mut buf, None).await.unwrap();
        assert_eq!(sz, expected.len());
        assert_eq!(buf, expected);
        drop(sender);
        rt2.hclose(zipped_a).unwrap();
        rt2.hclose(zipped_b).unwrap();
    });
}

/// Tests that an empty message survives the compression round trip.
#[test]
fn lz4_empty_message() {
    common::init();
    let rt = Runtime::new();
    let rt2 = rt.clone();
    rt.run(async move {
        let (a, b) = inproc::pair(&rt2).unwrap();
        let zipped_a = lz4::attach(&rt2, a).unwrap();
        let zipped_b = lz4::attach(&rt2, b).unwrap();
        let sender = rt2.spawn({
            let rt = rt2.clone();
            async move {
                rt.msend(zipped_a, b"", None).await.unwrap();
            }
        });
        let mut buf = [0u8; 8];
        let sz = rt2.mrecv(zipped_b, &mut buf, None).await.unwrap();
        assert_eq!(sz, 0);
        drop(sender);
        rt2.hclose(zipped_a).unwrap();
        rt2.hclose(zipped_b).unwrap();
    });
}

/// Tests that a declared size larger than the receive buffer fails with
/// MessageTooLong and leaves the stream usable.
#[test]
fn lz4_oversized_message() {
    common::init();
    let rt = Runtime::new();
    let rt2 = rt.clone();
    rt.run(async move {
        let (a, b) = inproc::pair(&rt2).unwrap();
        let zipped_a = lz4::attach(&rt2, a).unwrap();
        let zipped_b = lz4::attach(&rt2, b).unwrap();
        let sender = rt2.spawn({
            let rt = rt2.clone();
            async move {
                rt.msend(zipped_a, &[0u8; 100], None).await.unwrap();
                rt.msend(zipped_a, b"ok", None).await.unwrap();
            }
        });
        let mut small = [0u8; 50];
        assert_eq!(
            rt2.mrecv(zipped_b, &mut small, None).await,
            Err(Fail::MessageTooLong {})
        );
        let sz = rt2.mrecv(zipped_b, &mut small, None).await.unwrap();
        assert_eq!(&small[..sz], b"ok");
        drop(sender);
        rt2.hclose(zipped_a).unwrap();
        rt2.hclose(zipped_b).unwrap();
    });
}

//==============================================================================
// CRLF
//==============================================================================

/// Tests line framing over TCP, including an embedded bare carriage return.
#[test]
fn crlf_lines() {
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
                let lines = crlf::attach(&rt, conn).unwrap();
                let mut buf = [0u8; 32];
                let sz = rt.mrecv(lines, &mut buf, None).await.unwrap();
                rt.msend(lines, &buf[..sz], None).await.unwrap();
                let sz = rt.mrecv(lines, &mut buf, None).await.unwrap();
                rt.msend(lines, &buf[..sz], None).await.unwrap();
                // Hold until the peer is done reading.
                let _ = rt.mrecv(lines, &mut buf, None).await;
            }
        });
        let conn = tcp::connect(&rt2, addr, None).await.unwrap();
        let lines = crlf::attach(&rt2, conn).unwrap();
        rt2.msend(lines, b"plain line", None).await.unwrap();
        let mut buf = [0u8; 32];
        let sz = rt2.mrecv(lines, &mut buf, None).await.unwrap();
        assert_eq!(&buf[..sz], b"plain line");
        // A bare CR is data, not a terminator.
        rt2.msend(lines, b"split\rline", None).await.unwrap();
        let sz = rt2.mrecv(lines, &mut buf, None).await.unwrap();
        assert_eq!(&buf[..sz], b"split\rline");
        drop(server);
        rt2.hclose(lines).unwrap();
        rt2.hclose(listener).unwrap();
    });
}

//==============================================================================
// Keep-alive
//==============================================================================

/// Tests the keep-alive wire format: 'D' prefixes data, silent periods
/// carry 'K' pings, and a silent peer escalates into ConnectionReset.
#[test]
fn keepalive_pings_and_reset() {
    common::init();
    let rt = Runtime::new();
    let rt2 = rt.clone();
    rt.run(async move {
        let listener = tcp::listen(&rt2, "127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = tcp::local_addr(&rt2, listener).unwrap();
        let pings = Rc::new(Cell::new(0u32));
        let server = rt2.spawn({
            let rt = rt2.clone();
            let pings = pings.clone();
            async move {
                let conn = tcp::accept(&rt, listener, None).await.unwrap();
                let lines = crlf::attach(&rt, conn).unwrap();
                let mut buf = [0u8; 64];
                // First frame is user data.
                let sz = rt.mrecv(lines, &mut buf, None).await.unwrap();
                assert_eq!(&buf[..sz], b"Dhi");
                // Answer in kind, then fall silent and count pings.
                rt.msend(lines, b"Dyo", None).await.unwrap();
                while let Ok(sz) = rt.mrecv(lines, &mut buf, None).await {
                    if sz == 1 && buf[0] == b'K' {
                        pings.set(pings.get() + 1);
                    }
                }
            }
        });
        let conn = tcp::connect(&rt2, addr, None).await.unwrap();
        let lines = crlf::attach(&rt2, conn).unwrap();
        let guarded = keepalive::attach(
            &rt2,
            lines,
            Some(Duration::from_millis(50)),
            Some(Duration::from_millis(200)),
        )
        .unwrap();
        rt2.msend(guarded, b"hi", None).await.unwrap();
        let mut buf = [0u8; 16];
        let sz = rt2.mrecv(guarded, &mut buf, None).await.unwrap();
        assert_eq!(&buf[..sz], b"yo");
        // The server stays silent: the lapse latches ConnectionReset.
        let deadline = Some(rt2.now() + Duration::from_millis(500));
        assert_eq!(
            rt2.mrecv(guarded, &mut buf, deadline).await,
            Err(Fail::ConnectionReset {})
        );
        // Sticky: the latched error repeats.
        assert_eq!(
            rt2.mrecv(guarded, &mut buf, None).await,
            Err(Fail::ConnectionReset {})
        );
        // Meanwhile at least two pings crossed the wire.
        assert!(pings.get() >= 2, "saw {} pings", pings.get());
        drop(server);
        rt2.hclose(guarded).unwrap();
        rt2.hclose(listener).unwrap();
    });
}

//==============================================================================
// Message throttler
//==============================================================================

/// Tests that the message quota paces sends on the virtual clock.
#[test]
fn mthrottler_paces_messages() {
    common::init();
    let rt = Runtime::with_virtual_clock();
    let rt2 = rt.clone();
    rt.run(async move {
        let (a, b) = inproc::pair(&rt2).unwrap();
        // 100 messages per second, quota renewed every 100 ms.
        let throttled = mthrottler::attach(
            &rt2,
            a,
            100,
            Duration::from_millis(100),
            0,
            Duration::ZERO,
        )
        .unwrap();
        let drain = rt2.spawn({
            let rt = rt2.clone();
            async move {
                let mut buf = [0u8; 1];
                while rt.mrecv(b, &mut buf, None).await.is_ok() {}
            }
        });
        let start = rt2.now();
        for _ in 0..25 {
            rt2.msend(throttled, b"m", None).await.unwrap();
        }
        // 10 messages per window: the 25th lands in the third window.
        assert_eq!(rt2.now() - start, Duration::from_millis(200));
        drop(drain);
        rt2.hclose(throttled).unwrap();
        rt2.hclose(b).unwrap();
    });
}
