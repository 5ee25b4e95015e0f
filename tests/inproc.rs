// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use catstack::{transport::inproc, Fail, Runtime};

mod common;

//==============================================================================
// Send & Receive
//==============================================================================

/// Tests if a message crosses an in-process pair intact.
#[test]
fn inproc_send_recv() {
    common::init();
    let rt = Runtime::new();
    let rt2 = rt.clone();
    rt.run(async move {
        let (a, b) = inproc::pair(&rt2).unwrap();
        let sender = rt2.spawn({
            let rt = rt2.clone();
            async move {
                rt.msend(a, b"hello", None).await.unwrap();
            }
        });
        let mut buf = [0u8; 5];
        let sz = rt2.mrecv(b, &mut buf, None).await.unwrap();
        assert_eq!(sz, 5);
        assert_eq!(&buf, b"hello");
        drop(sender);
        rt2.hclose(a).unwrap();
        rt2.hclose(b).unwrap();
    });
}

/// Tests that a scatter list reassembles into the same bytes.
#[test]
fn inproc_scatter_gather() {
    common::init();
    let rt = Runtime::new();
    let rt2 = rt.clone();
    rt.run(async move {
        let (a, b) = inproc::pair(&rt2).unwrap();
        let sender = rt2.spawn({
            let rt = rt2.clone();
            async move {
                let iol: [&[u8]; 3] = [b"foo", b"ba", b"r"];
                rt.msendl(a, &iol, None).await.unwrap();
            }
        });
        let mut first = [0u8; 4];
        let mut second = [0u8; 2];
        let mut iol: [&mut [u8]; 2] = [&mut first, &mut second];
        let sz = rt2.mrecvl(b, &mut iol, None).await.unwrap();
        assert_eq!(sz, 6);
        assert_eq!(&first, b"foob");
        assert_eq!(&second, b"ar");
        drop(sender);
        rt2.hclose(a).unwrap();
        rt2.hclose(b).unwrap();
    });
}

/// Tests that an oversized message fails with MessageTooLong on both sides
/// and leaves the stream usable.
#[test]
fn inproc_oversized_message() {
    common::init();
    let rt = Runtime::new();
    let rt2 = rt.clone();
    rt.run(async move {
        let (a, b) = inproc::pair(&rt2).unwrap();
        let sender = rt2.spawn({
            let rt = rt2.clone();
            async move {
                let big = [0u8; 100];
                assert_eq!(
                    rt.msend(a, &big, None).await,
                    Err(Fail::MessageTooLong {})
                );
                rt.msend(a, b"ok", None).await.unwrap();
            }
        });
        let mut buf = [0u8; 50];
        assert_eq!(
            rt2.mrecv(b, &mut buf, None).await,
            Err(Fail::MessageTooLong {})
        );
        // The next receive still works.
        let sz = rt2.mrecv(b, &mut buf, None).await.unwrap();
        assert_eq!(sz, 2);
        assert_eq!(&buf[..2], b"ok");
        drop(sender);
        rt2.hclose(a).unwrap();
        rt2.hclose(b).unwrap();
    });
}

//==============================================================================
// Handles
//==============================================================================

/// Tests that a duplicated handle keeps the object alive across a close of
/// the original, and that the dead id is refused afterwards.
#[test]
fn handle_duplication() {
    common::init();
    let rt = Runtime::new();
    let rt2 = rt.clone();
    rt.run(async move {
        let (a, b) = inproc::pair(&rt2).unwrap();
        let a2 = rt2.hdup(a).unwrap();
        rt2.hclose(a).unwrap();
        // The duplicate still sends.
        let sender = rt2.spawn({
            let rt = rt2.clone();
            async move {
                rt.msend(a2, b"x", None).await.unwrap();
            }
        });
        let mut buf = [0u8; 1];
        assert_eq!(rt2.mrecv(b, &mut buf, None).await.unwrap(), 1);
        drop(sender);
        // The closed id is dead.
        assert_eq!(rt2.msend(a, b"y", None).await, Err(Fail::BadHandle {}));
        rt2.hclose(a2).unwrap();
        assert_eq!(rt2.hclose(a2), Err(Fail::BadHandle {}));
        rt2.hclose(b).unwrap();
    });
}

/// Tests that hdone signals end-of-stream to the peer.
#[test]
fn inproc_done_pipes_peer() {
    common::init();
    let rt = Runtime::new();
    let rt2 = rt.clone();
    rt.run(async move {
        let (a, b) = inproc::pair(&rt2).unwrap();
        rt2.hdone(a, None).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(rt2.mrecv(b, &mut buf, None).await, Err(Fail::Pipe {}));
        rt2.hclose(a).unwrap();
        rt2.hclose(b).unwrap();
    });
}
