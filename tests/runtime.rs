// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use catstack::{Fail, Runtime};
use std::{cell::RefCell, rc::Rc, time::Duration};

mod common;

//==============================================================================
// Timers
//==============================================================================

/// Tests that sleepers wake in deadline order on the virtual clock.
#[test]
fn sleepers_wake_in_order() {
    common::init();
    let rt = Runtime::with_virtual_clock();
    let rt2 = rt.clone();
    rt.run(async move {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut workers = Vec::new();
        for delay in [30u64, 10, 20] {
            let rt = rt2.clone();
            let order = order.clone();
            workers.push(rt2.spawn(async move {
                let deadline = Some(rt.now() + Duration::from_millis(delay));
                rt.msleep(deadline).await.unwrap();
                order.borrow_mut().push(delay);
            }));
        }
        rt2.msleep(Some(rt2.now() + Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(*order.borrow(), vec![10, 20, 30]);
        drop(workers);
    });
}

/// Tests that a missed deadline reports Timedout without breaking the
/// channel.
#[test]
fn deadline_expiry_is_not_fatal() {
    common::init();
    let rt = Runtime::with_virtual_clock();
    let rt2 = rt.clone();
    rt.run(async move {
        let ch = rt2.chmake::<u8>(1);
        let deadline = Some(rt2.now() + Duration::from_millis(10));
        assert_eq!(rt2.chrecv::<u8>(ch, deadline).await, Err(Fail::Timedout {}));
        // The channel still works.
        rt2.chsend(ch, 7u8, None).await.unwrap();
        assert_eq!(rt2.chrecv::<u8>(ch, None).await.unwrap(), 7);
        rt2.hclose(ch).unwrap();
    });
}

//==============================================================================
// Cancellation
//==============================================================================

/// Tests that dropping a task handle cancels the coroutine at its
/// suspension point.
#[test]
fn drop_cancels_a_sleeping_task() {
    common::init();
    let rt = Runtime::with_virtual_clock();
    let rt2 = rt.clone();
    rt.run(async move {
        let finished = Rc::new(RefCell::new(false));
        let worker = rt2.spawn({
            let rt = rt2.clone();
            let finished = finished.clone();
            async move {
                // Sleeps until canceled.
                let _ = rt.msleep(None).await;
                *finished.borrow_mut() = true;
            }
        });
        rt2.yield_now().await;
        assert!(!worker.has_completed());
        drop(worker);
        rt2.yield_now().await;
        assert!(!*finished.borrow());
    });
}

/// Tests that a canceled receiver releases its slot in the rendezvous
/// queue.
#[test]
fn canceled_receiver_leaves_channel_clean() {
    common::init();
    let rt = Runtime::with_virtual_clock();
    let rt2 = rt.clone();
    rt.run(async move {
        let ch = rt2.chmake::<u8>(0);
        let parked = rt2.spawn({
            let rt = rt2.clone();
            async move {
                let _ = rt.chrecv::<u8>(ch, None).await;
                unreachable!();
            }
        });
        rt2.yield_now().await;
        drop(parked);
        // The send must pair with a live receiver, not the canceled one.
        let deadline = Some(rt2.now() + Duration::from_millis(10));
        assert_eq!(rt2.chsend(ch, 1u8, deadline).await, Err(Fail::Timedout {}));
        rt2.hclose(ch).unwrap();
    });
}

//==============================================================================
// Scheduling
//==============================================================================

/// Tests that yielding tasks interleave in ready-queue order.
#[test]
fn yield_interleaves_fairly() {
    common::init();
    let rt = Runtime::with_virtual_clock();
    let rt2 = rt.clone();
    rt.run(async move {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let mut workers = Vec::new();
        for id in 0..2u8 {
            let rt = rt2.clone();
            let trace = trace.clone();
            workers.push(rt2.spawn(async move {
                for round in 0..3u8 {
                    trace.borrow_mut().push((id, round));
                    rt.yield_now().await;
                }
            }));
        }
        rt2.msleep(Some(rt2.now() + Duration::from_millis(5)))
            .await
            .unwrap();
        assert_eq!(
            *trace.borrow(),
            vec![(0, 0), (1, 0), (0, 1), (1, 1), (0, 2), (1, 2)]
        );
        drop(workers);
    });
}
