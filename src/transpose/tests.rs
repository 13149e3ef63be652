// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::HashSet;

use super::*;
use crate::constants::TRANSPOSE_BUFFERS_PER_PEER;

#[test]
fn all_expected_units_arrive_exactly_once() {
    // Ranks 0 and 1 each send three units to rank 2, interleaved across
    // threads; rank 2 must see each (peer, unit) exactly once, in some
    // order.
    let mut endpoints = fabric(3, 8);
    let e2 = endpoints.pop().unwrap();
    let e1 = endpoints.pop().unwrap();
    let e0 = endpoints.pop().unwrap();

    std::thread::scope(|scope| {
        for (mut endpoint, units) in [(e0, [0usize, 2, 4]), (e1, [1, 3, 5])] {
            scope.spawn(move || {
                for unit in units {
                    endpoint
                        .async_send(2, 7, unit, true, |payload| {
                            payload.fill(unit as f32);
                        })
                        .unwrap();
                }
                endpoint.wait_for_all_sends().unwrap();
            });
        }

        let mut receiver = e2;
        receiver.post_all_receives(
            7,
            &[(0, 0), (0, 2), (0, 4), (1, 1), (1, 3), (1, 5)],
        );
        let mut seen = HashSet::new();
        while receiver.nr_pending() > 0 {
            let received = receiver.wait_for_any_receive().unwrap();
            assert_eq!(received.block, 7);
            assert!(received.valid);
            assert_eq!(received.payload()[0], received.unit as f32);
            assert!(seen.insert((received.from, received.unit)));
        }
        assert_eq!(seen.len(), 6);
    });
}

#[test]
fn per_destination_order_is_fifo() {
    let mut endpoints = fabric(2, 4);
    let mut receiver = endpoints.pop().unwrap();
    let mut sender = endpoints.pop().unwrap();

    receiver.post_all_receives(0, &[(0, 10), (0, 11), (0, 12), (0, 13)]);
    std::thread::scope(|scope| {
        scope.spawn(move || {
            for unit in 10..14 {
                sender
                    .async_send(1, 0, unit, true, |payload| payload.fill(0.0))
                    .unwrap();
            }
        });

        // A single peer means completion order must equal send order.
        for expected in 10..14 {
            let received = receiver.wait_for_any_receive().unwrap();
            assert_eq!(received.unit, expected);
        }
    });
}

#[test]
fn pool_depth_allows_overlap_and_credits_return() {
    let mut endpoints = fabric(2, 4);
    let mut receiver = endpoints.pop().unwrap();
    let mut sender = endpoints.pop().unwrap();
    receiver.post_all_receives(0, &[(0, 0), (0, 1), (0, 2)]);

    // Two sends fit the pool without any receive having happened.
    for unit in 0..TRANSPOSE_BUFFERS_PER_PEER {
        sender
            .async_send(1, 0, unit, true, |p| p.fill(unit as f32))
            .unwrap();
    }

    // Consuming one receive frees a credit; the next send then proceeds
    // without a receiver thread.
    let received = receiver.wait_for_any_receive().unwrap();
    assert_eq!(received.unit, 0);
    drop(received);
    sender
        .async_send(1, 0, 2, true, |p| p.fill(2.0))
        .unwrap();

    for expected in 1..3 {
        let received = receiver.wait_for_any_receive().unwrap();
        assert_eq!(received.unit, expected);
    }
    sender.wait_for_all_sends().unwrap();
}

#[test]
fn unexpected_unit_is_fatal() {
    let mut endpoints = fabric(2, 4);
    let mut receiver = endpoints.pop().unwrap();
    let mut sender = endpoints.pop().unwrap();

    receiver.post_all_receives(0, &[(0, 0)]);
    sender
        .async_send(1, 0, 9, true, |p| p.fill(0.0))
        .unwrap();

    assert!(matches!(
        receiver.wait_for_any_receive(),
        Err(TransposeError::Unexpected { unit: 9, .. })
    ));
}

#[test]
fn wrong_block_is_fatal() {
    let mut endpoints = fabric(2, 4);
    let mut receiver = endpoints.pop().unwrap();
    let mut sender = endpoints.pop().unwrap();

    receiver.post_all_receives(5, &[(0, 0)]);
    sender
        .async_send(1, 4, 0, true, |p| p.fill(0.0))
        .unwrap();

    assert!(matches!(
        receiver.wait_for_any_receive(),
        Err(TransposeError::Unexpected { packet_block: 4, .. })
    ));
}

#[test]
fn hung_up_peer_is_fatal() {
    let mut endpoints = fabric(2, 4);
    let receiver = endpoints.pop().unwrap();
    let mut sender = endpoints.pop().unwrap();
    drop(receiver);

    assert!(matches!(
        sender.async_send(1, 0, 0, true, |p| p.fill(0.0)),
        Err(TransposeError::Disconnected { peer: 1, .. })
    ));
}

#[test]
fn invalid_marker_travels() {
    let mut endpoints = fabric(2, 4);
    let mut receiver = endpoints.pop().unwrap();
    let mut sender = endpoints.pop().unwrap();

    receiver.post_all_receives(0, &[(0, 0)]);
    sender
        .async_send(1, 0, 0, false, |p| p.fill(0.0))
        .unwrap();
    let received = receiver.wait_for_any_receive().unwrap();
    assert!(!received.valid);
}

#[test]
fn waiting_with_nothing_pending_is_an_error() {
    let mut endpoints = fabric(2, 4);
    let mut receiver = endpoints.pop().unwrap();
    assert!(matches!(
        receiver.wait_for_any_receive(),
        Err(TransposeError::NothingPending { .. })
    ));
}
