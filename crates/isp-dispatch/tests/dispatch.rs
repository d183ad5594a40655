//! Dispatcher and command-queue behavior against the simulated firmware.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use isp_core::{ChannelId, CommandOpcode, IspError, IspTransport, Response, ResponseStatus};
use isp_dispatch::{CommandQueue, DiscardEvents, Dispatcher};
use isp_transport_mock::{MockBehavior, MockTransport};

const POLL: Duration = Duration::from_millis(5);

fn wire_up(transport: &Arc<MockTransport>) -> (Arc<CommandQueue>, Dispatcher) {
    let queue = Arc::new(CommandQueue::new(transport.clone(), 64));
    let dispatcher = Dispatcher::new(queue.clone(), Arc::new(DiscardEvents), 3, POLL);
    transport.connect(Arc::new(dispatcher.inlet()));
    dispatcher.start();
    (queue, dispatcher)
}

#[tokio::test]
async fn sequence_numbers_do_not_repeat() {
    let transport = MockTransport::with_behavior(MockBehavior::manual());
    let (queue, dispatcher) = wire_up(&transport);

    let mut seen = std::collections::HashSet::new();
    for _ in 0..100 {
        let sequence = queue
            .enqueue_and_send(
                CommandOpcode::SetExposure,
                ChannelId::CONTROL,
                Bytes::new(),
                None,
            )
            .await
            .unwrap();
        assert!(seen.insert(sequence), "sequence {sequence} repeated");
    }
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn send_sync_completes_with_matching_response() {
    let transport = MockTransport::new();
    let (queue, dispatcher) = wire_up(&transport);

    let response = queue
        .send_sync(
            CommandOpcode::SensorOpen,
            ChannelId::CONTROL,
            Bytes::new(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert!(response.status.is_ok());
    assert_eq!(response.opcode, CommandOpcode::SensorOpen);
    assert_eq!(queue.pending_len(), 0);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn send_sync_ok_surfaces_firmware_failure() {
    let transport = MockTransport::new();
    transport.set_behavior(|b| {
        b.fail.insert(CommandOpcode::StreamOn, ResponseStatus::Busy);
    });
    let (queue, dispatcher) = wire_up(&transport);

    let err = queue
        .send_sync_ok(
            CommandOpcode::StreamOn,
            ChannelId::CONTROL,
            Bytes::new(),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
    match err {
        IspError::Firmware { opcode, status } => {
            assert_eq!(opcode, CommandOpcode::StreamOn);
            assert_eq!(status, ResponseStatus::Busy);
        }
        other => panic!("expected firmware error, got {other}"),
    }
    dispatcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn timeout_leaves_element_pending_and_drops_late_response() {
    let transport = MockTransport::with_behavior(MockBehavior::manual());
    let (queue, dispatcher) = wire_up(&transport);

    let err = queue
        .send_sync(
            CommandOpcode::SetFocus,
            ChannelId::CONTROL,
            Bytes::new(),
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
    let sequence = match err {
        IspError::Timeout { sequence, .. } => sequence,
        other => panic!("expected timeout, got {other}"),
    };
    // Element is intentionally left pending for a possible late answer.
    assert!(queue.is_pending(sequence));

    // The late answer arrives after the deadline; it is matched, found
    // stale, and dropped rather than delivered to anyone.
    transport.inject_response(Response::ok(
        sequence,
        CommandOpcode::SetFocus,
        ChannelId::CONTROL,
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!queue.is_pending(sequence));
    assert_eq!(queue.pending_len(), 0);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn transmit_failure_creates_no_pending_element() {
    let transport = MockTransport::new();
    transport.set_behavior(|b| {
        b.fail_transmit.insert(CommandOpcode::SensorClose);
    });
    let (queue, dispatcher) = wire_up(&transport);

    let err = queue
        .enqueue_and_send(
            CommandOpcode::SensorClose,
            ChannelId::CONTROL,
            Bytes::new(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IspError::Transport(_)));
    assert_eq!(queue.pending_len(), 0);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn drain_wakes_stranded_waiters() {
    let transport = MockTransport::with_behavior(MockBehavior::manual());
    let (queue, dispatcher) = wire_up(&transport);

    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue
                .send_sync(
                    CommandOpcode::StreamOff,
                    ChannelId::CONTROL,
                    Bytes::new(),
                    Duration::from_secs(30),
                )
                .await
        })
    };
    // Let the waiter get its element into the table.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.pending_len(), 1);

    let drained = queue.drain(None);
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].opcode, CommandOpcode::StreamOff);
    assert_eq!(queue.pending_len(), 0);

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(IspError::Drained { .. })));
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn drain_can_be_scoped_to_one_channel() {
    let transport = MockTransport::with_behavior(MockBehavior::manual());
    let (queue, dispatcher) = wire_up(&transport);

    queue
        .enqueue_and_send(CommandOpcode::SetFlash, ChannelId(0), Bytes::new(), None)
        .await
        .unwrap();
    queue
        .enqueue_and_send(CommandOpcode::SetFlash, ChannelId(1), Bytes::new(), None)
        .await
        .unwrap();

    let drained = queue.drain(Some(ChannelId(1)));
    assert_eq!(drained.len(), 1);
    assert_eq!(queue.pending_len(), 1);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn responses_on_different_channels_do_not_interfere() {
    let transport = MockTransport::with_behavior(MockBehavior::manual());
    let (queue, dispatcher) = wire_up(&transport);

    let waiter0 = {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue
                .send_sync(
                    CommandOpcode::SetExposure,
                    ChannelId(0),
                    Bytes::new(),
                    Duration::from_secs(5),
                )
                .await
        })
    };
    let waiter1 = {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue
                .send_sync(
                    CommandOpcode::SetWhiteBalance,
                    ChannelId(1),
                    Bytes::new(),
                    Duration::from_secs(5),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let transcript = transport.transcript();
    assert_eq!(transcript.len(), 2);
    let (seq0, seq1) = if transcript[0].channel == ChannelId(0) {
        (transcript[0].sequence, transcript[1].sequence)
    } else {
        (transcript[1].sequence, transcript[0].sequence)
    };

    // Interleaved arrival, second channel first.
    transport.inject_response(Response::ok(seq1, CommandOpcode::SetWhiteBalance, ChannelId(1)));
    transport.inject_response(Response::ok(seq0, CommandOpcode::SetExposure, ChannelId(0)));

    let r0 = waiter0.await.unwrap().unwrap();
    let r1 = waiter1.await.unwrap().unwrap();
    assert_eq!(r0.opcode, CommandOpcode::SetExposure);
    assert_eq!(r1.opcode, CommandOpcode::SetWhiteBalance);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn opcode_mismatch_keeps_element_pending() {
    let transport = MockTransport::with_behavior(MockBehavior::manual());
    let (queue, dispatcher) = wire_up(&transport);

    let sequence = queue
        .enqueue_and_send(
            CommandOpcode::SetSceneMode,
            ChannelId::CONTROL,
            Bytes::new(),
            None,
        )
        .await
        .unwrap();

    // Same sequence, wrong opcode: dropped, element retained.
    transport.inject_response(Response::ok(
        sequence,
        CommandOpcode::SetFlash,
        ChannelId::CONTROL,
    ));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(queue.is_pending(sequence));

    // The real answer still completes it.
    transport.inject_response(Response::ok(
        sequence,
        CommandOpcode::SetSceneMode,
        ChannelId::CONTROL,
    ));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!queue.is_pending(sequence));
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn pending_table_capacity_is_enforced() {
    let transport = MockTransport::with_behavior(MockBehavior::manual());
    let queue = Arc::new(CommandQueue::new(transport.clone(), 2));
    let dispatcher = Dispatcher::new(queue.clone(), Arc::new(DiscardEvents), 1, POLL);
    transport.connect(Arc::new(dispatcher.inlet()));

    for _ in 0..2 {
        queue
            .enqueue_and_send(CommandOpcode::SetFlash, ChannelId(0), Bytes::new(), None)
            .await
            .unwrap();
    }
    let err = queue
        .enqueue_and_send(CommandOpcode::SetFlash, ChannelId(0), Bytes::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, IspError::ResourceExhausted(_)));
}
