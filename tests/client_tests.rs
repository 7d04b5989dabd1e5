#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Integration-style client tests.
//!
//! Uses the in-memory `MockHub` from `tests/common` in place of the
//! negotiation endpoint and the service, and verifies connection management,
//! the group operations and delivery through the receive loop.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;
use web_pubsub_client::{
    handler_fn, ChannelHandler, ConnectionState, FanOut, HandlerError, PubSubClient, PubSubError,
    ReceiveStart, WireMessage,
};

use common::{
    client_for, connected_event_json, group_message_json, next_delivery, test_config, wait_until,
    MockHub,
};

fn channel_client(hub: &MockHub) -> (PubSubClient, mpsc::Receiver<WireMessage>) {
    let (handler, rx) = ChannelHandler::new(16);
    (client_for(hub, test_config(), handler), rx)
}

// ════════════════════════════════════════════════════════════════════
// Validation
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn blank_arguments_fail_before_any_io() {
    let hub = MockHub::new();
    let (client, _rx) = channel_client(&hub);

    let err = assert_err!(client.join_group("").await);
    assert!(matches!(err, PubSubError::Validation { field: "group" }));
    let err = assert_err!(client.leave_group("   ").await);
    assert!(matches!(err, PubSubError::Validation { field: "group" }));
    let err = assert_err!(client.send_to_group("g1", "").await);
    assert!(matches!(err, PubSubError::Validation { field: "data" }));
    let err = assert_err!(client.send_to_group("\t", "hi").await);
    assert!(matches!(err, PubSubError::Validation { field: "group" }));

    assert_eq!(hub.negotiations(), 0);
    assert_eq!(hub.handshakes(), 0);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(!client.is_receiving());
}

// ════════════════════════════════════════════════════════════════════
// Connection management
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn concurrent_operations_share_one_handshake() {
    let hub = MockHub::new().with_handshake_delay(Duration::from_millis(50));
    let (client, _rx) = channel_client(&hub);

    let (a, b, c) = tokio::join!(client.connect(), client.connect(), client.join_group("g1"));
    assert_ok!(a);
    assert_ok!(b);
    assert_ok!(c);

    assert_eq!(hub.negotiations(), 1);
    assert_eq!(hub.handshakes(), 1);
    assert_eq!(client.state(), ConnectionState::Open);

    // Already open: no further I/O.
    assert_ok!(client.connect().await);
    assert_eq!(hub.handshakes(), 1);

    assert_ok!(client.close("done").await);
}

#[tokio::test]
async fn failed_negotiation_reverts_to_disconnected() {
    let hub = MockHub::new();
    hub.refuse_negotiations_after(0);
    let (client, _rx) = channel_client(&hub);

    let err = assert_err!(client.join_group("g1").await);
    assert!(matches!(err, PubSubError::Connection(_)), "got {err:?}");
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(hub.handshakes(), 0);
    assert!(hub.sent().is_empty());
    assert!(!client.is_receiving());
}

#[tokio::test]
async fn state_watch_reports_transitions() {
    let hub = MockHub::new();
    let (client, _rx) = channel_client(&hub);
    let mut states = client.watch_state();
    assert_eq!(*states.borrow(), ConnectionState::Disconnected);

    assert_ok!(client.connect().await);
    let open = states.wait_for(|s| *s == ConnectionState::Open);
    let state = tokio::time::timeout(common::WAIT, open)
        .await
        .expect("timed out")
        .map(|s| *s);
    assert_eq!(assert_ok!(state), ConnectionState::Open);

    assert_ok!(client.close("bye").await);
    assert_eq!(*states.borrow(), ConnectionState::Closed);
}

#[tokio::test]
async fn send_failure_marks_connection_lost_and_next_send_reconnects() {
    let hub = MockHub::new();
    let (client, _rx) = channel_client(&hub);
    assert_ok!(client.join_group("g1").await);

    hub.fail_sends(true);
    let err = assert_err!(client.send_to_group("g1", "lost").await);
    assert!(matches!(err, PubSubError::TransportSend(_)), "got {err:?}");
    assert_eq!(client.state(), ConnectionState::Disconnected);

    hub.fail_sends(false);
    assert_ok!(client.send_to_group("g1", "again").await);
    assert!(hub.handshakes() >= 2);
    assert_eq!(
        hub.sent().last().map(String::as_str),
        Some(r#"{"type":"sendToGroup","group":"g1","data":"again"}"#)
    );

    assert_ok!(client.close("done").await);
}

#[tokio::test]
async fn close_sends_reason_once() {
    let hub = MockHub::new();
    let (client, _rx) = channel_client(&hub);
    assert_ok!(client.join_group("g1").await);

    assert_ok!(client.close("done").await);
    assert_ok!(client.close("again").await);

    assert_eq!(hub.close_reasons(), vec!["done".to_string()]);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(!client.is_receiving());
}

#[tokio::test]
async fn close_before_connect_is_a_noop() {
    let hub = MockHub::new();
    let (client, _rx) = channel_client(&hub);
    assert_ok!(client.close("never opened").await);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(hub.negotiations(), 0);
    assert!(hub.close_reasons().is_empty());
}

// ════════════════════════════════════════════════════════════════════
// Group operations and delivery
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn join_then_receive_group_message() {
    let hub = MockHub::new();
    let (client, mut rx) = channel_client(&hub);

    assert_ok!(client.join_group("g1").await);
    assert_eq!(hub.sent(), vec![r#"{"type":"joinGroup","group":"g1"}"#.to_string()]);
    assert!(client.is_receiving());

    hub.push(&group_message_json("g1", "hello"));
    let msg = next_delivery(&mut rx).await;
    assert_eq!(msg.kind, "message");
    assert_eq!(msg.from, "group");
    assert_eq!(msg.group, "g1");
    assert_eq!(msg.data, "hello");
    assert!(msg.is_group_message("g1"));

    assert_ok!(client.leave_group("g1").await);
    assert_eq!(
        hub.sent().last().map(String::as_str),
        Some(r#"{"type":"leaveGroup","group":"g1"}"#)
    );

    assert_ok!(client.close("done").await);
}

#[tokio::test]
async fn fragmented_message_is_dispatched_once() {
    let hub = MockHub::new();
    let (client, mut rx) = channel_client(&hub);
    assert_ok!(client.join_group("g1").await);

    let json = group_message_json("g1", "stitched");
    let (head, rest) = json.split_at(7);
    let (middle, tail) = rest.split_at(rest.len() / 2);
    hub.push_fragments(&[head, middle, tail]);

    let msg = next_delivery(&mut rx).await;
    assert_eq!(msg.data, "stitched");

    let extra = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(extra.is_err(), "fragments must not be delivered separately");

    assert_ok!(client.close("done").await);
}

#[tokio::test]
async fn messages_are_delivered_in_order() {
    let hub = MockHub::new();
    let (client, mut rx) = channel_client(&hub);
    assert_ok!(client.join_group("g1").await);

    hub.push(&connected_event_json());
    for i in 0..5 {
        hub.push(&group_message_json("g1", &format!("m{i}")));
    }

    let first = next_delivery(&mut rx).await;
    assert_eq!(first.kind, "system");
    assert_eq!(first.event, "connected");
    assert_eq!(first.connection_id, "conn-abc");
    for i in 0..5 {
        assert_eq!(next_delivery(&mut rx).await.data, format!("m{i}"));
    }

    assert_ok!(client.close("done").await);
}

#[tokio::test]
async fn nothing_is_delivered_before_the_first_send() {
    let hub = MockHub::new();
    let (client, mut rx) = channel_client(&hub);

    assert_ok!(client.connect().await);
    hub.push(&group_message_json("g1", "early"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    assert!(!client.is_receiving());

    assert_ok!(client.join_group("g1").await);
    assert!(client.is_receiving());
    assert_eq!(next_delivery(&mut rx).await.data, "early");

    assert_ok!(client.close("done").await);
}

#[tokio::test]
async fn send_to_group_alone_does_not_start_receiving() {
    let hub = MockHub::new();
    let (client, mut rx) = channel_client(&hub);

    assert_ok!(client.send_to_group("g1", "hi").await);
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(
        hub.sent(),
        vec![r#"{"type":"sendToGroup","group":"g1","data":"hi"}"#.to_string()]
    );
    assert!(!client.is_receiving());

    hub.push(&group_message_json("g1", "pending"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());

    assert_ok!(client.join_group("g1").await);
    assert!(client.is_receiving());
    assert_eq!(next_delivery(&mut rx).await.data, "pending");

    assert_ok!(client.close("done").await);
}

#[tokio::test]
async fn on_open_mode_send_to_group_starts_receiving() {
    let hub = MockHub::new();
    let (handler, mut rx) = ChannelHandler::new(4);
    let config = test_config().with_receive_start(ReceiveStart::OnOpen);
    let client = client_for(&hub, config, handler);

    assert_ok!(client.send_to_group("g1", "hi").await);
    assert!(client.is_receiving());
    hub.push(&group_message_json("g1", "pushed"));
    assert_eq!(next_delivery(&mut rx).await.data, "pushed");

    assert_ok!(client.close("done").await);
}

#[tokio::test]
async fn on_open_mode_starts_receiving_on_connect() {
    let hub = MockHub::new();
    let (handler, mut rx) = ChannelHandler::new(4);
    let config = test_config().with_receive_start(ReceiveStart::OnOpen);
    let client = client_for(&hub, config, handler);

    assert_ok!(client.connect().await);
    assert!(client.is_receiving());
    hub.push(&group_message_json("g1", "pushed"));
    assert_eq!(next_delivery(&mut rx).await.data, "pushed");
    assert!(hub.sent().is_empty());

    assert_ok!(client.close("done").await);
}

#[tokio::test]
async fn undecodable_frames_and_handler_errors_do_not_stop_the_loop() {
    let hub = MockHub::new();
    let (tx, mut rx) = mpsc::channel(8);
    let handler = handler_fn(move |_client, event| {
        let tx = tx.clone();
        async move {
            if event.message.data == "bad" {
                return Err(HandlerError::from("rejected"));
            }
            tx.send(event.message).await.map_err(HandlerError::from)
        }
    });
    let client = client_for(&hub, test_config(), handler);
    assert_ok!(client.join_group("g1").await);

    hub.push("{not json");
    hub.push(&group_message_json("g1", "bad"));
    hub.push(&group_message_json("g1", "good"));

    assert_eq!(next_delivery(&mut rx).await.data, "good");
    assert!(client.is_receiving());

    assert_ok!(client.close("done").await);
}

#[tokio::test]
async fn fan_out_delivers_to_every_handler() {
    let hub = MockHub::new();
    let (first, mut rx1) = ChannelHandler::new(4);
    let (second, mut rx2) = ChannelHandler::new(4);
    let fan_out = FanOut::new().with(first).with(second);
    assert_eq!(fan_out.len(), 2);
    let client = client_for(&hub, test_config(), fan_out);

    assert_ok!(client.join_group("g1").await);
    hub.push(&group_message_json("g1", "both"));

    assert_eq!(next_delivery(&mut rx1).await.data, "both");
    assert_eq!(next_delivery(&mut rx2).await.data, "both");

    assert_ok!(client.close("done").await);
}

#[tokio::test]
async fn handler_can_send_through_the_client() {
    let hub = MockHub::new();
    let handler = handler_fn(|client, event| async move {
        if event.message.data == "ping" {
            client.send_to_group(&event.message.group, "pong").await?;
        }
        Ok::<(), HandlerError>(())
    });
    let client = client_for(&hub, test_config(), handler);
    assert_ok!(client.join_group("g1").await);

    hub.push(&group_message_json("g1", "ping"));
    let pong = r#"{"type":"sendToGroup","group":"g1","data":"pong"}"#.to_string();
    wait_until("pong reply", || hub.sent().contains(&pong)).await;

    assert_ok!(client.close("done").await);
}

// ════════════════════════════════════════════════════════════════════
// Receive loop resilience
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn loop_reconnects_after_the_service_drops_the_connection() {
    let hub = MockHub::new();
    let (client, mut rx) = channel_client(&hub);
    assert_ok!(client.join_group("g1").await);
    assert_eq!(hub.handshakes(), 1);

    hub.drop_connection();
    wait_until("second handshake", || hub.handshakes() == 2).await;
    wait_until("open state", || client.state() == ConnectionState::Open).await;

    hub.push(&group_message_json("g1", "after reconnect"));
    assert_eq!(next_delivery(&mut rx).await.data, "after reconnect");

    assert_ok!(client.close("done").await);
}

#[tokio::test]
async fn transport_errors_trigger_a_reconnect() {
    let hub = MockHub::new();
    let (client, mut rx) = channel_client(&hub);
    assert_ok!(client.join_group("g1").await);

    hub.push_error("connection reset");
    wait_until("second handshake", || hub.handshakes() == 2).await;
    wait_until("open state", || client.state() == ConnectionState::Open).await;

    hub.push(&group_message_json("g1", "recovered"));
    assert_eq!(next_delivery(&mut rx).await.data, "recovered");

    assert_ok!(client.close("done").await);
}

#[tokio::test]
async fn loop_keeps_retrying_while_negotiation_fails() {
    let hub = MockHub::new();
    hub.refuse_negotiations_after(1);
    let (client, _rx) = channel_client(&hub);
    assert_ok!(client.join_group("g1").await);

    hub.drop_connection();
    wait_until("repeated negotiation attempts", || hub.negotiations() >= 4).await;
    assert!(client.is_receiving());
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // The loop never surfaces its failures; close still succeeds.
    assert_ok!(client.close("done").await);
    assert!(!client.is_receiving());

    let attempts = hub.negotiations();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hub.negotiations(), attempts, "loop must stop retrying after close");
}

// ════════════════════════════════════════════════════════════════════
// Cancellation and shutdown
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn close_from_inside_the_handler_completes() {
    let hub = MockHub::new();
    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    let handler = handler_fn(move |client, event| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            client.close("handler said bye").await?;
            assert!(event.cancel.is_cancelled());
            Ok::<(), HandlerError>(())
        }
    });
    let client = client_for(&hub, test_config(), handler);
    assert_ok!(client.join_group("g1").await);

    hub.push(&group_message_json("g1", "stop"));
    wait_until("close from the handler", || client.state() == ConnectionState::Closed).await;
    assert_eq!(hub.close_reasons(), vec!["handler said bye".to_string()]);
    assert!(!client.is_receiving());

    // A later close joins the retired loop without blocking.
    let closed = tokio::time::timeout(common::WAIT, client.close("again")).await;
    assert_ok!(assert_ok!(closed));
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(hub.close_reasons().len(), 1);
}

#[tokio::test]
async fn closing_another_client_from_a_handler_waits_for_its_loop() {
    let hub_a = MockHub::new();
    let hub_b = MockHub::new();

    let b_started = Arc::new(AtomicBool::new(false));
    let b_finished = Arc::new(AtomicBool::new(false));
    let handler_b = {
        let started = Arc::clone(&b_started);
        let finished = Arc::clone(&b_finished);
        handler_fn(move |_client, _event| {
            let started = Arc::clone(&started);
            let finished = Arc::clone(&finished);
            async move {
                started.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                finished.store(true, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        })
    };
    let client_b = client_for(&hub_b, test_config(), handler_b);

    let other = Arc::new(OnceLock::<PubSubClient>::new());
    let b_done_when_closed = Arc::new(OnceLock::<bool>::new());
    let handler_a = {
        let other = Arc::clone(&other);
        let finished = Arc::clone(&b_finished);
        let outcome = Arc::clone(&b_done_when_closed);
        handler_fn(move |_client, _event| {
            let other = Arc::clone(&other);
            let finished = Arc::clone(&finished);
            let outcome = Arc::clone(&outcome);
            async move {
                let b = other.get().unwrap().clone();
                b.close("from a").await?;
                let _ = outcome.set(finished.load(Ordering::SeqCst));
                Ok::<(), HandlerError>(())
            }
        })
    };
    let client_a = client_for(&hub_a, test_config(), handler_a);
    other.set(client_b.clone()).unwrap();

    assert_ok!(client_a.join_group("g1").await);
    assert_ok!(client_b.join_group("g1").await);

    hub_b.push(&group_message_json("g1", "slow"));
    wait_until("b's handler to start", || b_started.load(Ordering::SeqCst)).await;
    hub_a.push(&group_message_json("g1", "close b"));
    wait_until("a's handler to close b", || b_done_when_closed.get().is_some()).await;

    assert_eq!(b_done_when_closed.get(), Some(&true));
    assert_eq!(client_b.state(), ConnectionState::Closed);
    assert_eq!(hub_b.close_reasons(), vec!["from a".to_string()]);
    assert!(!client_b.is_receiving());

    assert_ok!(client_a.close("done").await);
    assert_eq!(hub_a.close_reasons(), vec!["done".to_string()]);
}

#[tokio::test]
async fn parent_cancellation_stops_the_loop() {
    let hub = MockHub::new();
    let parent = CancellationToken::new();
    let (handler, _rx) = ChannelHandler::new(4);
    let client = PubSubClient::builder(test_config())
        .with_negotiator(hub.negotiator())
        .with_connector(hub.connector())
        .with_handler(handler)
        .with_cancellation(parent.clone())
        .build()
        .unwrap();

    assert_ok!(client.join_group("g1").await);
    assert!(client.is_receiving());

    parent.cancel();
    assert!(!client.is_receiving());

    // The connection itself is untouched until close.
    assert_eq!(client.state(), ConnectionState::Open);
    assert_ok!(client.close("done").await);
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn send_after_close_reconnects_and_restarts_the_loop() {
    let hub = MockHub::new();
    let (client, mut rx) = channel_client(&hub);
    assert_ok!(client.join_group("g1").await);
    assert_ok!(client.close("pause").await);
    assert!(!client.is_receiving());

    assert_ok!(client.join_group("g1").await);
    assert_eq!(hub.handshakes(), 2);
    assert!(client.is_receiving());

    hub.push(&group_message_json("g1", "resumed"));
    assert_eq!(next_delivery(&mut rx).await.data, "resumed");

    assert_ok!(client.close("done").await);
}

#[tokio::test]
async fn clones_share_one_connection() {
    let hub = MockHub::new();
    let (client, _rx) = channel_client(&hub);
    let other = client.clone();

    assert_ok!(client.join_group("g1").await);
    assert_ok!(other.send_to_group("g1", "from clone").await);
    assert_eq!(hub.handshakes(), 1);
    assert_eq!(other.state(), ConnectionState::Open);
    assert!(other.is_receiving());

    assert_ok!(other.close("done").await);
    assert_eq!(client.state(), ConnectionState::Closed);
}
