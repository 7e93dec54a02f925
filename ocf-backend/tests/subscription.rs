mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use ocf_backend::{
    EventKind, FilterBy, GatewayError, ResourceEventKind, ResourceId, ResourceSubscription,
    StatusCode, SubscriptionError,
};

async fn start(
    handler: Arc<RecordingHandler>,
) -> (ResourceSubscription, ServerEnd) {
    let (stream, server) = duplex_pair();
    server.ack("sub-1");
    let subscription = ResourceSubscription::start(
        stream,
        "token-1".to_string(),
        ResourceId::new(DEVICE_ID, "/light/1"),
        handler,
    )
    .await
    .unwrap();
    (subscription, server)
}

#[tokio::test]
async fn test_start_sends_content_changed_filter() {
    let (handler, _rx) = RecordingHandler::new();
    let (subscription, mut server) = start(handler).await;

    assert_eq!(subscription.id(), "sub-1");
    let request = server.requests.recv().await.unwrap();
    assert_eq!(request.token, "token-1");
    let FilterBy::ResourceEvent(filter) = request.filter_by;
    assert_eq!(filter.resource_id, ResourceId::new(DEVICE_ID, "/light/1"));
    assert_eq!(filter.filter_events, vec![ResourceEventKind::ContentChanged]);
}

#[tokio::test]
async fn test_content_changes_reach_handler_in_order() {
    let (handler, mut rx) = RecordingHandler::new();
    let (_subscription, server) = start(handler).await;

    server.content_changed("/light/1", r#"{"value":1}"#);
    server.content_changed("/light/1", r#"{"value":2}"#);

    for expected in [1, 2] {
        match next_callback(&mut rx).await {
            Callback::Changed(value) => assert_eq!(value["value"], expected),
            other => panic!("expected content change, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_rejected_ack_fails_with_gateway_message() {
    let (handler, mut rx) = RecordingHandler::new();
    let (stream, server) = duplex_pair();
    server.reject(StatusCode::NotFound, "resource not found");

    let err = ResourceSubscription::start(
        stream,
        "token-1".to_string(),
        ResourceId::new(DEVICE_ID, "/missing"),
        handler,
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        SubscriptionError::Rejected {
            code: StatusCode::NotFound,
            ..
        }
    ));
    assert!(err.to_string().contains("resource not found"));
    // No loop was started, so nothing is ever reported.
    server.content_changed("/missing", r#"{"value":1}"#);
    assert_no_callback(&mut rx).await;
    assert_eq!(server.close_count(), 1);
}

#[tokio::test]
async fn test_stream_closed_before_ack() {
    let (handler, _rx) = RecordingHandler::new();
    let (stream, server) = duplex_pair();
    drop(server);

    let err = ResourceSubscription::start(
        stream,
        "token-1".to_string(),
        ResourceId::new(DEVICE_ID, "/light/1"),
        handler,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SubscriptionError::Gateway(_) | SubscriptionError::ClosedBeforeAck));
}

#[tokio::test(start_paused = true)]
async fn test_ack_timeout_half_closes_stream() {
    let (handler, mut rx) = RecordingHandler::new();
    let (stream, server) = duplex_pair();

    let err = ResourceSubscription::start_with_timeout(
        stream,
        "token-1".to_string(),
        ResourceId::new(DEVICE_ID, "/light/1"),
        handler,
        Duration::from_secs(5),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, SubscriptionError::AckTimeout(d) if d == Duration::from_secs(5)));
    assert_eq!(server.close_count(), 1);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_non_ack_first_event_is_rejected() {
    let (handler, _rx) = RecordingHandler::new();
    let (stream, server) = duplex_pair();
    server.content_changed("/light/1", r#"{"value":1}"#);

    let err = ResourceSubscription::start(
        stream,
        "token-1".to_string(),
        ResourceId::new(DEVICE_ID, "/light/1"),
        handler,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, SubscriptionError::UnexpectedAck(_)));
}

#[tokio::test]
async fn test_cancel_without_reason_closes() {
    let (handler, mut rx) = RecordingHandler::new();
    let (subscription, server) = start(handler).await;

    server.cancel("");

    assert!(matches!(next_callback(&mut rx).await, Callback::Closed));
    assert_no_callback(&mut rx).await;
    assert!(subscription.is_canceled());
    assert_eq!(server.close_count(), 1);
}

#[tokio::test]
async fn test_cancel_with_reason_reports_error() {
    let (handler, mut rx) = RecordingHandler::new();
    let (_subscription, server) = start(handler).await;

    server.cancel("device offline");

    match next_callback(&mut rx).await {
        Callback::Error(message) => assert_eq!(message, "device offline"),
        other => panic!("expected error, got {other:?}"),
    }
    assert_no_callback(&mut rx).await;
    assert_eq!(server.close_count(), 1);
}

#[tokio::test]
async fn test_stream_end_closes() {
    let (handler, mut rx) = RecordingHandler::new();
    let (subscription, server) = start(handler).await;

    drop(server);

    assert!(matches!(next_callback(&mut rx).await, Callback::Closed));
    subscription.cancel().await.unwrap().wait().await;
    assert!(subscription.is_finished());
}

#[tokio::test]
async fn test_stream_error_is_reported() {
    let (handler, mut rx) = RecordingHandler::new();
    let (_subscription, server) = start(handler).await;

    server.fail(GatewayError::Stream("connection reset".to_string()));

    match next_callback(&mut rx).await {
        Callback::Error(message) => assert!(message.contains("connection reset")),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(server.close_count(), 1);
}

#[tokio::test]
async fn test_handler_failure_ends_subscription() {
    let (handler, mut rx) = RecordingHandler::failing_on(2);
    let (subscription, server) = start(handler).await;

    server.content_changed("/light/1", r#"{"value":1}"#);
    server.content_changed("/light/1", r#"{"value":2}"#);
    server.content_changed("/light/1", r#"{"value":3}"#);

    assert!(matches!(next_callback(&mut rx).await, Callback::Changed(_)));
    match next_callback(&mut rx).await {
        Callback::Error(message) => assert!(message.contains("handler rejected content")),
        other => panic!("expected error, got {other:?}"),
    }
    assert_no_callback(&mut rx).await;
    assert!(subscription.is_canceled());
}

#[tokio::test]
async fn test_unknown_event_is_reported() {
    let (handler, mut rx) = RecordingHandler::new();
    let (_subscription, server) = start(handler).await;

    server.push_event(EventKind::DevicesRegistered {
        device_ids: vec![DEVICE_ID.to_string()],
    });

    match next_callback(&mut rx).await {
        Callback::Error(message) => {
            assert!(message.starts_with("unknown event occurs on recv resource content changed"))
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_concurrent_cancel_half_closes_once() {
    let (handler, mut rx) = RecordingHandler::new();
    let (subscription, server) = start(handler).await;
    let close_calls = server.close_calls.clone();
    let gateway = server.finish_after_half_close();

    let subscription = Arc::new(subscription);
    let mut waits = Vec::new();
    for _ in 0..8 {
        let subscription = subscription.clone();
        waits.push(tokio::spawn(async move {
            subscription.cancel().await.unwrap().wait().await;
            assert!(subscription.is_finished());
        }));
    }
    for wait in waits {
        wait.await.unwrap();
    }

    assert_eq!(close_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(matches!(next_callback(&mut rx).await, Callback::Closed));
    assert_no_callback(&mut rx).await;

    let filters = gateway.await.unwrap();
    assert_eq!(filters.len(), 1);
}

#[tokio::test]
async fn test_wait_returns_after_handler_notified() {
    let (handler, mut rx) = RecordingHandler::new();
    let (subscription, server) = start(handler).await;
    let _gateway = server.finish_after_half_close();

    subscription.cancel().await.unwrap().wait().await;

    // The terminal callback happens before the loop signals completion.
    assert!(matches!(rx.try_recv(), Ok(Callback::Closed)));
}
