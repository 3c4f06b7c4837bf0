//! Server-level tests: handler table, subscriptions, hub fan-out and the
//! disconnect path, exercised without a socket.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::ws::Message;
use futures_channel::mpsc;
use futures_util::{Sink, SinkExt, StreamExt};
use pulse_protocol::{ConnectionContext, ConnectionId, HandlerError, Payload};
use pulse_server::{
    Hub, HandlerTable, LifecycleEvent, PublishReport, PulseServer, SubscriptionRegistry,
};
use pulse_transport::{ConnectionHandle, ConnectionHandler, ConnectionRegistry, Delivery};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

fn connect(
    registry: &ConnectionRegistry,
    id: &str,
) -> (Arc<ConnectionHandle>, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded::<Message>();
    let sink = tx.sink_map_err(|e| axum::Error::new(e));
    let ctx = ConnectionContext::new(ConnectionId::from(id), "/rooms");
    let handle = Arc::new(ConnectionHandle::new(ctx, sink, CancellationToken::new()));
    registry.add(handle.clone());
    (handle, rx)
}

/// Write half of a peer that stopped draining its socket.
struct StuckSink;

impl Sink<Message> for StuckSink {
    type Error = axum::Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Pending
    }

    fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Pending
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Pending
    }
}

fn connect_stuck(registry: &ConnectionRegistry, id: &str, write_timeout: Duration) {
    let ctx = ConnectionContext::new(ConnectionId::from(id), "/rooms");
    let handle = ConnectionHandle::new(ctx, StuckSink, CancellationToken::new())
        .with_write_timeout(write_timeout);
    registry.add(Arc::new(handle));
}

async fn next_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> Value {
    match rx.next().await.expect("frame") {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscription registry
// ─────────────────────────────────────────────────────────────────────────────

mod subscriptions {
    use super::*;

    #[test]
    fn repeated_subscribe_keeps_one_member_with_latest_timestamp() {
        let subs = SubscriptionRegistry::new();
        let id = ConnectionId::from("a");

        let mut last = subs.subscribe("news", &id);
        for _ in 0..5 {
            let ts = subs.subscribe("news", &id);
            assert!(ts >= last);
            last = ts;
        }

        assert_eq!(subs.members("news"), vec![id.clone()]);
        assert_eq!(subs.member_count("news"), 1);
        assert_eq!(subs.subscribed_at("news", &id), Some(last));
    }

    #[test]
    fn channel_created_lazily_and_dropped_when_empty() {
        let subs = SubscriptionRegistry::new();
        let id = ConnectionId::from("a");
        assert!(subs.is_empty());

        subs.subscribe("news", &id);
        assert_eq!(subs.channels(), vec!["news".to_string()]);

        assert!(subs.unsubscribe("news", &id));
        assert!(subs.channels().is_empty());
        assert!(!subs.unsubscribe("news", &id));
        assert!(!subs.unsubscribe("missing", &id));
    }

    #[test]
    fn remove_connection_clears_every_channel() {
        let subs = SubscriptionRegistry::new();
        let a = ConnectionId::from("a");
        let b = ConnectionId::from("b");
        subs.subscribe("news", &a);
        subs.subscribe("sports", &a);
        subs.subscribe("sports", &b);

        assert_eq!(subs.channels_of(&a), vec!["news".to_string(), "sports".to_string()]);
        let left = subs.remove_connection(&a);
        assert_eq!(left, vec!["news".to_string(), "sports".to_string()]);

        assert!(subs.channels_of(&a).is_empty());
        assert_eq!(subs.channels(), vec!["sports".to_string()]);
        assert!(subs.is_subscribed("sports", &b));
        assert!(subs.remove_connection(&a).is_empty());
    }

    #[test]
    fn subscribe_if_rejects_dead_connections() {
        let subs = SubscriptionRegistry::new();
        let id = ConnectionId::from("a");
        assert!(subs.subscribe_if("news", &id, || false).is_none());
        assert!(subs.is_empty());
        assert!(subs.subscribe_if("news", &id, || true).is_some());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handler table
// ─────────────────────────────────────────────────────────────────────────────

mod handlers {
    use super::*;

    #[tokio::test]
    async fn dispatch_passes_id_and_payload() {
        let table = HandlerTable::new();
        table.on_message("/echo", |id, payload| async move {
            Ok(json!({"id": id, "text": payload.as_text()}))
        });

        let result = table
            .dispatch("/echo", LifecycleEvent::Message, ConnectionId::from("c1"), Payload::from("hi"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, json!({"id": "c1", "text": "hi"}));
    }

    #[tokio::test]
    async fn missing_handler_dispatches_to_none() {
        let table = HandlerTable::new();
        table.on_connect("/chat", |_, _| async { Ok(Value::Null) });

        assert!(table.has("/chat", LifecycleEvent::Connect));
        assert!(!table.has("/chat", LifecycleEvent::Message));
        let outcome = table
            .dispatch("/chat", LifecycleEvent::Message, ConnectionId::from("c"), Payload::from("x"))
            .await;
        assert!(outcome.is_none());
        let outcome = table
            .dispatch("/other", LifecycleEvent::Connect, ConnectionId::from("c"), Payload::Empty)
            .await;
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn second_registration_overwrites_first() {
        let table = HandlerTable::new();
        table.on_message("/r", |_, _| async { Ok(json!("first")) });
        table.on_message("/r", |_, _| async { Ok(json!("second")) });

        let result = table
            .dispatch("/r", LifecycleEvent::Message, ConnectionId::from("c"), Payload::from("x"))
            .await
            .unwrap();
        assert_eq!(result.unwrap(), json!("second"));
        assert_eq!(table.routes(), vec!["/r".to_string()]);
    }

    #[tokio::test]
    async fn handler_errors_are_returned() {
        let table = HandlerTable::new();
        table.on_message("/r", |_, _| async { Err(HandlerError::msg("nope")) });
        let result = table
            .dispatch("/r", LifecycleEvent::Message, ConnectionId::from("c"), Payload::from("x"))
            .await
            .unwrap();
        assert_eq!(result.unwrap_err().message, "nope");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hub
// ─────────────────────────────────────────────────────────────────────────────

mod hub {
    use super::*;

    #[tokio::test]
    async fn send_to_live_and_unknown_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let hub = Hub::with_registry(registry.clone());
        let (_handle, mut rx) = connect(&registry, "a");

        assert_eq!(hub.send(&ConnectionId::from("a"), json!("hello")).await, Delivery::Delivered);
        assert_eq!(next_json(&mut rx).await, json!({"data": "hello"}));

        assert_eq!(hub.send(&ConnectionId::from("zzz"), json!("hello")).await, Delivery::NotFound);
    }

    #[tokio::test]
    async fn subscribe_requires_registered_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let hub = Hub::with_registry(registry.clone());
        let (_handle, _rx) = connect(&registry, "a");

        assert!(hub.subscribe("news", &ConnectionId::from("a")).is_some());
        assert!(hub.subscribe("news", &ConnectionId::from("ghost")).is_none());
        assert_eq!(hub.subscriptions().members("news"), vec![ConnectionId::from("a")]);
    }

    #[tokio::test]
    async fn publish_reaches_members_and_skips_missing_ones() {
        let registry = Arc::new(ConnectionRegistry::new());
        let hub = Hub::with_registry(registry.clone());
        let (_a, mut rx_a) = connect(&registry, "a");
        let (_b, mut rx_b) = connect(&registry, "b");
        let (_c, rx_c) = connect(&registry, "c");
        let (_outsider, mut rx_outsider) = connect(&registry, "outsider");

        for id in ["a", "b", "c"] {
            hub.subscribe("news", &ConnectionId::from(id)).unwrap();
        }
        // "c" dies without cleanup; its write fails.
        drop(rx_c);

        let report = hub.publish("news", json!({"headline": "hi"})).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(report.skipped, 1);

        assert_eq!(next_json(&mut rx_a).await, json!({"data": {"headline": "hi"}}));
        assert_eq!(next_json(&mut rx_b).await, json!({"data": {"headline": "hi"}}));
        assert!(rx_outsider.try_next().is_err(), "non-member must not receive");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_member_is_skipped_without_holding_up_others() {
        let registry = Arc::new(ConnectionRegistry::new());
        let hub = Hub::with_registry(registry.clone());
        connect_stuck(&registry, "a-stuck", Duration::from_millis(500));
        let (_good, mut rx_good) = connect(&registry, "b-good");
        hub.subscribe("news", &ConnectionId::from("a-stuck")).unwrap();
        hub.subscribe("news", &ConnectionId::from("b-good")).unwrap();

        let start = tokio::time::Instant::now();
        let report = tokio::time::timeout(Duration::from_secs(2), hub.publish("news", json!("hi")))
            .await
            .expect("publish must finish");
        assert!(start.elapsed() <= Duration::from_millis(600));
        assert_eq!(report, PublishReport { delivered: 1, skipped: 1 });
        assert_eq!(next_json(&mut rx_good).await, json!({"data": "hi"}));
    }

    #[tokio::test]
    async fn publish_to_unknown_channel_is_empty() {
        let hub = Hub::new();
        let report = hub.publish("nobody", json!(1)).await;
        assert_eq!(report.delivered + report.skipped, 0);
    }

    #[tokio::test]
    async fn unsubscribed_member_stops_receiving() {
        let registry = Arc::new(ConnectionRegistry::new());
        let hub = Hub::with_registry(registry.clone());
        let (_a, _rx_a) = connect(&registry, "a");
        let id = ConnectionId::from("a");

        hub.subscribe("news", &id).unwrap();
        assert!(hub.unsubscribe("news", &id));
        let report = hub.publish("news", json!(1)).await;
        assert_eq!(report.delivered, 0);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PulseServer as the transport's ConnectionHandler
// ─────────────────────────────────────────────────────────────────────────────

mod server {
    use super::*;

    #[tokio::test]
    async fn connect_and_message_dispatch_by_route() {
        let server = PulseServer::new();
        server.on_connect("/chat", |_, _| async { Ok(json!({"welcome": true})) });
        server.on_message("/chat", |_, payload| async move {
            Ok(json!(payload.as_text().unwrap_or_default().to_uppercase()))
        });

        let ctx = ConnectionContext::new(ConnectionId::from("c"), "/chat");
        let welcome = ConnectionHandler::on_connect(&server, &ctx).await.unwrap().unwrap();
        assert_eq!(welcome, json!({"welcome": true}));

        let reply = ConnectionHandler::on_message(&server, &ctx, Payload::from("ping")).await.unwrap().unwrap();
        assert_eq!(reply, json!("PING"));

        let other = ConnectionContext::new(ConnectionId::from("c"), "/elsewhere");
        assert!(ConnectionHandler::on_message(&server, &other, Payload::from("ping")).await.is_none());
    }

    #[tokio::test]
    async fn disconnect_runs_handler_once_and_clears_subscriptions() {
        let registry = Arc::new(ConnectionRegistry::new());
        let server = PulseServer::with_registry(registry.clone());
        let hub = server.hub();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        server.on_disconnect("/rooms", move |id, payload| {
            let counter = counter.clone();
            async move {
                assert_eq!(id, ConnectionId::from("a"));
                assert_eq!(payload, Payload::Empty);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });

        let (handle, _rx) = connect(&registry, "a");
        hub.subscribe("news", handle.id()).unwrap();
        hub.subscribe("sports", handle.id()).unwrap();

        // Cleanup order used by the transport: remove, then dispatch.
        registry.remove(handle.id());
        ConnectionHandler::on_disconnect(&server, handle.context()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(hub.subscriptions().channels_of(handle.id()).is_empty());
        assert!(hub.subscriptions().is_empty());
        assert_eq!(hub.send(handle.id(), json!("late")).await, Delivery::NotFound);
    }

    #[tokio::test]
    async fn failing_disconnect_handler_still_cleans_up() {
        let registry = Arc::new(ConnectionRegistry::new());
        let server = PulseServer::with_registry(registry.clone());
        server.on_disconnect("/rooms", |_, _| async { Err(HandlerError::msg("boom")) });

        let (handle, _rx) = connect(&registry, "a");
        server.hub().subscribe("news", handle.id()).unwrap();
        registry.remove(handle.id());
        ConnectionHandler::on_disconnect(&server, handle.context()).await;

        assert!(server.hub().subscriptions().is_empty());
    }
}
