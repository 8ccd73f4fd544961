use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use wire_transport::{Transport, TransportMessage};
use wire_transport_memory::{Error, MemoryTransport};

fn collector() -> (
    impl Fn(TransportMessage) -> std::future::Ready<()> + Send + Sync + 'static,
    mpsc::UnboundedReceiver<TransportMessage>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |message: TransportMessage| {
        let _ = tx.send(message);
        std::future::ready(())
    };

    (handler, rx)
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_wildcard_fan_out() {
    let transport = MemoryTransport::new();
    let (tail_handler, mut tail_rx) = collector();
    let (one_handler, mut one_rx) = collector();

    transport
        .subscribe("wire.w1.receiver.r1.>", tail_handler)
        .await
        .unwrap();
    transport
        .subscribe("wire.w1.receiver.*.orders", one_handler)
        .await
        .unwrap();

    transport
        .publish("wire.w1.receiver.r1.orders", Bytes::from_static(b"a"))
        .await
        .unwrap();
    transport
        .publish("wire.w1.receiver.r1.orders.eu", Bytes::from_static(b"b"))
        .await
        .unwrap();

    assert_eq!(tail_rx.recv().await.unwrap().payload, "a");
    assert_eq!(tail_rx.recv().await.unwrap().payload, "b");
    assert_eq!(one_rx.recv().await.unwrap().payload, "a");
    assert!(one_rx.try_recv().is_err());
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_messages_delivered_in_order() {
    let transport = MemoryTransport::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let handler_seen = seen.clone();
    transport
        .subscribe("orders", move |message: TransportMessage| {
            let seen = handler_seen.clone();
            let done_tx = done_tx.clone();
            async move {
                // Slow handler: later messages must still wait their turn.
                tokio::time::sleep(Duration::from_millis(5)).await;
                seen.lock().await.push(message.payload);
                let _ = done_tx.send(());
            }
        })
        .await
        .unwrap();

    for i in 0..5u8 {
        transport
            .publish("orders", Bytes::from(vec![i]))
            .await
            .unwrap();
    }

    for _ in 0..5 {
        done_rx.recv().await.unwrap();
    }

    let seen = seen.lock().await;
    let expected: Vec<Bytes> = (0..5u8).map(|i| Bytes::from(vec![i])).collect();
    assert_eq!(*seen, expected);
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_request_reply() {
    let transport = MemoryTransport::new();
    let responder = transport.clone();

    transport
        .subscribe("echo", move |message: TransportMessage| {
            let responder = responder.clone();
            async move {
                if let Some(reply) = message.reply {
                    responder.publish(&reply, message.payload).await.unwrap();
                }
            }
        })
        .await
        .unwrap();

    let response = transport
        .request("echo", Bytes::from_static(b"ping"), Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(response, "ping");
    assert!(transport.capabilities().direct_reply);
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_request_without_responders() {
    let transport = MemoryTransport::new();

    let result = transport
        .request("nobody", Bytes::new(), Duration::from_millis(50))
        .await;

    assert!(matches!(result, Err(Error::NoResponders(subject)) if subject == "nobody"));
}

#[tracing_test::traced_test]
#[tokio::test(start_paused = true)]
async fn test_request_timeout() {
    let transport = MemoryTransport::new();
    let (handler, _rx) = collector();
    transport.subscribe("silent", handler).await.unwrap();

    let result = transport
        .request("silent", Bytes::new(), Duration::from_millis(100))
        .await;

    assert!(matches!(result, Err(Error::Timeout(_))));
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let transport = MemoryTransport::new();
    let (handler, mut rx) = collector();

    let id = transport.subscribe("topic", handler).await.unwrap();
    transport.unsubscribe(id).await.unwrap();
    assert_eq!(transport.subscription_count().await, 0);

    transport.publish("topic", Bytes::new()).await.unwrap();
    assert!(rx.recv().await.is_none());

    assert!(matches!(
        transport.unsubscribe(id).await,
        Err(Error::UnknownSubscription(_))
    ));
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_invalid_subjects_rejected() {
    let transport = MemoryTransport::new();
    let (handler, _rx) = collector();

    assert!(matches!(
        transport.publish("wire.*", Bytes::new()).await,
        Err(Error::InvalidSubject(_))
    ));
    assert!(matches!(
        transport.subscribe("wire.>.tail", handler).await,
        Err(Error::InvalidSubject(_))
    ));
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_closed_transport() {
    let transport = MemoryTransport::new();
    let (handler, mut rx) = collector();
    transport.subscribe("topic", handler).await.unwrap();

    transport.close().await.unwrap();

    assert!(rx.recv().await.is_none());
    assert!(matches!(transport.connect().await, Err(Error::Closed)));
    assert!(matches!(
        transport.publish("topic", Bytes::new()).await,
        Err(Error::Closed)
    ));
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_inboxes_are_unique() {
    let transport = MemoryTransport::new();

    let a = transport.new_inbox();
    let b = transport.new_inbox();

    assert!(a.starts_with("_INBOX."));
    assert_ne!(a, b);
}
