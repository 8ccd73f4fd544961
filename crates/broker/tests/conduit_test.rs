mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use wire_broker::{
    ConduitConfig, ConduitReceiver, Error, HandlerError, ReceiverConfig, SenderConfig,
    TopicContext,
};
use wire_coordination::CoordinationAdapter;
use wire_coordination_memory::MemoryCoordinationAdapter;
use wire_transport_memory::MemoryTransport;

use common::{Harness, receiver_config, sender_config};

type TestConduit = ConduitReceiver<MemoryCoordinationAdapter, MemoryTransport>;

fn conduit<F, Fut>(harness: &Harness, config: ReceiverConfig, setup: F) -> TestConduit
where
    F: Fn(TopicContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    conduit_with(harness, config, ConduitConfig::default(), setup)
}

fn conduit_with<F, Fut>(
    harness: &Harness,
    config: ReceiverConfig,
    conduit_config: ConduitConfig,
    setup: F,
) -> TestConduit
where
    F: Fn(TopicContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    ConduitReceiver::new(
        config,
        ConduitConfig {
            ttl_check_interval: Duration::from_millis(50),
            ..conduit_config
        },
        harness.coordination.clone(),
        harness.transport.clone(),
        setup,
    )
}

/// Setup that waits `delay` and then registers a handler taking `work` per message and
/// recording each payload's `n` once it finishes.
fn slow_setup(
    delay: Duration,
    work: Duration,
    finished: Arc<Mutex<Vec<Value>>>,
) -> impl Fn(TopicContext) -> futures::future::BoxFuture<'static, Result<(), HandlerError>>
+ Send
+ Sync
+ 'static {
    move |ctx: TopicContext| {
        let finished = finished.clone();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            ctx.on_message(move |_topic: String, payload: Value| {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(work).await;
                    finished.lock().push(payload["n"].clone());
                    Ok::<_, HandlerError>(payload)
                }
            })?;
            Ok(())
        })
    }
}

#[tracing_test::traced_test]
#[tokio::test(start_paused = true)]
async fn test_messages_queue_until_handler_registered() {
    let harness = Harness::new();
    let setups = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let setup_count = setups.clone();
    let handler_seen = seen.clone();
    let conduit = conduit(&harness, receiver_config("r1"), move |ctx: TopicContext| {
        setup_count.fetch_add(1, Ordering::SeqCst);
        let seen = handler_seen.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ctx.on_message(move |topic: String, payload: Value| {
                seen.lock().push(payload["n"].clone());
                async move { Ok::<_, HandlerError>(json!({"topic": topic, "n": payload["n"]})) }
            })?;
            Ok(())
        }
    });
    conduit.start().await.unwrap();
    let sender = harness.sender(sender_config());

    let (a, b) = tokio::join!(
        sender.send("room", json!({"n": 1}), None),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sender.send("room", json!({"n": 2}), None).await
        }
    );

    assert_eq!(a.unwrap().result, Some(json!({"topic": "room", "n": 1})));
    assert_eq!(b.unwrap().result, Some(json!({"topic": "room", "n": 2})));
    assert_eq!(*seen.lock(), vec![json!(1), json!(2)]);
    assert_eq!(setups.load(Ordering::SeqCst), 1);
    assert_eq!(conduit.active_topics(), vec!["room".to_string()]);

    sender.send("room", json!({"n": 3}), None).await.unwrap();
    assert_eq!(setups.load(Ordering::SeqCst), 1);
}

#[tracing_test::traced_test]
#[tokio::test(start_paused = true)]
async fn test_failed_setup_rejects_and_retries_on_next_message() {
    let harness = Harness::new();
    let setups = Arc::new(AtomicUsize::new(0));

    let setup_count = setups.clone();
    let conduit = conduit(&harness, receiver_config("r1"), move |ctx: TopicContext| {
        let attempt = setup_count.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt == 0 {
                return Err::<(), HandlerError>("no database".into());
            }
            ctx.on_message(|_topic: String, _payload: Value| async {
                Ok::<_, HandlerError>(json!("ready"))
            })?;
            Ok(())
        }
    });
    conduit.start().await.unwrap();
    let sender = harness.sender(sender_config());

    let failed = sender.send("db", json!({}), None).await.unwrap();
    assert!(!failed.success);
    assert!(failed.error.unwrap().contains("no database"));
    assert!(conduit.active_topics().is_empty());

    let ok = sender.send("db", json!({}), None).await.unwrap();
    assert_eq!(ok.result, Some(json!("ready")));
    assert_eq!(setups.load(Ordering::SeqCst), 2);
}

#[tracing_test::traced_test]
#[tokio::test(start_paused = true)]
async fn test_setup_without_handler_rejects() {
    let harness = Harness::new();
    let conduit = conduit(&harness, receiver_config("r1"), |_ctx: TopicContext| async {
        Ok::<(), HandlerError>(())
    });
    conduit.start().await.unwrap();
    let sender = harness.sender(sender_config());

    let response = sender.send("empty", json!({}), None).await.unwrap();

    assert!(!response.success);
    assert!(response.error.unwrap().contains("no message handler"));
    assert!(conduit.active_topics().is_empty());
}

#[tracing_test::traced_test]
#[tokio::test(start_paused = true)]
async fn test_second_handler_registration_fails() {
    let harness = Harness::new();
    let (tx, mut results) = mpsc::unbounded_channel();
    let conduit = conduit(&harness, receiver_config("r1"), move |ctx: TopicContext| {
        let tx = tx.clone();
        async move {
            ctx.on_message(|_topic: String, _payload: Value| async {
                Ok::<_, HandlerError>(json!(1))
            })?;
            let second = ctx.on_message(|_topic: String, _payload: Value| async {
                Ok::<_, HandlerError>(json!(2))
            });
            let _ = tx.send(second);
            Ok(())
        }
    });
    conduit.start().await.unwrap();
    let sender = harness.sender(sender_config());

    let response = sender.send("once", json!({}), None).await.unwrap();

    assert_eq!(response.result, Some(json!(1)));
    assert_matches!(
        results.recv().await.unwrap(),
        Err(Error::HandlerAlreadyRegistered(topic)) if topic == "once"
    );
}

#[tracing_test::traced_test]
#[tokio::test(start_paused = true)]
async fn test_ttl_expiry_closes_and_releases() {
    let harness = Harness::new();
    let (tx, mut closed) = mpsc::unbounded_channel();
    let conduit = conduit(&harness, receiver_config("r1"), move |ctx: TopicContext| {
        let tx = tx.clone();
        async move {
            ctx.extend_ttl(Duration::from_millis(200))?;
            for step in ["flush", "disconnect"] {
                let tx = tx.clone();
                ctx.on_close(move || async move {
                    let _ = tx.send(step);
                })?;
            }
            ctx.on_message(|_topic: String, payload: Value| async { Ok::<_, HandlerError>(payload) })?;
            Ok(())
        }
    });
    conduit.start().await.unwrap();
    let sender = harness.sender(sender_config());

    sender.send("lease", json!({}), None).await.unwrap();
    assert!(conduit.receiver().owns_topic("lease"));

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(closed.recv().await.unwrap(), "flush");
    assert_eq!(closed.recv().await.unwrap(), "disconnect");
    assert!(conduit.active_topics().is_empty());
    assert!(!conduit.receiver().owns_topic("lease"));
    assert_eq!(
        harness.coordination.get_topic_owner("lease").await.unwrap(),
        None
    );
}

#[tracing_test::traced_test]
#[tokio::test(start_paused = true)]
async fn test_voluntary_close_from_context() {
    let harness = Harness::new();
    let contexts = Arc::new(Mutex::new(Vec::new()));

    let stored = contexts.clone();
    let conduit = conduit(&harness, receiver_config("r1"), move |ctx: TopicContext| {
        stored.lock().push(ctx.clone());
        async move {
            ctx.on_message(|_topic: String, _payload: Value| async {
                Ok::<_, HandlerError>(json!(null))
            })?;
            Ok(())
        }
    });
    conduit.start().await.unwrap();
    let sender = harness.sender(sender_config());
    sender.send("session", json!({}), None).await.unwrap();

    let ctx = contexts.lock().pop().unwrap();
    ctx.close().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(conduit.active_topics().is_empty());
    assert_eq!(
        harness.coordination.get_topic_owner("session").await.unwrap(),
        None
    );
    assert_matches!(ctx.extend_ttl(Duration::from_secs(1)), Err(Error::TopicClosed(_)));

    // A new message sets the topic up again.
    sender.send("session", json!({}), None).await.unwrap();
    assert_eq!(conduit.active_topics(), vec!["session".to_string()]);
}

#[tracing_test::traced_test]
#[tokio::test(start_paused = true)]
async fn test_ownership_loss_closes_without_release() {
    let harness = Harness::new();
    let (tx, mut closed) = mpsc::unbounded_channel();
    let conduit = conduit(&harness, receiver_config("r1"), move |ctx: TopicContext| {
        let tx = tx.clone();
        async move {
            let topic = ctx.topic().to_string();
            ctx.on_close(move || async move {
                let _ = tx.send(topic);
            })?;
            ctx.on_message(|_topic: String, _payload: Value| async {
                Ok::<_, HandlerError>(json!(null))
            })?;
            Ok(())
        }
    });
    conduit.start().await.unwrap();
    let sender = harness.sender(SenderConfig {
        ownership_claim_ttl: Duration::from_millis(50),
        ..sender_config()
    });
    sender.send("contested", json!({}), None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    harness
        .coordination
        .claim_topic_ownership("contested", "r2", Duration::from_secs(30))
        .await
        .unwrap();
    conduit.receiver().ownership().renew_all().await;

    assert_eq!(closed.recv().await.unwrap(), "contested");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(conduit.active_topics().is_empty());
    assert_eq!(
        harness.coordination.get_topic_owner("contested").await.unwrap(),
        Some("r2".to_string())
    );
}

#[tracing_test::traced_test]
#[tokio::test(start_paused = true)]
async fn test_stop_runs_close_handlers() {
    let harness = Harness::new();
    let (tx, mut closed) = mpsc::unbounded_channel();
    let conduit = conduit(&harness, receiver_config("r1"), move |ctx: TopicContext| {
        let tx = tx.clone();
        async move {
            ctx.on_close(move || async move {
                let _ = tx.send(());
            })?;
            ctx.on_message(|_topic: String, _payload: Value| async {
                Ok::<_, HandlerError>(json!(null))
            })?;
            Ok(())
        }
    });
    conduit.start().await.unwrap();
    let sender = harness.sender(sender_config());
    sender.send("a", json!({}), None).await.unwrap();
    sender.send("b", json!({}), None).await.unwrap();

    conduit.stop().await.unwrap();

    closed.recv().await.unwrap();
    closed.recv().await.unwrap();
    assert!(conduit.active_topics().is_empty());
    assert_eq!(conduit.receiver().owned_topic_count(), 0);
}

#[tracing_test::traced_test]
#[tokio::test(start_paused = true)]
async fn test_full_pending_queue_is_not_cached() {
    let harness = Harness::new();
    let finished = Arc::new(Mutex::new(Vec::new()));
    let conduit = conduit_with(
        &harness,
        receiver_config("r1"),
        ConduitConfig {
            max_pending_messages: 1,
            ..ConduitConfig::default()
        },
        slow_setup(Duration::from_millis(100), Duration::ZERO, finished.clone()),
    );
    conduit.start().await.unwrap();
    let sender = harness.sender(sender_config());

    let (first, rejected) = tokio::join!(
        sender.send_with_message_id("m1", "room", json!({"n": 1}), None),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sender
                .send_with_message_id("m2", "room", json!({"n": 2}), None)
                .await
        }
    );

    assert!(first.unwrap().success);
    let rejected = rejected.unwrap();
    assert!(!rejected.success);
    assert!(rejected.error.unwrap().contains("pending message queue full"));

    let retried = sender
        .send_with_message_id("m2", "room", json!({"n": 2}), None)
        .await
        .unwrap();

    assert!(retried.success);
    assert_eq!(retried.result, Some(json!({"n": 2})));
    assert_eq!(*finished.lock(), vec![json!(1), json!(2)]);
}

#[tracing_test::traced_test]
#[tokio::test(start_paused = true)]
async fn test_messages_after_registration_wait_for_queue() {
    let harness = Harness::new();
    let finished = Arc::new(Mutex::new(Vec::new()));
    let conduit = conduit(
        &harness,
        receiver_config("r1"),
        slow_setup(
            Duration::from_millis(100),
            Duration::from_millis(50),
            finished.clone(),
        ),
    );
    conduit.start().await.unwrap();
    let sender = harness.sender(sender_config());

    // The handler is registered at 100ms and works through 1 and 2 until 200ms; 3 arrives in
    // between and must wait its turn.
    let (a, b, c) = tokio::join!(
        sender.send("room", json!({"n": 1}), None),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sender.send("room", json!({"n": 2}), None).await
        },
        async {
            tokio::time::sleep(Duration::from_millis(120)).await;
            sender.send("room", json!({"n": 3}), None).await
        }
    );

    assert!(a.unwrap().success);
    assert!(b.unwrap().success);
    assert!(c.unwrap().success);
    assert_eq!(*finished.lock(), vec![json!(1), json!(2), json!(3)]);
}
