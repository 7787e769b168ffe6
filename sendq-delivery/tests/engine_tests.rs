//! Integration tests for the queue engine state machine

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use sendq_common::{Signal, envelope::Envelope, unix_now};
use sendq_delivery::{
    EngineConfig, EngineError, Executor, FlushOutcome, MockTransport, QueueEngine, RetryPolicy,
};
use sendq_store::{BackingStore, MemoryBackingStore, Message, MessageState};
use tokio::sync::broadcast;

fn envelope() -> Envelope {
    Envelope::new("sender@example.com", vec!["rcpt@example.net".to_string()])
}

fn payload() -> Arc<[u8]> {
    Arc::from(b"Subject: test\r\n\r\nhello".as_slice())
}

/// A policy that retries immediately, for driving the loop by hand.
fn immediate_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        base_delay_secs: 0,
        max_attempts,
        ..RetryPolicy::default()
    }
}

fn build_engine(
    transport: &Arc<MockTransport>,
    policy: RetryPolicy,
) -> (Arc<QueueEngine>, Arc<dyn BackingStore>) {
    let store: Arc<dyn BackingStore> = Arc::new(MemoryBackingStore::new());
    let executor = Executor::new(
        Arc::clone(transport) as Arc<dyn sendq_delivery::Transport>,
        vec![75],
    );
    let engine = Arc::new(QueueEngine::new(
        Arc::clone(&store),
        executor,
        policy,
        EngineConfig {
            poll_interval_secs: 1,
            workers: 1,
        },
    ));
    (engine, store)
}

#[tokio::test]
async fn test_enqueue_round_trip() {
    let transport = Arc::new(MockTransport::new());
    let (engine, _store) = build_engine(&transport, RetryPolicy::default());

    let id = engine
        .enqueue(envelope(), payload())
        .await
        .expect("enqueue");

    let message = engine.status(&id).await.expect("status");
    assert_eq!(message.state, MessageState::Pending);
    assert_eq!(message.attempt_count, 0);
    assert_eq!(message.envelope, envelope());
    assert_eq!(message.payload.as_ref(), payload().as_ref());
    assert_eq!(transport.invocations(), 0, "enqueue must not deliver");
}

#[tokio::test]
async fn test_enqueue_rejects_invalid_envelopes() {
    let transport = Arc::new(MockTransport::new());
    let (engine, _store) = build_engine(&transport, RetryPolicy::default());

    let no_sender = engine
        .enqueue(Envelope::new("", vec!["b@y".to_string()]), payload())
        .await;
    assert!(matches!(no_sender, Err(EngineError::InvalidEnvelope(_))));

    let no_recipients = engine.enqueue(Envelope::new("a@x", vec![]), payload()).await;
    assert!(matches!(no_recipients, Err(EngineError::InvalidEnvelope(_))));
}

#[tokio::test]
async fn test_transient_failures_then_success_delivers() {
    let transport = Arc::new(MockTransport::new());
    transport.push_status(Some(75), "network unreachable");
    transport.push_status(Some(75), "network unreachable");
    transport.push_status(Some(0), "");

    let (engine, _store) = build_engine(&transport, immediate_policy(10));
    let id = engine.enqueue(envelope(), payload()).await.expect("enqueue");

    for _ in 0..3 {
        engine.process_due().await.expect("process");
    }

    let message = engine.status(&id).await.expect("status");
    assert_eq!(message.state, MessageState::Delivered);
    assert_eq!(message.attempt_count, 3);
    assert_eq!(transport.invocations(), 3);
    assert!(message.last_error.is_none());
}

#[tokio::test]
async fn test_exhausted_retries_fail_permanently() {
    let transport = Arc::new(MockTransport::new());
    for _ in 0..3 {
        transport.push_status(Some(75), "still down");
    }

    let (engine, _store) = build_engine(&transport, immediate_policy(3));
    let id = engine.enqueue(envelope(), payload()).await.expect("enqueue");

    for _ in 0..3 {
        engine.process_due().await.expect("process");
    }

    let message = engine.status(&id).await.expect("status");
    assert_eq!(message.state, MessageState::FailedPermanent);
    assert_eq!(message.attempt_count, 3);
    assert_eq!(message.last_error.as_deref().map(str::is_empty), Some(false));

    // Terminal messages are never offered again
    let attempted = engine.process_due().await.expect("process");
    assert_eq!(attempted, 0);
    assert_eq!(transport.invocations(), 3);
}

#[tokio::test]
async fn test_permanent_failure_stops_after_one_attempt() {
    let transport = Arc::new(MockTransport::new());
    transport.push_status(Some(64), "malformed recipient");

    let (engine, _store) = build_engine(&transport, immediate_policy(10));
    let id = engine.enqueue(envelope(), payload()).await.expect("enqueue");

    engine.process_due().await.expect("process");

    let message = engine.status(&id).await.expect("status");
    assert_eq!(message.state, MessageState::FailedPermanent);
    assert_eq!(message.attempt_count, 1);
    assert!(
        message
            .last_error
            .as_deref()
            .expect("error recorded")
            .contains("64")
    );
}

#[tokio::test]
async fn test_scheduled_retry_waits_for_its_due_time() {
    let transport = Arc::new(MockTransport::new());
    transport.push_status(Some(75), "greylisted");

    // Default policy: first retry is 60s out
    let (engine, _store) = build_engine(&transport, RetryPolicy::default());
    let id = engine.enqueue(envelope(), payload()).await.expect("enqueue");

    engine.process_due().await.expect("process");

    let message = engine.status(&id).await.expect("status");
    assert_eq!(message.state, MessageState::RetryScheduled);
    let due = message.next_attempt_at.expect("retry scheduled");
    assert!(due >= unix_now() + 59);

    // Not due yet: nothing to do
    let attempted = engine.process_due().await.expect("process");
    assert_eq!(attempted, 0);
    assert_eq!(transport.invocations(), 1);

    // A forced retry makes it due immediately
    engine.retry_now(&id).await.expect("retry_now");
    let attempted = engine.process_due().await.expect("process");
    assert_eq!(attempted, 1);
    assert_eq!(transport.invocations(), 2);

    let message = engine.status(&id).await.expect("status");
    assert_eq!(message.state, MessageState::Delivered);
}

#[tokio::test]
async fn test_retry_now_rejects_terminal_and_in_flight_messages() {
    let transport = Arc::new(MockTransport::new());
    let (engine, store) = build_engine(&transport, RetryPolicy::default());

    let mut delivered = Message::new(envelope(), payload());
    delivered.state = MessageState::Delivered;
    store.put(&delivered).await.expect("put");
    assert!(matches!(
        engine.retry_now(&delivered.id).await,
        Err(EngineError::InvalidState(_))
    ));

    let mut in_flight = Message::new(envelope(), payload());
    in_flight.state = MessageState::InFlight;
    store.put(&in_flight).await.expect("put");
    assert!(matches!(
        engine.retry_now(&in_flight.id).await,
        Err(EngineError::InvalidState(_))
    ));

    let mut exhausted = Message::new(envelope(), payload());
    exhausted.state = MessageState::FailedPermanent;
    exhausted.attempt_count = 10;
    store.put(&exhausted).await.expect("put");
    assert!(matches!(
        engine.retry_now(&exhausted.id).await,
        Err(EngineError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_retry_now_revives_a_non_exhausted_permanent_failure() {
    let transport = Arc::new(MockTransport::new());
    let (engine, store) = build_engine(&transport, RetryPolicy::default());

    // Failed permanently after 2 of 10 attempts (a permanent transport
    // classification, not exhaustion)
    let mut failed = Message::new(envelope(), payload());
    failed.state = MessageState::FailedPermanent;
    failed.attempt_count = 2;
    store.put(&failed).await.expect("put");

    engine.retry_now(&failed.id).await.expect("retry_now");

    let message = engine.status(&failed.id).await.expect("status");
    assert_eq!(message.state, MessageState::RetryScheduled);
    assert!(message.next_attempt_at.expect("due now") <= unix_now());
}

#[tokio::test]
async fn test_remove_refuses_in_flight_messages() {
    let transport = Arc::new(MockTransport::new());
    let (engine, store) = build_engine(&transport, RetryPolicy::default());

    let mut in_flight = Message::new(envelope(), payload());
    in_flight.state = MessageState::InFlight;
    store.put(&in_flight).await.expect("put");

    assert!(matches!(
        engine.remove(&in_flight.id).await,
        Err(EngineError::Conflict(_))
    ));

    // Still there
    assert!(engine.status(&in_flight.id).await.is_ok());
}

#[tokio::test]
async fn test_remove_delivered_message_then_status_is_not_found() {
    let transport = Arc::new(MockTransport::new());
    let (engine, store) = build_engine(&transport, RetryPolicy::default());

    let mut delivered = Message::new(envelope(), payload());
    delivered.state = MessageState::Delivered;
    store.put(&delivered).await.expect("put");

    engine.remove(&delivered.id).await.expect("remove");
    assert!(matches!(
        engine.status(&delivered.id).await,
        Err(EngineError::NotFound(_))
    ));

    // Removing again is idempotent
    engine.remove(&delivered.id).await.expect("second remove");
}

#[tokio::test]
async fn test_recovery_reverts_interrupted_deliveries() {
    let transport = Arc::new(MockTransport::new());
    let (engine, store) = build_engine(&transport, RetryPolicy::default());

    let mut interrupted = Message::new(envelope(), payload());
    interrupted.state = MessageState::InFlight;
    interrupted.attempt_count = 1;
    store.put(&interrupted).await.expect("put");

    let recovered = engine.recover().await.expect("recover");
    assert_eq!(recovered, 1);

    let message = engine.status(&interrupted.id).await.expect("status");
    assert_eq!(message.state, MessageState::RetryScheduled);
    assert_eq!(message.attempt_count, 2, "the interrupted attempt counts");
    assert!(message.next_attempt_at.is_some());
    assert!(message.last_error.expect("error recorded").contains("interrupted"));
}

#[tokio::test]
async fn test_recovery_never_assumes_delivery() {
    let transport = Arc::new(MockTransport::new());
    let (engine, store) = build_engine(&transport, RetryPolicy::default());

    // One attempt away from the ceiling: recovery must abandon, not
    // deliver
    let mut interrupted = Message::new(envelope(), payload());
    interrupted.state = MessageState::InFlight;
    interrupted.attempt_count = 9;
    store.put(&interrupted).await.expect("put");

    engine.recover().await.expect("recover");

    let message = engine.status(&interrupted.id).await.expect("status");
    assert_eq!(message.state, MessageState::FailedPermanent);
    assert_eq!(message.attempt_count, 10);
}

#[tokio::test]
async fn test_concurrent_passes_attempt_a_message_once() {
    let transport = Arc::new(MockTransport::new());
    let (engine, _store) = build_engine(&transport, immediate_policy(10));

    engine.enqueue(envelope(), payload()).await.expect("enqueue");

    let first = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.process_due().await })
    };
    let second = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.process_due().await })
    };

    first.await.expect("join").expect("process");
    second.await.expect("join").expect("process");

    assert_eq!(
        transport.invocations(),
        1,
        "the claim must admit exactly one delivery attempt"
    );
}

#[tokio::test]
async fn test_flush_completes_once_messages_settle() {
    let transport = Arc::new(MockTransport::new());
    let (engine, _store) = build_engine(&transport, immediate_policy(10));

    let (shutdown_tx, _) = broadcast::channel(4);
    let server = {
        let engine = Arc::clone(&engine);
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { engine.serve(shutdown).await })
    };

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(engine.enqueue(envelope(), payload()).await.expect("enqueue"));
    }

    let outcome = engine
        .flush(Some(Duration::from_secs(10)))
        .await
        .expect("flush");
    assert_eq!(outcome, FlushOutcome::Complete);

    for id in &ids {
        let message = engine.status(id).await.expect("status");
        assert_eq!(message.state, MessageState::Delivered);
    }

    shutdown_tx.send(Signal::Shutdown).expect("signal");
    server.await.expect("join").expect("serve");
}

#[tokio::test]
async fn test_flush_deadline_expires_without_disturbing_the_queue() {
    let transport = Arc::new(MockTransport::new());
    let (engine, _store) = build_engine(&transport, RetryPolicy::default());

    let id = engine.enqueue(envelope(), payload()).await.expect("enqueue");

    // No worker is running, so the message can never settle
    let outcome = engine
        .flush(Some(Duration::from_millis(100)))
        .await
        .expect("flush");
    assert_eq!(outcome, FlushOutcome::TimedOut);

    let message = engine.status(&id).await.expect("status");
    assert_eq!(message.state, MessageState::Pending, "flush must not mutate");
}

#[tokio::test]
async fn test_flush_with_nothing_due_returns_immediately() {
    let transport = Arc::new(MockTransport::new());
    let (engine, _store) = build_engine(&transport, RetryPolicy::default());

    let outcome = engine.flush(None).await.expect("flush");
    assert_eq!(outcome, FlushOutcome::Complete);
}

#[tokio::test]
async fn test_purge_terminal_respects_the_horizon() {
    let transport = Arc::new(MockTransport::new());
    let (engine, store) = build_engine(&transport, RetryPolicy::default());

    let mut old_delivered = Message::new(envelope(), payload());
    old_delivered.state = MessageState::Delivered;
    old_delivered.updated_at = unix_now() - 1000;
    store.put(&old_delivered).await.expect("put");

    let mut fresh_delivered = Message::new(envelope(), payload());
    fresh_delivered.state = MessageState::Delivered;
    store.put(&fresh_delivered).await.expect("put");

    let mut pending = Message::new(envelope(), payload());
    pending.created_at = 0;
    pending.updated_at = 0;
    store.put(&pending).await.expect("put");

    let purged = engine
        .purge_terminal(Duration::from_secs(500))
        .await
        .expect("purge");
    assert_eq!(purged, 1);

    assert!(matches!(
        engine.status(&old_delivered.id).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(engine.status(&fresh_delivered.id).await.is_ok());
    assert!(
        engine.status(&pending.id).await.is_ok(),
        "non-terminal messages are never purged"
    );
}

#[tokio::test]
async fn test_list_filters_by_state() {
    let transport = Arc::new(MockTransport::new());
    let (engine, store) = build_engine(&transport, RetryPolicy::default());

    engine.enqueue(envelope(), payload()).await.expect("enqueue");

    let mut delivered = Message::new(envelope(), payload());
    delivered.state = MessageState::Delivered;
    store.put(&delivered).await.expect("put");

    let all = engine.list(None).await.expect("list");
    assert_eq!(all.len(), 2);

    let pending = engine.list(Some(MessageState::Pending)).await.expect("list");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].state, MessageState::Pending);
}
