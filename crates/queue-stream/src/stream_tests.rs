//! Tests for the queue stream.

use super::*;
use crate::config::StreamOptions;
use crate::error::ServiceError;
use crate::message::{LeaseToken, QueueRef};
use crate::test_support::{message, provider_error, Call, RecordingService};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

fn stream(service: &RecordingService) -> QueueStream {
    QueueStream::new(StreamConfig::new("Q").unwrap(), Arc::new(service.clone()))
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Service whose calls park until released, counting how many started
#[derive(Default)]
struct GatedService {
    release: Notify,
    started: AtomicUsize,
    batch: Mutex<Vec<RawMessage>>,
}

impl GatedService {
    fn with_batch(batch: Vec<RawMessage>) -> Arc<Self> {
        Arc::new(Self {
            batch: Mutex::new(batch),
            ..Self::default()
        })
    }

    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueService for GatedService {
    async fn enqueue(&self, _: &QueueRef, _: String, _: u32) -> Result<(), ServiceError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok(())
    }

    async fn dequeue_batch(
        &self,
        _: &QueueRef,
        _: u32,
        _: u32,
        _: u32,
    ) -> Result<Vec<RawMessage>, ServiceError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok(std::mem::take(&mut *self.batch.lock().unwrap()))
    }

    async fn delete_message(&self, _: &QueueRef, _: &LeaseToken) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn extend_lease(&self, _: &QueueRef, _: &LeaseToken, _: u32) -> Result<(), ServiceError> {
        Ok(())
    }
}

// ============================================================================
// Write Side
// ============================================================================

mod write {
    use super::*;

    /// Verify that one write makes exactly one enqueue whose body decodes
    /// back to the payload.
    #[tokio::test]
    async fn test_write_enqueues_serialized_payload() {
        let service = RecordingService::new();
        let payload = json!({"message": "hello", "n": [1, 2, 3]});

        stream(&service)
            .write(NewJob::new(payload.clone()))
            .await
            .unwrap();

        let calls = service.enqueue_calls();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            Call::Enqueue {
                queue,
                body,
                delay_seconds,
            } => {
                assert_eq!(queue, "Q");
                assert_eq!(serde_json::from_str::<Value>(body).unwrap(), payload);
                assert_eq!(*delay_seconds, 0);
            }
            other => panic!("unexpected call: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_passes_delay() {
        let service = RecordingService::new();

        stream(&service)
            .write(NewJob::new("later").with_delay(30))
            .await
            .unwrap();

        assert!(matches!(
            service.enqueue_calls()[0],
            Call::Enqueue {
                delay_seconds: 30,
                ..
            }
        ));
    }

    /// Verify that an unserializable payload fails without an enqueue and
    /// leaves the stream usable.
    #[tokio::test]
    async fn test_unserializable_payload_is_rejected() {
        let service = RecordingService::new();
        let stream = stream(&service);
        let mut payload = HashMap::new();
        payload.insert((1u8, 2u8), "tuple keys have no JSON form");

        let result = stream.write(NewJob::new(payload)).await;

        assert!(matches!(result, Err(StreamError::Serialization(_))));
        assert!(service.enqueue_calls().is_empty());

        stream.write(NewJob::new(json!("next"))).await.unwrap();
        assert_eq!(service.enqueue_calls().len(), 1);
    }

    /// Verify that a failed enqueue is reported once and not retried.
    #[tokio::test]
    async fn test_enqueue_failure_is_not_retried() {
        let service = RecordingService::new();
        service.fail_enqueue();

        let error = stream(&service)
            .write(NewJob::new(json!(1)))
            .await
            .unwrap_err();

        assert_eq!(error.operation(), "enqueue");
        assert_eq!(service.enqueue_calls().len(), 1);
    }

    /// Verify that writes beyond the high water mark wait for a free slot.
    #[tokio::test]
    async fn test_writes_respect_high_water_mark() {
        let service = GatedService::with_batch(Vec::new());
        let stream = Arc::new(QueueStream::new(
            StreamConfig::new("Q").unwrap(),
            service.clone(),
        ));

        let writers: Vec<_> = (0..2)
            .map(|i| {
                let stream = Arc::clone(&stream);
                tokio::spawn(async move { stream.write(NewJob::new(json!(i))).await })
            })
            .collect();

        eventually(|| service.started() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.started(), 1);

        service.release.notify_one();
        eventually(|| service.started() == 2).await;
        service.release.notify_one();

        for writer in writers {
            writer.await.unwrap().unwrap();
        }
    }
}

// ============================================================================
// Read Side
// ============================================================================

mod read {
    use super::*;

    /// Verify that a well-formed message becomes one job carrying the
    /// message's lease token and receive count.
    #[tokio::test]
    async fn test_message_becomes_job() {
        let service = RecordingService::new();
        service.push_batch(vec![message(r#"{"message":"hello"}"#, "L1", 1)]);
        let stream = stream(&service);

        let mut jobs = stream.subscribe::<Value>().unwrap();
        let job = jobs.recv().await.unwrap().unwrap();

        assert_eq!(job.payload, json!({"message": "hello"}));
        assert_eq!(job.lease_token, LeaseToken::new("L1"));
        assert_eq!(job.receive_count, 1);
        stream.close();
    }

    /// Verify that receive calls use the configured batch size, lease and wait.
    #[tokio::test]
    async fn test_dequeue_uses_configuration() {
        let service = RecordingService::new();
        let config = StreamOptions::new("Q")
            .with_high_water_mark(4)
            .with_batch_size(10)
            .with_timeout(45)
            .with_wait(3)
            .build()
            .unwrap();
        let stream = QueueStream::new(config, Arc::new(service.clone()));

        let _jobs = stream.subscribe::<Value>().unwrap();
        eventually(|| service.dequeue_count() >= 1).await;
        stream.close();

        assert_eq!(
            service.calls()[0],
            Call::DequeueBatch {
                queue: "Q".to_string(),
                max_count: 10,
                lease_seconds: 45,
                wait_seconds: 3,
            }
        );
    }

    /// Verify that an empty batch is followed by another receive call with
    /// nothing emitted in between.
    #[tokio::test]
    async fn test_empty_batch_polls_again() {
        let service = RecordingService::new();
        service.push_batch(Vec::new());
        service.push_batch(vec![message("2", "L2", 1)]);
        let stream = stream(&service);

        let mut jobs = stream.subscribe::<Value>().unwrap();
        let first = jobs.recv().await.unwrap().unwrap();

        assert_eq!(first.payload, json!(2));
        assert!(service.dequeue_count() >= 2);
        stream.close();
    }

    /// Verify that empty batches emit nothing to the reader.
    #[tokio::test]
    async fn test_empty_batches_emit_nothing() {
        let service = RecordingService::new();
        let stream = stream(&service);

        let mut jobs = stream.subscribe::<Value>().unwrap();
        eventually(|| service.dequeue_count() >= 3).await;

        let mut next = tokio_test::task::spawn(jobs.recv());
        tokio_test::assert_pending!(next.poll());
        drop(next);
        stream.close();
    }

    /// Verify that a malformed body produces one error scoped to that message
    /// and later messages in the batch are still delivered.
    #[tokio::test]
    async fn test_malformed_body_does_not_stop_batch() {
        let service = RecordingService::new();
        service.push_batch(vec![
            message("{not json", "BAD", 1),
            message(r#"{"ok":true}"#, "GOOD", 1),
        ]);
        let stream = stream(&service);

        let mut jobs = stream.subscribe::<Value>().unwrap();

        match jobs.recv().await.unwrap() {
            Err(StreamError::Deserialization(e)) => {
                assert_eq!(e.lease_token, LeaseToken::new("BAD"));
            }
            other => panic!("unexpected item: {:?}", other),
        }
        let good = jobs.recv().await.unwrap().unwrap();
        assert_eq!(good.lease_token, LeaseToken::new("GOOD"));
        stream.close();
    }

    /// Verify that a typed payload that does not match the body is a
    /// deserialization error too.
    #[tokio::test]
    async fn test_typed_payload_mismatch() {
        #[derive(Debug, serde::Deserialize)]
        struct Greeting {
            #[allow(dead_code)]
            message: String,
        }

        let service = RecordingService::new();
        service.push_batch(vec![message(r#"{"other":1}"#, "L1", 1)]);
        let stream = stream(&service);

        let mut jobs = stream.subscribe::<Greeting>().unwrap();

        assert!(matches!(
            jobs.recv().await.unwrap(),
            Err(StreamError::Deserialization(_))
        ));
        stream.close();
    }

    /// Verify that a failed receive is reported and ends the poll loop.
    #[tokio::test]
    async fn test_service_error_halts_polling() {
        let service = RecordingService::new();
        service.push_dequeue_error(provider_error("boom"));
        service.push_batch(vec![message("1", "L1", 1)]);
        let stream = stream(&service);

        let mut jobs = stream.subscribe::<Value>().unwrap();

        let error = jobs.recv().await.unwrap().unwrap_err();
        assert_eq!(error.operation(), "dequeue_batch");
        assert!(jobs.recv().await.is_none());
        assert_eq!(service.dequeue_count(), 1);
    }

    /// Verify that dropping the receiver stops the poll loop.
    #[tokio::test]
    async fn test_dropped_receiver_stops_polling() {
        let service = RecordingService::new();
        let stream = stream(&service);

        let jobs = stream.subscribe::<Value>().unwrap();
        eventually(|| service.dequeue_count() >= 1).await;
        drop(jobs);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let settled = service.dequeue_count();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(service.dequeue_count(), settled);
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_second_subscriber_is_rejected() {
        let service = RecordingService::new();
        let stream = stream(&service);

        let _jobs = stream.subscribe::<Value>().unwrap();
        let second = stream.subscribe::<Value>();

        assert!(matches!(second, Err(StreamError::AlreadySubscribed)));
        stream.close();
    }

    #[tokio::test]
    async fn test_subscribe_after_close_is_rejected() {
        let service = RecordingService::new();
        let stream = stream(&service);

        stream.close();

        assert!(stream.is_closed());
        assert!(matches!(
            stream.subscribe::<Value>(),
            Err(StreamError::Closed)
        ));
        assert_eq!(service.dequeue_count(), 0);
    }

    /// Verify that close lets the receive call in flight finish, delivers its
    /// messages and then ends the read side without another call.
    #[tokio::test]
    async fn test_close_finishes_in_flight_receive() {
        let service = GatedService::with_batch(vec![message("7", "L7", 1)]);
        let stream = QueueStream::new(StreamConfig::new("Q").unwrap(), service.clone());

        let mut jobs = stream.subscribe::<Value>().unwrap();
        eventually(|| service.started() == 1).await;

        stream.close();
        service.release.notify_one();

        let job = jobs.recv().await.unwrap().unwrap();
        assert_eq!(job.lease_token, LeaseToken::new("L7"));
        assert!(jobs.recv().await.is_none());
        assert_eq!(service.started(), 1);
    }

    /// Verify that writes keep working after the read side closed.
    #[tokio::test]
    async fn test_write_after_close() {
        let service = RecordingService::new();
        let stream = stream(&service);

        stream.close();
        stream.write(NewJob::new(json!("still"))).await.unwrap();

        assert_eq!(service.enqueue_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_lease_keeper_targets_stream_queue() {
        let service = RecordingService::new();
        let config = StreamOptions::new("Q")
            .with_timeout(60)
            .with_extend_lease_by(15)
            .build()
            .unwrap();
        let stream = QueueStream::new(config, Arc::new(service.clone()));

        stream
            .lease_keeper()
            .extend(&LeaseToken::new("L1"), 0.5)
            .await
            .unwrap();

        assert_eq!(
            service.calls(),
            vec![Call::ExtendLease {
                queue: "Q".to_string(),
                lease_token: "L1".to_string(),
                lease_seconds: 15,
            }]
        );
    }
}
