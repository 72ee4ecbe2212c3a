use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::future::join_all;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::{
    database::models::message,
    delivery::{
        backoff::BackoffPolicy,
        classify::{classify, Disposition},
        rate_gate::RateGate,
        store::MessageStore,
    },
    mailer::{DeliveryError, Mailer},
};

/// Fans a claimed batch out across a bounded set of concurrent handlers.
///
/// Handlers pull from the already-claimed batch, so there is no further
/// store contention inside a batch. Every outcome is written back through
/// the store; a message whose outcome cannot be recorded stays `Claimed`
/// and is rescued by the stale-claim reclaimer.
#[derive(Clone)]
pub struct Dispatcher {
    store: MessageStore,
    mailer: Mailer,
    backoff: BackoffPolicy,
    gate: Arc<RateGate>,
    concurrency: usize,
    send_timeout: Duration,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        store: MessageStore,
        mailer: Mailer,
        backoff: BackoffPolicy,
        gate: Arc<RateGate>,
        concurrency: usize,
        send_timeout: Duration,
    ) -> Self {
        Self {
            store,
            mailer,
            backoff,
            gate,
            concurrency,
            send_timeout,
        }
    }

    /// Process one claimed batch to completion.
    ///
    /// Messages within the batch are processed in no particular order;
    /// per-message failures never abort the batch.
    pub async fn dispatch_batch(&self, batch: Vec<message::Model>) {
        if batch.is_empty() {
            return;
        }

        let handler_count = self.concurrency.clamp(1, batch.len());
        let work = Arc::new(Mutex::new(VecDeque::from(batch)));

        let handlers: Vec<_> = (0..handler_count)
            .map(|_| {
                let dispatcher = self.clone();
                let work = Arc::clone(&work);
                tokio::spawn(async move {
                    loop {
                        let next = work.lock().unwrap().pop_front();
                        let Some(message) = next else { break };
                        dispatcher.deliver(message).await;
                    }
                })
            })
            .collect();

        for handler in join_all(handlers).await {
            if let Err(e) = handler {
                error!("💥 Delivery handler panicked: {e}");
            }
        }
    }

    async fn deliver(&self, message: message::Model) {
        self.gate.acquire().await;

        let send = self.mailer.send(
            &message.destination,
            &message.subject,
            &message.text_body,
            message.html_body.as_deref(),
        );
        let outcome = match timeout(self.send_timeout, send).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DeliveryError::timed_out(self.send_timeout)),
        };

        match outcome {
            Ok(provider_message_id) => {
                info!(
                    "✅ Delivered message {} to {}",
                    message.id, message.destination
                );
                if let Err(e) = self.store.mark_sent(message.id, provider_message_id).await {
                    error!(
                        "Failed to record delivery of message {}: {e}. Leaving it claimed for the reclaimer.",
                        message.id
                    );
                }
            }
            Err(delivery_error) => self.record_failure(&message, &delivery_error).await,
        }
    }

    async fn record_failure(&self, message: &message::Model, error: &DeliveryError) {
        let attempts = message.attempts + 1;
        let exhausted = attempts >= message.max_attempts;

        let written = match classify(error) {
            Disposition::Retry if !exhausted => {
                let delay = self.backoff.next_delay(attempts.unsigned_abs());
                let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                let next_attempt_at =
                    chrono::Utc::now().naive_utc() + chrono::Duration::milliseconds(delay_ms);

                warn!(
                    "⚠️ Retrying message {} in {:?} after attempt {attempts}/{}: {error}",
                    message.id, delay, message.max_attempts
                );
                self.store
                    .mark_retry(message.id, attempts, next_attempt_at, &error.to_string())
                    .await
            }
            Disposition::Retry => {
                error!(
                    "❌ Message {} exhausted all {} attempts: {error}",
                    message.id, message.max_attempts
                );
                self.store
                    .mark_failed(message.id, attempts, &error.to_string())
                    .await
            }
            Disposition::Fail => {
                error!(
                    "❌ Message {} failed permanently on attempt {attempts}: {error}",
                    message.id
                );
                self.store
                    .mark_failed(message.id, attempts, &error.to_string())
                    .await
            }
        };

        if let Err(e) = written {
            error!(
                "Failed to record outcome for message {}: {e}. Leaving it claimed for the reclaimer.",
                message.id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::models::message_status::MessageStatus,
        delivery::store::NewMessage,
        mailer::{ErrorCategory, MockTransport},
    };

    fn dispatcher_with(
        store: &MessageStore,
        transport: &MockTransport,
        concurrency: usize,
    ) -> Dispatcher {
        // Zero base delay keeps retried messages immediately claimable
        let backoff = BackoffPolicy::new(Duration::ZERO, Duration::ZERO, Duration::ZERO);
        Dispatcher::new(
            store.clone(),
            Mailer::Mock(transport.clone()),
            backoff,
            Arc::new(RateGate::with_interval(Duration::ZERO)),
            concurrency,
            Duration::from_secs(30),
        )
    }

    async fn claim_and_dispatch(store: &MessageStore, dispatcher: &Dispatcher) {
        let batch = store.claim_batch(10, "worker-a").await.unwrap();
        dispatcher.dispatch_batch(batch).await;
    }

    #[tokio::test]
    async fn delivers_a_message_and_marks_it_sent() {
        let store = MessageStore::memory();
        let transport = MockTransport::new();
        let dispatcher = dispatcher_with(&store, &transport, 4);

        let model = store
            .enqueue(NewMessage::new("sam@example.com", "Task assigned", "Go"))
            .await
            .unwrap();

        claim_and_dispatch(&store, &dispatcher).await;

        let row = store.find(model.id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Sent);
        assert_eq!(row.provider_message_id.as_deref(), Some("mock-message-id"));
        assert_eq!(transport.messages().len(), 1);
    }

    #[tokio::test]
    async fn retries_twice_then_succeeds_on_the_third_attempt() {
        let store = MessageStore::memory();
        let transport = MockTransport::new();
        transport.fail_next(DeliveryError::status(500, "provider down"));
        transport.fail_next(DeliveryError::transient("connection reset"));
        let dispatcher = dispatcher_with(&store, &transport, 1);

        let model = store
            .enqueue(NewMessage {
                max_attempts: Some(3),
                ..NewMessage::new("sam@example.com", "s", "b")
            })
            .await
            .unwrap();

        // Attempt 1: retryable failure
        claim_and_dispatch(&store, &dispatcher).await;
        let row = store.find(model.id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Queued);
        assert_eq!(row.attempts, 1);
        assert!(row.last_error.as_deref().unwrap().contains("provider down"));
        let first_retry_at = row.next_attempt_at;

        // Attempt 2: retryable failure, eligibility never moves backwards
        claim_and_dispatch(&store, &dispatcher).await;
        let row = store.find(model.id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Queued);
        assert_eq!(row.attempts, 2);
        assert!(row.next_attempt_at >= first_retry_at);

        // Attempt 3: success
        claim_and_dispatch(&store, &dispatcher).await;
        let row = store.find(model.id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Sent);
        assert_eq!(row.attempts, 3);
        assert!(row.last_error.is_none());
        assert_eq!(transport.messages().len(), 3);
    }

    #[tokio::test]
    async fn permanent_errors_short_circuit_regardless_of_remaining_attempts() {
        let store = MessageStore::memory();
        let transport = MockTransport::new();
        transport.fail_next(DeliveryError::category(
            ErrorCategory::MalformedRecipient,
            "invalid recipient address: missing domain",
        ));
        let dispatcher = dispatcher_with(&store, &transport, 4);

        let model = store
            .enqueue(NewMessage {
                max_attempts: Some(5),
                ..NewMessage::new("nobody", "s", "b")
            })
            .await
            .unwrap();

        claim_and_dispatch(&store, &dispatcher).await;

        let row = store.find(model.id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Failed);
        assert_eq!(row.attempts, 1);
        assert!(row
            .last_error
            .as_deref()
            .unwrap()
            .contains("invalid recipient address"));
    }

    #[tokio::test]
    async fn fails_exactly_when_attempts_are_exhausted() {
        let store = MessageStore::memory();
        let transport = MockTransport::new();
        transport.fail_next(DeliveryError::status(503, "overloaded"));
        transport.fail_next(DeliveryError::status(503, "overloaded"));
        let dispatcher = dispatcher_with(&store, &transport, 1);

        let model = store
            .enqueue(NewMessage {
                max_attempts: Some(2),
                ..NewMessage::new("sam@example.com", "s", "b")
            })
            .await
            .unwrap();

        claim_and_dispatch(&store, &dispatcher).await;
        let row = store.find(model.id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Queued, "one attempt left");
        assert_eq!(row.attempts, 1);

        claim_and_dispatch(&store, &dispatcher).await;
        let row = store.find(model.id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Failed);
        assert_eq!(row.attempts, 2);
    }

    #[tokio::test]
    async fn a_failing_message_never_aborts_the_rest_of_the_batch() {
        let store = MessageStore::memory();
        let transport = MockTransport::new();
        transport.fail_next(DeliveryError::status(400, "bad request"));
        let dispatcher = dispatcher_with(&store, &transport, 1);

        let failing = store
            .enqueue(NewMessage::new("first@example.com", "s", "b"))
            .await
            .unwrap();
        let healthy = store
            .enqueue(NewMessage::new("second@example.com", "s", "b"))
            .await
            .unwrap();

        claim_and_dispatch(&store, &dispatcher).await;

        let failed = store.find(failing.id).await.unwrap().unwrap();
        let sent = store.find(healthy.id).await.unwrap().unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(sent.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn drains_a_batch_larger_than_the_handler_pool() {
        let store = MessageStore::memory();
        let transport = MockTransport::new();
        let dispatcher = dispatcher_with(&store, &transport, 3);

        for i in 0..12 {
            store
                .enqueue(NewMessage::new(&format!("user{i}@example.com"), "s", "b"))
                .await
                .unwrap();
        }

        let batch = store.claim_batch(12, "worker-a").await.unwrap();
        assert_eq!(batch.len(), 12);
        dispatcher.dispatch_batch(batch).await;

        assert_eq!(transport.messages().len(), 12);
    }
}
