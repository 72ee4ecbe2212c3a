use std::time::Duration;

use sqlx::postgres::PgListener;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::{DeliveryConfig, PruneConfig},
    delivery::{dispatcher::Dispatcher, store::MessageStore},
};

/// Channel the enqueue trigger notifies; waking on it lets an idle worker
/// pick up fresh work without waiting out the poll interval.
const NOTIFY_CHANNEL: &str = "message_queued";

/// Owns the poll loop: reclaim, claim, dispatch, idle, shut down.
pub struct DeliveryWorker {
    store: MessageStore,
    dispatcher: Dispatcher,
    config: DeliveryConfig,
    worker_id: String,
    shutdown: CancellationToken,
}

impl DeliveryWorker {
    #[must_use]
    pub fn new(
        store: MessageStore,
        dispatcher: Dispatcher,
        config: DeliveryConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let worker_id = config.resolved_worker_id();
        Self {
            store,
            dispatcher,
            config,
            worker_id,
            shutdown,
        }
    }

    /// Run until shutdown is requested.
    ///
    /// Non-empty batches are dispatched back to back to drain backlog;
    /// the poll sleep only happens when the queue is empty. Cancellation
    /// stops new iterations but never interrupts the in-flight batch, so
    /// no `mark_*` call is cut off mid-write.
    pub async fn run(self) {
        let mut listener = self.connect_listener().await;
        let mut last_reclaim: Option<Instant> = None;
        let poll_interval = Duration::from_secs(self.config.poll_interval_secs);
        let reclaim_interval = Duration::from_secs(self.config.reclaim_interval_secs);

        info!("🚚 Delivery worker '{}' started", self.worker_id);

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if last_reclaim.is_none_or(|at| at.elapsed() >= reclaim_interval) {
                self.reclaim_stale().await;
                last_reclaim = Some(Instant::now());
            }

            match self
                .store
                .claim_batch(self.config.batch_size, &self.worker_id)
                .await
            {
                Ok(batch) if !batch.is_empty() => {
                    debug!(
                        "🔧 Worker '{}' claimed {} message(s)",
                        self.worker_id,
                        batch.len()
                    );
                    self.dispatcher.dispatch_batch(batch).await;
                    // Loop immediately to drain any backlog
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    // Claim and mark operations are atomic, so nothing is
                    // corrupted; pause and try again
                    error!("Message store unavailable: {e}");
                }
            }

            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = idle_wait(&mut listener, poll_interval) => {}
            }
        }

        info!("🚚 Delivery worker '{}' stopped", self.worker_id);
    }

    async fn reclaim_stale(&self) {
        let stale_secs = i64::try_from(self.config.stale_lock_timeout_secs).unwrap_or(i64::MAX);
        let older_than = chrono::Utc::now().naive_utc() - chrono::Duration::seconds(stale_secs);

        match self.store.reclaim_stale(older_than).await {
            Ok(0) => {}
            Ok(count) => info!("🚑 Reclaimed {count} stale claim(s)"),
            Err(e) => warn!("Failed to reclaim stale claims: {e}"),
        }
    }

    async fn connect_listener(&self) -> Option<PgListener> {
        let pool = self.store.postgres_connection_pool()?;

        match PgListener::connect_with(pool).await {
            Ok(mut listener) => match listener.listen(NOTIFY_CHANNEL).await {
                Ok(()) => {
                    info!(
                        "Worker '{}' listening for enqueue notifications",
                        self.worker_id
                    );
                    Some(listener)
                }
                Err(e) => {
                    warn!(
                        "Worker '{}' failed to LISTEN on '{NOTIFY_CHANNEL}': {e}. Using polling only.",
                        self.worker_id
                    );
                    None
                }
            },
            Err(e) => {
                warn!(
                    "Worker '{}' failed to create listener: {e}. Using polling only.",
                    self.worker_id
                );
                None
            }
        }
    }
}

/// Wait for an enqueue notification or, without a listener, one poll
/// interval. A broken listener downgrades the worker to plain polling.
async fn idle_wait(listener: &mut Option<PgListener>, poll_interval: Duration) {
    match listener {
        Some(active) => match timeout(poll_interval, active.recv()).await {
            Ok(Ok(_notification)) => {
                debug!("Received enqueue notification");
            }
            Ok(Err(e)) => {
                error!("Listener failed: {e}. Switching to polling.");
                *listener = None;
                sleep(Duration::from_secs(1)).await;
            }
            Err(_) => {
                // Poll interval elapsed without a notification
            }
        },
        None => sleep(poll_interval).await,
    }
}

/// Periodically delete aged terminal messages.
pub async fn run_prune_loop(store: MessageStore, config: PruneConfig, shutdown: CancellationToken) {
    info!("🧹 Starting retention sweep task");
    let interval = Duration::from_secs(config.interval_secs);

    loop {
        let now = chrono::Utc::now().naive_utc();
        let sent_cutoff =
            now - chrono::Duration::seconds(
                i64::try_from(config.sent_retention_secs).unwrap_or(i64::MAX),
            );
        let failed_cutoff =
            now - chrono::Duration::seconds(
                i64::try_from(config.failed_retention_secs).unwrap_or(i64::MAX),
            );

        match store
            .prune_terminal(sent_cutoff, failed_cutoff, config.batch_size)
            .await
        {
            Ok(0) => {}
            Ok(count) => debug!("🧹 Deleted {count} old message(s)"),
            Err(e) => error!("🧹 Failed to prune old messages: {e}"),
        }

        tokio::select! {
            () = shutdown.cancelled() => break,
            () = sleep(interval) => {}
        }
    }
}
