use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::NaiveDateTime;
use sea_orm::{
    sea_query::{Expr, LockBehavior, LockType},
    ActiveEnum, ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use tokio::time::sleep;
use uuid::Uuid;

use crate::database::models::{
    message::{self, Entity as MessageEntity},
    message_status::MessageStatus,
};

/// Attempts granted to a message unless the producer asks otherwise.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Producer-facing payload for [`MessageStore::enqueue`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub destination: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
    /// Opaque key for producer-side deduplication
    pub idempotency_key: Option<String>,
    /// Overrides [`DEFAULT_MAX_ATTEMPTS`] when set
    pub max_attempts: Option<i32>,
}

impl NewMessage {
    #[must_use]
    pub fn new(destination: &str, subject: &str, text_body: &str) -> Self {
        Self {
            destination: destination.to_string(),
            subject: subject.to_string(),
            text_body: text_body.to_string(),
            html_body: None,
            idempotency_key: None,
            max_attempts: None,
        }
    }
}

/// Durable queue of outbound messages, shared by every worker process.
///
/// The store is the sole cross-process serialization point: all state
/// transitions go through these operations, never through ad-hoc field
/// writes. The in-memory variant honors the same contract under a mutex,
/// so the dispatcher and worker can be exercised without Postgres.
#[derive(Clone, Debug)]
pub enum MessageStore {
    /// Postgres-backed store for production
    Database(DatabaseConnection),
    /// In-memory store for testing
    Memory(MemoryStore),
}

impl MessageStore {
    /// Create an in-memory store for testing
    #[must_use]
    pub fn memory() -> Self {
        Self::Memory(MemoryStore::default())
    }

    /// The sqlx pool backing a database store, for LISTEN support.
    #[must_use]
    pub fn postgres_connection_pool(&self) -> Option<&sqlx::PgPool> {
        match self {
            Self::Database(db) => Some(db.get_postgres_connection_pool()),
            Self::Memory(_) => None,
        }
    }

    /// Insert a new message as `Queued`, eligible immediately.
    ///
    /// Safe to call concurrently from any number of producers; on the
    /// database backend the insert trigger notifies idle workers.
    pub async fn enqueue(&self, new_message: NewMessage) -> Result<message::Model, DbErr> {
        let now = chrono::Utc::now().naive_utc();

        match self {
            Self::Database(db) => {
                let model = message::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    created_at: sea_orm::NotSet,
                    updated_at: sea_orm::NotSet,
                    destination: Set(new_message.destination),
                    subject: Set(new_message.subject),
                    text_body: Set(new_message.text_body),
                    html_body: Set(new_message.html_body),
                    idempotency_key: Set(new_message.idempotency_key),
                    status: Set(MessageStatus::Queued),
                    attempts: Set(0),
                    max_attempts: Set(new_message.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS)),
                    next_attempt_at: Set(now),
                    claimed_at: Set(None),
                    claimed_by: Set(None),
                    last_error: Set(None),
                    provider_message_id: Set(None),
                };

                model.insert(db).await
            }
            Self::Memory(memory) => Ok(memory.enqueue(new_message, now)),
        }
    }

    /// Atomically claim up to `limit` eligible messages for `worker_id`.
    ///
    /// Eligible means `Queued` with `next_attempt_at` in the past; oldest
    /// eligibility first. No two concurrent callers ever receive the same
    /// message: the database backend selects with `FOR UPDATE SKIP LOCKED`
    /// inside one transaction, so competing workers skip each other's rows
    /// instead of double-claiming them.
    pub async fn claim_batch(
        &self,
        limit: u64,
        worker_id: &str,
    ) -> Result<Vec<message::Model>, DbErr> {
        let now = chrono::Utc::now().naive_utc();

        let batch = match self {
            Self::Database(db) => {
                let txn = db.begin().await?;

                let rows = MessageEntity::find()
                    .filter(message::Column::Status.eq(MessageStatus::Queued))
                    .filter(message::Column::NextAttemptAt.lte(now))
                    .order_by_asc(message::Column::NextAttemptAt)
                    .limit(limit)
                    .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
                    .all(&txn)
                    .await?;

                let mut claimed = Vec::with_capacity(rows.len());
                for row in rows {
                    let mut active: message::ActiveModel = row.into();
                    active.status = Set(MessageStatus::Claimed);
                    active.claimed_at = Set(Some(now));
                    active.claimed_by = Set(Some(worker_id.to_string()));
                    claimed.push(active.update(&txn).await?);
                }

                txn.commit().await?;
                claimed
            }
            Self::Memory(memory) => memory.claim_batch(limit, worker_id, now),
        };

        ensure_distinct(&batch)?;
        Ok(batch)
    }

    /// Record a successful delivery: `Claimed` → `Sent`, lease and last
    /// error cleared.
    pub async fn mark_sent(
        &self,
        id: Uuid,
        provider_message_id: Option<String>,
    ) -> Result<(), DbErr> {
        match self {
            Self::Database(db) => {
                MessageEntity::update_many()
                    .col_expr(message::Column::Status, MessageStatus::Sent.as_enum())
                    .col_expr(
                        message::Column::ClaimedAt,
                        Expr::value(Option::<NaiveDateTime>::None),
                    )
                    .col_expr(
                        message::Column::ClaimedBy,
                        Expr::value(Option::<String>::None),
                    )
                    .col_expr(
                        message::Column::LastError,
                        Expr::value(Option::<String>::None),
                    )
                    .col_expr(
                        message::Column::ProviderMessageId,
                        Expr::value(provider_message_id),
                    )
                    .filter(message::Column::Id.eq(id))
                    .filter(message::Column::Status.eq(MessageStatus::Claimed))
                    .exec(db)
                    .await?;
                Ok(())
            }
            Self::Memory(memory) => {
                memory.update_claimed(id, |row| {
                    row.status = MessageStatus::Sent;
                    row.claimed_at = None;
                    row.claimed_by = None;
                    row.last_error = None;
                    row.provider_message_id = provider_message_id.clone();
                });
                Ok(())
            }
        }
    }

    /// Record a retryable failure: `Claimed` → `Queued`, eligible again at
    /// `next_attempt_at`.
    pub async fn mark_retry(
        &self,
        id: Uuid,
        attempts: i32,
        next_attempt_at: NaiveDateTime,
        error: &str,
    ) -> Result<(), DbErr> {
        match self {
            Self::Database(db) => {
                MessageEntity::update_many()
                    .col_expr(message::Column::Status, MessageStatus::Queued.as_enum())
                    .col_expr(message::Column::Attempts, Expr::value(attempts))
                    .col_expr(message::Column::NextAttemptAt, Expr::value(next_attempt_at))
                    .col_expr(
                        message::Column::LastError,
                        Expr::value(Some(error.to_string())),
                    )
                    .col_expr(
                        message::Column::ClaimedAt,
                        Expr::value(Option::<NaiveDateTime>::None),
                    )
                    .col_expr(
                        message::Column::ClaimedBy,
                        Expr::value(Option::<String>::None),
                    )
                    .filter(message::Column::Id.eq(id))
                    .filter(message::Column::Status.eq(MessageStatus::Claimed))
                    .exec(db)
                    .await?;
                Ok(())
            }
            Self::Memory(memory) => {
                memory.update_claimed(id, |row| {
                    row.status = MessageStatus::Queued;
                    row.attempts = attempts;
                    row.next_attempt_at = next_attempt_at;
                    row.last_error = Some(error.to_string());
                    row.claimed_at = None;
                    row.claimed_by = None;
                });
                Ok(())
            }
        }
    }

    /// Record a permanent failure: `Claimed` → `Failed`, terminal.
    pub async fn mark_failed(&self, id: Uuid, attempts: i32, error: &str) -> Result<(), DbErr> {
        match self {
            Self::Database(db) => {
                MessageEntity::update_many()
                    .col_expr(message::Column::Status, MessageStatus::Failed.as_enum())
                    .col_expr(message::Column::Attempts, Expr::value(attempts))
                    .col_expr(
                        message::Column::LastError,
                        Expr::value(Some(error.to_string())),
                    )
                    .col_expr(
                        message::Column::ClaimedAt,
                        Expr::value(Option::<NaiveDateTime>::None),
                    )
                    .col_expr(
                        message::Column::ClaimedBy,
                        Expr::value(Option::<String>::None),
                    )
                    .filter(message::Column::Id.eq(id))
                    .filter(message::Column::Status.eq(MessageStatus::Claimed))
                    .exec(db)
                    .await?;
                Ok(())
            }
            Self::Memory(memory) => {
                memory.update_claimed(id, |row| {
                    row.status = MessageStatus::Failed;
                    row.attempts = attempts;
                    row.last_error = Some(error.to_string());
                    row.claimed_at = None;
                    row.claimed_by = None;
                });
                Ok(())
            }
        }
    }

    /// Return abandoned claims to the queue.
    ///
    /// Every `Claimed` message whose lease started before `older_than`
    /// goes back to `Queued` with the lease cleared; `attempts` and
    /// `next_attempt_at` are untouched, so the rescued message keeps its
    /// place in the retry schedule. Terminal messages are never affected.
    pub async fn reclaim_stale(&self, older_than: NaiveDateTime) -> Result<u64, DbErr> {
        match self {
            Self::Database(db) => {
                let result = MessageEntity::update_many()
                    .col_expr(message::Column::Status, MessageStatus::Queued.as_enum())
                    .col_expr(
                        message::Column::ClaimedAt,
                        Expr::value(Option::<NaiveDateTime>::None),
                    )
                    .col_expr(
                        message::Column::ClaimedBy,
                        Expr::value(Option::<String>::None),
                    )
                    .filter(message::Column::Status.eq(MessageStatus::Claimed))
                    .filter(message::Column::ClaimedAt.lt(older_than))
                    .exec(db)
                    .await?;
                Ok(result.rows_affected)
            }
            Self::Memory(memory) => Ok(memory.reclaim_stale(older_than)),
        }
    }

    /// Delete aged terminal messages in bounded batches; returns the total
    /// number removed.
    pub async fn prune_terminal(
        &self,
        sent_cutoff: NaiveDateTime,
        failed_cutoff: NaiveDateTime,
        batch_size: u64,
    ) -> Result<u64, DbErr> {
        match self {
            Self::Database(db) => {
                let mut total = 0;
                total +=
                    prune_by_status(db, MessageStatus::Sent, sent_cutoff, batch_size).await?;
                total +=
                    prune_by_status(db, MessageStatus::Failed, failed_cutoff, batch_size).await?;
                Ok(total)
            }
            Self::Memory(memory) => Ok(memory.prune_terminal(sent_cutoff, failed_cutoff)),
        }
    }

    /// Look up a single message.
    pub async fn find(&self, id: Uuid) -> Result<Option<message::Model>, DbErr> {
        match self {
            Self::Database(db) => MessageEntity::find_by_id(id).one(db).await,
            Self::Memory(memory) => Ok(memory.find(id)),
        }
    }
}

/// A duplicate id in one claimed batch means the store's atomicity is
/// broken; surface it instead of delivering the same message twice.
fn ensure_distinct(batch: &[message::Model]) -> Result<(), DbErr> {
    let mut seen = HashSet::with_capacity(batch.len());
    for row in batch {
        if !seen.insert(row.id) {
            return Err(DbErr::Custom(format!(
                "claim returned duplicate message id {}",
                row.id
            )));
        }
    }
    Ok(())
}

async fn prune_by_status(
    db: &DatabaseConnection,
    status: MessageStatus,
    cutoff: NaiveDateTime,
    batch_size: u64,
) -> Result<u64, DbErr> {
    let mut total = 0;

    loop {
        let old_messages = MessageEntity::find()
            .filter(message::Column::Status.eq(status))
            .filter(message::Column::CreatedAt.lte(cutoff))
            .order_by_asc(message::Column::CreatedAt)
            .limit(batch_size)
            .all(db)
            .await?;

        if old_messages.is_empty() {
            break;
        }

        let ids: Vec<Uuid> = old_messages.iter().map(|m| m.id).collect();
        total += ids.len() as u64;

        MessageEntity::delete_many()
            .filter(message::Column::Id.is_in(ids))
            .exec(db)
            .await?;

        // Small delay between batches to avoid overwhelming the database
        sleep(Duration::from_millis(100)).await;
    }

    Ok(total)
}

/// Mutex-guarded rows honoring the same claim contract as Postgres.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    rows: Arc<Mutex<Vec<message::Model>>>,
}

impl MemoryStore {
    fn enqueue(&self, new_message: NewMessage, now: NaiveDateTime) -> message::Model {
        let model = message::Model {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            destination: new_message.destination,
            subject: new_message.subject,
            text_body: new_message.text_body,
            html_body: new_message.html_body,
            idempotency_key: new_message.idempotency_key,
            status: MessageStatus::Queued,
            attempts: 0,
            max_attempts: new_message.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            next_attempt_at: now,
            claimed_at: None,
            claimed_by: None,
            last_error: None,
            provider_message_id: None,
        };

        self.rows.lock().unwrap().push(model.clone());
        model
    }

    fn claim_batch(&self, limit: u64, worker_id: &str, now: NaiveDateTime) -> Vec<message::Model> {
        let mut rows = self.rows.lock().unwrap();

        let mut eligible: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.is_claimable(now))
            .map(|(index, _)| index)
            .collect();
        eligible.sort_by_key(|&index| rows[index].next_attempt_at);
        eligible.truncate(usize::try_from(limit).unwrap_or(usize::MAX));

        eligible
            .into_iter()
            .map(|index| {
                let row = &mut rows[index];
                row.status = MessageStatus::Claimed;
                row.claimed_at = Some(now);
                row.claimed_by = Some(worker_id.to_string());
                row.clone()
            })
            .collect()
    }

    fn update_claimed(&self, id: Uuid, apply: impl FnOnce(&mut message::Model)) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows
            .iter_mut()
            .find(|row| row.id == id && row.status == MessageStatus::Claimed)
        {
            apply(row);
            row.updated_at = chrono::Utc::now().naive_utc();
        }
    }

    fn reclaim_stale(&self, older_than: NaiveDateTime) -> u64 {
        let mut rows = self.rows.lock().unwrap();
        let mut reclaimed = 0;

        for row in rows.iter_mut() {
            if row.status == MessageStatus::Claimed
                && row.claimed_at.is_some_and(|at| at < older_than)
            {
                row.status = MessageStatus::Queued;
                row.claimed_at = None;
                row.claimed_by = None;
                reclaimed += 1;
            }
        }

        reclaimed
    }

    fn prune_terminal(&self, sent_cutoff: NaiveDateTime, failed_cutoff: NaiveDateTime) -> u64 {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();

        rows.retain(|row| match row.status {
            MessageStatus::Sent => row.created_at > sent_cutoff,
            MessageStatus::Failed => row.created_at > failed_cutoff,
            MessageStatus::Queued | MessageStatus::Claimed => true,
        });

        (before - rows.len()) as u64
    }

    fn find(&self, id: Uuid) -> Option<message::Model> {
        self.rows.lock().unwrap().iter().find(|r| r.id == id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use futures_util::future::join_all;

    use super::*;

    fn past(seconds: i64) -> NaiveDateTime {
        chrono::Utc::now().naive_utc() - chrono::Duration::seconds(seconds)
    }

    #[tokio::test]
    async fn enqueue_starts_queued_and_immediately_eligible() {
        let store = MessageStore::memory();

        let model = store
            .enqueue(NewMessage::new("sam@example.com", "Sprint started", "Go"))
            .await
            .unwrap();

        assert_eq!(model.status, MessageStatus::Queued);
        assert_eq!(model.attempts, 0);
        assert_eq!(model.max_attempts, DEFAULT_MAX_ATTEMPTS);

        let batch = store.claim_batch(10, "worker-a").await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, model.id);
    }

    #[tokio::test]
    async fn enqueue_preserves_the_producer_payload() {
        let store = MessageStore::memory();

        let model = store
            .enqueue(NewMessage {
                html_body: Some("<p>Go</p>".to_string()),
                idempotency_key: Some("task-42-assigned".to_string()),
                ..NewMessage::new("sam@example.com", "Sprint started", "Go")
            })
            .await
            .unwrap();

        assert_eq!(model.html_body.as_deref(), Some("<p>Go</p>"));
        assert_eq!(model.idempotency_key.as_deref(), Some("task-42-assigned"));
    }

    #[tokio::test]
    async fn claim_sets_the_lease_and_hides_the_message() {
        let store = MessageStore::memory();
        store
            .enqueue(NewMessage::new("sam@example.com", "s", "b"))
            .await
            .unwrap();

        let batch = store.claim_batch(10, "worker-a").await.unwrap();
        assert_eq!(batch[0].status, MessageStatus::Claimed);
        assert_eq!(batch[0].claimed_by.as_deref(), Some("worker-a"));
        assert!(batch[0].claimed_at.is_some());

        // Already claimed; a second claim finds nothing
        let second = store.claim_batch(10, "worker-b").await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn concurrent_claimers_never_share_a_message() {
        let store = MessageStore::memory();
        for i in 0..50 {
            store
                .enqueue(NewMessage::new(&format!("user{i}@example.com"), "s", "b"))
                .await
                .unwrap();
        }

        let claimers: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.claim_batch(10, &format!("worker-{i}")).await.unwrap()
                })
            })
            .collect();

        let batches: Vec<Vec<message::Model>> = join_all(claimers)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for batch in &batches {
            for row in batch {
                assert!(seen.insert(row.id), "message {} claimed twice", row.id);
                total += 1;
            }
        }
        // Capacity (8 x 10) exceeds the backlog, so every message was
        // claimed by exactly one caller
        assert_eq!(total, 50);
    }

    #[tokio::test]
    async fn messages_scheduled_in_the_future_are_not_claimable() {
        let store = MessageStore::memory();
        let model = store
            .enqueue(NewMessage::new("sam@example.com", "s", "b"))
            .await
            .unwrap();
        let future = chrono::Utc::now().naive_utc() + chrono::Duration::seconds(60);

        // Claim it, then push it into the future as a retry would
        store.claim_batch(10, "worker-a").await.unwrap();
        store
            .mark_retry(model.id, 1, future, "connection reset")
            .await
            .unwrap();

        assert!(store.claim_batch(10, "worker-a").await.unwrap().is_empty());

        let row = store.find(model.id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Queued);
        assert_eq!(row.attempts, 1);
        assert_eq!(row.last_error.as_deref(), Some("connection reset"));
        assert!(row.claimed_at.is_none() && row.claimed_by.is_none());
    }

    #[tokio::test]
    async fn mark_sent_clears_the_lease_and_records_the_provider_id() {
        let store = MessageStore::memory();
        let model = store
            .enqueue(NewMessage::new("sam@example.com", "s", "b"))
            .await
            .unwrap();
        store.claim_batch(10, "worker-a").await.unwrap();

        store
            .mark_sent(model.id, Some("provider-123".to_string()))
            .await
            .unwrap();

        let row = store.find(model.id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Sent);
        assert_eq!(row.provider_message_id.as_deref(), Some("provider-123"));
        assert!(row.claimed_at.is_none() && row.claimed_by.is_none());
        assert!(row.last_error.is_none());
    }

    #[tokio::test]
    async fn reclaim_returns_stale_claims_without_touching_attempts() {
        let store = MessageStore::memory();
        let model = store
            .enqueue(NewMessage::new("sam@example.com", "s", "b"))
            .await
            .unwrap();
        store.claim_batch(10, "worker-a").await.unwrap();

        // A lease from just now is not stale yet
        assert_eq!(store.reclaim_stale(past(300)).await.unwrap(), 0);

        // Once the cutoff passes the claim time, the message comes back
        let future_cutoff = chrono::Utc::now().naive_utc() + chrono::Duration::seconds(1);
        assert_eq!(store.reclaim_stale(future_cutoff).await.unwrap(), 1);

        let row = store.find(model.id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Queued);
        assert_eq!(row.attempts, 0);
        assert!(row.claimed_at.is_none() && row.claimed_by.is_none());
    }

    #[tokio::test]
    async fn reclaim_never_touches_terminal_messages() {
        let store = MessageStore::memory();
        let model = store
            .enqueue(NewMessage::new("sam@example.com", "s", "b"))
            .await
            .unwrap();
        store.claim_batch(10, "worker-a").await.unwrap();
        store.mark_sent(model.id, None).await.unwrap();

        let future_cutoff = chrono::Utc::now().naive_utc() + chrono::Duration::seconds(1);
        assert_eq!(store.reclaim_stale(future_cutoff).await.unwrap(), 0);
        let row = store.find(model.id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn prune_removes_only_aged_terminal_messages() {
        let store = MessageStore::memory();

        let sent = store
            .enqueue(NewMessage::new("a@example.com", "s", "b"))
            .await
            .unwrap();
        let queued = store
            .enqueue(NewMessage::new("b@example.com", "s", "b"))
            .await
            .unwrap();
        store.claim_batch(1, "worker-a").await.unwrap();
        store.mark_sent(sent.id, None).await.unwrap();

        // Cutoffs in the future age out everything terminal
        let cutoff = chrono::Utc::now().naive_utc() + chrono::Duration::seconds(1);
        let removed = store.prune_terminal(cutoff, cutoff, 100).await.unwrap();

        assert_eq!(removed, 1);
        assert!(store.find(sent.id).await.unwrap().is_none());
        assert!(store.find(queued.id).await.unwrap().is_some());
    }
}
