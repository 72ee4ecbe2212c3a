//! `SeaORM` Entity for outbound messages

use crate::database::models::message_status::MessageStatus;
use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "message")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub destination: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
    /// Opaque producer-supplied key; stored for producer-side deduplication
    pub idempotency_key: Option<String>,
    pub status: MessageStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_attempt_at: DateTime,
    pub claimed_at: Option<DateTime>,
    pub claimed_by: Option<String>,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Check if the message is eligible for claiming at `now`.
    #[must_use]
    pub fn is_claimable(&self, now: DateTime) -> bool {
        self.status == MessageStatus::Queued && self.next_attempt_at <= now
    }

    /// Check if another delivery attempt is allowed.
    #[must_use]
    pub const fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}
