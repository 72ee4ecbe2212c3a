use sea_orm::DeriveActiveEnum;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Delivery state of an outbound message.
///
/// A message moves from `Queued` through `Claimed` to one of the terminal
/// states. The status, together with `next_attempt_at`, determines whether
/// a message is eligible for claiming.
///
/// # State Transitions
///
/// - `Queued` → `Claimed` → `Sent` (delivered)
/// - `Queued` → `Claimed` → `Queued` (retryable failure, future
///   `next_attempt_at`)
/// - `Queued` → `Claimed` → `Failed` (permanent failure or attempts
///   exhausted)
/// - `Claimed` → `Queued` (lease expired, returned by the reclaimer)
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    EnumIter,
    EnumString,
    Display,
)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "message_status")]
#[derive(Default)]
pub enum MessageStatus {
    /// Waiting for a worker. Eligible for claiming once `next_attempt_at`
    /// has passed; retries return here with a future eligibility time.
    #[sea_orm(string_value = "queued")]
    #[default]
    Queued,

    /// Leased to exactly one worker, identified by `claimed_by`. A claim
    /// that outlives the stale-lock timeout is forcibly returned to
    /// `Queued` by the reclaimer.
    #[sea_orm(string_value = "claimed")]
    Claimed,

    /// Accepted by the delivery provider. Terminal; never processed again.
    #[sea_orm(string_value = "sent")]
    Sent,

    /// Permanently failed: a non-retryable error occurred or all attempts
    /// were exhausted. Terminal; `last_error` holds the final reason for
    /// operator follow-up.
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl MessageStatus {
    /// Terminal states are never mutated again by the delivery subsystem.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }

    /// Whether a worker currently holds a lease on the message.
    pub const fn is_claimed(&self) -> bool {
        matches!(self, Self::Claimed)
    }
}
