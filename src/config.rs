use serde::{Deserialize, Deserializer, Serialize};

use lettre::message::Mailbox;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub tracing: TracingConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    pub email: EmailConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub prune: PruneConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EmailConfig {
    /// Mock transport that captures messages for testing
    Mock,
    /// Real SMTP configuration for outbound delivery
    Smtp {
        host: String,
        port: u16,
        #[serde(deserialize_with = "deserialize_mailbox")]
        sender: Mailbox,
        username: Option<String>,
        password: Option<String>,
        #[serde(default = "default_use_tls")]
        use_tls: bool,
    },
}

fn deserialize_mailbox<'de, D>(deserializer: D) -> Result<Mailbox, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

fn default_use_tls() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TracingConfig {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
}

/// Tunables for the claim/dispatch loop.
///
/// Batch size and handler concurrency are configured independently; the
/// rate ceiling holds regardless of how the two are combined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum number of messages claimed per poll (default: 25)
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Number of concurrent delivery handlers per batch (default: 8)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Outbound sends per second accepted by the provider (default: 10,
    /// 0 disables pacing)
    #[serde(default = "default_rate_per_second")]
    pub rate_per_second: u32,
    /// Sleep between polls when the queue is empty, in seconds (default: 5)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Per-send timeout in seconds (default: 30)
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    /// Age after which a claim is considered abandoned, in seconds
    /// (default: 300). Must comfortably exceed worst-case batch handling
    /// time, or in-progress work gets reclaimed.
    #[serde(default = "default_stale_lock_timeout")]
    pub stale_lock_timeout_secs: u64,
    /// Interval between stale-claim sweeps in seconds (default: 60)
    #[serde(default = "default_reclaim_interval")]
    pub reclaim_interval_secs: u64,
    /// Base delay in seconds before the first retry (default: 30)
    #[serde(default = "default_base_retry_delay")]
    pub base_retry_delay_secs: u64,
    /// Ceiling on the retry delay in seconds (default: 3600)
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u64,
    /// Upper bound on the random jitter added to retry delays, in
    /// milliseconds (default: 50)
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter_ms: u64,
    /// Identity recorded on claimed rows; defaults to `delivery-{pid}`
    #[serde(default)]
    pub worker_id: Option<String>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            rate_per_second: default_rate_per_second(),
            poll_interval_secs: default_poll_interval(),
            send_timeout_secs: default_send_timeout(),
            stale_lock_timeout_secs: default_stale_lock_timeout(),
            reclaim_interval_secs: default_reclaim_interval(),
            base_retry_delay_secs: default_base_retry_delay(),
            max_retry_delay_secs: default_max_retry_delay(),
            retry_jitter_ms: default_retry_jitter(),
            worker_id: None,
        }
    }
}

impl DeliveryConfig {
    /// Worker identity, generated from the process id when not configured.
    #[must_use]
    pub fn resolved_worker_id(&self) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| format!("delivery-{}", std::process::id()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Whether to expose the liveness endpoint (default: true)
    #[serde(default = "default_liveness_enabled")]
    pub enabled: bool,
    /// Port for the liveness endpoint (default: 8080)
    #[serde(default = "default_liveness_port")]
    pub port: u16,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: default_liveness_enabled(),
            port: default_liveness_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneConfig {
    /// Interval between retention sweeps in seconds (default: 3600 = 1 hour)
    #[serde(default = "default_prune_interval")]
    pub interval_secs: u64,
    /// Retention period for sent messages in seconds (default: 7200 = 2 hours)
    #[serde(default = "default_sent_retention")]
    pub sent_retention_secs: u64,
    /// Retention period for failed messages in seconds (default: 172800 = 2 days)
    #[serde(default = "default_failed_retention")]
    pub failed_retention_secs: u64,
    /// Maximum number of rows deleted per batch (default: 1000)
    #[serde(default = "default_prune_batch_size")]
    pub batch_size: u64,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_prune_interval(),
            sent_retention_secs: default_sent_retention(),
            failed_retention_secs: default_failed_retention(),
            batch_size: default_prune_batch_size(),
        }
    }
}

const fn default_batch_size() -> u64 {
    25
}

const fn default_concurrency() -> usize {
    8
}

const fn default_rate_per_second() -> u32 {
    10
}

const fn default_poll_interval() -> u64 {
    5
}

const fn default_send_timeout() -> u64 {
    30
}

const fn default_stale_lock_timeout() -> u64 {
    300 // 5 minutes
}

const fn default_reclaim_interval() -> u64 {
    60
}

const fn default_base_retry_delay() -> u64 {
    30
}

const fn default_max_retry_delay() -> u64 {
    3600 // 1 hour
}

const fn default_retry_jitter() -> u64 {
    50
}

const fn default_liveness_enabled() -> bool {
    true
}

const fn default_liveness_port() -> u16 {
    8080
}

const fn default_prune_interval() -> u64 {
    3600 // 1 hour
}

const fn default_sent_retention() -> u64 {
    7200 // 2 hours
}

const fn default_failed_retention() -> u64 {
    172_800 // 2 days
}

const fn default_prune_batch_size() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_defaults_are_sane() {
        let config = DeliveryConfig::default();

        assert_eq!(config.batch_size, 25);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.rate_per_second, 10);
        // Reclaiming faster than the lease expires would be wasted work
        assert!(config.reclaim_interval_secs <= config.stale_lock_timeout_secs);
        assert!(config.base_retry_delay_secs <= config.max_retry_delay_secs);
    }

    #[test]
    fn worker_id_falls_back_to_pid() {
        let config = DeliveryConfig::default();
        assert!(config.resolved_worker_id().starts_with("delivery-"));

        let config = DeliveryConfig {
            worker_id: Some("worker-a".to_string()),
            ..Default::default()
        };
        assert_eq!(config.resolved_worker_id(), "worker-a");
    }
}
