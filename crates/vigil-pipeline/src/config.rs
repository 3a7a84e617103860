//! Configuration management
//!
//! All settings come from environment variables (optionally seeded from a
//! `.env` file) with the defaults below. [`PipelineConfig::load`] validates
//! the result; configuration errors are fatal at startup.

use crate::retry::RetryPolicy;
use crate::storage::config::StorageConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use vigil_common::types::{Channel, TOPIC_DEAD_LETTER, TOPIC_NORMALIZED, TOPIC_NORMALIZED_DLQ};

// ============================================================================
// Broker
// ============================================================================

pub const DEFAULT_BOOTSTRAP_SERVERS: &str = "localhost:9092";
pub const DEFAULT_KAFKA_ACKS: &str = "all";
pub const DEFAULT_KAFKA_COMPRESSION: &str = "gzip";
pub const DEFAULT_KAFKA_MESSAGE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_KAFKA_AUTO_OFFSET_RESET: &str = "earliest";
pub const DEFAULT_KAFKA_SESSION_TIMEOUT_MS: u64 = 10_000;

/// Largest message the broker accepts (Kafka's `message.max.bytes` default)
pub const DEFAULT_BROKER_MAX_MESSAGE_BYTES: usize = 1_048_576;

/// Room reserved for envelope fields around an inline payload
pub const ENVELOPE_ALLOWANCE_BYTES: usize = 64 * 1024;

// ============================================================================
// Claim check
// ============================================================================

/// Payloads at or below this size travel inline; 0 sends everything by reference
pub const DEFAULT_INLINE_THRESHOLD_BYTES: usize = 0;

// ============================================================================
// Health
// ============================================================================

pub const DEFAULT_HEALTH_HOST: &str = "0.0.0.0";
pub const DEFAULT_CONNECTOR_HEALTH_PORT: u16 = 8080;
pub const DEFAULT_PROCESSOR_HEALTH_PORT: u16 = 8081;
pub const DEFAULT_NORMALIZER_HEALTH_PORT: u16 = 8082;

// ============================================================================
// Secondary sink
// ============================================================================

pub const DEFAULT_SECONDARY_SINK_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SECONDARY_SINK_QUEUE: usize = 1_000;

// ============================================================================
// Connector
// ============================================================================

pub const DEFAULT_CONNECTOR_NAME: &str = "email-connector";
pub const DEFAULT_SPOOL_DIR: &str = "./spool";
pub const DEFAULT_SPOOL_MAILBOX: &str = "INBOX";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_POLL_BATCH_SIZE: usize = 100;
pub const DEFAULT_INGEST_QUEUE_CAPACITY: usize = 64;

// ============================================================================
// IMAP
// ============================================================================

pub const DEFAULT_IMAP_PORT: u16 = 993;
pub const DEFAULT_IMAP_USE_TLS: bool = true;
pub const DEFAULT_IMAP_MAILBOX: &str = "INBOX";
pub const DEFAULT_IMAP_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Consumers
// ============================================================================

pub const DEFAULT_PROCESSOR_GROUP: &str = "email-processor";
pub const DEFAULT_NORMALIZER_GROUP: &str = "normalizer";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub broker: BrokerConfig,
    pub topics: TopicConfig,
    pub storage: StorageConfig,
    pub retry: RetrySettings,
    pub health: HealthConfig,
    pub secondary_sink: SecondarySinkConfig,
    pub claim_check: ClaimCheckConfig,
    pub connector: ConnectorConfig,
    pub imap: ImapConfig,
    pub processor: ProcessorConfig,
    pub normalizer: NormalizerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub bootstrap_servers: String,
    pub acks: String,
    pub compression: String,
    pub message_timeout_ms: u64,
    pub auto_offset_reset: String,
    pub session_timeout_ms: u64,
    pub max_message_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub dead_letter: String,
    pub normalized: String,
    pub normalized_dlq: String,
}

/// Serializable form of [`RetryPolicy`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub host: String,
    /// Overrides the per-process default port
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondarySinkConfig {
    /// Base URL; empty or unset disables the sink
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimCheckConfig {
    pub inline_threshold_bytes: usize,
}

/// Where the email connector reads mail from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailSourceKind {
    /// A local maildir
    Spool,
    Imap,
}

impl FromStr for MailSourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spool" | "maildir" => Ok(MailSourceKind::Spool),
            "imap" => Ok(MailSourceKind::Imap),
            other => anyhow::bail!("unknown mail source {other:?}, expected spool or imap"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub name: String,
    pub source: MailSourceKind,
    pub spool_dir: PathBuf,
    pub mailbox: String,
    /// Where the last delivered message id is persisted
    pub cursor_file: Option<PathBuf>,
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    pub queue_capacity: usize,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub mailbox: String,
    pub timeout_secs: u64,
}

impl std::fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_tls", &self.use_tls)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("mailbox", &self.mailbox)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub group: String,
    /// Text and HTML bodies above this size are offloaded to the object store
    pub body_inline_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizerConfig {
    pub group: String,
    pub channels: Vec<Channel>,
    /// Domains owned by the organization, used for direction detection
    pub monitored_domains: Vec<String>,
}

impl PipelineConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = PipelineConfig {
            broker: BrokerConfig {
                bootstrap_servers: env_or("KAFKA_BOOTSTRAP_SERVERS", DEFAULT_BOOTSTRAP_SERVERS),
                acks: env_or("KAFKA_ACKS", DEFAULT_KAFKA_ACKS),
                compression: env_or("KAFKA_COMPRESSION", DEFAULT_KAFKA_COMPRESSION),
                message_timeout_ms: env_parse(
                    "KAFKA_MESSAGE_TIMEOUT_MS",
                    DEFAULT_KAFKA_MESSAGE_TIMEOUT_MS,
                )?,
                auto_offset_reset: env_or(
                    "KAFKA_AUTO_OFFSET_RESET",
                    DEFAULT_KAFKA_AUTO_OFFSET_RESET,
                ),
                session_timeout_ms: env_parse(
                    "KAFKA_SESSION_TIMEOUT_MS",
                    DEFAULT_KAFKA_SESSION_TIMEOUT_MS,
                )?,
                max_message_bytes: env_parse(
                    "BROKER_MAX_MESSAGE_BYTES",
                    DEFAULT_BROKER_MAX_MESSAGE_BYTES,
                )?,
            },
            topics: TopicConfig {
                dead_letter: env_or("TOPIC_DEAD_LETTER", TOPIC_DEAD_LETTER),
                normalized: env_or("TOPIC_NORMALIZED", TOPIC_NORMALIZED),
                normalized_dlq: env_or("TOPIC_NORMALIZED_DLQ", TOPIC_NORMALIZED_DLQ),
            },
            storage: StorageConfig::from_env()?,
            retry: RetrySettings {
                max_attempts: env_parse("RETRY_MAX_ATTEMPTS", crate::retry::DEFAULT_MAX_ATTEMPTS)?,
                base_delay_ms: env_parse(
                    "RETRY_BASE_DELAY_MS",
                    crate::retry::DEFAULT_BASE_DELAY.as_millis() as u64,
                )?,
                max_delay_ms: env_parse(
                    "RETRY_MAX_DELAY_MS",
                    crate::retry::DEFAULT_MAX_DELAY.as_millis() as u64,
                )?,
                multiplier: env_parse("RETRY_MULTIPLIER", crate::retry::DEFAULT_MULTIPLIER)?,
                jitter: env_parse("RETRY_JITTER", crate::retry::DEFAULT_JITTER)?,
            },
            health: HealthConfig {
                host: env_or("HEALTH_HOST", DEFAULT_HEALTH_HOST),
                port: env_opt("HEALTH_PORT")?,
            },
            secondary_sink: SecondarySinkConfig {
                endpoint: std::env::var("SECONDARY_SINK_ENDPOINT")
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
                timeout_secs: env_parse(
                    "SECONDARY_SINK_TIMEOUT_SECS",
                    DEFAULT_SECONDARY_SINK_TIMEOUT_SECS,
                )?,
                queue_capacity: env_parse(
                    "SECONDARY_SINK_QUEUE_CAPACITY",
                    DEFAULT_SECONDARY_SINK_QUEUE,
                )?,
            },
            claim_check: ClaimCheckConfig {
                inline_threshold_bytes: env_parse(
                    "CLAIM_CHECK_INLINE_THRESHOLD_BYTES",
                    DEFAULT_INLINE_THRESHOLD_BYTES,
                )?,
            },
            connector: ConnectorConfig {
                name: env_or("VIGIL_CONNECTOR_NAME", DEFAULT_CONNECTOR_NAME),
                source: env_or("EMAIL_SOURCE", "spool").parse()?,
                spool_dir: PathBuf::from(env_or("SPOOL_DIR", DEFAULT_SPOOL_DIR)),
                mailbox: env_or("SPOOL_MAILBOX", DEFAULT_SPOOL_MAILBOX),
                cursor_file: std::env::var("SPOOL_CURSOR_FILE").ok().map(PathBuf::from),
                poll_interval_secs: env_parse("POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?,
                batch_size: env_parse("POLL_BATCH_SIZE", DEFAULT_POLL_BATCH_SIZE)?,
                queue_capacity: env_parse("INGEST_QUEUE_CAPACITY", DEFAULT_INGEST_QUEUE_CAPACITY)?,
            },
            imap: ImapConfig {
                host: env_or("IMAP_HOST", ""),
                port: env_parse("IMAP_PORT", DEFAULT_IMAP_PORT)?,
                use_tls: env_parse("IMAP_USE_SSL", DEFAULT_IMAP_USE_TLS)?,
                username: env_or("IMAP_USERNAME", ""),
                password: env_or("IMAP_PASSWORD", ""),
                mailbox: env_or("IMAP_MAILBOX", DEFAULT_IMAP_MAILBOX),
                timeout_secs: env_parse("IMAP_TIMEOUT_SECS", DEFAULT_IMAP_TIMEOUT_SECS)?,
            },
            processor: ProcessorConfig {
                group: env_or("PROCESSOR_GROUP", DEFAULT_PROCESSOR_GROUP),
                body_inline_limit_bytes: env_parse(
                    "PROCESSOR_BODY_INLINE_LIMIT_BYTES",
                    crate::email::processor::DEFAULT_BODY_INLINE_LIMIT_BYTES,
                )?,
            },
            normalizer: NormalizerConfig {
                group: env_or("NORMALIZER_GROUP", DEFAULT_NORMALIZER_GROUP),
                channels: parse_list(&env_or("NORMALIZER_CHANNELS", "email"))
                    .into_iter()
                    .map(|c| c.parse::<Channel>())
                    .collect::<Result<_, _>>()
                    .context("NORMALIZER_CHANNELS")?,
                monitored_domains: parse_list(&env_or("MONITORED_DOMAINS", ""))
                    .into_iter()
                    .map(|d| d.to_lowercase())
                    .collect(),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.broker.bootstrap_servers.trim().is_empty() {
            anyhow::bail!("KAFKA_BOOTSTRAP_SERVERS cannot be empty");
        }

        if self.broker.max_message_bytes <= ENVELOPE_ALLOWANCE_BYTES {
            anyhow::bail!(
                "BROKER_MAX_MESSAGE_BYTES ({}) must exceed the envelope allowance ({})",
                self.broker.max_message_bytes,
                ENVELOPE_ALLOWANCE_BYTES
            );
        }

        // base64 inflates inline payloads by 4/3
        let inline_encoded = self.claim_check.inline_threshold_bytes.div_ceil(3) * 4;
        if inline_encoded + ENVELOPE_ALLOWANCE_BYTES > self.broker.max_message_bytes {
            anyhow::bail!(
                "CLAIM_CHECK_INLINE_THRESHOLD_BYTES ({}) does not fit in a broker message of {} bytes",
                self.claim_check.inline_threshold_bytes,
                self.broker.max_message_bytes
            );
        }

        // text body, HTML body and header list are each bounded by the limit
        let parsed_worst_case = self.processor.body_inline_limit_bytes.saturating_mul(3);
        if parsed_worst_case.saturating_add(ENVELOPE_ALLOWANCE_BYTES) > self.broker.max_message_bytes {
            anyhow::bail!(
                "PROCESSOR_BODY_INLINE_LIMIT_BYTES ({}) does not fit in a broker message of {} bytes",
                self.processor.body_inline_limit_bytes,
                self.broker.max_message_bytes
            );
        }

        if self.connector.source == MailSourceKind::Imap {
            if self.imap.host.trim().is_empty() || self.imap.username.trim().is_empty() {
                anyhow::bail!("IMAP_HOST and IMAP_USERNAME are required when EMAIL_SOURCE=imap");
            }
            if self.imap.port == 0 || self.imap.timeout_secs == 0 {
                anyhow::bail!("IMAP_PORT and IMAP_TIMEOUT_SECS must be greater than 0");
            }
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("RETRY_MAX_ATTEMPTS must be at least 1");
        }

        if self.retry.multiplier < 1.0 {
            anyhow::bail!("RETRY_MULTIPLIER must be at least 1.0");
        }

        if !(0.0..=1.0).contains(&self.retry.jitter) {
            anyhow::bail!("RETRY_JITTER must be between 0 and 1");
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!(
                "RETRY_BASE_DELAY_MS ({}) cannot be greater than RETRY_MAX_DELAY_MS ({})",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            );
        }

        if self.health.port == Some(0) {
            anyhow::bail!("HEALTH_PORT must be greater than 0");
        }

        if self.connector.batch_size == 0 || self.connector.queue_capacity == 0 {
            anyhow::bail!("POLL_BATCH_SIZE and INGEST_QUEUE_CAPACITY must be greater than 0");
        }

        if self.normalizer.channels.is_empty() {
            anyhow::bail!("NORMALIZER_CHANNELS must name at least one channel");
        }

        if let Some(endpoint) = &self.secondary_sink.endpoint {
            reqwest::Url::parse(endpoint)
                .with_context(|| format!("SECONDARY_SINK_ENDPOINT is not a URL: {endpoint}"))?;
        }

        if self.normalizer.monitored_domains.is_empty() {
            tracing::warn!("No MONITORED_DOMAINS configured - every email will be classified inbound");
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.policy()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.connector.poll_interval_secs)
    }

    pub fn cursor_file(&self) -> PathBuf {
        self.connector
            .cursor_file
            .clone()
            .unwrap_or_else(|| self.connector.spool_dir.join(".vigil-cursor"))
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            broker: BrokerConfig {
                bootstrap_servers: DEFAULT_BOOTSTRAP_SERVERS.to_string(),
                acks: DEFAULT_KAFKA_ACKS.to_string(),
                compression: DEFAULT_KAFKA_COMPRESSION.to_string(),
                message_timeout_ms: DEFAULT_KAFKA_MESSAGE_TIMEOUT_MS,
                auto_offset_reset: DEFAULT_KAFKA_AUTO_OFFSET_RESET.to_string(),
                session_timeout_ms: DEFAULT_KAFKA_SESSION_TIMEOUT_MS,
                max_message_bytes: DEFAULT_BROKER_MAX_MESSAGE_BYTES,
            },
            topics: TopicConfig {
                dead_letter: TOPIC_DEAD_LETTER.to_string(),
                normalized: TOPIC_NORMALIZED.to_string(),
                normalized_dlq: TOPIC_NORMALIZED_DLQ.to_string(),
            },
            storage: StorageConfig::for_minio("http://localhost:9000", "vigil"),
            retry: RetrySettings {
                max_attempts: retry.max_attempts,
                base_delay_ms: retry.base_delay.as_millis() as u64,
                max_delay_ms: retry.max_delay.as_millis() as u64,
                multiplier: retry.multiplier,
                jitter: retry.jitter,
            },
            health: HealthConfig {
                host: DEFAULT_HEALTH_HOST.to_string(),
                port: None,
            },
            secondary_sink: SecondarySinkConfig {
                endpoint: None,
                timeout_secs: DEFAULT_SECONDARY_SINK_TIMEOUT_SECS,
                queue_capacity: DEFAULT_SECONDARY_SINK_QUEUE,
            },
            claim_check: ClaimCheckConfig {
                inline_threshold_bytes: DEFAULT_INLINE_THRESHOLD_BYTES,
            },
            connector: ConnectorConfig {
                name: DEFAULT_CONNECTOR_NAME.to_string(),
                source: MailSourceKind::Spool,
                spool_dir: PathBuf::from(DEFAULT_SPOOL_DIR),
                mailbox: DEFAULT_SPOOL_MAILBOX.to_string(),
                cursor_file: None,
                poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
                batch_size: DEFAULT_POLL_BATCH_SIZE,
                queue_capacity: DEFAULT_INGEST_QUEUE_CAPACITY,
            },
            imap: ImapConfig {
                host: String::new(),
                port: DEFAULT_IMAP_PORT,
                use_tls: DEFAULT_IMAP_USE_TLS,
                username: String::new(),
                password: String::new(),
                mailbox: DEFAULT_IMAP_MAILBOX.to_string(),
                timeout_secs: DEFAULT_IMAP_TIMEOUT_SECS,
            },
            processor: ProcessorConfig {
                group: DEFAULT_PROCESSOR_GROUP.to_string(),
                body_inline_limit_bytes: crate::email::processor::DEFAULT_BODY_INLINE_LIMIT_BYTES,
            },
            normalizer: NormalizerConfig {
                group: DEFAULT_NORMALIZER_GROUP.to_string(),
                channels: vec![Channel::Email],
                monitored_domains: Vec::new(),
            },
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {key}: {raw:?}")),
        _ => Ok(None),
    }
}

fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(env_opt(key)?.unwrap_or(default))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
