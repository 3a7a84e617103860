//! Vigil Pipeline Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Ingestion pipeline for regulated communications.
//!
//! # Overview
//!
//! Messages flow through three independently deployed stages:
//!
//! - **Connector**: captures raw messages from a channel, uploads the payload
//!   to the object store and publishes a claim-check envelope to `raw-<channel>`
//! - **Processor**: downloads and parses raw payloads, stores attachments and
//!   publishes parsed records to `parsed-<channel>`
//! - **Normalizer**: maps parsed records to the canonical record and writes it
//!   to both the `normalized` topic and the object store
//!
//! Units that cannot be processed are dead-lettered with the stage, failure
//! kind and attempt count; offsets are committed only afterwards.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use vigil_pipeline::broker::MemoryBroker;
//! use vigil_pipeline::email::EmailNormalizer;
//! use vigil_pipeline::normalize::NormalizerRegistry;
//!
//! # fn main() -> anyhow::Result<()> {
//! let broker = Arc::new(MemoryBroker::new());
//! let registry = NormalizerRegistry::builder()
//!     .register(Arc::new(EmailNormalizer::new(["corp.example.com"])))
//!     .build()?;
//! # let _ = (broker, registry, CancellationToken::new());
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod capture;
pub mod config;
pub mod connector;
pub mod dead_letter;
pub mod email;
pub mod health;
pub mod normalize;
pub mod processor;
pub mod retry;
pub mod shutdown;
pub mod sink;
pub mod storage;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use vigil_common::types::Channel;

/// Vigil - regulated communications ingestion
#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Stage to run
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Capture mail from the spool and publish claim-check envelopes
    Connector,

    /// Parse raw email payloads into parsed records
    Processor,

    /// Map parsed records to canonical records
    Normalizer,

    /// Re-capture a historical window without moving the live cursor
    Backfill {
        /// Channel to backfill
        #[arg(long, default_value = "email")]
        channel: Channel,

        /// Inclusive start (RFC 3339)
        #[arg(long)]
        start: DateTime<Utc>,

        /// Exclusive end (RFC 3339)
        #[arg(long)]
        end: DateTime<Utc>,

        /// Mailbox to read instead of the configured one
        #[arg(long)]
        mailbox: Option<String>,
    },
}

impl Commands {
    /// Service name used for log files and health reports
    pub fn service_name(&self) -> &'static str {
        match self {
            Commands::Connector => "vigil-connector",
            Commands::Processor => "vigil-processor",
            Commands::Normalizer => "vigil-normalizer",
            Commands::Backfill { .. } => "vigil-backfill",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backfill_arguments() {
        let cli = Cli::try_parse_from([
            "vigil",
            "backfill",
            "--start",
            "2025-03-01T00:00:00Z",
            "--end",
            "2025-03-02T00:00:00Z",
            "--mailbox",
            "Archive",
        ])
        .unwrap();

        match cli.command {
            Commands::Backfill {
                channel,
                start,
                end,
                mailbox,
            } => {
                assert_eq!(channel, Channel::Email);
                assert!(start < end);
                assert_eq!(mailbox.as_deref(), Some("Archive"));
            },
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Cli::try_parse_from(["vigil"]).is_err());
        let cli = Cli::try_parse_from(["vigil", "-v", "normalizer"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.command.service_name(), "vigil-normalizer");
    }
}
