//! Shared fixtures for the pipeline integration tests
//!
//! Everything runs in-process: a [`MemoryBroker`], a [`MemoryStore`] and a
//! spool directory under a temp dir stand in for Kafka, S3 and the mail host.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use vigil_common::types::{
    Channel, FailureRecord, TOPIC_DEAD_LETTER, TOPIC_NORMALIZED, TOPIC_NORMALIZED_DLQ,
};
use vigil_pipeline::broker::{Delivery, MemoryBroker};
use vigil_pipeline::capture::CaptureStage;
use vigil_pipeline::connector::{ConnectorRuntime, DeliverySummary, RuntimeConfig};
use vigil_pipeline::dead_letter::DeadLetterSink;
use vigil_pipeline::email::{EmailConnector, EmailNormalizer, EmailProcessor, SpoolMailbox};
use vigil_pipeline::health::HealthState;
use vigil_pipeline::normalize::{IngestionService, NormalizerRegistry};
use vigil_pipeline::processor::{StageHandler, StageRunner, StageSummary};
use vigil_pipeline::retry::RetryPolicy;
use vigil_pipeline::storage::{ClaimCheckStore, MemoryStore};

pub const MAILBOX: &str = "INBOX";
pub const MONITORED_DOMAIN: &str = "corp.example.com";

pub struct Harness {
    pub broker: MemoryBroker,
    pub store: MemoryStore,
    pub retry: RetryPolicy,
    spool: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_broker(MemoryBroker::new())
    }

    pub fn with_broker(broker: MemoryBroker) -> Self {
        let spool = tempfile::tempdir().unwrap();
        for sub in ["tmp", "new"] {
            std::fs::create_dir_all(spool.path().join(MAILBOX).join(sub)).unwrap();
        }
        Self {
            broker,
            store: MemoryStore::new("vigil"),
            retry: RetryPolicy::immediate(3),
            spool,
        }
    }

    pub fn inbox(&self) -> PathBuf {
        self.spool.path().join(MAILBOX)
    }

    /// Drop a message into the maildir, as the MTA would: write to `tmp/`, then rename into `new/`
    pub fn deliver_mail(&self, file_name: &str, bytes: &[u8]) {
        let staged = self.inbox().join("tmp").join(file_name);
        std::fs::write(&staged, bytes).unwrap();
        std::fs::rename(staged, self.inbox().join("new").join(file_name)).unwrap();
    }

    pub fn claim_check(&self) -> ClaimCheckStore {
        ClaimCheckStore::new(Arc::new(self.store.clone()), self.retry.clone())
    }

    pub fn connector(&self) -> EmailConnector {
        EmailConnector::new(
            "email-connector",
            Arc::new(SpoolMailbox::new(self.spool.path(), MAILBOX)),
            CaptureStage::new(Channel::Email, self.claim_check(), 0),
            16,
        )
        .with_cursor_file(self.cursor_file())
    }

    pub fn cursor_file(&self) -> PathBuf {
        self.spool.path().join("cursor")
    }

    pub fn runtime(&self) -> ConnectorRuntime {
        ConnectorRuntime::new(
            Arc::new(self.connector()),
            Arc::new(self.broker.clone()),
            self.dead_letter(TOPIC_DEAD_LETTER),
            self.retry.clone(),
            runtime_config(),
        )
    }

    pub fn dead_letter(&self, topic: &str) -> DeadLetterSink {
        DeadLetterSink::new(Arc::new(self.broker.clone()), topic, self.retry.clone())
    }

    pub fn processor(&self) -> EmailProcessor {
        EmailProcessor::new(
            Arc::new(self.broker.clone()),
            self.claim_check(),
            self.dead_letter(TOPIC_DEAD_LETTER),
            self.retry.clone(),
            "email-processor",
        )
    }

    pub fn ingestion(&self) -> IngestionService {
        let registry = NormalizerRegistry::builder()
            .register(Arc::new(EmailNormalizer::new([MONITORED_DOMAIN])))
            .build()
            .unwrap();
        IngestionService::new(
            registry,
            Arc::new(self.broker.clone()),
            self.claim_check(),
            self.dead_letter(TOPIC_NORMALIZED_DLQ),
            self.retry.clone(),
            TOPIC_NORMALIZED,
            vec![Channel::Email],
            "normalizer",
        )
    }

    /// Run `handler` over everything published so far, then stop
    pub async fn drain(&self, handler: &dyn StageHandler) -> StageSummary {
        self.broker.close().await;
        StageRunner::new(
            Arc::new(self.broker.clone()),
            HealthState::new(handler.stage()),
            self.retry.clone(),
        )
        .run(handler, CancellationToken::new())
        .await
        .unwrap()
    }

    pub async fn dead_letters(&self, topic: &str) -> Vec<FailureRecord> {
        decode_failures(&self.broker.messages(topic).await)
    }
}

pub fn runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        poll_interval: Duration::from_millis(10),
        queue_capacity: 8,
        secondary_queue: 256,
        connect_backoff: RetryPolicy::immediate(1),
        health_addr: None,
    }
}

/// Run the connector until `expected` envelopes were published or dead-lettered
pub async fn run_connector(runtime: &ConnectorRuntime, expected: u64) -> DeliverySummary {
    let cancel = CancellationToken::new();
    let health = runtime.health();

    let watcher = async {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
        loop {
            let report = health.report();
            if report.processed_count + report.dead_lettered_count >= expected
                || tokio::time::Instant::now() > deadline
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
    };

    let (summary, ()) = tokio::join!(runtime.run(cancel.clone()), watcher);
    summary.unwrap()
}

pub fn decode_failures(messages: &[Delivery]) -> Vec<FailureRecord> {
    messages
        .iter()
        .map(|m| FailureRecord::from_json(&m.payload).unwrap())
        .collect()
}

pub fn message_id(n: usize) -> String {
    format!("<m{n}@{MONITORED_DOMAIN}>")
}

/// A plain-text message from a monitored sender to an outside recipient
pub fn sample_email(id: &str, body: &str) -> Vec<u8> {
    format!(
        "Message-ID: {id}\r\n\
         Date: Tue, 4 Mar 2025 10:15:00 +0000\r\n\
         From: Alice Trader <alice@{MONITORED_DOMAIN}>\r\n\
         To: bob@client.example.org\r\n\
         Subject: position update\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         {body}\r\n"
    )
    .into_bytes()
}

/// A multipart message carrying `attachment` as a base64 part
pub fn email_with_attachment(id: &str, file_name: &str, attachment: &[u8]) -> Vec<u8> {
    let encoded = STANDARD.encode(attachment);
    let mut wrapped = String::with_capacity(encoded.len() + encoded.len() / 76 * 2);
    for line in encoded.as_bytes().chunks(76) {
        wrapped.push_str(std::str::from_utf8(line).unwrap());
        wrapped.push_str("\r\n");
    }

    let mut message = format!(
        "Message-ID: {id}\r\n\
         Date: Tue, 4 Mar 2025 10:15:00 +0000\r\n\
         From: alice@{MONITORED_DOMAIN}\r\n\
         To: carol@{MONITORED_DOMAIN}\r\n\
         Subject: deck attached\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: multipart/mixed; boundary=\"vigil-boundary\"\r\n\
         \r\n\
         --vigil-boundary\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         see attached\r\n\
         --vigil-boundary\r\n\
         Content-Type: application/octet-stream; name=\"{file_name}\"\r\n\
         Content-Disposition: attachment; filename=\"{file_name}\"\r\n\
         Content-Transfer-Encoding: base64\r\n\
         \r\n"
    );
    message.push_str(&wrapped);
    message.push_str("--vigil-boundary--\r\n");
    message.into_bytes()
}
