//! Pipeline integration tests
//!
//! Drive the connector, parse and normalize stages against the in-memory
//! broker and object store and check the delivery guarantees end to end:
//! - No loss: every captured message is either published or dead-lettered
//! - Claim-check ordering: every published reference resolves
//! - Idempotent re-delivery
//! - Secondary sink failures never touch primary delivery
//! - Header-only envelope extraction
//! - Large messages flow through in bounded time

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::{email_with_attachment, message_id, run_connector, sample_email, Harness};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use vigil_common::types::{
    BackfillRequest, CanonicalRecord, Channel, Direction, FailedUnit, FailureKind, ParsedRecord,
    RawEnvelope, TOPIC_DEAD_LETTER, TOPIC_NORMALIZED,
};
use vigil_pipeline::broker::{Broker, MemoryBroker};
use vigil_pipeline::email::envelope::extract_envelope;
use vigil_pipeline::health::HealthState;
use vigil_pipeline::processor::StageRunner;
use vigil_pipeline::retry::RetryPolicy;
use vigil_pipeline::sink::{SecondarySink, SinkError};
use vigil_pipeline::storage::claim_check;

const RAW_EMAIL: &str = "raw-email";
const PARSED_EMAIL: &str = "parsed-email";

// ============================================================================
// No-loss invariant
// ============================================================================

fn keys_of(messages: &[vigil_pipeline::broker::Delivery]) -> Vec<String> {
    messages.iter().filter_map(|m| m.key.clone()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_every_message_is_published_or_dead_lettered(
        items in prop::collection::vec((any::<bool>(), "[a-zA-Z0-9 .,]{0,200}"), 1..10)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let (published, dead_lettered, stored, expected, failing) = rt.block_on(async {
            let harness = Harness::new();
            let mut failing = BTreeSet::new();
            for (n, (fails, body)) in items.iter().enumerate() {
                let id = message_id(n);
                harness.deliver_mail(&format!("{n:04}.eml"), &sample_email(&id, body));
                if *fails {
                    failing.insert(id);
                }
            }
            harness.broker.fail_publishes_for_keys(RAW_EMAIL, failing.iter().cloned()).await;

            run_connector(&harness.runtime(), items.len() as u64).await;

            let published = keys_of(&harness.broker.messages(RAW_EMAIL).await);
            let dead_lettered: Vec<String> = harness
                .dead_letters(TOPIC_DEAD_LETTER)
                .await
                .into_iter()
                .map(|record| record.key())
                .collect();
            let stored = harness.store.keys().await.len();
            let expected: BTreeSet<String> = (0..items.len()).map(message_id).collect();
            (published, dead_lettered, stored, expected, failing)
        });

        let published_set: BTreeSet<String> = published.iter().cloned().collect();
        let dead_set: BTreeSet<String> = dead_lettered.iter().cloned().collect();

        // exactly once each
        prop_assert_eq!(published.len(), published_set.len());
        prop_assert_eq!(dead_lettered.len(), dead_set.len());
        prop_assert!(published_set.is_disjoint(&dead_set));
        let all: BTreeSet<String> = published_set.union(&dead_set).cloned().collect();
        prop_assert_eq!(all, expected);

        prop_assert_eq!(dead_set, failing);
        // payloads were uploaded before any publish attempt
        prop_assert_eq!(stored, items.len());
    }
}

#[tokio::test]
async fn test_exhausted_publish_is_dead_lettered_with_context() {
    let harness = Harness::new();
    harness.deliver_mail("0001.eml", &sample_email(&message_id(1), "hello"));
    harness.broker.fail_all_publishes(RAW_EMAIL).await;

    let summary = run_connector(&harness.runtime(), 1).await;
    assert_eq!(summary.delivered, 0);
    assert_eq!(summary.dead_lettered, 1);

    let failures = harness.dead_letters(TOPIC_DEAD_LETTER).await;
    assert_eq!(failures.len(), 1);
    let failure = &failures[0];
    assert_eq!(failure.stage, "capture");
    assert_eq!(failure.kind, FailureKind::RetryExhausted);
    assert_eq!(failure.attempt_count, 3);
    assert_eq!(failure.source_topic.as_deref(), Some(RAW_EMAIL));
    match &failure.unit {
        FailedUnit::RawEnvelope(envelope) => {
            assert_eq!(envelope.raw_message_id, message_id(1));
            assert!(envelope.payload_ref.is_some());
        },
        other => panic!("unexpected unit {other:?}"),
    }

    // the cursor moves past a dead-lettered message
    assert_eq!(std::fs::read_to_string(harness.cursor_file()).unwrap(), "0001.eml");
}

#[tokio::test]
async fn test_runtime_stops_when_neither_publish_nor_dead_letter_succeeds() {
    // the envelope is too large for the broker and even the reduced dead-letter record is
    let harness = Harness::with_broker(MemoryBroker::with_max_message_bytes(256));
    harness.deliver_mail("0001.eml", &sample_email(&message_id(1), "hello"));

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        harness.runtime().run(CancellationToken::new()),
    )
    .await
    .expect("runtime did not stop on its own");
    assert!(result.is_err());

    assert_eq!(harness.broker.message_count(RAW_EMAIL).await, 0);
    assert_eq!(harness.broker.message_count(TOPIC_DEAD_LETTER).await, 0);
    assert!(!harness.cursor_file().exists());
}

#[tokio::test]
async fn test_huge_recipient_list_still_publishes() {
    let harness = Harness::with_broker(MemoryBroker::with_max_message_bytes(1_048_576));
    let recipients: Vec<String> = (0..60_000).map(|n| format!("r{n}@client.example.org")).collect();
    let mail = format!(
        "Message-ID: {}\r\nDate: Tue, 4 Mar 2025 10:15:00 +0000\r\nFrom: alice@corp.example.com\r\nTo: {}\r\n\r\nhi\r\n",
        message_id(1),
        recipients.join(", ")
    );
    harness.deliver_mail("0001.eml", mail.as_bytes());

    let summary = tokio::time::timeout(Duration::from_secs(30), run_connector(&harness.runtime(), 1))
        .await
        .expect("connector did not deliver");
    assert_eq!(summary.delivered, 1);

    let envelope = RawEnvelope::from_json(&harness.broker.messages(RAW_EMAIL).await[0].payload).unwrap();
    assert_eq!(envelope.envelope["truncated"], true);
    assert_eq!(envelope.size_bytes, mail.len() as u64);
}

#[tokio::test]
async fn test_oversized_envelope_is_dead_lettered_by_reference() {
    let harness = Harness::with_broker(MemoryBroker::with_max_message_bytes(1024));
    let mail = format!(
        "Message-ID: {}\r\nFrom: alice@corp.example.com\r\nSubject: {}\r\n\r\nhi\r\n",
        message_id(1),
        "s".repeat(2000)
    );
    harness.deliver_mail("0001.eml", mail.as_bytes());

    let summary = run_connector(&harness.runtime(), 1).await;
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(harness.broker.message_count(RAW_EMAIL).await, 0);

    let failures = harness.dead_letters(TOPIC_DEAD_LETTER).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].key(), message_id(1));
    match &failures[0].unit {
        FailedUnit::Reference {
            unit_type,
            payload_ref,
            ..
        } => {
            assert_eq!(unit_type, "raw_envelope");
            let bytes = harness.claim_check().download(payload_ref.as_deref().unwrap()).await.unwrap();
            assert_eq!(bytes, mail.as_bytes());
        },
        other => panic!("unexpected unit {other:?}"),
    }
    assert_eq!(std::fs::read_to_string(harness.cursor_file()).unwrap(), "0001.eml");
}

#[tokio::test]
async fn test_message_ids_that_sanitize_alike_keep_separate_payloads() {
    let harness = Harness::new();
    let first = sample_email("<a$1@corp.example.com>", "first body");
    let second = sample_email("<a%1@corp.example.com>", "second body, a bit longer");
    harness.deliver_mail("0001.eml", &first);
    harness.deliver_mail("0002.eml", &second);

    run_connector(&harness.runtime(), 2).await;

    let claims = harness.claim_check();
    let mut downloaded = Vec::new();
    for message in harness.broker.messages(RAW_EMAIL).await {
        let envelope = RawEnvelope::from_json(&message.payload).unwrap();
        let bytes = claims
            .download_verified(
                envelope.payload_ref.as_deref().unwrap(),
                Some(envelope.size_bytes),
                Some(&envelope.payload_sha256),
            )
            .await
            .unwrap();
        downloaded.push(bytes);
    }
    assert_eq!(downloaded, vec![first, second]);
}

#[tokio::test]
async fn test_late_mail_under_earlier_name_is_captured() {
    let harness = Harness::new();
    harness.deliver_mail("0002.eml", &sample_email(&message_id(2), "two"));
    assert_eq!(run_connector(&harness.runtime(), 1).await.delivered, 1);

    harness.deliver_mail("0001.eml", &sample_email(&message_id(1), "one"));
    assert_eq!(run_connector(&harness.runtime(), 1).await.delivered, 1);

    let published = keys_of(&harness.broker.messages(RAW_EMAIL).await);
    assert_eq!(published, vec![message_id(2), message_id(1)]);
    assert!(harness.inbox().join("cur/0001.eml").exists());
    assert!(harness.inbox().join("cur/0002.eml").exists());
}

// ============================================================================
// Claim-check ordering
// ============================================================================

#[tokio::test]
async fn test_published_references_always_resolve() {
    let harness = Harness::new();
    harness.deliver_mail("0001.eml", &sample_email(&message_id(1), "first"));
    harness.deliver_mail(
        "0002.eml",
        &email_with_attachment(&message_id(2), "deck.pdf", b"%PDF-1.4 quarterly numbers"),
    );

    run_connector(&harness.runtime(), 2).await;
    harness.drain(&harness.processor()).await;

    let claims = harness.claim_check();
    for message in harness.broker.messages(RAW_EMAIL).await {
        let envelope = RawEnvelope::from_json(&message.payload).unwrap();
        let uri = envelope.payload_ref.as_deref().unwrap();
        let bytes = claims.download(uri).await.unwrap();
        assert_eq!(bytes.len() as u64, envelope.size_bytes);
    }

    let mut assets = 0;
    for message in harness.broker.messages(PARSED_EMAIL).await {
        let record = ParsedRecord::from_json(&message.payload).unwrap();
        for asset in &record.assets {
            let bytes = claims
                .download_verified(&asset.uri, Some(asset.size_bytes), Some(&asset.sha256))
                .await
                .unwrap();
            assert_eq!(bytes, b"%PDF-1.4 quarterly numbers");
            assets += 1;
        }
    }
    assert_eq!(assets, 1);
}

#[tokio::test]
async fn test_nothing_is_published_before_the_upload_succeeds() {
    let harness = Harness::new();
    harness.deliver_mail("0001.eml", &sample_email(&message_id(1), "hello"));
    harness.store.fail_all_puts().await;

    let runtime = harness.runtime();
    let cancel = CancellationToken::new();
    let stop = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    };
    let (summary, ()) = tokio::join!(runtime.run(cancel.clone()), stop);
    let summary = summary.unwrap();

    assert_eq!(summary.delivered, 0);
    assert_eq!(harness.broker.message_count(RAW_EMAIL).await, 0);
    assert!(!harness.cursor_file().exists());

    // once the store recovers the same message is captured and published
    harness.store.heal().await;
    let summary = run_connector(&harness.runtime(), 1).await;
    assert_eq!(summary.delivered, 1);
    let envelope = RawEnvelope::from_json(&harness.broker.messages(RAW_EMAIL).await[0].payload).unwrap();
    assert!(harness
        .claim_check()
        .download(envelope.payload_ref.as_deref().unwrap())
        .await
        .is_ok());
}

// ============================================================================
// Idempotent re-delivery
// ============================================================================

#[tokio::test]
async fn test_redelivered_envelope_yields_identical_records() {
    let harness = Harness::new();
    harness.deliver_mail(
        "0001.eml",
        &email_with_attachment(&message_id(7), "deck.pdf", b"%PDF-1.4 deck"),
    );
    run_connector(&harness.runtime(), 1).await;

    // the broker hands the same envelope out twice
    let raw = harness.broker.messages(RAW_EMAIL).await.remove(0);
    harness
        .broker
        .publish(RAW_EMAIL, raw.key.as_deref().unwrap(), &raw.payload)
        .await
        .unwrap();

    let parsed_summary = harness.drain(&harness.processor()).await;
    assert_eq!(parsed_summary.published, 2);
    let store_keys_after_parse = harness.store.keys().await;

    let normalized_summary = harness.drain(&harness.ingestion()).await;
    assert_eq!(normalized_summary.published, 2);

    let parsed = harness.broker.messages(PARSED_EMAIL).await;
    assert_eq!(parsed[0].key, parsed[1].key);
    assert_eq!(parsed[0].payload, parsed[1].payload);

    let normalized = harness.broker.messages(TOPIC_NORMALIZED).await;
    assert_eq!(normalized[0].key, parsed[0].key);
    assert_eq!(normalized[0].payload, normalized[1].payload);

    let keys = harness.store.keys().await;
    let attachments = keys.iter().filter(|k| k.starts_with("attachments/")).count();
    let canonical = keys.iter().filter(|k| k.starts_with("normalized/")).count();
    assert_eq!(attachments, 1);
    assert_eq!(canonical, 1);
    assert_eq!(keys.len(), store_keys_after_parse.len() + 1);

    let record: CanonicalRecord = serde_json::from_slice(&normalized[0].payload).unwrap();
    let key = claim_check::normalized_key(record.timestamp, &record.message_id);
    assert_eq!(harness.store.bytes(&key).await.unwrap(), normalized[0].payload);
}

#[tokio::test]
async fn test_unit_that_cannot_be_dead_lettered_is_redelivered() {
    let harness = Harness::new();
    harness.deliver_mail("0001.eml", b"no headers at all");
    run_connector(&harness.runtime(), 1).await;
    harness.broker.close().await;

    // parse fails and the dead-letter topic is down: nothing may be committed
    harness.broker.fail_all_publishes(TOPIC_DEAD_LETTER).await;
    let processor = harness.processor();
    let runner = StageRunner::new(
        Arc::new(harness.broker.clone()),
        HealthState::new("parse"),
        harness.retry.clone(),
    );
    assert!(runner.run(&processor, CancellationToken::new()).await.is_err());
    assert_eq!(harness.broker.committed_offset("email-processor", RAW_EMAIL).await, None);

    harness.broker.heal(TOPIC_DEAD_LETTER).await;
    let summary = runner.run(&processor, CancellationToken::new()).await.unwrap();
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(harness.broker.committed_offset("email-processor", RAW_EMAIL).await, Some(1));
}

// ============================================================================
// Dual-delivery decoupling
// ============================================================================

struct FailingSink;

#[async_trait]
impl SecondarySink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    async fn deliver(&self, _envelope: &RawEnvelope) -> Result<(), SinkError> {
        Err(SinkError::Rejected(503))
    }
}

#[tokio::test]
async fn test_failing_secondary_sink_does_not_affect_primary_delivery() {
    let harness = Harness::new();
    for n in 0..5 {
        harness.deliver_mail(&format!("{n:04}.eml"), &sample_email(&message_id(n), "hi"));
    }

    let runtime = harness.runtime().with_secondary(Arc::new(FailingSink));
    let summary = run_connector(&runtime, 5).await;

    assert_eq!(summary.delivered, 5);
    assert_eq!(summary.dead_lettered, 0);
    assert_eq!(harness.broker.message_count(RAW_EMAIL).await, 5);
    assert_eq!(harness.broker.message_count(TOPIC_DEAD_LETTER).await, 0);

    let report = runtime.health().report();
    assert_eq!(report.secondary_failures, 5);
    assert_eq!(report.processed_count, 5);
}

// ============================================================================
// Capture speed bound
// ============================================================================

fn fastest_extraction(raw: &[u8]) -> Duration {
    (0..5)
        .map(|_| {
            let start = Instant::now();
            let envelope = extract_envelope(raw).unwrap();
            let elapsed = start.elapsed();
            assert_eq!(envelope.subject.as_deref(), Some("position update"));
            elapsed
        })
        .min()
        .unwrap()
}

#[test]
fn test_envelope_extraction_cost_does_not_grow_with_body() {
    let small = sample_email(&message_id(1), &"x".repeat(900));
    let large = sample_email(&message_id(2), &"x".repeat(20 * 1024 * 1024));
    assert!(small.len() < 1100);

    let small_time = fastest_extraction(&small);
    let large_time = fastest_extraction(&large);

    assert!(
        large_time <= small_time * 20 + Duration::from_millis(5),
        "20 MB extraction took {large_time:?}, 1 KB took {small_time:?}"
    );
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_message_flows_end_to_end() {
    // a real broker limit; only references may travel through it
    let harness = Harness::with_broker(MemoryBroker::with_max_message_bytes(1_048_576));
    let attachment: Vec<u8> = (0..10 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let id = "<e2e-10mb@corp.example.com>";
    harness.deliver_mail("0001.eml", &email_with_attachment(id, "positions.bin", &attachment));

    let normalized = tokio::time::timeout(Duration::from_secs(120), async {
        assert_eq!(run_connector(&harness.runtime(), 1).await.delivered, 1);
        assert_eq!(harness.drain(&harness.processor()).await.published, 1);
        harness.drain(&harness.ingestion()).await
    })
    .await
    .expect("pipeline did not finish in time");
    assert_eq!(normalized.published, 1);

    let raw = harness.broker.messages(RAW_EMAIL).await;
    assert_eq!(raw[0].key.as_deref(), Some(id));
    let parsed = harness.broker.messages(PARSED_EMAIL).await;
    assert_eq!(parsed[0].key.as_deref(), Some(id));

    let message = &harness.broker.messages(TOPIC_NORMALIZED).await[0];
    let record: CanonicalRecord = serde_json::from_slice(&message.payload).unwrap();
    assert_eq!(record.message_id, id);
    assert_eq!(record.direction, Direction::Internal);
    assert_eq!(record.attachments.len(), 1);

    let stored = harness
        .claim_check()
        .download(&record.attachments[0].uri)
        .await
        .unwrap();
    assert_eq!(stored, attachment);

    let key = claim_check::normalized_key(record.timestamp, id);
    assert_eq!(key, "normalized/2025-03-04/e2e-10mb@corp.example.com.json");
    assert_eq!(harness.store.bytes(&key).await.unwrap(), message.payload);
}

// ============================================================================
// Dead-letter
// ============================================================================

#[tokio::test]
async fn test_unparseable_payload_is_dead_lettered_once() {
    let mut harness = Harness::new();
    harness.retry = RetryPolicy::no_retry();
    harness.deliver_mail("0001.eml", b"no headers at all");

    run_connector(&harness.runtime(), 1).await;
    let summary = harness.drain(&harness.processor()).await;
    assert_eq!(summary.dead_lettered, 1);

    let failures = harness.dead_letters(TOPIC_DEAD_LETTER).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].stage, "parse");
    assert_eq!(failures[0].kind, FailureKind::Malformed);
    assert_eq!(failures[0].attempt_count, 1);
    assert_eq!(failures[0].key(), "INBOX-0001");

    // the raw object stays retrievable for reprocessing
    let key = claim_check::raw_key(Channel::Email, "INBOX-0001", "eml");
    assert_eq!(harness.store.bytes(&key).await.unwrap(), b"no headers at all");
    assert_eq!(harness.broker.message_count(PARSED_EMAIL).await, 0);
}

// ============================================================================
// Backfill
// ============================================================================

#[tokio::test]
async fn test_backfill_recaptures_window_without_moving_live_cursor() {
    let harness = Harness::new();
    harness.deliver_mail("0001.eml", &sample_email(&message_id(1), "one"));
    harness.deliver_mail("0002.eml", &sample_email(&message_id(2), "two"));

    let now = Utc::now();
    let request = BackfillRequest::new(
        Channel::Email,
        now - ChronoDuration::hours(1),
        now + ChronoDuration::hours(1),
    )
    .unwrap();

    let summary = harness
        .runtime()
        .run_backfill(&request, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.delivered, 2);

    for message in harness.broker.messages(RAW_EMAIL).await {
        let envelope = RawEnvelope::from_json(&message.payload).unwrap();
        assert_eq!(envelope.source_metadata["backfill"], true);
    }
    assert!(!harness.cursor_file().exists());

    // the live connector still starts from the beginning
    assert_eq!(run_connector(&harness.runtime(), 2).await.delivered, 2);
    assert_eq!(std::fs::read_to_string(harness.cursor_file()).unwrap(), "0002.eml");
}

#[tokio::test]
async fn test_backfill_rejects_other_channels() {
    let harness = Harness::new();
    let now = Utc::now();
    let request =
        BackfillRequest::new(Channel::TeamsChat, now - ChronoDuration::hours(1), now).unwrap();

    let result = harness
        .runtime()
        .run_backfill(&request, CancellationToken::new())
        .await;
    assert!(result.is_err());
    assert_eq!(harness.broker.message_count(RAW_EMAIL).await, 0);
}
