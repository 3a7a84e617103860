//! Email connector
//!
//! Polls a [`MailSource`] in arrival order, captures each message and emits
//! its envelope. Two cursors are kept: the poll cursor moves as soon as a
//! message is handed to delivery, the committed cursor (persisted to disk)
//! only once the runtime reports the envelope published or dead-lettered.
//! At that point the source is also told to acknowledge the message. A
//! restart therefore resumes from the last delivered message.
//!
//! Messages handed to delivery but not yet committed are tracked in memory
//! so sources that list by state rather than by cursor do not emit them twice.

use super::envelope::extract_envelope;
use super::mailbox::{MailItem, MailSource};
use super::RAW_EXTENSION;
use crate::capture::{CaptureStage, CapturedItem};
use crate::connector::{Connector, ConnectorError, IngestContext};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use vigil_common::types::{BackfillRequest, Channel, RawEnvelope, CONTENT_TYPE_RFC822};

const SOURCE_UID_KEY: &str = "uid";
const BACKFILL_KEY: &str = "backfill";

#[derive(Debug, Default)]
struct Cursors {
    polled: Option<String>,
    committed: Option<String>,
    in_flight: HashSet<String>,
    loaded: bool,
}

pub struct EmailConnector {
    name: String,
    source: Arc<dyn MailSource>,
    capture: CaptureStage,
    batch_size: usize,
    cursor_file: Option<PathBuf>,
    cursors: Mutex<Cursors>,
}

impl EmailConnector {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn MailSource>,
        capture: CaptureStage,
        batch_size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            capture,
            batch_size: batch_size.max(1),
            cursor_file: None,
            cursors: Mutex::new(Cursors::default()),
        }
    }

    /// Persist the committed cursor to `path` and resume from it on connect
    pub fn with_cursor_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cursor_file = Some(path.into());
        self
    }

    fn cursors(&self) -> MutexGuard<'_, Cursors> {
        self.cursors.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Last message known to be delivered
    pub fn committed_cursor(&self) -> Option<String> {
        self.cursors().committed.clone()
    }

    async fn load_cursor(&self) -> Result<(), ConnectorError> {
        if self.cursors().loaded {
            return Ok(());
        }

        let stored = match &self.cursor_file {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(contents) => Some(contents.trim().to_string()).filter(|c| !c.is_empty()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    return Err(ConnectorError::Connection(format!(
                        "cannot read cursor file {}: {e}",
                        path.display()
                    )))
                },
            },
            None => None,
        };

        if let Some(cursor) = &stored {
            info!(connector = %self.name, cursor = %cursor, "resuming from stored cursor");
        }
        let mut cursors = self.cursors();
        cursors.polled = stored.clone();
        cursors.committed = stored;
        cursors.loaded = true;
        Ok(())
    }

    async fn capture_item(&self, item: MailItem, backfill: bool) -> Result<RawEnvelope, ConnectorError> {
        // the raw message is captured even when its headers do not parse; the parse stage rejects it
        let summary = match extract_envelope(&item.bytes) {
            Ok(summary) => summary,
            Err(e) => {
                warn!(uid = %item.uid, error = %e, "unreadable header block");
                Default::default()
            },
        };

        let raw_message_id = summary
            .message_id
            .clone()
            .unwrap_or_else(|| self.source.fallback_id(&item.uid));

        let mut source_metadata = Map::new();
        source_metadata.insert(SOURCE_UID_KEY.into(), Value::from(item.uid.as_str()));
        source_metadata.insert("mailbox".into(), Value::from(self.source.mailbox()));
        source_metadata.insert("host".into(), Value::from(self.source.host()));
        source_metadata.insert("received_at".into(), Value::from(item.received_at.to_rfc3339()));
        if backfill {
            source_metadata.insert(BACKFILL_KEY.into(), Value::Bool(true));
        }

        self.capture
            .capture(CapturedItem {
                raw_message_id,
                payload: item.bytes,
                content_type: CONTENT_TYPE_RFC822.to_string(),
                extension: RAW_EXTENSION.to_string(),
                envelope: summary.to_map(),
                source_metadata,
            })
            .await
    }
}

#[async_trait]
impl Connector for EmailConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel(&self) -> Channel {
        self.capture.channel()
    }

    async fn connect(&self) -> Result<(), ConnectorError> {
        self.source.probe().await?;
        self.load_cursor().await
    }

    async fn ingest(&self, ctx: &IngestContext) -> Result<usize, ConnectorError> {
        let (cursor, pending) = {
            let cursors = self.cursors();
            (cursors.polled.clone(), cursors.in_flight.len())
        };
        let uids = self
            .source
            .list_since(cursor.as_deref(), self.batch_size + pending)
            .await?;
        let mut emitted = 0;

        for uid in uids {
            if ctx.is_cancelled() || emitted == self.batch_size {
                break;
            }
            if self.cursors().in_flight.contains(&uid) {
                continue;
            }
            let item = self.source.fetch(&uid).await?;
            let envelope = self.capture_item(item, false).await?;
            ctx.emit(envelope).await?;

            {
                let mut cursors = self.cursors();
                if cursors.polled.as_deref().is_none_or(|polled| self.source.is_after(&uid, polled)) {
                    cursors.polled = Some(uid.clone());
                }
                cursors.in_flight.insert(uid);
            }
            emitted += 1;
        }

        Ok(emitted)
    }

    async fn backfill(
        &self,
        request: &BackfillRequest,
        ctx: &IngestContext,
    ) -> Result<usize, ConnectorError> {
        if let Some(mailbox) = request.params.get("mailbox").and_then(Value::as_str) {
            if mailbox != self.source.mailbox() {
                return Err(ConnectorError::InvalidRequest(format!(
                    "connector reads mailbox {}, not {mailbox}",
                    self.source.mailbox()
                )));
            }
        }

        let uids = self.source.list_between(request.start, request.end).await?;
        info!(connector = %self.name, count = uids.len(), "backfill window listed");
        let mut emitted = 0;

        for uid in uids {
            if ctx.is_cancelled() {
                break;
            }
            let item = self.source.fetch(&uid).await?;
            let envelope = self.capture_item(item, true).await?;
            ctx.emit(envelope).await?;
            emitted += 1;
        }

        Ok(emitted)
    }

    async fn commit(&self, envelope: &RawEnvelope) -> Result<(), ConnectorError> {
        if envelope.source_metadata.contains_key(BACKFILL_KEY) {
            return Ok(());
        }
        let Some(uid) = envelope.source_metadata.get(SOURCE_UID_KEY).and_then(Value::as_str) else {
            return Ok(());
        };

        // stays in flight if this fails, so it is not emitted again before a restart
        self.source.acknowledge(uid).await?;

        {
            let mut cursors = self.cursors();
            cursors.in_flight.remove(uid);
            if cursors
                .committed
                .as_deref()
                .is_some_and(|committed| !self.source.is_after(uid, committed))
            {
                return Ok(());
            }
            cursors.committed = Some(uid.to_string());
        }

        if let Some(path) = &self.cursor_file {
            tokio::fs::write(path, uid).await.map_err(|e| ConnectorError::Capture {
                id: envelope.raw_message_id.clone(),
                reason: format!("cannot persist cursor to {}: {e}", path.display()),
            })?;
        }
        debug!(connector = %self.name, cursor = %uid, "cursor committed");
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        self.source.close().await
    }

    fn details(&self) -> Map<String, Value> {
        let cursors = self.cursors();
        let mut details = Map::new();
        details.insert("mailbox".into(), Value::from(self.source.mailbox()));
        details.insert("host".into(), Value::from(self.source.host()));
        details.insert("cursor".into(), cursors.committed.clone().map_or(Value::Null, Value::from));
        details.insert("in_flight".into(), Value::from(cursors.in_flight.len()));
        details.extend(self.source.details());
        details
    }
}
