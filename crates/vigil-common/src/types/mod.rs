//! Records exchanged between pipeline stages
//!
//! A communication moves through the pipeline as
//! [`RawEnvelope`] -> [`ParsedRecord`] -> [`CanonicalRecord`], joined across
//! stages by `raw_message_id`. Units of work that cannot progress are wrapped
//! in a [`FailureRecord`] and published to a dead-letter topic.

mod canonical;
mod channel;
mod envelope;
mod failure;
mod parsed;

pub use canonical::{Attachment, CanonicalRecord, Direction, Participant, ParticipantRole};
pub use channel::{Channel, TOPIC_DEAD_LETTER, TOPIC_NORMALIZED, TOPIC_NORMALIZED_DLQ};
pub use envelope::{FormatTag, RawEnvelope, CONTENT_TYPE_RFC822};
pub use failure::{FailedUnit, FailureKind, FailureRecord};
pub use parsed::{AssetRef, AssetRole, ParsedRecord};

use crate::error::{Result, VigilError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// On-demand re-run of capture over a historical window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub channel: Channel,

    /// Inclusive lower bound
    pub start: DateTime<Utc>,

    /// Exclusive upper bound
    pub end: DateTime<Utc>,

    /// Channel-specific parameters, e.g. a mailbox name
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl BackfillRequest {
    pub fn new(channel: Channel, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        let request = Self {
            channel,
            start,
            end,
            params: Map::new(),
        };
        request.validate()?;
        Ok(request)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.start >= self.end {
            return Err(VigilError::Validation(format!(
                "backfill window start {} must be before end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_backfill_window() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        let request = BackfillRequest::new(Channel::Email, start, end)
            .unwrap()
            .with_param("mailbox", "INBOX");

        assert!(request.contains(start));
        assert!(!request.contains(end));
        assert_eq!(request.params["mailbox"], "INBOX");

        assert!(BackfillRequest::new(Channel::Email, end, start).is_err());
        assert!(BackfillRequest::new(Channel::Email, start, start).is_err());
    }
}
