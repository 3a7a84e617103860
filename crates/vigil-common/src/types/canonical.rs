use super::Channel;
use crate::error::{Result, VigilError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Direction of a communication relative to the monitored organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Sender,
    To,
    Cc,
    Bcc,
    Participant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Channel-level identity, e.g. an email address
    pub id: String,
    pub name: String,
    pub role: ParticipantRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub uri: String,
}

/// Channel-independent form of one logical communication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub message_id: String,
    pub channel: Channel,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub participants: Vec<Participant>,

    #[serde(default)]
    pub body_text: Option<String>,

    /// Recording reference for voice channels
    #[serde(default)]
    pub audio_ref: Option<String>,

    #[serde(default)]
    pub attachments: Vec<Attachment>,

    /// Channel residue that has no canonical field
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CanonicalRecord {
    pub fn validate(&self) -> Result<()> {
        if self.message_id.trim().is_empty() {
            return Err(VigilError::Validation("message_id is empty".into()));
        }
        if self.participants.is_empty() {
            return Err(VigilError::Validation(format!(
                "record {} has no participants",
                self.message_id
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn record() -> CanonicalRecord {
        CanonicalRecord {
            message_id: "<m1@example.com>".into(),
            channel: Channel::Email,
            direction: Direction::Inbound,
            timestamp: Utc::now(),
            participants: vec![Participant {
                id: "alice@example.com".into(),
                name: "Alice".into(),
                role: ParticipantRole::Sender,
            }],
            body_text: None,
            audio_ref: None,
            attachments: Vec::new(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn test_validate_requires_participants() {
        let mut canonical = record();
        assert!(canonical.validate().is_ok());
        canonical.participants.clear();
        assert!(canonical.validate().is_err());
    }

    #[test]
    fn test_serialized_names() {
        let json: Value = serde_json::to_value(record()).unwrap();
        assert_eq!(json["direction"], "inbound");
        assert_eq!(json["participants"][0]["role"], "sender");
    }
}
