//! Email to canonical record

use super::{EmailAddress, EmailFields};
use crate::normalize::{NormalizeError, Normalizer};
use chrono::DateTime;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use vigil_common::types::{
    AssetRole, Attachment, CanonicalRecord, Channel, Direction, ParsedRecord, Participant, ParticipantRole,
};

pub struct EmailNormalizer {
    monitored_domains: BTreeSet<String>,
}

impl EmailNormalizer {
    pub fn new<I, S>(monitored_domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            monitored_domains: monitored_domains
                .into_iter()
                .map(|d| d.as_ref().trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    fn is_monitored(&self, address: &EmailAddress) -> bool {
        address
            .domain()
            .is_some_and(|domain| self.monitored_domains.contains(&domain))
    }

    pub fn direction(&self, fields: &EmailFields) -> Direction {
        let sender = fields.from.as_ref().is_some_and(|from| self.is_monitored(from));
        let recipient = fields.recipients().any(|r| self.is_monitored(r));
        match (sender, recipient) {
            (true, true) => Direction::Internal,
            (true, false) => Direction::Outbound,
            _ => Direction::Inbound,
        }
    }
}

fn participant(address: &EmailAddress, role: ParticipantRole) -> Participant {
    Participant {
        id: address.address.clone(),
        name: address.name.clone().unwrap_or_else(|| address.address.clone()),
        role,
    }
}

impl Normalizer for EmailNormalizer {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn normalize(&self, record: &ParsedRecord) -> Result<CanonicalRecord, NormalizeError> {
        if record.channel != Channel::Email {
            return Err(NormalizeError::ChannelMismatch {
                expected: Channel::Email,
                actual: record.channel,
            });
        }

        let fields: EmailFields = serde_json::from_value(record.fields.clone())
            .map_err(|e| NormalizeError::malformed(record, format!("email fields: {e}")))?;

        let date = fields
            .date
            .as_deref()
            .ok_or_else(|| NormalizeError::malformed(record, "missing Date header"))?;
        let seconds = mailparse::dateparse(date)
            .map_err(|e| NormalizeError::malformed(record, format!("bad Date {date:?}: {e}")))?;
        let timestamp = DateTime::from_timestamp(seconds, 0)
            .ok_or_else(|| NormalizeError::malformed(record, format!("Date {date:?} out of range")))?;

        let mut participants: Vec<Participant> = fields
            .from
            .iter()
            .map(|from| participant(from, ParticipantRole::Sender))
            .collect();
        for (addresses, role) in [
            (&fields.to, ParticipantRole::To),
            (&fields.cc, ParticipantRole::Cc),
            (&fields.bcc, ParticipantRole::Bcc),
        ] {
            participants.extend(addresses.iter().map(|a| participant(a, role)));
        }

        let attachments = record
            .assets
            .iter()
            .filter(|asset| asset.role == AssetRole::Attachment)
            .map(|asset| Attachment {
                name: asset.name.clone(),
                content_type: asset.content_type.clone(),
                uri: asset.uri.clone(),
            })
            .collect();

        let message_id = fields
            .message_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| record.raw_message_id.clone());

        let mut metadata = Map::new();
        metadata.insert("raw_message_id".into(), Value::from(record.raw_message_id.as_str()));
        if let Some(subject) = &fields.subject {
            metadata.insert("subject".into(), Value::from(subject.as_str()));
        }
        if let Some(html) = &fields.body_html {
            metadata.insert("body_html".into(), Value::from(html.as_str()));
        }
        if let Some(uri) = &record.source_ref {
            metadata.insert("raw_payload_uri".into(), Value::from(uri.as_str()));
        }
        for asset in &record.assets {
            let key = match asset.role {
                AssetRole::BodyText => "body_text_uri",
                AssetRole::BodyHtml => "body_html_uri",
                AssetRole::Attachment => continue,
            };
            metadata.insert(key.into(), Value::from(asset.uri.as_str()));
        }

        let canonical = CanonicalRecord {
            message_id,
            channel: Channel::Email,
            direction: self.direction(&fields),
            timestamp,
            participants,
            body_text: record.body_text.clone(),
            audio_ref: None,
            attachments,
            metadata,
        };
        canonical
            .validate()
            .map_err(|e| NormalizeError::malformed(record, e.to_string()))?;
        Ok(canonical)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use vigil_common::types::AssetRef;

    fn record(from: &str, to: &[&str]) -> ParsedRecord {
        let to: Vec<_> = to.iter().map(|a| json!({ "address": a })).collect();
        ParsedRecord {
            raw_message_id: "<n1@corp.example.com>".into(),
            channel: Channel::Email,
            source_ref: Some("s3://vigil/raw/email/n1@corp.example.com.eml".into()),
            body_text: Some("hello".into()),
            assets: vec![AssetRef {
                name: "deck.pdf".into(),
                content_type: "application/pdf".into(),
                uri: "s3://vigil/attachments/email/n1@corp.example.com/b94d27b9934d_deck.pdf".into(),
                size_bytes: 11,
                sha256: "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9".into(),
                role: AssetRole::Attachment,
            }],
            fields: json!({
                "message_id": "<n1@corp.example.com>",
                "subject": "Q3",
                "from": { "name": "Alice", "address": from },
                "to": to,
                "cc": [{ "address": "carol@corp.example.com" }],
                "date": "Tue, 4 Mar 2025 10:15:00 +0100",
            }),
        }
    }

    fn normalizer() -> EmailNormalizer {
        EmailNormalizer::new(["Corp.Example.com"])
    }

    #[test]
    fn test_maps_participants_timestamp_and_metadata() {
        let canonical = normalizer()
            .normalize(&record("alice@corp.example.com", &["bob@client.example.org"]))
            .unwrap();

        assert_eq!(canonical.message_id, "<n1@corp.example.com>");
        assert_eq!(canonical.timestamp.to_rfc3339(), "2025-03-04T09:15:00+00:00");
        let roles: Vec<_> = canonical.participants.iter().map(|p| (p.id.as_str(), p.role)).collect();
        assert_eq!(
            roles,
            vec![
                ("alice@corp.example.com", ParticipantRole::Sender),
                ("bob@client.example.org", ParticipantRole::To),
                ("carol@corp.example.com", ParticipantRole::Cc),
            ]
        );
        assert_eq!(canonical.participants[0].name, "Alice");
        assert_eq!(canonical.participants[1].name, "bob@client.example.org");
        assert_eq!(canonical.attachments[0].name, "deck.pdf");
        assert_eq!(canonical.metadata["subject"], "Q3");
        assert_eq!(
            canonical.metadata["raw_payload_uri"],
            "s3://vigil/raw/email/n1@corp.example.com.eml"
        );
    }

    #[test]
    fn test_direction() {
        let n = normalizer();
        let direction = |from: &str, to: &[&str]| {
            let mut r = record(from, to);
            r.fields["cc"] = json!([]);
            n.normalize(&r).unwrap().direction
        };

        assert_eq!(direction("a@corp.example.com", &["b@CORP.example.com"]), Direction::Internal);
        assert_eq!(direction("a@corp.example.com", &["b@client.example.org"]), Direction::Outbound);
        assert_eq!(direction("a@client.example.org", &["b@corp.example.com"]), Direction::Inbound);
        assert_eq!(direction("a@client.example.org", &["b@other.example.net"]), Direction::Inbound);
    }

    #[test]
    fn test_offloaded_bodies_become_metadata_references() {
        let mut r = record("a@corp.example.com", &["bob@client.example.org"]);
        r.body_text = None;
        r.assets.push(AssetRef {
            name: "body.txt".into(),
            content_type: "text/plain; charset=utf-8".into(),
            uri: "s3://vigil/attachments/email/n1@corp.example.com/0123456789ab_body.txt".into(),
            size_bytes: 300_000,
            sha256: "00".into(),
            role: AssetRole::BodyText,
        });

        let canonical = normalizer().normalize(&r).unwrap();
        assert_eq!(canonical.attachments.len(), 1);
        assert_eq!(canonical.body_text, None);
        assert_eq!(
            canonical.metadata["body_text_uri"],
            "s3://vigil/attachments/email/n1@corp.example.com/0123456789ab_body.txt"
        );
        assert!(canonical.metadata.get("body_html_uri").is_none());
    }

    #[test]
    fn test_missing_sender_keeps_recipients() {
        let mut r = record("a@corp.example.com", &["bob@client.example.org"]);
        r.fields["from"] = Value::Null;

        let canonical = normalizer().normalize(&r).unwrap();
        let roles: Vec<_> = canonical.participants.iter().map(|p| p.role).collect();
        assert_eq!(roles, vec![ParticipantRole::To, ParticipantRole::Cc]);
        // carol is a monitored recipient
        assert_eq!(canonical.direction, Direction::Inbound);

        r.fields.as_object_mut().unwrap().remove("from");
        assert!(normalizer().normalize(&r).is_ok());
    }

    #[test]
    fn test_falls_back_to_raw_message_id() {
        let mut r = record("a@corp.example.com", &[]);
        r.fields["message_id"] = Value::Null;
        assert_eq!(normalizer().normalize(&r).unwrap().message_id, "<n1@corp.example.com>");

        r.raw_message_id = "INBOX-0007".into();
        assert_eq!(normalizer().normalize(&r).unwrap().message_id, "INBOX-0007");
    }

    #[test]
    fn test_malformed_fields() {
        let mut r = record("a@corp.example.com", &[]);
        r.fields["date"] = Value::Null;
        assert!(matches!(normalizer().normalize(&r), Err(NormalizeError::Malformed { .. })));

        let mut r = record("a@corp.example.com", &[]);
        r.fields = json!({ "subject": "no sender" });
        assert!(matches!(normalizer().normalize(&r), Err(NormalizeError::Malformed { .. })));

        let mut r = record("a@corp.example.com", &[]);
        r.channel = Channel::TeamsChat;
        assert!(matches!(
            normalizer().normalize(&r),
            Err(NormalizeError::ChannelMismatch { .. })
        ));
    }
}
