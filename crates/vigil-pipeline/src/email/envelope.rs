//! Capture-time summary of an email
//!
//! Only the header block is read ([`mailparse::parse_headers`] stops at the
//! first blank line), so extraction cost follows header size, not message
//! size. The summary map itself is bounded: header values are cut and
//! address lists shortened so an envelope always fits a broker message.

use mailparse::{MailHeaderMap, MailParseError};
use serde_json::{Map, Value};

/// Upper bound on the serialized summary map
pub const SUMMARY_BUDGET_BYTES: usize = 16 * 1024;

/// Longest single header value kept in the summary
const VALUE_LIMIT_BYTES: usize = 998;

/// Marker set when the summary dropped or cut anything
pub const TRUNCATED_KEY: &str = "truncated";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailEnvelope {
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub date: Option<String>,
}

pub fn extract_envelope(raw: &[u8]) -> Result<EmailEnvelope, MailParseError> {
    let (headers, _body_offset) = mailparse::parse_headers(raw)?;
    let first = |name: &str| {
        headers
            .get_first_value(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };
    let all = |name: &str| -> Vec<String> {
        headers
            .get_all_values(name)
            .into_iter()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect()
    };

    Ok(EmailEnvelope {
        // longer than a header line may be; the connector falls back to a source id
        message_id: first("Message-ID").filter(|id| id.len() <= VALUE_LIMIT_BYTES),
        subject: first("Subject"),
        from: first("From"),
        to: all("To"),
        cc: all("Cc"),
        bcc: all("Bcc"),
        date: first("Date"),
    })
}

impl EmailEnvelope {
    /// Summary map carried on the raw envelope, at most [`SUMMARY_BUDGET_BYTES`]
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        let mut used = 0;
        let mut truncated = false;

        for (key, value) in [
            ("message_id", &self.message_id),
            ("subject", &self.subject),
            ("from", &self.from),
            ("date", &self.date),
        ] {
            if let Some(value) = value {
                let kept = cut(value, VALUE_LIMIT_BYTES);
                truncated |= kept.len() < value.len();
                used += key.len() + encoded_len(kept);
                map.insert(key.to_string(), Value::from(kept));
            }
        }

        for (key, values) in [("to", &self.to), ("cc", &self.cc), ("bcc", &self.bcc)] {
            let mut kept = Vec::new();
            for value in values {
                let value_cut = cut(value, VALUE_LIMIT_BYTES);
                let cost = encoded_len(value_cut) + 1;
                if used + key.len() + cost > SUMMARY_BUDGET_BYTES {
                    truncated = true;
                    break;
                }
                truncated |= value_cut.len() < value.len();
                used += cost;
                kept.push(value_cut.to_string());
            }
            if !kept.is_empty() {
                used += key.len();
                map.insert(key.to_string(), Value::from(kept));
            }
        }

        if truncated {
            map.insert(TRUNCATED_KEY.to_string(), Value::Bool(true));
        }
        map
    }
}

/// Length of `value` as a JSON string, escapes and quotes included
fn encoded_len(value: &str) -> usize {
    serde_json::to_string(value).map_or(value.len() * 6 + 2, |encoded| encoded.len())
}

/// Longest prefix of `value` within `limit` bytes, on a char boundary
fn cut(value: &str, limit: usize) -> &str {
    if value.len() <= limit {
        return value;
    }
    let mut end = limit;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}
