use super::Channel;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What an offloaded asset stands for in its record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetRole {
    #[default]
    Attachment,
    /// The text body, too large to carry inline
    BodyText,
    /// The HTML body, too large to carry inline
    BodyHtml,
}

/// A sub-asset (an attachment or an oversized body) offloaded to the object store during parsing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub name: String,
    pub content_type: String,
    pub uri: String,
    pub size_bytes: u64,
    pub sha256: String,
    #[serde(default)]
    pub role: AssetRole,
}

/// Output of the parse stage
///
/// Holds no processing timestamps: parsing the same raw payload twice yields
/// byte-identical records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub raw_message_id: String,
    pub channel: Channel,

    /// URI of the raw payload the record was parsed from
    #[serde(default)]
    pub source_ref: Option<String>,

    #[serde(default)]
    pub body_text: Option<String>,

    #[serde(default)]
    pub assets: Vec<AssetRef>,

    /// Channel-specific structure, interpreted by that channel's normalizer
    #[serde(default)]
    pub fields: Value,
}

impl ParsedRecord {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
