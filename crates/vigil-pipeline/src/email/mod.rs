//! Email channel
//!
//! - [`envelope`]: header-only summary extraction used at capture time
//! - [`mailbox`]: the [`mailbox::MailSource`] polling seam and its maildir implementation
//! - [`imap`]: the IMAP implementation of [`mailbox::MailSource`]
//! - [`connector`]: polls a mail source and captures each message
//! - [`parser`]: full MIME parse used by the parse stage
//! - [`processor`]: the parse stage for `raw-email`
//! - [`normalizer`]: maps parsed email to the canonical record

use serde::{Deserialize, Serialize};

pub mod connector;
pub mod envelope;
pub mod imap;
pub mod mailbox;
pub mod normalizer;
pub mod parser;
pub mod processor;

pub use connector::EmailConnector;
pub use imap::ImapMailbox;
pub use mailbox::{MailItem, MailSource, SpoolMailbox};
pub use normalizer::EmailNormalizer;
pub use processor::EmailProcessor;

/// Object key extension of raw email payloads
pub const RAW_EXTENSION: &str = "eml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub address: String,
}

impl EmailAddress {
    /// Lowercased part after the last `@`
    pub fn domain(&self) -> Option<String> {
        self.address
            .rsplit_once('@')
            .map(|(_, domain)| domain.trim().to_lowercase())
            .filter(|domain| !domain.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

/// The `fields` object of an email [`vigil_common::types::ParsedRecord`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailFields {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub from: Option<EmailAddress>,
    #[serde(default)]
    pub to: Vec<EmailAddress>,
    #[serde(default)]
    pub cc: Vec<EmailAddress>,
    #[serde(default)]
    pub bcc: Vec<EmailAddress>,
    /// RFC 2822 `Date` header as received
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub body_html: Option<String>,
    #[serde(default)]
    pub headers: Vec<HeaderField>,
    /// Set when trailing headers were dropped to keep the record bounded
    #[serde(default)]
    pub headers_truncated: bool,
}

impl EmailFields {
    pub fn recipients(&self) -> impl Iterator<Item = &EmailAddress> {
        self.to.iter().chain(&self.cc).chain(&self.bcc)
    }
}
