//! Full MIME parse of a raw email
//!
//! Address headers are read leniently: a missing `From` leaves the sender
//! empty and address tokens that do not parse are skipped, so only a message
//! whose MIME structure is broken is rejected.

use super::{EmailAddress, EmailFields, HeaderField};
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MimeError {
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl From<mailparse::MailParseError> for MimeError {
    fn from(e: mailparse::MailParseError) -> Self {
        MimeError::Malformed(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct MimeAttachment {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ParsedEmail {
    pub fields: EmailFields,
    pub body_text: Option<String>,
    pub attachments: Vec<MimeAttachment>,
}

#[derive(Default)]
struct Walk {
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<MimeAttachment>,
}

pub fn parse_message(raw: &[u8]) -> Result<ParsedEmail, MimeError> {
    let mail = mailparse::parse_mail(raw)?;
    let headers = &mail.headers;
    // mailparse turns any leading line into a header; require at least one real field
    if !headers.iter().any(|header| is_field_name(&header.get_key())) {
        return Err(MimeError::Malformed("no header fields".into()));
    }

    let from = headers
        .get_first_value("From")
        .and_then(|value| addresses(&value).into_iter().next());

    let recipients = |name: &str| -> Vec<EmailAddress> {
        headers
            .get_all_values(name)
            .iter()
            .flat_map(|value| addresses(value))
            .collect()
    };

    let mut walk = Walk::default();
    collect(&mail, &mut walk)?;

    let fields = EmailFields {
        message_id: non_empty(headers.get_first_value("Message-ID")),
        subject: non_empty(headers.get_first_value("Subject")),
        from,
        to: recipients("To"),
        cc: recipients("Cc"),
        bcc: recipients("Bcc"),
        date: non_empty(headers.get_first_value("Date")),
        body_html: walk.html,
        headers: headers
            .iter()
            .map(|header| HeaderField {
                name: header.get_key(),
                value: header.get_value(),
            })
            .collect(),
        headers_truncated: false,
    };

    Ok(ParsedEmail {
        fields,
        body_text: walk.text,
        attachments: walk.attachments,
    })
}

/// RFC 5322 field name: printable ASCII without `:`
fn is_field_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_graphic() && b != b':')
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Addresses in one header value; tokens that do not parse are dropped
fn addresses(value: &str) -> Vec<EmailAddress> {
    let parsed = match mailparse::addrparse(value) {
        Ok(parsed) => parsed.into_inner(),
        Err(e) => {
            debug!(error = %e, "address list does not parse, reading token by token");
            value
                .split(',')
                .filter_map(|token| mailparse::addrparse(token).ok())
                .flat_map(|list| list.into_inner())
                .collect()
        },
    };

    let mut out = Vec::new();
    for addr in parsed {
        let singles = match addr {
            MailAddr::Single(single) => vec![single],
            MailAddr::Group(group) => group.addrs,
        };
        out.extend(singles.into_iter().filter_map(|single| {
            let address = single.addr.trim().to_string();
            (!address.is_empty()).then(|| EmailAddress {
                name: non_empty(single.display_name),
                address,
            })
        }));
    }
    out
}

fn attachment_name(part: &ParsedMail<'_>) -> Option<String> {
    let disposition = part.get_content_disposition();
    disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned()
        .filter(|name| !name.trim().is_empty())
}

fn collect(part: &ParsedMail<'_>, walk: &mut Walk) -> Result<(), MimeError> {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect(sub, walk)?;
        }
        return Ok(());
    }

    let mimetype = part.ctype.mimetype.to_lowercase();
    let explicit = part.get_content_disposition().disposition == DispositionType::Attachment;
    let name = attachment_name(part);
    let is_body = !explicit && (mimetype == "text/plain" || mimetype == "text/html");

    if is_body {
        let body = part.get_body()?;
        let slot = if mimetype == "text/plain" {
            &mut walk.text
        } else {
            &mut walk.html
        };
        if slot.is_none() {
            *slot = Some(body);
            return Ok(());
        }
    }

    if explicit || name.is_some() {
        walk.attachments.push(MimeAttachment {
            name: name.unwrap_or_else(|| "attachment".to_string()),
            content_type: mimetype,
            bytes: part.get_body_raw()?,
        });
    }
    Ok(())
}
