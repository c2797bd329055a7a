//! Turns a remote message payload into a flat [`Email`]. Pure: no I/O, no state.

pub mod headers;

use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::decode_base64url;
use crate::emails::{Attachment, AttachmentContent, Email, EmailFlags};
use crate::gmail::types::{Message, MessagePart};
use headers::{
    decode_encoded_words, header_value, parse_date, parse_mailbox, parse_mailbox_list,
};

/// Maximum depth for MIME tree traversal; deeper parts are ignored.
pub const MAX_MIME_DEPTH: usize = 50;
pub const DEFAULT_INLINE_ATTACHMENT_MAX_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapperOptions {
    /// Attachments carrying inline data are kept inline only below this declared size.
    pub inline_attachment_max_bytes: u64,
}

impl Default for MapperOptions {
    fn default() -> Self {
        Self {
            inline_attachment_max_bytes: DEFAULT_INLINE_ATTACHMENT_MAX_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("message payload has no id")]
    MissingId,
    #[error("message {message_id} has an unparseable date {value:?}")]
    InvalidDate { message_id: String, value: String },
}

impl MappingError {
    pub fn code(&self) -> &'static str {
        match self {
            MappingError::MissingId => "mapping.missing_id",
            MappingError::InvalidDate { .. } => "mapping.invalid_date",
        }
    }

    /// The payload itself is malformed; retrying the same input cannot succeed.
    pub fn is_recoverable(&self) -> bool {
        false
    }
}

pub fn map_message(
    account_id: &str,
    message: &Message,
    options: &MapperOptions,
) -> Result<Email, MappingError> {
    let remote_id = message.id.trim();
    if remote_id.is_empty() {
        return Err(MappingError::MissingId);
    }

    let payload = message.payload.as_ref();

    let raw_date = message
        .internal_date
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| header_value(payload, "Date"));
    let date = match raw_date {
        Some(value) => Some(parse_date(value).ok_or_else(|| MappingError::InvalidDate {
            message_id: remote_id.to_string(),
            value: value.to_string(),
        })?),
        None => None,
    };

    let from = header_value(payload, "From").and_then(parse_mailbox);
    let to = header_value(payload, "To")
        .map(parse_mailbox_list)
        .unwrap_or_default()
        .into_iter()
        .map(|m| m.address)
        .collect();
    let cc = header_value(payload, "Cc")
        .map(parse_mailbox_list)
        .unwrap_or_default()
        .into_iter()
        .map(|m| m.address)
        .collect();
    let subject = header_value(payload, "Subject").map(decode_encoded_words);

    let mut label_ids: Vec<String> = Vec::with_capacity(message.label_ids.len());
    for label in &message.label_ids {
        if !label_ids.contains(label) {
            label_ids.push(label.clone());
        }
    }

    let mut extracted = Extracted::default();
    if let Some(part) = payload {
        extracted.walk(remote_id, part, options, 0);
    }

    let thread_id = message
        .thread_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .unwrap_or(remote_id)
        .to_string();

    Ok(Email {
        account_id: account_id.to_string(),
        remote_id: remote_id.to_string(),
        thread_id,
        from_address: from.as_ref().map(|m| m.address.clone()),
        from_name: from.and_then(|m| m.name),
        to,
        cc,
        subject,
        date,
        snippet: message.snippet.clone().filter(|s| !s.is_empty()),
        body_text: extracted.body_text,
        body_html: extracted.body_html,
        flags: EmailFlags::from_labels(&label_ids),
        label_ids,
        attachments: extracted.attachments,
    })
}

#[derive(Default)]
struct Extracted {
    body_text: Option<String>,
    body_html: Option<String>,
    attachments: Vec<Attachment>,
}

impl Extracted {
    fn walk(&mut self, message_id: &str, part: &MessagePart, options: &MapperOptions, depth: usize) {
        if depth > MAX_MIME_DEPTH {
            debug!(message_id, depth, "mime tree deeper than limit, ignoring subtree");
            return;
        }

        let mime = essence(part.mime_type.as_deref());
        let filename = part
            .filename
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty());

        match filename {
            Some(filename) => self.push_attachment(message_id, part, filename, &mime, options),
            None if mime == "text/plain" && self.body_text.is_none() => {
                self.body_text = decode_text(message_id, part);
            }
            None if mime == "text/html" && self.body_html.is_none() => {
                self.body_html = decode_text(message_id, part);
            }
            None => {}
        }

        for child in &part.parts {
            self.walk(message_id, child, options, depth + 1);
        }
    }

    fn push_attachment(
        &mut self,
        message_id: &str,
        part: &MessagePart,
        filename: &str,
        mime: &str,
        options: &MapperOptions,
    ) {
        let body = part.body.clone().unwrap_or_default();
        let size = body.size.max(0) as u64;

        let inline = match body.data.as_deref() {
            Some(data) if size < options.inline_attachment_max_bytes => {
                match decode_base64url(data) {
                    Ok(bytes) => Some(bytes),
                    Err(err) => {
                        warn!(message_id, filename, error = %err, "undecodable inline attachment");
                        None
                    }
                }
            }
            _ => None,
        };

        let content = match (inline, body.attachment_id) {
            (Some(bytes), _) => AttachmentContent::Inline(bytes),
            (None, Some(attachment_id)) if !attachment_id.is_empty() => {
                AttachmentContent::Remote { attachment_id }
            }
            // Zero-byte files arrive with neither data nor a handle.
            _ if body.data.is_none() => AttachmentContent::Inline(Vec::new()),
            _ => {
                warn!(message_id, filename, "attachment has no retrievable content, skipping");
                return;
            }
        };

        self.attachments.push(Attachment {
            filename: filename.to_string(),
            mime_type: if mime.is_empty() {
                "application/octet-stream".to_string()
            } else {
                mime.to_string()
            },
            size,
            content,
        });
    }
}

fn essence(mime: Option<&str>) -> String {
    mime.unwrap_or_default()
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn decode_text(message_id: &str, part: &MessagePart) -> Option<String> {
    let data = part.body.as_ref()?.data.as_deref()?;
    match decode_base64url(data) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) => {
            warn!(message_id, error = %err, "undecodable body part");
            None
        }
    }
}
