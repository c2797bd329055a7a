//! RFC 5322 composition for drafts. Drafts are only ever stored remotely, never sent from here.

use mail_builder::MessageBuilder;
use mail_builder::headers::address::Address;
use mail_builder::headers::message_id::MessageId;
use serde::Deserialize;
use thiserror::Error;

use crate::codec::encode_base64url;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DraftAddress {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl From<&str> for DraftAddress {
    fn from(email: &str) -> Self {
        Self {
            email: email.to_string(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftContent {
    pub from: DraftAddress,
    pub to: Vec<DraftAddress>,
    pub cc: Vec<DraftAddress>,
    pub bcc: Vec<DraftAddress>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    /// RFC 5322 Message-ID of the message being answered.
    pub in_reply_to: Option<String>,
}

#[derive(Debug, Error)]
pub enum MimeBuildError {
    #[error("at least one recipient is required")]
    MissingRecipients,
    #[error("a text or html body is required")]
    MissingBody,
    #[error("recipient address is empty")]
    EmptyAddress,
    #[error("failed to build message: {0}")]
    Io(#[from] std::io::Error),
}

impl DraftContent {
    pub fn to_rfc822(&self) -> Result<String, MimeBuildError> {
        if self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty() {
            return Err(MimeBuildError::MissingRecipients);
        }
        let has_body = |body: &Option<String>| body.as_deref().is_some_and(|b| !b.is_empty());
        if !has_body(&self.body_text) && !has_body(&self.body_html) {
            return Err(MimeBuildError::MissingBody);
        }
        if self
            .to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .any(|a| a.email.trim().is_empty())
        {
            return Err(MimeBuildError::EmptyAddress);
        }

        let mut builder = MessageBuilder::new().from(header_address(&self.from));
        if !self.to.is_empty() {
            builder = builder.to(address_list(&self.to));
        }
        if !self.cc.is_empty() {
            builder = builder.cc(address_list(&self.cc));
        }
        if !self.bcc.is_empty() {
            builder = builder.bcc(address_list(&self.bcc));
        }
        if let Some(subject) = self.subject.as_deref() {
            builder = builder.subject(subject);
        }
        if let Some(body) = self.body_text.as_deref().filter(|b| !b.is_empty()) {
            builder = builder.text_body(body);
        }
        if let Some(body) = self.body_html.as_deref().filter(|b| !b.is_empty()) {
            builder = builder.html_body(body);
        }
        if let Some(parent) = self.in_reply_to.as_deref().and_then(normalize_message_id) {
            builder = builder
                .in_reply_to(MessageId::new(parent.clone()))
                .references(MessageId::new(parent));
        }

        builder.write_to_string().map_err(MimeBuildError::Io)
    }

    /// The `raw` field the remote draft endpoint expects.
    pub fn to_base64url(&self) -> Result<String, MimeBuildError> {
        Ok(encode_base64url(self.to_rfc822()?.as_bytes()))
    }
}

fn header_address(addr: &DraftAddress) -> Address<'static> {
    Address::new_address(addr.name.clone(), addr.email.trim().to_string())
}

fn address_list(addrs: &[DraftAddress]) -> Address<'static> {
    Address::new_list(addrs.iter().map(header_address).collect())
}

/// Strips whitespace and angle brackets from a Message-ID; `None` when nothing is left.
pub fn normalize_message_id(id: &str) -> Option<String> {
    let trimmed = id.trim().trim_matches('<').trim_matches('>');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
