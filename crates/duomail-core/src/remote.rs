use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::gmail::types::{
    AttachmentBody, Draft, ListHistoryResponse, ListLabelsResponse, ListMessagesResponse, Message,
    Profile,
};

pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// A bearer credential handed out by the credential manager. Debug output never shows the token.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("access token rejected")]
    AuthRejected,
    #[error("resource not found")]
    NotFound,
    #[error("history cursor is no longer valid")]
    CursorExpired,
    #[error("transient server error: {0}")]
    Transient(String),
    #[error("network unavailable: {0}")]
    Network(String),
    #[error("response decode error: {0}")]
    Decode(String),
    #[error("request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl RemoteError {
    pub fn code(&self) -> &'static str {
        match self {
            RemoteError::RateLimited { .. } => "remote.rate_limited",
            RemoteError::AuthRejected => "remote.auth_rejected",
            RemoteError::NotFound => "remote.not_found",
            RemoteError::CursorExpired => "remote.cursor_expired",
            RemoteError::Transient(_) => "remote.transient",
            RemoteError::Network(_) => "remote.network",
            RemoteError::Decode(_) => "remote.decode",
            RemoteError::Rejected { .. } => "remote.rejected",
        }
    }

    /// Worth retrying the same request within one sync pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_) | RemoteError::Network(_))
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RemoteError::RateLimited { .. }
                | RemoteError::Transient(_)
                | RemoteError::Network(_)
                | RemoteError::CursorExpired
                | RemoteError::AuthRejected
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListMessagesParams {
    pub query: Option<String>,
    pub label_ids: Vec<String>,
    pub page_token: Option<String>,
    pub max_results: Option<u32>,
}

/// Read and draft surface of the remote mailbox. There is deliberately no send operation.
#[async_trait]
pub trait RemoteMail: Send + Sync {
    async fn list_history(
        &self,
        token: &AccessToken,
        start_history_id: &str,
        page_token: Option<&str>,
        max_results: Option<u32>,
    ) -> Result<ListHistoryResponse, RemoteError>;

    async fn get_message(&self, token: &AccessToken, id: &str) -> Result<Message, RemoteError>;

    async fn list_messages(
        &self,
        token: &AccessToken,
        params: &ListMessagesParams,
    ) -> Result<ListMessagesResponse, RemoteError>;

    async fn get_profile(&self, token: &AccessToken) -> Result<Profile, RemoteError>;

    async fn list_labels(&self, token: &AccessToken) -> Result<ListLabelsResponse, RemoteError>;

    async fn modify_labels(
        &self,
        token: &AccessToken,
        id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<Message, RemoteError>;

    async fn create_draft(
        &self,
        token: &AccessToken,
        raw: &str,
        thread_id: Option<&str>,
    ) -> Result<Draft, RemoteError>;

    async fn get_attachment(
        &self,
        token: &AccessToken,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<AttachmentBody, RemoteError>;
}
