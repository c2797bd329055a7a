use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::accounts::AccountError;
use crate::credentials::{AuthorizedError, CredentialError};
use crate::drafts::MimeBuildError;
use crate::emails::StoreError;
use crate::labels::LabelError;
use crate::remote::RemoteError;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const NOT_FOUND: i64 = -32001;
pub const AUTH_REQUIRED: i64 = -32002;
pub const QUOTA_EXCEEDED: i64 = -32003;
pub const RATE_LIMITED: i64 = -32004;
pub const OVERSIZED_ATTACHMENT: i64 = -32005;
pub const CONNECTION_LIMIT_REACHED: i64 = -32006;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("account {account_id} requires authorization")]
    AuthRequired { account_id: String },
    #[error("remote quota exceeded")]
    QuotaExceeded { retry_after: Duration },
    #[error("rate limit exceeded")]
    RateLimited { retry_after: Duration },
    #[error("attachment is {size} bytes, limit is {limit}")]
    OversizedAttachment { size: u64, limit: u64 },
    #[error("connection limit of {limit} reached")]
    ConnectionLimitReached { limit: usize },
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ProtocolError {
    pub fn code(&self) -> i64 {
        match self {
            ProtocolError::ParseError(_) => PARSE_ERROR,
            ProtocolError::InvalidRequest(_) => INVALID_REQUEST,
            ProtocolError::MethodNotFound(_) => METHOD_NOT_FOUND,
            ProtocolError::InvalidParameter(_) => INVALID_PARAMS,
            ProtocolError::Internal(_) => INTERNAL_ERROR,
            ProtocolError::NotFound(_) => NOT_FOUND,
            ProtocolError::AuthRequired { .. } => AUTH_REQUIRED,
            ProtocolError::QuotaExceeded { .. } => QUOTA_EXCEEDED,
            ProtocolError::RateLimited { .. } => RATE_LIMITED,
            ProtocolError::OversizedAttachment { .. } => OVERSIZED_ATTACHMENT,
            ProtocolError::ConnectionLimitReached { .. } => CONNECTION_LIMIT_REACHED,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::QuotaExceeded { .. }
                | ProtocolError::RateLimited { .. }
                | ProtocolError::ConnectionLimitReached { .. }
                | ProtocolError::Internal(_)
        )
    }

    pub fn data(&self) -> Option<Value> {
        match self {
            ProtocolError::RateLimited { retry_after }
            | ProtocolError::QuotaExceeded { retry_after } => {
                Some(json!({ "retry_after_secs": retry_after_secs(*retry_after) }))
            }
            ProtocolError::OversizedAttachment { size, limit } => {
                Some(json!({ "size": size, "limit": limit }))
            }
            ProtocolError::AuthRequired { account_id } => Some(json!({ "account_id": account_id })),
            _ => None,
        }
    }

    pub fn to_object(&self) -> ErrorObject {
        ErrorObject {
            code: self.code(),
            message: self.to_string(),
            data: self.data(),
        }
    }
}

/// Whole seconds, rounded up so a client never retries early.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 || secs == 0 {
        secs + 1
    } else {
        secs
    }
}

impl From<StoreError> for ProtocolError {
    fn from(err: StoreError) -> Self {
        ProtocolError::Internal(err.to_string())
    }
}

impl From<AccountError> for ProtocolError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::NotFound(id) => ProtocolError::NotFound(format!("account {id}")),
            other => ProtocolError::Internal(other.to_string()),
        }
    }
}

impl From<LabelError> for ProtocolError {
    fn from(err: LabelError) -> Self {
        ProtocolError::Internal(err.to_string())
    }
}

impl From<MimeBuildError> for ProtocolError {
    fn from(err: MimeBuildError) -> Self {
        match err {
            MimeBuildError::Io(io) => ProtocolError::Internal(io.to_string()),
            other => ProtocolError::InvalidParameter(other.to_string()),
        }
    }
}

impl From<CredentialError> for ProtocolError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::ReauthenticationRequired { account_id } => {
                ProtocolError::AuthRequired { account_id }
            }
            other => ProtocolError::Internal(other.to_string()),
        }
    }
}

impl From<RemoteError> for ProtocolError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::RateLimited { retry_after } => ProtocolError::QuotaExceeded { retry_after },
            RemoteError::NotFound => ProtocolError::NotFound("remote resource not found".into()),
            RemoteError::AuthRejected => ProtocolError::AuthRequired {
                account_id: String::new(),
            },
            RemoteError::Rejected { status: 400, body } => ProtocolError::InvalidParameter(body),
            other => ProtocolError::Internal(other.to_string()),
        }
    }
}

impl ProtocolError {
    /// Maps a failed authorized call, naming the account when authorization is the problem.
    pub fn from_authorized(account_id: &str, err: AuthorizedError) -> Self {
        match err {
            AuthorizedError::Credential(err) => err.into(),
            AuthorizedError::Remote(RemoteError::AuthRejected) => ProtocolError::AuthRequired {
                account_id: account_id.to_string(),
            },
            AuthorizedError::Remote(err) => err.into(),
        }
    }
}
