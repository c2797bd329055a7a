//! JSON-RPC 2.0 surface for local agents: one request per line, `tools/call` routed to a fixed
//! table of mail operations. The table has no send operation.

pub mod error;
pub mod rate_limit;
pub mod tools;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::accounts::AccountRepository;
use crate::credentials::CredentialManager;
use crate::emails::MailStore;
use crate::labels::LabelRepository;
use crate::remote::RemoteMail;
use crate::sanitize::{DEFAULT_SANITIZE_TIMEOUT, HtmlSanitizer, PassthroughSanitizer};
use crate::spool::AttachmentSpool;

pub use error::{ErrorObject, ProtocolError};
pub use rate_limit::{RateLimiter, RateLimits};

const JSONRPC_VERSION: &str = "2.0";

pub const DEFAULT_MAX_CONNECTIONS: usize = 8;
pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 25 * 1024 * 1024;
pub const DEFAULT_INLINE_ATTACHMENT_BYTES: u64 = 256 * 1024;
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    pub rate_limits: RateLimits,
    pub max_connections: usize,
    pub max_attachment_bytes: u64,
    pub inline_attachment_bytes: u64,
    pub sanitize_timeout: Duration,
    /// Longest request line accepted, excluding the newline.
    pub max_request_bytes: usize,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            rate_limits: RateLimits::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
            inline_attachment_bytes: DEFAULT_INLINE_ATTACHMENT_BYTES,
            sanitize_timeout: DEFAULT_SANITIZE_TIMEOUT,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Local,
    /// Anything that did not arrive over stdio or the local socket.
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub connection_id: u64,
    pub origin: Origin,
}

impl RequestContext {
    pub fn local(connection_id: u64) -> Self {
        Self {
            connection_id,
            origin: Origin::Local,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Shared by every connection. Per-request state lives in [`RequestContext`].
#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) accounts: AccountRepository,
    pub(crate) labels: LabelRepository,
    pub(crate) store: Arc<dyn MailStore>,
    pub(crate) remote: Arc<dyn RemoteMail>,
    pub(crate) credentials: CredentialManager,
    pub(crate) sanitizer: Arc<dyn HtmlSanitizer>,
    pub(crate) spool: AttachmentSpool,
    pub(crate) settings: ProtocolSettings,
    limiter: Arc<RateLimiter>,
}

impl Dispatcher {
    pub fn new(
        accounts: AccountRepository,
        labels: LabelRepository,
        store: Arc<dyn MailStore>,
        remote: Arc<dyn RemoteMail>,
        credentials: CredentialManager,
        spool: AttachmentSpool,
        settings: ProtocolSettings,
    ) -> Self {
        Self {
            accounts,
            labels,
            store,
            remote,
            credentials,
            sanitizer: Arc::new(PassthroughSanitizer),
            spool,
            limiter: Arc::new(RateLimiter::new(settings.rate_limits)),
            settings,
        }
    }

    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn HtmlSanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    /// Releases per-connection state once a connection closes.
    pub fn connection_closed(&self, connection_id: u64) {
        self.limiter.forget(connection_id);
    }

    /// Handles one request line. Returns `None` for notifications.
    pub async fn handle_line(&self, ctx: &RequestContext, line: &str) -> Option<String> {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                return Some(error_response(None, &ProtocolError::ParseError(err.to_string())));
            }
        };

        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(err) => {
                return Some(error_response(
                    None,
                    &ProtocolError::InvalidRequest(err.to_string()),
                ));
            }
        };
        let id = request.id.clone();

        let outcome = self.route(ctx, request).await;
        // Notifications get no reply, not even an error.
        let id = id?;
        Some(match outcome {
            Ok(result) => result_response(id, result),
            Err(err) => error_response(Some(id), &err),
        })
    }

    async fn route(
        &self,
        ctx: &RequestContext,
        request: JsonRpcRequest,
    ) -> Result<Value, ProtocolError> {
        if let Origin::Remote(peer) = &ctx.origin {
            warn!(connection_id = ctx.connection_id, peer, "refusing non-local request");
            return Err(ProtocolError::InvalidRequest(
                "requests are only accepted from local channels".into(),
            ));
        }
        if request.jsonrpc != JSONRPC_VERSION {
            return Err(ProtocolError::InvalidRequest(
                "jsonrpc must be \"2.0\"".into(),
            ));
        }
        self.limiter
            .check(ctx.connection_id)
            .map_err(|retry_after| ProtocolError::RateLimited { retry_after })?;

        debug!(connection_id = ctx.connection_id, method = %request.method, "protocol request");
        match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {
                    "tools": {}
                }
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": tools::tool_schemas() })),
            "tools/call" => {
                let name = request
                    .params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ProtocolError::InvalidParameter("tools/call requires params.name".into())
                    })?;
                let arguments = match request.params.get("arguments") {
                    None | Some(Value::Null) => json!({}),
                    Some(args @ Value::Object(_)) => args.clone(),
                    Some(_) => {
                        return Err(ProtocolError::InvalidParameter(
                            "params.arguments must be an object".into(),
                        ));
                    }
                };
                tools::call_tool(self, name, &arguments).await
            }
            method if method.starts_with("notifications/") => Ok(Value::Null),
            other => Err(ProtocolError::MethodNotFound(format!(
                "unknown method '{other}'"
            ))),
        }
    }
}

fn result_response(id: Value, result: Value) -> String {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
    .to_string()
}

pub fn error_response(id: Option<Value>, err: &ProtocolError) -> String {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id.unwrap_or(Value::Null),
        "error": err.to_object(),
    })
    .to_string()
}
