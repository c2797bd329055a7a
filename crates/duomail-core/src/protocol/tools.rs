use serde_json::{Map, Value, json};
use tracing::info;

use super::{Dispatcher, ProtocolError};
use crate::codec::{decode_base64url, encode_base64url};
use crate::drafts::{DraftAddress, DraftContent};
use crate::emails::{AttachmentContent, Email, EmailFlags, Folder, FolderQuery, SearchQuery};
use crate::sanitize::sanitize_with_timeout;

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;

pub fn tool_schemas() -> Vec<Value> {
    vec![
        json!({
            "name": "list_messages",
            "description": "List cached messages in a folder, newest first",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "account_id": {"type": "string"},
                    "folder": {"type": "string", "description": "inbox, starred, all, or a label id"},
                    "unread_only": {"type": "boolean"},
                    "limit": {"type": "integer", "minimum": 1, "maximum": MAX_LIST_LIMIT},
                    "offset": {"type": "integer", "minimum": 0}
                }
            }
        }),
        json!({
            "name": "read_message",
            "description": "Read one cached message with its bodies and attachment list",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "account_id": {"type": "string"},
                    "message_id": {"type": "string"}
                },
                "required": ["account_id", "message_id"]
            }
        }),
        json!({
            "name": "search_messages",
            "description": "Search cached messages by subject, sender, snippet or body text",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "account_id": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1, "maximum": MAX_LIST_LIMIT}
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "get_thread",
            "description": "Return the cached messages of a conversation, oldest first",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "account_id": {"type": "string"},
                    "thread_id": {"type": "string"}
                },
                "required": ["account_id", "thread_id"]
            }
        }),
        json!({
            "name": "list_labels",
            "description": "List the labels known for an account",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "account_id": {"type": "string"}
                },
                "required": ["account_id"]
            }
        }),
        json!({
            "name": "list_accounts",
            "description": "List configured accounts with credential and sync status",
            "inputSchema": {
                "type": "object",
                "properties": {}
            }
        }),
        json!({
            "name": "create_draft",
            "description": "Create a draft in the account's mailbox. Drafts are never sent.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "account_id": {"type": "string"},
                    "to": {"type": "array", "items": address_schema()},
                    "cc": {"type": "array", "items": address_schema()},
                    "bcc": {"type": "array", "items": address_schema()},
                    "subject": {"type": "string"},
                    "body_text": {"type": "string"},
                    "body_html": {"type": "string"},
                    "in_reply_to": {"type": "string", "description": "Message-ID header being answered"},
                    "thread_id": {"type": "string"}
                },
                "required": ["account_id", "to"]
            }
        }),
        json!({
            "name": "modify_labels",
            "description": "Add or remove labels on a message",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "account_id": {"type": "string"},
                    "message_id": {"type": "string"},
                    "add_label_ids": {"type": "array", "items": {"type": "string"}},
                    "remove_label_ids": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["account_id", "message_id"]
            }
        }),
        json!({
            "name": "get_attachment",
            "description": "Fetch attachment content; large content is returned as a file handle",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "account_id": {"type": "string"},
                    "message_id": {"type": "string"},
                    "attachment_index": {"type": "integer", "minimum": 0}
                },
                "required": ["account_id", "message_id", "attachment_index"]
            }
        }),
    ]
}

fn address_schema() -> Value {
    json!({
        "oneOf": [
            {"type": "string"},
            {
                "type": "object",
                "properties": {
                    "email": {"type": "string"},
                    "name": {"type": "string"}
                },
                "required": ["email"]
            }
        ]
    })
}

/// Routes a `tools/call`. Names outside this table, including any attempt to send, are
/// `MethodNotFound`.
pub async fn call_tool(
    dispatcher: &Dispatcher,
    name: &str,
    arguments: &Value,
) -> Result<Value, ProtocolError> {
    match name {
        "list_messages" => list_messages(dispatcher, arguments).await,
        "read_message" => read_message(dispatcher, arguments).await,
        "search_messages" => search_messages(dispatcher, arguments).await,
        "get_thread" => get_thread(dispatcher, arguments).await,
        "list_labels" => list_labels(dispatcher, arguments).await,
        "list_accounts" => list_accounts(dispatcher).await,
        "create_draft" => create_draft(dispatcher, arguments).await,
        "modify_labels" => modify_labels(dispatcher, arguments).await,
        "get_attachment" => get_attachment(dispatcher, arguments).await,
        other => Err(ProtocolError::MethodNotFound(format!("unknown tool '{other}'"))),
    }
}

async fn list_messages(dispatcher: &Dispatcher, arguments: &Value) -> Result<Value, ProtocolError> {
    let account_id = optional_string(arguments, "account_id")?;
    let folder = optional_string(arguments, "folder")?.unwrap_or_else(|| "inbox".to_string());
    let query = FolderQuery {
        account_id: account_id.clone(),
        folder: Folder::parse(&folder),
        unread_only: optional_bool(arguments, "unread_only")?.unwrap_or(false),
        limit: limit(arguments)?,
        offset: optional_u32(arguments, "offset")?.unwrap_or(0),
    };

    if let Some(account_id) = account_id.as_deref() {
        dispatcher.accounts.get_by_id(account_id).await?;
    }
    let messages = dispatcher.store.query_by_account_and_folder(&query).await?;
    Ok(json!({ "messages": messages }))
}

async fn read_message(dispatcher: &Dispatcher, arguments: &Value) -> Result<Value, ProtocolError> {
    let account_id = required_string(arguments, "account_id")?;
    let message_id = required_string(arguments, "message_id")?;

    let email = dispatcher
        .store
        .get_by_remote_id(&account_id, &message_id)
        .await?
        .ok_or_else(|| ProtocolError::NotFound(format!("message {message_id}")))?;

    let body_html = match email.body_html.clone() {
        Some(html) => Some(
            sanitize_with_timeout(
                dispatcher.sanitizer.clone(),
                html,
                email.body_text.clone(),
                dispatcher.settings.sanitize_timeout,
            )
            .await,
        ),
        None => None,
    };

    let mut view = email_view(&email);
    view.insert("body_text".into(), json!(email.body_text));
    view.insert("body_html".into(), json!(body_html));
    Ok(Value::Object(view))
}

async fn search_messages(
    dispatcher: &Dispatcher,
    arguments: &Value,
) -> Result<Value, ProtocolError> {
    let text = required_string(arguments, "query")?;
    let query = SearchQuery {
        account_id: optional_string(arguments, "account_id")?,
        text,
        limit: limit(arguments)?,
    };
    let messages = dispatcher.store.search(&query).await?;
    Ok(json!({ "messages": messages }))
}

async fn get_thread(dispatcher: &Dispatcher, arguments: &Value) -> Result<Value, ProtocolError> {
    let account_id = required_string(arguments, "account_id")?;
    let thread_id = required_string(arguments, "thread_id")?;

    let emails = dispatcher.store.thread(&account_id, &thread_id).await?;
    let Some(first) = emails.first() else {
        return Err(ProtocolError::NotFound(format!("thread {thread_id}")));
    };

    let subject = first.subject.clone();
    let last_message_at = emails.iter().filter_map(|e| e.date).max();
    let unread_count = emails.iter().filter(|e| !e.flags.is_read).count();
    let messages: Vec<Value> = emails
        .iter()
        .map(|email| {
            let mut view = email_view(email);
            view.insert("body_text".into(), json!(email.body_text));
            Value::Object(view)
        })
        .collect();

    Ok(json!({
        "account_id": account_id,
        "thread_id": thread_id,
        "subject": subject,
        "message_count": messages.len(),
        "unread_count": unread_count,
        "last_message_at": last_message_at,
        "messages": messages,
    }))
}

async fn list_labels(dispatcher: &Dispatcher, arguments: &Value) -> Result<Value, ProtocolError> {
    let account_id = required_string(arguments, "account_id")?;
    dispatcher.accounts.get_by_id(&account_id).await?;
    let labels = dispatcher.labels.list_for_account(&account_id).await?;
    Ok(json!({ "labels": labels }))
}

async fn list_accounts(dispatcher: &Dispatcher) -> Result<Value, ProtocolError> {
    let accounts = dispatcher.accounts.list_all().await?;
    let mut views = Vec::with_capacity(accounts.len());
    for account in accounts {
        let credential_state = dispatcher.credentials.state(&account.id).await?;
        let sync_state = dispatcher.accounts.sync_state(&account.id).await?;
        views.push(json!({
            "id": account.id,
            "email": account.email,
            "display_name": account.display_name,
            "credential_state": credential_state,
            "sync_state": sync_state,
        }));
    }
    Ok(json!({ "accounts": views }))
}

async fn create_draft(dispatcher: &Dispatcher, arguments: &Value) -> Result<Value, ProtocolError> {
    let account_id = required_string(arguments, "account_id")?;
    let to = address_list(arguments, "to")?;
    let cc = address_list(arguments, "cc")?;
    let bcc = address_list(arguments, "bcc")?;
    let subject = optional_string(arguments, "subject")?;
    let body_text = optional_string(arguments, "body_text")?;
    let body_html = optional_string(arguments, "body_html")?;
    let in_reply_to = optional_string(arguments, "in_reply_to")?;
    let thread_id = optional_string(arguments, "thread_id")?;

    let account = dispatcher.accounts.get_by_id(&account_id).await?;
    let content = DraftContent {
        from: DraftAddress {
            email: account.email.clone(),
            name: account.display_name.clone(),
        },
        to,
        cc,
        bcc,
        subject,
        body_text,
        body_html,
        in_reply_to,
    };
    let raw = content.to_base64url()?;

    let remote = dispatcher.remote.clone();
    let draft = dispatcher
        .credentials
        .call_authorized(&account_id, |token| {
            let remote = remote.clone();
            let raw = raw.clone();
            let thread_id = thread_id.clone();
            async move { remote.create_draft(&token, &raw, thread_id.as_deref()).await }
        })
        .await
        .map_err(|err| ProtocolError::from_authorized(&account_id, err))?;

    info!(account_id = %account_id, draft_id = %draft.id, "draft created");
    let message = draft.message.as_ref();
    Ok(json!({
        "draft_id": draft.id,
        "message_id": message.map(|m| m.id.clone()),
        "thread_id": message.and_then(|m| m.thread_id.clone()),
    }))
}

async fn modify_labels(dispatcher: &Dispatcher, arguments: &Value) -> Result<Value, ProtocolError> {
    let account_id = required_string(arguments, "account_id")?;
    let message_id = required_string(arguments, "message_id")?;
    let add = string_list(arguments, "add_label_ids")?;
    let remove = string_list(arguments, "remove_label_ids")?;
    if add.is_empty() && remove.is_empty() {
        return Err(ProtocolError::InvalidParameter(
            "add_label_ids or remove_label_ids must name at least one label".into(),
        ));
    }
    if let Some(label) = add.iter().find(|label| remove.contains(label)) {
        return Err(ProtocolError::InvalidParameter(format!(
            "label '{label}' is both added and removed"
        )));
    }
    dispatcher.accounts.get_by_id(&account_id).await?;

    let remote = dispatcher.remote.clone();
    let message = dispatcher
        .credentials
        .call_authorized(&account_id, |token| {
            let remote = remote.clone();
            let message_id = message_id.clone();
            let add = add.clone();
            let remove = remove.clone();
            async move { remote.modify_labels(&token, &message_id, &add, &remove).await }
        })
        .await
        .map_err(|err| ProtocolError::from_authorized(&account_id, err))?;

    // The remote's resulting label set is authoritative when it reports one.
    let local = if message.label_ids.is_empty() {
        dispatcher
            .store
            .modify_labels(&account_id, &message_id, &add, &remove)
            .await?
    } else if dispatcher
        .store
        .update_labels(&account_id, &message_id, &message.label_ids)
        .await?
    {
        Some(message.label_ids.clone())
    } else {
        None
    };

    let label_ids = local.clone().unwrap_or(message.label_ids);
    info!(
        account_id = %account_id,
        message_id = %message_id,
        cached = local.is_some(),
        "labels modified"
    );
    Ok(json!({
        "message_id": message_id,
        "label_ids": label_ids,
        "flags": EmailFlags::from_labels(&label_ids),
        "cached": local.is_some(),
    }))
}

async fn get_attachment(dispatcher: &Dispatcher, arguments: &Value) -> Result<Value, ProtocolError> {
    let account_id = required_string(arguments, "account_id")?;
    let message_id = required_string(arguments, "message_id")?;
    let index = optional_u32(arguments, "attachment_index")?.ok_or_else(|| {
        ProtocolError::InvalidParameter("missing required param 'attachment_index'".into())
    })?;

    let attachment = dispatcher
        .store
        .get_attachment(&account_id, &message_id, index)
        .await?
        .ok_or_else(|| {
            ProtocolError::NotFound(format!("attachment {index} of message {message_id}"))
        })?;

    let limit = dispatcher.settings.max_attachment_bytes;
    if attachment.size > limit {
        return Err(ProtocolError::OversizedAttachment {
            size: attachment.size,
            limit,
        });
    }

    let content = match &attachment.content {
        AttachmentContent::Inline(bytes) => bytes.clone(),
        AttachmentContent::Remote { attachment_id } => {
            let remote = dispatcher.remote.clone();
            let body = dispatcher
                .credentials
                .call_authorized(&account_id, |token| {
                    let remote = remote.clone();
                    let message_id = message_id.clone();
                    let attachment_id = attachment_id.clone();
                    async move {
                        remote
                            .get_attachment(&token, &message_id, &attachment_id)
                            .await
                    }
                })
                .await
                .map_err(|err| ProtocolError::from_authorized(&account_id, err))?;
            let data = body.data.ok_or_else(|| {
                ProtocolError::Internal("remote returned attachment without data".into())
            })?;
            decode_base64url(&data)
                .map_err(|err| ProtocolError::Internal(format!("attachment decode: {err}")))?
        }
    };

    let size = content.len() as u64;
    if size > limit {
        return Err(ProtocolError::OversizedAttachment { size, limit });
    }

    if size <= dispatcher.settings.inline_attachment_bytes {
        return Ok(json!({
            "filename": attachment.filename,
            "mime_type": attachment.mime_type,
            "size": size,
            "encoding": "base64url",
            "data": encode_base64url(&content),
        }));
    }

    let handle = dispatcher
        .spool
        .write(&attachment.filename, &attachment.mime_type, &content)
        .await
        .map_err(|err| ProtocolError::Internal(err.to_string()))?;
    Ok(json!({
        "filename": attachment.filename,
        "mime_type": attachment.mime_type,
        "size": size,
        "handle": handle,
    }))
}

fn email_view(email: &Email) -> Map<String, Value> {
    let attachments: Vec<Value> = email
        .attachments
        .iter()
        .enumerate()
        .map(|(index, attachment)| {
            json!({
                "index": index,
                "filename": attachment.filename,
                "mime_type": attachment.mime_type,
                "size": attachment.size,
            })
        })
        .collect();

    let view = json!({
        "account_id": email.account_id,
        "message_id": email.remote_id,
        "thread_id": email.thread_id,
        "from_address": email.from_address,
        "from_name": email.from_name,
        "to": email.to,
        "cc": email.cc,
        "subject": email.subject,
        "date": email.date,
        "snippet": email.snippet,
        "label_ids": email.label_ids,
        "is_read": email.flags.is_read,
        "is_starred": email.flags.is_starred,
        "is_in_inbox": email.flags.is_in_inbox,
        "attachments": attachments,
    });
    match view {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn limit(arguments: &Value) -> Result<u32, ProtocolError> {
    match optional_u32(arguments, "limit")? {
        None => Ok(DEFAULT_LIST_LIMIT),
        Some(0) => Err(ProtocolError::InvalidParameter(
            "param 'limit' must be at least 1".into(),
        )),
        Some(n) => Ok(n.min(MAX_LIST_LIMIT)),
    }
}

fn required_string(arguments: &Value, key: &str) -> Result<String, ProtocolError> {
    optional_string(arguments, key)?
        .ok_or_else(|| ProtocolError::InvalidParameter(format!("missing required param '{key}'")))
}

/// Absent, null and blank strings all count as missing; any other type is rejected.
fn optional_string(arguments: &Value, key: &str) -> Result<Option<String>, ProtocolError> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(trimmed.to_string()))
            }
        }
        Some(_) => Err(ProtocolError::InvalidParameter(format!(
            "param '{key}' must be a string"
        ))),
    }
}

fn optional_bool(arguments: &Value, key: &str) -> Result<Option<bool>, ProtocolError> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ProtocolError::InvalidParameter(format!(
            "param '{key}' must be a boolean"
        ))),
    }
}

fn optional_u32(arguments: &Value, key: &str) -> Result<Option<u32>, ProtocolError> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| {
                ProtocolError::InvalidParameter(format!(
                    "param '{key}' must be a non-negative integer"
                ))
            }),
    }
}

fn string_list(arguments: &Value, key: &str) -> Result<Vec<String>, ProtocolError> {
    let invalid =
        || ProtocolError::InvalidParameter(format!("param '{key}' must be an array of strings"));
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .ok_or_else(invalid)
            })
            .collect(),
        Some(_) => Err(invalid()),
    }
}

/// Accepts a single address or an array; each entry is `"a@b"` or `{"email", "name"}`.
fn address_list(arguments: &Value, key: &str) -> Result<Vec<DraftAddress>, ProtocolError> {
    let parse = |item: &Value| -> Result<DraftAddress, ProtocolError> {
        match item {
            Value::String(email) if !email.trim().is_empty() => Ok(DraftAddress::from(email.trim())),
            Value::Object(_) => serde_json::from_value::<DraftAddress>(item.clone())
                .ok()
                .filter(|addr| !addr.email.trim().is_empty())
                .ok_or_else(|| {
                    ProtocolError::InvalidParameter(format!(
                        "param '{key}' contains an address without an email"
                    ))
                }),
            _ => Err(ProtocolError::InvalidParameter(format!(
                "param '{key}' must contain email addresses"
            ))),
        }
    };

    match arguments.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(parse).collect(),
        Some(single) => Ok(vec![parse(single)?]),
    }
}
