use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{Connection, Row, Value, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::db::{Database, DbError};

pub const LABEL_UNREAD: &str = "UNREAD";
pub const LABEL_STARRED: &str = "STARRED";
pub const LABEL_INBOX: &str = "INBOX";

const EMAIL_COLUMNS: &str = "id, account_id, remote_id, thread_id, from_address, from_name, to_json, cc_json, subject, date_ms, snippet, body_text, body_html, label_ids_json";
const SUMMARY_COLUMNS: &str = "e.account_id, e.remote_id, e.thread_id, e.from_address, e.from_name, e.subject, e.date_ms, e.snippet, e.label_ids_json, (SELECT COUNT(*) FROM attachments a WHERE a.email_id = e.id)";
const ATTACHMENT_COLUMNS: &str =
    "position, filename, mime_type, size, inline_data, remote_attachment_id";

/// Flags derived from a message's label set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EmailFlags {
    pub is_read: bool,
    pub is_starred: bool,
    pub is_in_inbox: bool,
}

impl EmailFlags {
    pub fn from_labels(label_ids: &[String]) -> Self {
        let has = |label: &str| label_ids.iter().any(|id| id == label);
        Self {
            is_read: !has(LABEL_UNREAD),
            is_starred: has(LABEL_STARRED),
            is_in_inbox: has(LABEL_INBOX),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentContent {
    Inline(Vec<u8>),
    Remote { attachment_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    /// Declared size from the wire payload.
    pub size: u64,
    pub content: AttachmentContent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub account_id: String,
    pub remote_id: String,
    pub thread_id: String,
    pub from_address: Option<String>,
    pub from_name: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub snippet: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub label_ids: Vec<String>,
    pub flags: EmailFlags,
    pub attachments: Vec<Attachment>,
}

/// Listing view of an email without bodies or attachment content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailSummary {
    pub account_id: String,
    pub message_id: String,
    pub thread_id: String,
    pub from_address: Option<String>,
    pub from_name: Option<String>,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub snippet: Option<String>,
    pub label_ids: Vec<String>,
    #[serde(flatten)]
    pub flags: EmailFlags,
    pub attachment_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Folder {
    Inbox,
    Starred,
    All,
    Label(String),
}

impl Folder {
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "inbox" => Folder::Inbox,
            "starred" => Folder::Starred,
            "all" => Folder::All,
            _ => Folder::Label(name.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderQuery {
    pub account_id: Option<String>,
    pub folder: Folder,
    pub unread_only: bool,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub account_id: Option<String>,
    pub text: String,
    pub limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "store.database",
            StoreError::Sql(_) => "store.sql",
            StoreError::Json(_) => "store.json",
            StoreError::Corrupt(_) => "store.corrupt",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StoreError::Corrupt(_))
    }
}

/// Local replica of remote mail. Writes for one account are serialized; reads never block on
/// them.
#[async_trait]
pub trait MailStore: Send + Sync {
    async fn insert_or_update(&self, email: &Email) -> Result<UpsertOutcome, StoreError>;

    async fn delete_by_remote_id(&self, account_id: &str, remote_id: &str)
    -> Result<bool, StoreError>;

    /// Replaces the label set. Returns `false` when the message is not cached.
    async fn update_labels(
        &self,
        account_id: &str,
        remote_id: &str,
        label_ids: &[String],
    ) -> Result<bool, StoreError>;

    /// Applies a label delta atomically and returns the resulting set, or `None` when the
    /// message is not cached.
    async fn modify_labels(
        &self,
        account_id: &str,
        remote_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<Option<Vec<String>>, StoreError>;

    async fn get_by_remote_id(
        &self,
        account_id: &str,
        remote_id: &str,
    ) -> Result<Option<Email>, StoreError>;

    async fn query_by_account_and_folder(
        &self,
        query: &FolderQuery,
    ) -> Result<Vec<EmailSummary>, StoreError>;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<EmailSummary>, StoreError>;

    /// All cached messages of a thread, oldest first.
    async fn thread(&self, account_id: &str, thread_id: &str) -> Result<Vec<Email>, StoreError>;

    async fn get_attachment(
        &self,
        account_id: &str,
        remote_id: &str,
        position: u32,
    ) -> Result<Option<Attachment>, StoreError>;

    /// Deletes the oldest messages until at most `keep_count` remain; returns how many went.
    async fn delete_oldest(&self, account_id: &str, keep_count: u64) -> Result<u64, StoreError>;

    async fn count(&self, account_id: &str) -> Result<u64, StoreError>;

    async fn clear_account(&self, account_id: &str) -> Result<u64, StoreError>;
}

#[derive(Clone)]
pub struct EmailRepository {
    db: Database,
    write_locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl EmailRepository {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            write_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn lock_account(&self, account_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .write_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(account_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn load_attachments(
        &self,
        conn: &Connection,
        email_id: i64,
    ) -> Result<Vec<Attachment>, StoreError> {
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE email_id = ?1 ORDER BY position"
                ),
                params![email_id],
            )
            .await?;

        let mut attachments = Vec::new();
        while let Some(row) = rows.next().await? {
            attachments.push(row_to_attachment(&row)?);
        }
        Ok(attachments)
    }

    async fn collect_emails(
        &self,
        conn: &Connection,
        sql: &str,
        values: Vec<Value>,
    ) -> Result<Vec<Email>, StoreError> {
        let mut rows = conn.query(sql, Params::Positional(values)).await?;
        let mut found = Vec::new();
        while let Some(row) = rows.next().await? {
            found.push(row_to_email(&row)?);
        }

        let mut emails = Vec::with_capacity(found.len());
        for (email_id, mut email) in found {
            email.attachments = self.load_attachments(conn, email_id).await?;
            emails.push(email);
        }
        Ok(emails)
    }

    async fn collect_summaries(
        &self,
        sql: &str,
        values: Vec<Value>,
    ) -> Result<Vec<EmailSummary>, StoreError> {
        let conn = self.db.connection().await?;
        let mut rows = conn.query(sql, Params::Positional(values)).await?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next().await? {
            summaries.push(row_to_summary(&row)?);
        }
        Ok(summaries)
    }

    async fn write_labels(
        conn: &Connection,
        account_id: &str,
        remote_id: &str,
        label_ids: &[String],
    ) -> Result<bool, StoreError> {
        let flags = EmailFlags::from_labels(label_ids);
        let labels_json = serde_json::to_string(label_ids)?;
        let changed = conn
            .execute(
                "UPDATE emails
                 SET label_ids_json = ?1, is_read = ?2, is_starred = ?3, is_in_inbox = ?4, updated_at = ?5
                 WHERE account_id = ?6 AND remote_id = ?7",
                params![
                    labels_json,
                    flags.is_read as i64,
                    flags.is_starred as i64,
                    flags.is_in_inbox as i64,
                    now_rfc3339(),
                    account_id,
                    remote_id
                ],
            )
            .await?;
        Ok(changed > 0)
    }
}

#[async_trait]
impl MailStore for EmailRepository {
    async fn insert_or_update(&self, email: &Email) -> Result<UpsertOutcome, StoreError> {
        let _guard = self.lock_account(&email.account_id).await;
        let now = now_rfc3339();
        let to_json = serde_json::to_string(&email.to)?;
        let cc_json = serde_json::to_string(&email.cc)?;
        let labels_json = serde_json::to_string(&email.label_ids)?;
        let flags = EmailFlags::from_labels(&email.label_ids);
        let date_ms = email.date.map(|date| date.timestamp_millis());

        let conn = self.db.connection().await?;
        let tx = conn.transaction().await?;

        let existing: Option<i64> = {
            let mut rows = tx
                .query(
                    "SELECT id FROM emails WHERE account_id = ?1 AND remote_id = ?2",
                    params![email.account_id.as_str(), email.remote_id.as_str()],
                )
                .await?;
            match rows.next().await? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };

        // Content is write-once per remote id; only labels and flags move, plus any field
        // that was previously missing.
        let (email_id, outcome) = match existing {
            Some(email_id) => {
                tx.execute(
                    "UPDATE emails SET
                        thread_id = ?1,
                        from_address = COALESCE(from_address, ?2),
                        from_name = COALESCE(from_name, ?3),
                        subject = COALESCE(subject, ?4),
                        date_ms = COALESCE(date_ms, ?5),
                        snippet = COALESCE(snippet, ?6),
                        body_text = COALESCE(body_text, ?7),
                        body_html = COALESCE(body_html, ?8),
                        label_ids_json = ?9,
                        is_read = ?10,
                        is_starred = ?11,
                        is_in_inbox = ?12,
                        updated_at = ?13
                     WHERE id = ?14",
                    params![
                        email.thread_id.as_str(),
                        email.from_address.clone(),
                        email.from_name.clone(),
                        email.subject.clone(),
                        date_ms,
                        email.snippet.clone(),
                        email.body_text.clone(),
                        email.body_html.clone(),
                        labels_json,
                        flags.is_read as i64,
                        flags.is_starred as i64,
                        flags.is_in_inbox as i64,
                        now,
                        email_id
                    ],
                )
                .await?;
                (email_id, UpsertOutcome::Updated)
            }
            None => {
                let mut rows = tx
                    .query(
                        "INSERT INTO emails (
                            account_id, remote_id, thread_id, from_address, from_name, to_json, cc_json, subject, date_ms, snippet, body_text, body_html, label_ids_json, is_read, is_starred, is_in_inbox, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)
                         RETURNING id",
                        params![
                            email.account_id.as_str(),
                            email.remote_id.as_str(),
                            email.thread_id.as_str(),
                            email.from_address.clone(),
                            email.from_name.clone(),
                            to_json,
                            cc_json,
                            email.subject.clone(),
                            date_ms,
                            email.snippet.clone(),
                            email.body_text.clone(),
                            email.body_html.clone(),
                            labels_json,
                            flags.is_read as i64,
                            flags.is_starred as i64,
                            flags.is_in_inbox as i64,
                            now
                        ],
                    )
                    .await?;
                let row = rows
                    .next()
                    .await?
                    .ok_or_else(|| StoreError::Corrupt("insert returned no id".into()))?;
                (row.get::<i64>(0)?, UpsertOutcome::Inserted)
            }
        };

        for (position, attachment) in email.attachments.iter().enumerate() {
            let (inline_data, remote_id) = match &attachment.content {
                AttachmentContent::Inline(data) => (Some(data.clone()), None),
                AttachmentContent::Remote { attachment_id } => (None, Some(attachment_id.clone())),
            };
            tx.execute(
                "INSERT OR IGNORE INTO attachments (email_id, position, filename, mime_type, size, inline_data, remote_attachment_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    email_id,
                    position as i64,
                    attachment.filename.as_str(),
                    attachment.mime_type.as_str(),
                    attachment.size as i64,
                    inline_data,
                    remote_id
                ],
            )
            .await?;
        }

        refresh_search_text(&tx, email_id).await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn delete_by_remote_id(
        &self,
        account_id: &str,
        remote_id: &str,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock_account(account_id).await;
        let conn = self.db.connection().await?;
        let deleted = conn
            .execute(
                "DELETE FROM emails WHERE account_id = ?1 AND remote_id = ?2",
                params![account_id, remote_id],
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn update_labels(
        &self,
        account_id: &str,
        remote_id: &str,
        label_ids: &[String],
    ) -> Result<bool, StoreError> {
        let _guard = self.lock_account(account_id).await;
        let conn = self.db.connection().await?;
        Self::write_labels(&conn, account_id, remote_id, label_ids).await
    }

    async fn modify_labels(
        &self,
        account_id: &str,
        remote_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<Option<Vec<String>>, StoreError> {
        let _guard = self.lock_account(account_id).await;
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT label_ids_json FROM emails WHERE account_id = ?1 AND remote_id = ?2",
                params![account_id, remote_id],
            )
            .await?;
        let current: Vec<String> = match rows.next().await? {
            Some(row) => serde_json::from_str(&row.get::<String>(0)?)?,
            None => return Ok(None),
        };
        drop(rows);

        let mut labels: Vec<String> = current
            .into_iter()
            .filter(|label| !remove.contains(label))
            .collect();
        for label in add {
            if !labels.contains(label) && !remove.contains(label) {
                labels.push(label.clone());
            }
        }

        Self::write_labels(&conn, account_id, remote_id, &labels).await?;
        Ok(Some(labels))
    }

    async fn get_by_remote_id(
        &self,
        account_id: &str,
        remote_id: &str,
    ) -> Result<Option<Email>, StoreError> {
        let conn = self.db.connection().await?;
        let emails = self
            .collect_emails(
                &conn,
                &format!(
                    "SELECT {EMAIL_COLUMNS} FROM emails WHERE account_id = ?1 AND remote_id = ?2"
                ),
                vec![account_id.into(), remote_id.into()],
            )
            .await?;
        Ok(emails.into_iter().next())
    }

    async fn query_by_account_and_folder(
        &self,
        query: &FolderQuery,
    ) -> Result<Vec<EmailSummary>, StoreError> {
        let mut sql = format!("SELECT {SUMMARY_COLUMNS} FROM emails e WHERE 1 = 1");
        let mut values: Vec<Value> = Vec::new();

        if let Some(account_id) = &query.account_id {
            sql.push_str(" AND e.account_id = ?");
            values.push(account_id.as_str().into());
        }
        match &query.folder {
            Folder::Inbox => sql.push_str(" AND e.is_in_inbox = 1"),
            Folder::Starred => sql.push_str(" AND e.is_starred = 1"),
            Folder::All => {}
            Folder::Label(label) => {
                sql.push_str(
                    " AND EXISTS (SELECT 1 FROM json_each(e.label_ids_json) WHERE json_each.value = ?)",
                );
                values.push(label.as_str().into());
            }
        }
        if query.unread_only {
            sql.push_str(" AND e.is_read = 0");
        }
        sql.push_str(" ORDER BY e.date_ms IS NULL, e.date_ms DESC, e.id DESC LIMIT ? OFFSET ?");
        values.push(i64::from(query.limit).into());
        values.push(i64::from(query.offset).into());

        self.collect_summaries(&sql, values).await
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<EmailSummary>, StoreError> {
        // LIKE only folds ASCII, so both sides are lowercased here instead.
        let pattern = format!("%{}%", escape_like(&query.text.trim().to_lowercase()));
        let mut sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM emails e
             WHERE e.search_text LIKE ?1 ESCAPE '\\'"
        );
        let mut values: Vec<Value> = vec![pattern.into(), i64::from(query.limit).into()];
        if let Some(account_id) = &query.account_id {
            sql.push_str(" AND e.account_id = ?3");
            values.push(account_id.as_str().into());
        }
        sql.push_str(" ORDER BY e.date_ms IS NULL, e.date_ms DESC, e.id DESC LIMIT ?2");

        self.collect_summaries(&sql, values).await
    }

    async fn thread(&self, account_id: &str, thread_id: &str) -> Result<Vec<Email>, StoreError> {
        let conn = self.db.connection().await?;
        self.collect_emails(
            &conn,
            &format!(
                "SELECT {EMAIL_COLUMNS} FROM emails
                 WHERE account_id = ?1 AND thread_id = ?2
                 ORDER BY date_ms IS NULL, date_ms ASC, id ASC"
            ),
            vec![account_id.into(), thread_id.into()],
        )
        .await
    }

    async fn get_attachment(
        &self,
        account_id: &str,
        remote_id: &str,
        position: u32,
    ) -> Result<Option<Attachment>, StoreError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT a.position, a.filename, a.mime_type, a.size, a.inline_data, a.remote_attachment_id
                 FROM attachments a
                 JOIN emails e ON e.id = a.email_id
                 WHERE e.account_id = ?1 AND e.remote_id = ?2 AND a.position = ?3",
                params![account_id, remote_id, i64::from(position)],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_attachment(&row)?)),
            None => Ok(None),
        }
    }

    async fn delete_oldest(&self, account_id: &str, keep_count: u64) -> Result<u64, StoreError> {
        let _guard = self.lock_account(account_id).await;
        let conn = self.db.connection().await?;
        let total = count_emails(&conn, account_id).await?;
        if total <= keep_count {
            return Ok(0);
        }

        let excess = (total - keep_count) as i64;
        let deleted = conn
            .execute(
                "DELETE FROM emails WHERE id IN (
                    SELECT id FROM emails
                    WHERE account_id = ?1
                    ORDER BY date_ms IS NOT NULL, date_ms ASC, id ASC
                    LIMIT ?2)",
                params![account_id, excess],
            )
            .await?;
        Ok(deleted)
    }

    async fn count(&self, account_id: &str) -> Result<u64, StoreError> {
        let conn = self.db.connection().await?;
        count_emails(&conn, account_id).await
    }

    async fn clear_account(&self, account_id: &str) -> Result<u64, StoreError> {
        let _guard = self.lock_account(account_id).await;
        let conn = self.db.connection().await?;
        let deleted = conn
            .execute(
                "DELETE FROM emails WHERE account_id = ?1",
                params![account_id],
            )
            .await?;
        Ok(deleted)
    }
}

async fn count_emails(conn: &Connection, account_id: &str) -> Result<u64, StoreError> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM emails WHERE account_id = ?1",
            params![account_id],
        )
        .await?;
    let count: i64 = match rows.next().await? {
        Some(row) => row.get(0)?,
        None => 0,
    };
    Ok(count.max(0) as u64)
}

/// Rebuilds the folded search column from whatever content the row holds after a write.
async fn refresh_search_text(tx: &libsql::Transaction, email_id: i64) -> Result<(), StoreError> {
    let mut rows = tx
        .query(
            "SELECT subject, snippet, from_address, from_name, body_text FROM emails WHERE id = ?1",
            params![email_id],
        )
        .await?;
    let Some(row) = rows.next().await? else {
        return Err(StoreError::Corrupt(format!("email {email_id} vanished mid-write")));
    };
    let mut fields = Vec::with_capacity(5);
    for idx in 0..5 {
        fields.push(row.get::<Option<String>>(idx)?.unwrap_or_default());
    }
    drop(rows);

    tx.execute(
        "UPDATE emails SET search_text = ?1 WHERE id = ?2",
        params![fields.join("\n").to_lowercase(), email_id],
    )
    .await?;
    Ok(())
}

fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn millis_to_datetime(value: Option<i64>) -> Option<DateTime<Utc>> {
    value.and_then(DateTime::from_timestamp_millis)
}

fn row_to_email(row: &Row) -> Result<(i64, Email), StoreError> {
    let to_json: String = row.get(6)?;
    let cc_json: String = row.get(7)?;
    let labels_json: String = row.get(13)?;
    let label_ids: Vec<String> = serde_json::from_str(&labels_json)?;

    let email = Email {
        account_id: row.get(1)?,
        remote_id: row.get(2)?,
        thread_id: row.get(3)?,
        from_address: row.get(4)?,
        from_name: row.get(5)?,
        to: serde_json::from_str(&to_json)?,
        cc: serde_json::from_str(&cc_json)?,
        subject: row.get(8)?,
        date: millis_to_datetime(row.get(9)?),
        snippet: row.get(10)?,
        body_text: row.get(11)?,
        body_html: row.get(12)?,
        flags: EmailFlags::from_labels(&label_ids),
        label_ids,
        attachments: Vec::new(),
    };
    Ok((row.get(0)?, email))
}

fn row_to_summary(row: &Row) -> Result<EmailSummary, StoreError> {
    let labels_json: String = row.get(8)?;
    let label_ids: Vec<String> = serde_json::from_str(&labels_json)?;
    let attachment_count: i64 = row.get(9)?;

    Ok(EmailSummary {
        account_id: row.get(0)?,
        message_id: row.get(1)?,
        thread_id: row.get(2)?,
        from_address: row.get(3)?,
        from_name: row.get(4)?,
        subject: row.get(5)?,
        date: millis_to_datetime(row.get(6)?),
        snippet: row.get(7)?,
        flags: EmailFlags::from_labels(&label_ids),
        label_ids,
        attachment_count: attachment_count.max(0) as u32,
    })
}

fn row_to_attachment(row: &Row) -> Result<Attachment, StoreError> {
    let size: i64 = row.get(3)?;
    let inline_data: Option<Vec<u8>> = row.get(4)?;
    let remote_id: Option<String> = row.get(5)?;
    let content = match (inline_data, remote_id) {
        (Some(data), None) => AttachmentContent::Inline(data),
        (None, Some(attachment_id)) => AttachmentContent::Remote { attachment_id },
        _ => {
            let position: i64 = row.get(0)?;
            return Err(StoreError::Corrupt(format!(
                "attachment {position} has no single content source"
            )));
        }
    };

    Ok(Attachment {
        filename: row.get(1)?,
        mime_type: row.get(2)?,
        size: size.max(0) as u64,
        content,
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountRepository;
    use crate::migrations::run_migrations;
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn setup() -> (EmailRepository, String, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db_name = format!("db_{}.sqlite", uuid::Uuid::new_v4());
        let db = Database::new(&dir.path().join(db_name))
            .await
            .expect("create db");
        run_migrations(&db).await.expect("migrations");
        let account = AccountRepository::new(db.clone())
            .create("user@example.com", "user@example.com", None)
            .await
            .expect("create account");
        (EmailRepository::new(db), account.id, dir)
    }

    fn sample_email(account_id: &str, remote_id: &str, day: u32, labels: &[&str]) -> Email {
        let label_ids: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        Email {
            account_id: account_id.to_string(),
            remote_id: remote_id.to_string(),
            thread_id: format!("thread-{remote_id}"),
            from_address: Some("alice@example.com".into()),
            from_name: Some("Alice".into()),
            to: vec!["bob@example.com".into()],
            cc: vec![],
            subject: Some(format!("Subject {remote_id}")),
            date: Some(Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap()),
            snippet: Some("snippet".into()),
            body_text: Some("plain body".into()),
            body_html: None,
            flags: EmailFlags::from_labels(&label_ids),
            label_ids,
            attachments: vec![
                Attachment {
                    filename: "small.txt".into(),
                    mime_type: "text/plain".into(),
                    size: 3,
                    content: AttachmentContent::Inline(b"abc".to_vec()),
                },
                Attachment {
                    filename: "large.pdf".into(),
                    mime_type: "application/pdf".into(),
                    size: 500_000,
                    content: AttachmentContent::Remote {
                        attachment_id: "att-1".into(),
                    },
                },
            ],
        }
    }

    #[test]
    fn flags_follow_label_set() {
        let labels = |ids: &[&str]| ids.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            EmailFlags::from_labels(&labels(&["INBOX", "UNREAD"])),
            EmailFlags {
                is_read: false,
                is_starred: false,
                is_in_inbox: true
            }
        );
        assert_eq!(
            EmailFlags::from_labels(&labels(&["INBOX", "STARRED"])),
            EmailFlags {
                is_read: true,
                is_starred: true,
                is_in_inbox: true
            }
        );
    }

    #[tokio::test]
    async fn upsert_inserts_then_keeps_content_write_once() {
        let (repo, account_id, _dir) = setup().await;
        let email = sample_email(&account_id, "m1", 1, &["INBOX", "UNREAD"]);

        let outcome = repo.insert_or_update(&email).await.expect("insert");
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let mut changed = email.clone();
        changed.body_text = Some("different body".into());
        changed.label_ids = vec!["INBOX".into()];
        changed.attachments.truncate(1);
        let outcome = repo.insert_or_update(&changed).await.expect("update");
        assert_eq!(outcome, UpsertOutcome::Updated);

        let stored = repo
            .get_by_remote_id(&account_id, "m1")
            .await
            .expect("load")
            .expect("present");
        assert_eq!(stored.body_text.as_deref(), Some("plain body"));
        assert_eq!(stored.label_ids, vec!["INBOX".to_string()]);
        assert!(stored.flags.is_read);
        assert_eq!(stored.attachments, email.attachments);
        assert_eq!(repo.count(&account_id).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn update_fills_previously_missing_body() {
        let (repo, account_id, _dir) = setup().await;
        let mut email = sample_email(&account_id, "m1", 1, &["INBOX"]);
        email.body_html = None;
        repo.insert_or_update(&email).await.expect("insert");

        email.body_html = Some("<p>hi</p>".into());
        repo.insert_or_update(&email).await.expect("update");

        let stored = repo
            .get_by_remote_id(&account_id, "m1")
            .await
            .expect("load")
            .expect("present");
        assert_eq!(stored.body_html.as_deref(), Some("<p>hi</p>"));
    }

    #[tokio::test]
    async fn folder_query_orders_newest_first_and_filters() {
        let (repo, account_id, _dir) = setup().await;
        repo.insert_or_update(&sample_email(&account_id, "old", 1, &["INBOX"]))
            .await
            .expect("insert");
        repo.insert_or_update(&sample_email(&account_id, "new", 3, &["INBOX", "UNREAD"]))
            .await
            .expect("insert");
        repo.insert_or_update(&sample_email(&account_id, "archived", 2, &["Label_7"]))
            .await
            .expect("insert");

        let inbox = repo
            .query_by_account_and_folder(&FolderQuery {
                account_id: Some(account_id.clone()),
                folder: Folder::Inbox,
                unread_only: false,
                limit: 10,
                offset: 0,
            })
            .await
            .expect("query inbox");
        let ids: Vec<_> = inbox.iter().map(|e| e.message_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
        assert_eq!(inbox[0].attachment_count, 2);

        let unread = repo
            .query_by_account_and_folder(&FolderQuery {
                account_id: Some(account_id.clone()),
                folder: Folder::All,
                unread_only: true,
                limit: 10,
                offset: 0,
            })
            .await
            .expect("query unread");
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].message_id, "new");

        let labelled = repo
            .query_by_account_and_folder(&FolderQuery {
                account_id: None,
                folder: Folder::parse("Label_7"),
                unread_only: false,
                limit: 10,
                offset: 0,
            })
            .await
            .expect("query label");
        assert_eq!(labelled.len(), 1);
        assert_eq!(labelled[0].message_id, "archived");

        let paged = repo
            .query_by_account_and_folder(&FolderQuery {
                account_id: Some(account_id.clone()),
                folder: Folder::All,
                unread_only: false,
                limit: 1,
                offset: 1,
            })
            .await
            .expect("query page");
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].message_id, "archived");
    }

    #[tokio::test]
    async fn search_matches_case_insensitive_substrings() {
        let (repo, account_id, _dir) = setup().await;
        let mut email = sample_email(&account_id, "m1", 1, &["INBOX"]);
        email.subject = Some("Quarterly Report".into());
        repo.insert_or_update(&email).await.expect("insert");
        repo.insert_or_update(&sample_email(&account_id, "m2", 2, &["INBOX"]))
            .await
            .expect("insert");

        let hits = repo
            .search(&SearchQuery {
                account_id: Some(account_id.clone()),
                text: "quarterly".into(),
                limit: 10,
            })
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message_id, "m1");

        let literal = repo
            .search(&SearchQuery {
                account_id: None,
                text: "100%".into(),
                limit: 10,
            })
            .await
            .expect("search literal");
        assert!(literal.is_empty(), "wildcards in the needle are escaped");
    }

    #[tokio::test]
    async fn search_folds_non_ascii_case() {
        let (repo, account_id, _dir) = setup().await;
        let mut email = sample_email(&account_id, "m1", 1, &["INBOX"]);
        email.subject = Some("Gedanken über Ökonomie".into());
        repo.insert_or_update(&email).await.expect("insert");

        let hits = repo
            .search(&SearchQuery {
                account_id: Some(account_id.clone()),
                text: "ÜBER ÖKONOMIE".into(),
                limit: 10,
            })
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message_id, "m1");
    }

    #[tokio::test]
    async fn delete_oldest_keeps_newest_messages() {
        let (repo, account_id, _dir) = setup().await;
        for day in 1..=5u32 {
            repo.insert_or_update(&sample_email(&account_id, &format!("m{day}"), day, &[]))
                .await
                .expect("insert");
        }

        let removed = repo.delete_oldest(&account_id, 3).await.expect("evict");
        assert_eq!(removed, 2);
        assert_eq!(repo.count(&account_id).await.expect("count"), 3);
        assert!(
            repo.get_by_remote_id(&account_id, "m1")
                .await
                .expect("load")
                .is_none()
        );
        assert!(
            repo.get_by_remote_id(&account_id, "m5")
                .await
                .expect("load")
                .is_some()
        );

        let removed = repo.delete_oldest(&account_id, 10).await.expect("noop");
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn modify_labels_applies_delta_and_recomputes_flags() {
        let (repo, account_id, _dir) = setup().await;
        repo.insert_or_update(&sample_email(&account_id, "m1", 1, &["INBOX", "UNREAD"]))
            .await
            .expect("insert");

        let labels = repo
            .modify_labels(
                &account_id,
                "m1",
                &["STARRED".to_string()],
                &["UNREAD".to_string()],
            )
            .await
            .expect("modify")
            .expect("cached");
        assert_eq!(labels, vec!["INBOX".to_string(), "STARRED".to_string()]);

        let stored = repo
            .get_by_remote_id(&account_id, "m1")
            .await
            .expect("load")
            .expect("present");
        assert!(stored.flags.is_read && stored.flags.is_starred);

        let missing = repo
            .modify_labels(&account_id, "absent", &[], &["INBOX".to_string()])
            .await
            .expect("modify missing");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn thread_groups_by_thread_id_oldest_first() {
        let (repo, account_id, _dir) = setup().await;
        let mut first = sample_email(&account_id, "a", 2, &[]);
        first.thread_id = "t".into();
        let mut second = sample_email(&account_id, "b", 1, &[]);
        second.thread_id = "t".into();
        repo.insert_or_update(&first).await.expect("insert");
        repo.insert_or_update(&second).await.expect("insert");

        let thread = repo.thread(&account_id, "t").await.expect("thread");
        let ids: Vec<_> = thread.iter().map(|e| e.remote_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(thread[0].attachments.len(), 2);
    }

    #[tokio::test]
    async fn attachments_load_by_position_and_delete_cascades() {
        let (repo, account_id, _dir) = setup().await;
        repo.insert_or_update(&sample_email(&account_id, "m1", 1, &[]))
            .await
            .expect("insert");

        let remote = repo
            .get_attachment(&account_id, "m1", 1)
            .await
            .expect("load")
            .expect("present");
        assert_eq!(
            remote.content,
            AttachmentContent::Remote {
                attachment_id: "att-1".into()
            }
        );
        assert!(
            repo.get_attachment(&account_id, "m1", 9)
                .await
                .expect("load")
                .is_none()
        );

        assert!(
            repo.delete_by_remote_id(&account_id, "m1")
                .await
                .expect("delete")
        );
        assert!(
            repo.get_attachment(&account_id, "m1", 0)
                .await
                .expect("load")
                .is_none()
        );
        assert!(
            !repo
                .delete_by_remote_id(&account_id, "m1")
                .await
                .expect("delete again")
        );
    }

    #[tokio::test]
    async fn clear_account_removes_everything_for_account() {
        let (repo, account_id, _dir) = setup().await;
        repo.insert_or_update(&sample_email(&account_id, "m1", 1, &[]))
            .await
            .expect("insert");
        repo.insert_or_update(&sample_email(&account_id, "m2", 2, &[]))
            .await
            .expect("insert");

        assert_eq!(repo.clear_account(&account_id).await.expect("clear"), 2);
        assert_eq!(repo.count(&account_id).await.expect("count"), 0);
    }
}
