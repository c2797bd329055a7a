use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};

const ACCOUNT_COLUMNS: &str = "id, remote_user_id, email, display_name, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: String,
    pub remote_user_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-account sync bookkeeping. Written only by the sync coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncState {
    pub cursor: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("account not found: {0}")]
    NotFound(String),
}

impl AccountError {
    pub fn code(&self) -> &'static str {
        match self {
            AccountError::Database(_) => "account.database",
            AccountError::Sql(_) => "account.sql",
            AccountError::DateTimeParse(_) => "account.datetime",
            AccountError::NotFound(_) => "account.not_found",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, AccountError::Database(_) | AccountError::Sql(_))
    }
}

#[derive(Clone)]
pub struct AccountRepository {
    db: Database,
}

impl AccountRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Registers an account together with its empty sync state.
    pub async fn create(
        &self,
        remote_user_id: impl Into<String>,
        email: impl Into<String>,
        display_name: Option<String>,
    ) -> Result<Account, AccountError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let remote_user_id: String = remote_user_id.into();
        let email: String = email.into();

        let conn = self.db.connection().await?;
        let tx = conn.transaction().await?;
        let mut rows = tx
            .query(
                &format!(
                    "INSERT INTO accounts (id, remote_user_id, email, display_name, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                     RETURNING {ACCOUNT_COLUMNS}"
                ),
                params![id.as_str(), remote_user_id, email, display_name, now.as_str()],
            )
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| AccountError::NotFound("insert failed".into()))?;
        let account = row_to_account(row)?;
        drop(rows);

        tx.execute(
            "INSERT INTO sync_state (account_id, cursor, last_success_at, last_error, updated_at)
             VALUES (?1, NULL, NULL, NULL, ?2)",
            params![id.as_str(), now.as_str()],
        )
        .await?;
        tx.commit().await?;

        Ok(account)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Account, AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_account(row),
            None => Err(AccountError::NotFound(id.to_string())),
        }
    }

    pub async fn get_by_email(&self, email: &str) -> Result<Account, AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE email = ?1 COLLATE NOCASE"),
                params![email],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_account(row),
            None => Err(AccountError::NotFound(email.to_string())),
        }
    }

    pub async fn list_all(&self) -> Result<Vec<Account>, AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY created_at"),
                (),
            )
            .await?;

        let mut accounts = Vec::new();
        while let Some(row) = rows.next().await? {
            accounts.push(row_to_account(row)?);
        }
        Ok(accounts)
    }

    /// Removes the account; emails, attachments, labels and sync state cascade.
    pub async fn delete(&self, id: &str) -> Result<(), AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "DELETE FROM accounts WHERE id = ?1 RETURNING id",
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(AccountError::NotFound(id.to_string())),
        }
    }

    pub async fn sync_state(&self, account_id: &str) -> Result<SyncState, AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT cursor, last_success_at, last_error FROM sync_state WHERE account_id = ?1",
                params![account_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let last_success_at: Option<String> = row.get(1)?;
                Ok(SyncState {
                    cursor: row.get(0)?,
                    last_success_at: match last_success_at {
                        Some(value) => {
                            Some(DateTime::parse_from_rfc3339(&value)?.with_timezone(&Utc))
                        }
                        None => None,
                    },
                    last_error: row.get(2)?,
                })
            }
            None => Err(AccountError::NotFound(account_id.to_string())),
        }
    }

    /// Records a completed pass: new cursor, success time, error cleared.
    pub async fn record_sync_success(
        &self,
        account_id: &str,
        cursor: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AccountError> {
        self.write_sync_state(
            account_id,
            "UPDATE sync_state SET cursor = ?1, last_success_at = ?2, last_error = NULL, updated_at = ?3
             WHERE account_id = ?4",
            params![cursor, to_rfc3339(at), now_rfc3339(), account_id],
        )
        .await
    }

    /// Moves the cursor forward without touching the success timestamp or error.
    pub async fn record_sync_checkpoint(
        &self,
        account_id: &str,
        cursor: &str,
    ) -> Result<(), AccountError> {
        self.write_sync_state(
            account_id,
            "UPDATE sync_state SET cursor = ?1, updated_at = ?2 WHERE account_id = ?3",
            params![cursor, now_rfc3339(), account_id],
        )
        .await
    }

    pub async fn record_sync_error(
        &self,
        account_id: &str,
        message: &str,
    ) -> Result<(), AccountError> {
        self.write_sync_state(
            account_id,
            "UPDATE sync_state SET last_error = ?1, updated_at = ?2 WHERE account_id = ?3",
            params![message, now_rfc3339(), account_id],
        )
        .await
    }

    async fn write_sync_state(
        &self,
        account_id: &str,
        sql: &str,
        values: impl libsql::params::IntoParams,
    ) -> Result<(), AccountError> {
        let conn = self.db.connection().await?;
        let changed = conn.execute(sql, values).await?;
        if changed == 0 {
            return Err(AccountError::NotFound(account_id.to_string()));
        }
        Ok(())
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn row_to_account(row: Row) -> Result<Account, AccountError> {
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;

    Ok(Account {
        id: row.get(0)?,
        remote_user_id: row.get(1)?,
        email: row.get(2)?,
        display_name: row.get(3)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}
