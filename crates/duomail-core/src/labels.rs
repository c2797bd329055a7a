use chrono::{SecondsFormat, Utc};
use libsql::{Row, params};
use serde::Serialize;
use thiserror::Error;

use crate::db::{Database, DbError};
use crate::gmail::types::LabelResponse;

const LABEL_COLUMNS: &str = "account_id, remote_id, name, label_type";

/// A remote label as cached for an account. The core never edits labels themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Label {
    pub account_id: String,
    pub remote_id: String,
    pub name: String,
    pub label_type: Option<String>,
}

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
}

impl LabelError {
    pub fn code(&self) -> &'static str {
        match self {
            LabelError::Database(_) => "label.database",
            LabelError::Sql(_) => "label.sql",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct LabelRepository {
    db: Database,
}

impl LabelRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Replaces the whole catalogue for an account in one transaction.
    pub async fn replace_all(
        &self,
        account_id: &str,
        labels: &[LabelResponse],
    ) -> Result<usize, LabelError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let conn = self.db.connection().await?;
        let tx = conn.transaction().await?;

        tx.execute(
            "DELETE FROM labels WHERE account_id = ?1",
            params![account_id],
        )
        .await?;
        for label in labels {
            tx.execute(
                "INSERT OR REPLACE INTO labels (account_id, remote_id, name, label_type, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    account_id,
                    label.id.as_str(),
                    label.name.as_str(),
                    label.label_type.clone(),
                    now.as_str()
                ],
            )
            .await?;
        }
        tx.commit().await?;

        Ok(labels.len())
    }

    pub async fn list_for_account(&self, account_id: &str) -> Result<Vec<Label>, LabelError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LABEL_COLUMNS} FROM labels WHERE account_id = ?1 ORDER BY name COLLATE NOCASE"
                ),
                params![account_id],
            )
            .await?;

        let mut labels = Vec::new();
        while let Some(row) = rows.next().await? {
            labels.push(row_to_label(row)?);
        }
        Ok(labels)
    }
}

fn row_to_label(row: Row) -> Result<Label, LabelError> {
    Ok(Label {
        account_id: row.get(0)?,
        remote_id: row.get(1)?,
        name: row.get(2)?,
        label_type: row.get(3)?,
    })
}
