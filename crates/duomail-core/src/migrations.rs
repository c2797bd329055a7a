use std::collections::HashMap;

use libsql::{Connection, params};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::db::{Database, DbError};

struct Migration {
    version: &'static str,
    sql: &'static str,
}

impl Migration {
    fn checksum(&self) -> String {
        let digest = Sha256::digest(self.sql.as_bytes());
        digest.iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: "001_initial",
        sql: include_str!("../../../migrations/001_initial.sql"),
    },
    Migration {
        version: "002_search_text",
        sql: include_str!("../../../migrations/002_search_text.sql"),
    },
];

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("migration failed: {0}")]
    LibSql(#[from] libsql::Error),
    #[error("migration {version} was edited after it was applied")]
    ChecksumMismatch { version: String },
    #[error("database has migration {version} from a newer release")]
    NewerSchema { version: String },
}

impl MigrationError {
    pub fn code(&self) -> &'static str {
        match self {
            MigrationError::Database(_) => "migration.database",
            MigrationError::LibSql(_) => "migration.statement",
            MigrationError::ChecksumMismatch { .. } => "migration.checksum_mismatch",
            MigrationError::NewerSchema { .. } => "migration.newer_schema",
        }
    }
}

async fn applied_versions(conn: &Connection) -> Result<HashMap<String, Option<String>>, MigrationError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            checksum TEXT,
            applied_at TEXT NOT NULL
        )",
        (),
    )
    .await?;

    let mut applied = HashMap::new();
    let mut rows = conn
        .query("SELECT version, checksum FROM schema_migrations", ())
        .await?;
    while let Some(row) = rows.next().await? {
        let version: String = row.get(0)?;
        let checksum: Option<String> = row.get(1)?;
        applied.insert(version, checksum);
    }
    Ok(applied)
}

/// Applies pending migrations in order, each in its own transaction. Refuses to touch a
/// replica whose history disagrees with this build.
async fn apply_migrations(conn: &Connection, migrations: &[Migration]) -> Result<(), MigrationError> {
    let applied = applied_versions(conn).await?;

    if let Some(version) = applied
        .keys()
        .find(|version| !migrations.iter().any(|m| m.version == version.as_str()))
    {
        return Err(MigrationError::NewerSchema {
            version: version.clone(),
        });
    }

    for migration in migrations {
        let checksum = migration.checksum();
        match applied.get(migration.version) {
            Some(Some(recorded)) if *recorded != checksum => {
                return Err(MigrationError::ChecksumMismatch {
                    version: migration.version.to_string(),
                });
            }
            Some(_) => continue,
            None => {}
        }

        let tx = conn.transaction().await?;
        tx.execute_batch(migration.sql).await?;
        tx.execute(
            "INSERT INTO schema_migrations (version, checksum, applied_at)
             VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))",
            params![migration.version, checksum],
        )
        .await?;
        tx.commit().await?;
        info!(version = migration.version, "applied migration");
    }

    Ok(())
}

pub async fn run_migrations(db: &Database) -> Result<(), MigrationError> {
    let conn = db.connection().await?;
    apply_migrations(&conn, MIGRATIONS).await
}
