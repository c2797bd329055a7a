use std::path::{Path, PathBuf};
use std::sync::Arc;

use libsql::{Builder, Connection, Database as LibSqlDatabase};
use thiserror::Error;
use tracing::debug;

const BUSY_TIMEOUT_MS: i64 = 5_000;

/// Handle to the local mail replica. Cheap to clone; every caller opens its own connection.
#[derive(Clone)]
pub struct Database {
    inner: Arc<LibSqlDatabase>,
    path: Arc<PathBuf>,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to prepare database directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to open database: {0}")]
    Build(libsql::Error),
    #[error("failed to open connection: {0}")]
    Connect(libsql::Error),
    #[error("failed to execute statement: {0}")]
    Statement(libsql::Error),
}

impl DbError {
    pub fn code(&self) -> &'static str {
        match self {
            DbError::Directory { .. } => "db.directory",
            DbError::Build(_) => "db.open",
            DbError::Connect(_) => "db.connect",
            DbError::Statement(_) => "db.statement",
        }
    }

    /// Lock contention surfaces as statement errors; the rest need operator attention.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DbError::Statement(_))
    }
}

impl Database {
    /// Opens (creating if needed) the replica file. The file holds mail content, so it is
    /// made owner-only on unix.
    pub async fn new(database_path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| DbError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let inner = Builder::new_local(database_path)
            .build()
            .await
            .map_err(DbError::Build)?;
        let db = Self {
            inner: Arc::new(inner),
            path: Arc::new(database_path.to_path_buf()),
        };

        let conn = db.connection().await?;
        let mut rows = conn
            .query("PRAGMA journal_mode = WAL", ())
            .await
            .map_err(DbError::Statement)?;
        if let Some(row) = rows.next().await.map_err(DbError::Statement)? {
            let mode: String = row.get(0).map_err(DbError::Statement)?;
            debug!(path = %database_path.display(), journal_mode = %mode, "database opened");
        }
        restrict_permissions(database_path)?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub async fn connection(&self) -> Result<Connection, DbError> {
        let conn = self.inner.connect().map_err(DbError::Connect)?;
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(DbError::Statement)?;
        // Sync passes and protocol calls write through separate connections.
        conn.query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ())
            .await
            .map_err(DbError::Statement)?;
        Ok(conn)
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        let conn = self.connection().await?;
        let mut rows = conn
            .query("SELECT 1", ())
            .await
            .map_err(DbError::Statement)?;
        let _ = rows.next().await.map_err(DbError::Statement)?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), DbError> {
    use std::os::unix::fs::PermissionsExt;

    if !path.exists() {
        return Ok(());
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|source| {
        DbError::Directory {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), DbError> {
    Ok(())
}
