use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

const MAX_FILENAME_CHARS: usize = 100;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("failed to write attachment spool: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle to attachment content written out-of-band for the client to read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpooledAttachment {
    pub path: String,
    pub size: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone)]
pub struct AttachmentSpool {
    dir: PathBuf,
}

impl AttachmentSpool {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn write(
        &self,
        filename: &str,
        mime_type: &str,
        content: &[u8],
    ) -> Result<SpooledAttachment, SpoolError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self
            .dir
            .join(format!("{}-{}", Uuid::new_v4(), sanitize_filename(filename)));
        tokio::fs::write(&path, content).await?;

        Ok(SpooledAttachment {
            path: path.to_string_lossy().into_owned(),
            size: content.len() as u64,
            mime_type: mime_type.to_string(),
        })
    }
}

/// Keeps the name recognizable while making it safe as a single path component.
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .take(MAX_FILENAME_CHARS)
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');

    if trimmed.is_empty() {
        "attachment".to_string()
    } else {
        trimmed.to_string()
    }
}
