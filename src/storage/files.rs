//! Downloaded file storage under `<dataset>/files`

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::utils::{sanitize_filename, truncate_text};

/// Writes article files as `files/<identifier>/<hash-prefix>.<ext>`
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create files directory: {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a file with this hash would be written to
    pub fn path_for(&self, identifier: &str, content_hash: &str, mime_type: &str, url: &str) -> PathBuf {
        let dir = truncate_text(&sanitize_filename(identifier), 120);
        let stem = content_hash.get(..16).unwrap_or(content_hash);
        self.root
            .join(dir)
            .join(format!("{stem}.{}", extension_for(mime_type, url)))
    }

    /// Write a file body; an existing file with the same hash is kept
    pub async fn save(
        &self,
        identifier: &str,
        content_hash: &str,
        mime_type: &str,
        url: &str,
        body: &[u8],
    ) -> Result<PathBuf> {
        let path = self.path_for(identifier, content_hash, mime_type, url);

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        // Write to a temporary name first so a crash never leaves a truncated file
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("Failed to write file: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move file into place: {}", path.display()))?;

        tracing::debug!(path = %path.display(), bytes = body.len(), "Stored file");
        Ok(path)
    }
}

/// File extension for a MIME type, falling back to the URL path
fn extension_for(mime_type: &str, url: &str) -> String {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let known = match essence.as_str() {
        "application/pdf" => Some("pdf"),
        "text/html" | "application/xhtml+xml" => Some("html"),
        "application/xml" | "text/xml" | "application/jats+xml" => Some("xml"),
        "text/plain" => Some("txt"),
        "text/csv" => Some("csv"),
        "application/zip" | "application/x-zip-compressed" => Some("zip"),
        "application/msword" => Some("doc"),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => Some("docx"),
        "application/vnd.ms-excel" => Some("xls"),
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => Some("xlsx"),
        _ => None,
    };
    if let Some(ext) = known {
        return ext.to_string();
    }

    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            let last = u.path_segments()?.last()?.to_string();
            let (_, ext) = last.rsplit_once('.')?;
            (!ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
                .then(|| ext.to_ascii_lowercase())
        })
        .unwrap_or_else(|| "bin".to_string())
}
