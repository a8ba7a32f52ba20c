//! Local file sources and sinks
//!
//! A `FileSource` is what the sender slices chunks from; a `FileSink` is
//! where a completed download is materialized.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::debug;

/// File metadata as announced in `file/new`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: u64,
    #[serde(rename = "lastModifiedDate")]
    pub last_modified_date: String,
}

/// Random-access byte source behind a shared file
#[async_trait]
pub trait FileSource: Send + Sync {
    /// Read `[start, end)`. `end` never exceeds the announced size.
    async fn read_range(&self, start: u64, end: u64) -> Result<Bytes>;
}

/// Destination for completed downloads
#[async_trait]
pub trait FileSink: Send + Sync {
    /// Materialize `data` under `name`, returning where it ended up
    async fn deliver(&self, name: &str, data: Bytes) -> Result<PathBuf>;
}

/// A file the local client offers to its peers
#[derive(Clone)]
pub struct SharedFile {
    pub meta: FileMetadata,
    pub source: Arc<dyn FileSource>,
}

impl SharedFile {
    pub fn new(meta: FileMetadata, source: Arc<dyn FileSource>) -> Self {
        Self { meta, source }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn size(&self) -> u64 {
        self.meta.size
    }
}

impl std::fmt::Debug for SharedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFile").field("meta", &self.meta).finish()
    }
}

/// File on the local filesystem
pub struct LocalFile {
    path: PathBuf,
}

impl LocalFile {
    /// Stat `path` and wrap it as a shareable file
    pub async fn open(path: impl AsRef<Path>) -> Result<SharedFile> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        if !metadata.is_file() {
            anyhow::bail!("{} is not a regular file", path.display());
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| anyhow::anyhow!("{} has no file name", path.display()))?;

        let last_modified_date = metadata
            .modified()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339())
            .unwrap_or_default();

        let meta = FileMetadata {
            mime_type: get_mime_type(&name).to_string(),
            name,
            size: metadata.len(),
            last_modified_date,
        };

        Ok(SharedFile::new(meta, Arc::new(LocalFile { path })))
    }
}

#[async_trait]
impl FileSource for LocalFile {
    async fn read_range(&self, start: u64, end: u64) -> Result<Bytes> {
        let mut file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.seek(SeekFrom::Start(start)).await?;

        let mut buf = vec![0u8; end.saturating_sub(start) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// In-memory file contents
pub struct MemoryFile {
    data: Bytes,
}

impl MemoryFile {
    pub fn shared(name: &str, data: impl Into<Bytes>) -> SharedFile {
        let data = data.into();
        let meta = FileMetadata {
            name: name.to_string(),
            mime_type: get_mime_type(name).to_string(),
            size: data.len() as u64,
            last_modified_date: chrono::Utc::now().to_rfc3339(),
        };
        SharedFile::new(meta, Arc::new(MemoryFile { data }))
    }
}

#[async_trait]
impl FileSource for MemoryFile {
    async fn read_range(&self, start: u64, end: u64) -> Result<Bytes> {
        let len = self.data.len() as u64;
        if start > end || end > len {
            anyhow::bail!("Range {}..{} out of bounds for {} bytes", start, end, len);
        }
        Ok(self.data.slice(start as usize..end as usize))
    }
}

/// Writes completed downloads into a directory
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Pick a path inside the directory that does not exist yet
    async fn free_path(&self, name: &str) -> PathBuf {
        let name = sanitize_file_name(name);
        let candidate = self.dir.join(&name);
        if tokio::fs::metadata(&candidate).await.is_err() {
            return candidate;
        }

        let (stem, ext) = match name.rfind('.') {
            Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
            _ => (name.as_str(), ""),
        };
        let mut n = 1;
        loop {
            let candidate = self.dir.join(format!("{} ({}){}", stem, n, ext));
            if tokio::fs::metadata(&candidate).await.is_err() {
                return candidate;
            }
            n += 1;
        }
    }
}

#[async_trait]
impl FileSink for DirectorySink {
    async fn deliver(&self, name: &str, data: Bytes) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let path = self.free_path(name).await;
        tokio::fs::write(&path, &data)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        debug!("Wrote {} bytes to {}", data.len(), path.display());
        Ok(path)
    }
}

/// Keep only the final path component of an announced name
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();
    match base {
        "" | "." | ".." => "download".to_string(),
        other => other.to_string(),
    }
}

/// Get MIME type from filename extension
pub fn get_mime_type(filename: &str) -> &'static str {
    let ext = match filename.rsplit_once('.') {
        Some((_, ext)) => ext.to_lowercase(),
        None => return "application/octet-stream",
    };
    match ext.as_str() {
        // Images
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        // Text
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "json" => "application/json",
        "md" => "text/markdown",
        "csv" => "text/csv",
        // Documents
        "pdf" => "application/pdf",
        // Video
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        // Audio
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        // Archives
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "gz" => "application/gzip",
        _ => "application/octet-stream",
    }
}
