use std::fmt::Write;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use super::PersistentStore;
use crate::caching::KeyPattern;

/// The directory holding partially written records, relative to the store root.
const TMP_DIR: &str = ".tmp";

/// A [`PersistentStore`] keeping one file per key in a directory.
///
/// Files are named after the sha-256 hash of their key and written atomically. Each file starts
/// with a header of two lines, the JSON-encoded key and the expiration time in milliseconds since
/// the unix epoch, followed by the raw value.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    path: PathBuf,
}

/// A parsed record file.
struct Record<'a> {
    key: String,
    expires_at: SystemTime,
    value: &'a [u8],
}

impl<'a> Record<'a> {
    fn parse(contents: &'a [u8]) -> Option<Self> {
        let mut parts = contents.splitn(3, |b| *b == b'\n');
        let key = serde_json::from_slice(parts.next()?).ok()?;
        let expires_at = std::str::from_utf8(parts.next()?).ok()?.parse().ok()?;
        let value = parts.next()?;
        Some(Self {
            key,
            expires_at: UNIX_EPOCH + Duration::from_millis(expires_at),
            value,
        })
    }

    fn is_expired(&self) -> bool {
        self.expires_at <= SystemTime::now()
    }
}

impl FilesystemStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The location of the record file for `key`.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `aa/bbccdd/eeff...`
    fn record_path(&self, key: &str) -> PathBuf {
        let hash = Sha256::digest(key.as_bytes());
        let mut path = format!("{:02x}/", hash[0]);
        for b in &hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        self.path.join(path)
    }

    /// Reads a file, treating a missing file as `None`.
    async fn read(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context("failed to read persisted record"),
        }
    }

    async fn remove(path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).context("failed to remove persisted record"),
        }
    }

    /// Lists all record files, skipping partially written ones.
    async fn record_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut dirs = vec![self.path.clone()];
        while let Some(dir) = dirs.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err).context("failed to list persisted records"),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .context("failed to list persisted records")?
            {
                let path = entry.path();
                if entry.file_name() == TMP_DIR {
                    continue;
                }
                if entry.file_type().await?.is_dir() {
                    dirs.push(path);
                } else {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl PersistentStore for FilesystemStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.record_path(key);
        let Some(contents) = Self::read(&path).await? else {
            return Ok(None);
        };
        let Some(record) = Record::parse(&contents) else {
            tracing::warn!(path = %path.display(), "Malformed persisted record");
            Self::remove(&path).await?;
            return Ok(None);
        };
        if record.key != key {
            tracing::warn!(key, other = %record.key, "Persisted record hash collision");
            return Ok(None);
        }
        if record.is_expired() {
            Self::remove(&path).await?;
            return Ok(None);
        }
        Ok(Some(record.value.to_vec()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let path = self.record_path(key);
        let parent_dir = path
            .parent()
            .context("persisted record has no parent directory")?;
        fs::create_dir_all(parent_dir)
            .await
            .context("failed to create parent directories")?;

        let temp_dir = self.path.join(TMP_DIR);
        fs::create_dir_all(&temp_dir)
            .await
            .context("failed to create tempdir")?;
        let temp_file = NamedTempFile::new_in(&temp_dir).context("failed to create tempfile")?;
        let dup_file = temp_file.reopen().context("failed to dup filedescriptor")?;
        let mut dest = File::from_std(dup_file);

        let expires_at = (SystemTime::now() + ttl)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let mut header = serde_json::to_vec(key).context("failed to encode key")?;
        header.push(b'\n');
        header.extend_from_slice(expires_at.to_string().as_bytes());
        header.push(b'\n');

        dest.write_all(&header)
            .await
            .context("failed to write record header")?;
        dest.write_all(&value)
            .await
            .context("failed to write record")?;
        dest.flush().await.context("failed to flush record")?;

        temp_file
            .persist(&path)
            .context("failed to save persisted record")?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        Self::remove(&self.record_path(key)).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        for path in self.record_files().await? {
            Self::remove(&path).await?;
        }
        Ok(())
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<usize> {
        let mut deleted = 0;
        for path in self.record_files().await? {
            let Some(contents) = Self::read(&path).await? else {
                continue;
            };
            let matches = Record::parse(&contents).is_some_and(|record| pattern.matches(&record.key));
            if matches && Self::remove(&path).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
