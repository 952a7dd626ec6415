//! The lockfile: an append-mostly index pinning every fetched URL to the
//! SHA-256 digest it resolved to, so later runs can verify rather than
//! merely trust a cached or re-downloaded file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::fs as ofs;

/// One pinned `(url, sha256, timestamp)` triple.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub url: String,
    pub sha256: String,
    pub timestamp: DateTime<Utc>,
}

/// A `(url, sha256)` pair supplied by a caller of [`Lock::add`], typically
/// derived from a [`crate::fetch::FetchResult`].
#[derive(Clone, Debug)]
pub struct UrlAndHash {
    pub url: String,
    pub sha256: String,
}

/// An in-memory lockfile, backed by a YAML file on disk.
#[derive(Clone, Debug)]
pub struct Lock {
    path: PathBuf,
    entries: Vec<LockEntry>,
    tainted: bool,
    /// URLs added during this process invocation; these share a single
    /// timestamp assigned lazily at `save()` time.
    pending: HashSet<String>,
}

impl Lock {
    /// Load the lockfile at `path`. A missing file is treated as an empty
    /// lock (this is the common case for a brand-new catalogue).
    #[instrument]
    pub async fn load(path: impl Into<PathBuf> + std::fmt::Debug) -> Result<Self> {
        let path = path.into();
        if tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            bail!("lockfile path is a directory: {path:?}");
        }

        let entries = match ofs::read_buffered(&path).await.context("read lockfile")? {
            Some(bytes) => {
                serde_yaml::from_slice::<Vec<LockEntry>>(&bytes).context("parse lockfile YAML")?
            }
            None => Vec::new(),
        };

        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.url.clone()) {
                bail!("duplicate url in lockfile: {}", entry.url);
            }
        }

        debug!(path = ?path, entries = entries.len(), "loaded lockfile");
        Ok(Self {
            path,
            entries,
            tainted: false,
            pending: HashSet::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the lock has unsaved mutations.
    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    /// Whether `url` has a pinned digest.
    pub fn contains(&self, url: &str) -> bool {
        self.entries.iter().any(|e| e.url == url)
    }

    /// Look up the pinned digest for `url`.
    pub fn sha256(&self, url: &str) -> Result<&str> {
        self.entries
            .iter()
            .find(|e| e.url == url)
            .map(|e| e.sha256.as_str())
            .ok_or_else(|| {
                color_eyre::eyre::eyre!("Unknown hash for url {url}, please run lock")
            })
    }

    /// Insert any entries not already present. Entries already pinned are
    /// left untouched (the lockfile is append-mostly). Newly inserted URLs
    /// are remembered so that `save()` assigns them all the same
    /// timestamp.
    pub fn add(&mut self, entries: impl IntoIterator<Item = UrlAndHash>) {
        for entry in entries {
            if self.contains(&entry.url) {
                continue;
            }
            self.entries.push(LockEntry {
                url: entry.url.clone(),
                sha256: entry.sha256,
                // Placeholder; replaced with the session timestamp at save.
                timestamp: DateTime::UNIX_EPOCH,
            });
            self.pending.insert(entry.url);
            self.tainted = true;
        }
    }

    /// Remove the given URLs, if present.
    pub fn remove(&mut self, urls: impl IntoIterator<Item = impl AsRef<str>>) {
        for url in urls {
            let url = url.as_ref();
            let before = self.entries.len();
            self.entries.retain(|e| e.url != url);
            if self.entries.len() != before {
                self.tainted = true;
            }
            self.pending.remove(url);
        }
    }

    /// Persist the lockfile, assigning the current time (truncated to
    /// second precision) to every entry added this session. A no-op when
    /// the lock is untainted, making repeated calls idempotent.
    #[instrument(skip(self))]
    pub async fn save(&mut self) -> Result<()> {
        if !self.tainted {
            return Ok(());
        }

        let now = DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap_or_else(Utc::now);
        for entry in &mut self.entries {
            if self.pending.contains(&entry.url) {
                entry.timestamp = now;
            }
        }

        let mut entries = self.entries.clone();
        entries.sort_by(|a, b| (a.timestamp, &a.url).cmp(&(b.timestamp, &b.url)));

        let yaml = serde_yaml::to_string(&entries).context("serialize lockfile")?;
        atomic_write(&self.path, yaml.as_bytes()).await?;

        self.entries = entries;
        self.pending.clear();
        self.tainted = false;
        debug!(path = ?self.path, "saved lockfile");
        Ok(())
    }
}

async fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = path.with_extension("lock.yml.tmp");
    ofs::write(&tmp, content).await.context("write lockfile tmp")?;
    ofs::rename(&tmp, path).await.context("rename lockfile into place")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn loads_missing_file_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.lock.yml");
        let lock = Lock::load(path).await.unwrap();
        assert!(!lock.contains("http://example/a"));
    }

    #[tokio::test]
    async fn add_then_save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.lock.yml");
        let mut lock = Lock::load(&path).await.unwrap();
        lock.add([UrlAndHash {
            url: "http://example/a".into(),
            sha256: "a".repeat(64),
        }]);
        lock.save().await.unwrap();

        let reloaded = Lock::load(&path).await.unwrap();
        assert!(reloaded.contains("http://example/a"));
        assert_eq!(reloaded.sha256("http://example/a").unwrap(), "a".repeat(64));
    }

    #[tokio::test]
    async fn save_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.lock.yml");
        let mut lock = Lock::load(&path).await.unwrap();
        lock.add([UrlAndHash {
            url: "http://example/a".into(),
            sha256: "a".repeat(64),
        }]);
        lock.save().await.unwrap();
        let first = tokio::fs::read(&path).await.unwrap();

        // A second save with no intervening mutation must be a no-op.
        lock.save().await.unwrap();
        let second = tokio::fs::read(&path).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn sha256_of_unknown_url_fails() {
        let dir = tempdir().unwrap();
        let lock = Lock::load(dir.path().join("x.lock.yml")).await.unwrap();
        assert!(lock.sha256("http://example/missing").is_err());
    }

    #[tokio::test]
    async fn directory_at_lockfile_path_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.lock.yml");
        tokio::fs::create_dir(&path).await.unwrap();
        assert!(Lock::load(&path).await.is_err());
    }
}
