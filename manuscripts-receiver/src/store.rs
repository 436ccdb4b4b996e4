//! Persistence for received submissions.
//!
//! Bytes land in a hidden `.part` file inside the destination directory.
//! `commit` is the only operation that makes a file visible. It hard-links
//! the temp file to the first free final name and then unlinks the temp.
//! Linking fails on an existing name, so nothing is ever overwritten, even
//! by another process sharing the directory. The naming lock keeps commits
//! in this process from racing each other over the same candidates.

use std::{
    io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, warn};

const TEMP_PREFIX: &str = ".";
const TEMP_SUFFIX: &str = ".part";
const MAX_NAME_ATTEMPTS: u32 = 9_999;
const MAX_STEM_CHARS: usize = 120;
const FALLBACK_STEM: &str = "submission";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("destination {path} is not usable: {source}")]
    Destination { path: PathBuf, source: io::Error },
    #[error("failed to create temp file: {0}")]
    CreateTemp(io::Error),
    #[error("write failed: {0}")]
    Write(io::Error),
    #[error("flush failed: {0}")]
    Sync(io::Error),
    #[error("linking into place failed: {0}")]
    Link(io::Error),
    #[error("write of {attempted} bytes would pass the expected {expected} bytes")]
    Overflow { attempted: u64, expected: u64 },
    #[error("no free file name for {0:?} after {MAX_NAME_ATTEMPTS} attempts")]
    CollisionsExhausted(String),
    #[error("write handle was already finished")]
    Finished,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NamingScheme {
    /// `essay.pdf`
    #[default]
    OriginalName,
    /// `Lovelace-essay.pdf`
    SenderPrefixed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredFile {
    pub final_path: PathBuf,
    pub original_file_name: String,
    pub sender_name: String,
    pub size_bytes: u64,
    pub received_at_unix_ms: u64,
}

/// An in-progress write. Dropping it without `commit` removes the temp file.
#[derive(Debug)]
pub struct PendingWrite {
    temp_path: PathBuf,
    file: Option<fs::File>,
    original_file_name: String,
    sender_name: String,
    expected_size: u64,
    bytes_written: u64,
    finished: bool,
}

impl PendingWrite {
    /// Bytes still accepted before the expected size is reached.
    pub fn remaining(&self) -> u64 {
        self.expected_size.saturating_sub(self.bytes_written)
    }

    /// Refuses to write past the expected size.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        if chunk.len() as u64 > self.remaining() {
            return Err(StoreError::Overflow {
                attempted: self.bytes_written + chunk.len() as u64,
                expected: self.expected_size,
            });
        }
        let file = self.file.as_mut().ok_or(StoreError::Finished)?;
        file.write_all(chunk).await.map_err(StoreError::Write)?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    /// Removes the temp file. Safe to call any number of times.
    pub async fn abort(&mut self) {
        self.file.take();
        if self.finished {
            return;
        }
        self.finished = true;
        match fs::remove_file(&self.temp_path).await {
            Ok(()) => debug!(path = %self.temp_path.display(), "temp file removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.temp_path.display(), "failed to remove temp file: {err}"),
        }
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if !self.finished {
            self.file.take();
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

#[derive(Debug)]
pub struct Store {
    dir: PathBuf,
    naming: NamingScheme,
    naming_lock: Mutex<()>,
}

impl Store {
    pub fn open(dir: impl Into<PathBuf>, naming: NamingScheme) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Destination {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            naming,
            naming_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn begin_write(
        &self,
        file_name: &str,
        sender_name: &str,
        expected_size: u64,
    ) -> Result<PendingWrite, StoreError> {
        let mut token = [0_u8; 8];
        rand::rng().fill_bytes(&mut token);
        let temp_path = self
            .dir
            .join(format!("{TEMP_PREFIX}{}{TEMP_SUFFIX}", hex::encode(token)));

        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
            .map_err(StoreError::CreateTemp)?;

        Ok(PendingWrite {
            temp_path,
            file: Some(file),
            original_file_name: file_name.to_owned(),
            sender_name: sender_name.to_owned(),
            expected_size,
            bytes_written: 0,
            finished: false,
        })
    }

    /// Durably flushes the temp file, then links it under a free final name.
    pub async fn commit(&self, mut pending: PendingWrite) -> Result<StoredFile, StoreError> {
        let mut file = pending.file.take().ok_or(StoreError::Finished)?;
        file.flush().await.map_err(StoreError::Sync)?;
        file.sync_all().await.map_err(StoreError::Sync)?;
        drop(file);

        let base_name = derive_file_name(
            &pending.original_file_name,
            &pending.sender_name,
            self.naming,
        );

        let final_path = {
            let _naming = self.naming_lock.lock().await;
            self.claim_free_name(&pending.temp_path, &base_name).await?
        };
        pending.finished = true;
        if let Err(err) = fs::remove_file(&pending.temp_path).await {
            warn!(path = %pending.temp_path.display(), "temp file left behind after commit: {err}");
        }
        self.sync_dir().await;

        Ok(StoredFile {
            final_path,
            original_file_name: pending.original_file_name.clone(),
            sender_name: pending.sender_name.clone(),
            size_bytes: pending.bytes_written,
            received_at_unix_ms: now_unix_ms(),
        })
    }

    pub async fn abort(&self, pending: &mut PendingWrite) {
        pending.abort().await;
    }

    /// Deletes `.part` files left behind by a previous process.
    pub fn sweep_temp_files(&self) -> usize {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %self.dir.display(), "cannot scan for temp files: {err}");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if is_temp_name(&name) && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Links `temp_path` under the first candidate name nobody holds yet.
    async fn claim_free_name(&self, temp_path: &Path, base_name: &str) -> Result<PathBuf, StoreError> {
        let (stem, ext) = split_extension(base_name);
        for attempt in 0..=MAX_NAME_ATTEMPTS {
            let candidate = if attempt == 0 {
                base_name.to_owned()
            } else {
                format!("{stem} ({attempt}){ext}")
            };
            let path = self.dir.join(&candidate);
            match fs::hard_link(temp_path, &path).await {
                Ok(()) => return Ok(path),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(StoreError::Link(err)),
            }
        }
        Err(StoreError::CollisionsExhausted(base_name.to_owned()))
    }

    #[cfg(unix)]
    async fn sync_dir(&self) {
        let synced = match fs::File::open(&self.dir).await {
            Ok(dir) => dir.sync_all().await,
            Err(err) => Err(err),
        };
        if let Err(err) = synced {
            debug!(dir = %self.dir.display(), "directory sync failed: {err}");
        }
    }

    #[cfg(not(unix))]
    async fn sync_dir(&self) {}
}

pub fn is_temp_name(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)
}

pub fn derive_file_name(original: &str, sender_name: &str, naming: NamingScheme) -> String {
    let base = sanitize_file_name(original);
    match naming {
        NamingScheme::OriginalName => base,
        NamingScheme::SenderPrefixed => {
            let last_name = sender_name.split_whitespace().last().unwrap_or_default();
            let last_name: String = last_name
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '-')
                .take(30)
                .collect();
            if last_name.is_empty() {
                base
            } else {
                format!("{last_name}-{base}")
            }
        }
    }
}

/// Strips directories and anything that is not a plain file-name character.
pub fn sanitize_file_name(original: &str) -> String {
    let leaf = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    let cleaned: String = leaf
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | '(' | ')'))
        .collect();
    let cleaned = cleaned.trim();

    let (stem, ext) = match cleaned.rfind('.') {
        Some(idx) => cleaned.split_at(idx),
        None => (cleaned, ""),
    };
    let stem: String = stem
        .trim()
        .trim_start_matches('.')
        .chars()
        .take(MAX_STEM_CHARS)
        .collect();
    let stem = stem.trim_end();
    let ext: String = ext.chars().take(16).collect();

    if stem.is_empty() {
        format!("{FALLBACK_STEM}{ext}")
    } else {
        format!("{stem}{ext}")
    }
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use super::*;

    fn list_dir(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn sanitizes_paths_and_odd_characters() {
        assert_eq!(sanitize_file_name("essay.pdf"), "essay.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\sam\\draft 2.docx"), "draft 2.docx");
        assert_eq!(sanitize_file_name(".hidden"), "submission.hidden");
        assert_eq!(sanitize_file_name("..notes.md"), "notes.md");
        assert_eq!(sanitize_file_name("???.pdf"), "submission.pdf");
        assert_eq!(sanitize_file_name(""), "submission");
    }

    #[test]
    fn sender_prefix_uses_last_name() {
        assert_eq!(
            derive_file_name("essay.pdf", "Ada King Lovelace", NamingScheme::SenderPrefixed),
            "Lovelace-essay.pdf"
        );
        assert_eq!(
            derive_file_name("essay.pdf", "  ", NamingScheme::SenderPrefixed),
            "essay.pdf"
        );
    }

    #[tokio::test]
    async fn commit_makes_file_visible_with_exact_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), NamingScheme::OriginalName).unwrap();

        let mut pending = store.begin_write("essay.pdf", "Sam", 5).await.unwrap();
        pending.write_chunk(b"hello").await.unwrap();
        assert_eq!(list_dir(dir.path()).len(), 1);
        assert!(is_temp_name(&list_dir(dir.path())[0]));

        let stored = store.commit(pending).await.unwrap();
        assert_eq!(stored.final_path, dir.path().join("essay.pdf"));
        assert_eq!(stored.size_bytes, 5);
        assert_eq!(std::fs::read(&stored.final_path).unwrap(), b"hello");
        assert_eq!(list_dir(dir.path()), vec!["essay.pdf".to_owned()]);
    }

    #[tokio::test]
    async fn same_name_gets_numbered_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("essay.pdf"), b"first").unwrap();
        let store = Store::open(dir.path(), NamingScheme::OriginalName).unwrap();

        let mut pending = store.begin_write("essay.pdf", "Sam", 6).await.unwrap();
        pending.write_chunk(b"second").await.unwrap();
        let stored = store.commit(pending).await.unwrap();

        assert_eq!(stored.final_path, dir.path().join("essay (1).pdf"));
        assert_eq!(std::fs::read(dir.path().join("essay.pdf")).unwrap(), b"first");
    }

    #[tokio::test]
    async fn writes_past_expected_size_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), NamingScheme::OriginalName).unwrap();

        let mut pending = store.begin_write("essay.pdf", "Sam", 4).await.unwrap();
        pending.write_chunk(b"abc").await.unwrap();
        assert_eq!(pending.remaining(), 1);
        assert!(matches!(
            pending.write_chunk(b"de").await,
            Err(StoreError::Overflow {
                attempted: 5,
                expected: 4
            })
        ));
        pending.write_chunk(b"d").await.unwrap();

        let stored = store.commit(pending).await.unwrap();
        assert_eq!(std::fs::read(&stored.final_path).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn abort_is_idempotent_and_removes_temp() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), NamingScheme::OriginalName).unwrap();

        let mut pending = store.begin_write("essay.pdf", "Sam", 3).await.unwrap();
        pending.write_chunk(b"abc").await.unwrap();
        store.abort(&mut pending).await;
        store.abort(&mut pending).await;

        assert!(list_dir(dir.path()).is_empty());
        assert!(matches!(
            pending.write_chunk(b"x").await,
            Err(StoreError::Finished)
        ));
    }

    #[tokio::test]
    async fn dropping_uncommitted_write_removes_temp() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), NamingScheme::OriginalName).unwrap();
        let pending = store.begin_write("essay.pdf", "Sam", 3).await.unwrap();
        drop(pending);
        assert!(list_dir(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn concurrent_commits_never_share_a_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path(), NamingScheme::OriginalName).unwrap());

        let mut tasks = Vec::new();
        for index in 0..50_u32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let body = format!("submission {index}");
                let mut pending = store
                    .begin_write("essay.pdf", "Sam", body.len() as u64)
                    .await
                    .unwrap();
                pending.write_chunk(body.as_bytes()).await.unwrap();
                store.commit(pending).await.unwrap()
            }));
        }

        let mut paths = HashSet::new();
        let mut bodies = HashSet::new();
        for task in tasks {
            let stored = task.await.unwrap();
            bodies.insert(std::fs::read_to_string(&stored.final_path).unwrap());
            assert!(paths.insert(stored.final_path));
        }
        assert_eq!(paths.len(), 50);
        assert_eq!(bodies.len(), 50);
        assert_eq!(list_dir(dir.path()).len(), 50);
    }

    #[tokio::test]
    async fn stores_sharing_a_directory_never_overwrite_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let first = Arc::new(Store::open(dir.path(), NamingScheme::OriginalName).unwrap());
        let second = Arc::new(Store::open(dir.path(), NamingScheme::OriginalName).unwrap());

        let mut tasks = Vec::new();
        for index in 0..40_u32 {
            let store = if index % 2 == 0 { first.clone() } else { second.clone() };
            tasks.push(tokio::spawn(async move {
                let body = format!("copy {index}");
                let mut pending = store
                    .begin_write("essay.pdf", "Sam", body.len() as u64)
                    .await
                    .unwrap();
                pending.write_chunk(body.as_bytes()).await.unwrap();
                store.commit(pending).await.unwrap()
            }));
        }

        let mut bodies = HashSet::new();
        for task in tasks {
            let stored = task.await.unwrap();
            bodies.insert(std::fs::read_to_string(&stored.final_path).unwrap());
        }
        assert_eq!(bodies.len(), 40);
        let names = list_dir(dir.path());
        assert_eq!(names.len(), 40);
        assert!(names.iter().all(|name| !is_temp_name(name)));
    }

    #[test]
    fn sweep_removes_only_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".0011223344556677.part"), b"x").unwrap();
        std::fs::write(dir.path().join("essay.pdf"), b"x").unwrap();
        let store = Store::open(dir.path(), NamingScheme::OriginalName).unwrap();

        assert_eq!(store.sweep_temp_files(), 1);
        assert_eq!(list_dir(dir.path()), vec!["essay.pdf".to_owned()]);
    }
}
