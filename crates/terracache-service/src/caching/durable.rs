use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::task::JoinHandle;

use super::CacheEntry;
use crate::types::CacheKey;

/// File names longer than this are replaced by a digest of the key.
const MAX_ENCODED_LEN: usize = 200;

const EXTENSION: &str = ".json";
const HASHED_PREFIX: &str = "sha256-";

/// Returns the file name under which the entry for `key` is persisted.
///
/// This is the lowercase hex encoding of the key, which is reversible and safe on every file
/// system. Keys which would exceed a reasonable file name length use a sha-256 digest instead, in
/// which case the key can only be recovered from the file contents.
pub fn file_name(key: &CacheKey) -> String {
    let encoded = hex::encode(key.as_str());
    if encoded.len() > MAX_ENCODED_LEN {
        let digest = Sha256::digest(key.as_str().as_bytes());
        format!("{HASHED_PREFIX}{}{EXTENSION}", hex::encode(digest))
    } else {
        format!("{encoded}{EXTENSION}")
    }
}

/// Recovers the key from a file name created by [`file_name`].
///
/// Returns `None` for hashed names and for names that were not created by [`file_name`].
pub fn decode_file_name(name: &str) -> Option<CacheKey> {
    let encoded = name.strip_suffix(EXTENSION)?;
    if encoded.starts_with(HASHED_PREFIX) {
        return None;
    }
    let bytes = hex::decode(encoded).ok()?;
    let key = String::from_utf8(bytes).ok()?;
    Some(CacheKey::from_raw(key))
}

#[derive(Debug)]
struct StoreDirs {
    entries: PathBuf,
    tmp: PathBuf,
}

/// The file-system layer of the cache.
///
/// Every entry lives in its own file `<cache_dir>/entries/<file_name>`, containing the whole
/// [`CacheEntry`] as JSON. Files are written to `<cache_dir>/tmp` first and atomically renamed
/// into place, so readers never observe a partially written entry.
///
/// All operations are best-effort: errors are logged and never propagated. Without a configured
/// cache directory, the store is disabled and every operation is a no-op.
#[derive(Debug, Clone, Default)]
pub struct DurableStore {
    dirs: Option<Arc<StoreDirs>>,
}

impl DurableStore {
    pub fn new(cache_dir: Option<&Path>) -> Self {
        let dirs = cache_dir.map(|dir| {
            Arc::new(StoreDirs {
                entries: dir.join("entries"),
                tmp: dir.join("tmp"),
            })
        });
        Self { dirs }
    }

    /// A store that does not persist anything.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.dirs.is_some()
    }

    /// The directory holding the entry files, if enabled.
    pub fn entries_dir(&self) -> Option<&Path> {
        self.dirs.as_ref().map(|dirs| dirs.entries.as_path())
    }

    /// Persists the given entry, replacing a previous entry for the same key.
    ///
    /// This does blocking I/O, see [`spawn_save`](Self::spawn_save) for use from async code.
    pub fn save(&self, entry: &CacheEntry) {
        let Some(dirs) = &self.dirs else {
            return;
        };

        let path = dirs.entries.join(file_name(&entry.key));
        let result = write_entry(&dirs.tmp, &path, entry);

        metric!(
            counter("caches.file.write") += 1,
            "status" => if result.is_ok() { "ok" } else { "err" },
        );

        match result {
            Ok(()) => tracing::trace!(key = %entry.key, path = %path.display(), "Persisted cache entry"),
            Err(e) => {
                sentry::with_scope(
                    |scope| scope.set_extra("path", path.display().to_string().into()),
                    || {
                        tracing::error!(
                            error = &e as &dyn std::error::Error,
                            key = %entry.key,
                            "Failed to persist cache entry",
                        )
                    },
                );
            }
        }
    }

    /// Persists the given entry in a background task.
    ///
    /// The outcome is only observable through logs and metrics. The returned handle may be awaited
    /// to wait for the write to finish, but does not have to be.
    pub fn spawn_save(&self, entry: Arc<CacheEntry>) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            return None;
        }
        let store = self.clone();
        Some(tokio::task::spawn_blocking(move || store.save(&entry)))
    }

    /// Loads the entry for `key`, regardless of whether it is still valid.
    pub async fn load(&self, key: &CacheKey) -> Option<CacheEntry> {
        let dirs = self.dirs.as_ref()?;
        let name = file_name(key);
        let path = dirs.entries.join(&name);

        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to read cache entry",
                );
                return None;
            }
        };

        parse_entry(&name, &contents).filter(|entry| &entry.key == key)
    }

    /// Loads all persisted entries.
    ///
    /// Entries which fail to parse are logged and skipped.
    pub async fn load_all(&self) -> Vec<CacheEntry> {
        if !self.is_enabled() {
            return Vec::new();
        }
        let store = self.clone();
        match tokio::task::spawn_blocking(move || store.read_all()).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = &e as &dyn std::error::Error, "Failed to load cache entries");
                Vec::new()
            }
        }
    }

    fn read_all(&self) -> Vec<CacheEntry> {
        let mut entries = Vec::new();
        let Some(dirs) = &self.dirs else {
            return entries;
        };

        let dir = match fs::read_dir(&dirs.entries) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return entries,
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %dirs.entries.display(),
                    "Failed to enumerate cache entries",
                );
                return entries;
            }
        };

        for dir_entry in dir {
            let path = match dir_entry {
                Ok(dir_entry) => dir_entry.path(),
                Err(e) => {
                    tracing::error!(error = &e as &dyn std::error::Error, "Failed to read cache directory entry");
                    continue;
                }
            };
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !path.is_file() || !name.ends_with(EXTENSION) {
                continue;
            }

            match fs::read(&path) {
                Ok(contents) => entries.extend(parse_entry(name, &contents)),
                Err(e) => tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to read cache entry",
                ),
            }
        }

        tracing::info!(count = entries.len(), "Loaded persisted cache entries");
        entries
    }

    /// Clears the temporary files.
    ///
    /// This is done on startup, to get rid of temporary files left behind by a hard crash.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if let Some(dirs) = &self.dirs {
            if dirs.tmp.exists() {
                fs::remove_dir_all(&dirs.tmp)?;
            }
            fs::create_dir_all(&dirs.tmp)?;
        }
        Ok(())
    }
}

/// Parses the contents of the entry file `name`.
///
/// Corrupt files, and files that do not belong to the key they contain, yield `None`.
pub(super) fn parse_entry(name: &str, contents: &[u8]) -> Option<CacheEntry> {
    let entry: CacheEntry = match serde_json::from_slice(contents) {
        Ok(entry) => entry,
        Err(e) => {
            metric!(counter("caches.file.corrupt") += 1);
            tracing::error!(
                error = &e as &dyn std::error::Error,
                file = name,
                "Skipping corrupt cache entry",
            );
            return None;
        }
    };

    if file_name(&entry.key) != name {
        tracing::warn!(
            file = name,
            decoded = ?decode_file_name(name),
            key = %entry.key,
            "Skipping cache entry stored under a foreign file name",
        );
        return None;
    }

    Some(entry)
}

fn write_entry(tmp_dir: &Path, path: &Path, entry: &CacheEntry) -> io::Result<()> {
    let mut temp_file = tempfile_in(tmp_dir)?;
    {
        let mut writer = BufWriter::new(temp_file.as_file_mut());
        serde_json::to_writer(&mut writer, entry)?;
        writer.flush()?;
    }
    persist_tempfile(temp_file, path)
}

/// Creates a new temporary file in `dir`.
///
/// The `cleanup` command could potentially remove the directory we are operating in, so the
/// fs operations are retried.
fn tempfile_in(dir: &Path) -> io::Result<NamedTempFile> {
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(dir) {
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match tempfile::Builder::new().prefix("tmp").tempfile_in(dir) {
            Ok(temp_file) => return Ok(temp_file),
            Err(e) => {
                if retries > MAX_RETRIES {
                    return Err(e);
                }
            }
        }
    }
}

/// Atomically moves `temp_file` to `path`, creating missing parent directories.
fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist entry"))?;

    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                temp_file = e.file;
                if retries > MAX_RETRIES {
                    return Err(e.error);
                }
            }
        }
    }
}
