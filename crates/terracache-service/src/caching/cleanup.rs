use std::fs::{read_dir, remove_file};
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};

use super::DurableStore;
use super::durable::parse_entry;
use crate::config::Config;

/// Entry function for the cleanup command.
///
/// Removes all persisted entries that expired longer than the configured retention ago.
/// If `dry_run` is `true`, no files will actually be deleted.
pub fn cleanup(config: &Config, dry_run: bool) -> Result<CleanupStats> {
    let store = DurableStore::new(config.cache_dir.as_deref());
    store.cleanup(Utc::now(), config.caches.retention, dry_run)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl DurableStore {
    /// Removes entries that expired more than `retention` before `now`, as well as files which
    /// are not valid entries at all.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
        dry_run: bool,
    ) -> Result<CleanupStats> {
        let entries_dir = self.entries_dir().ok_or_else(|| {
            anyhow!("no caching configured! Did you provide a path to your config file?")
        })?;
        tracing::info!("Cleaning up `{}`", entries_dir.display());

        let retention = TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX);
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut stats = CleanupStats::default();
        let dir = match read_dir(entries_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Directory not found: `{}`", entries_dir.display());
                return Ok(stats);
            }
            Err(e) => return Err(e.into()),
        };

        for dir_entry in dir {
            let path = dir_entry?.path();
            if !path.is_file() {
                continue;
            }
            if let Err(e) = try_cleanup_path(&path, cutoff, &mut stats, dry_run) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", path.display().to_string().into()),
                    || tracing::error!("Failed to clean cache file: {:?}", e),
                );
            }
        }

        tracing::info!(
            "Retained {} files, totaling {} bytes",
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} files, totaling {} bytes",
            stats.removed_files,
            stats.removed_bytes,
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes);
        metric!(counter("caches.size.files_removed") += stats.removed_files as i64);
        metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64);

        Ok(stats)
    }
}

/// Removes the file at `path` if it is not a valid entry or expired before `cutoff`.
fn try_cleanup_path(
    path: &Path,
    cutoff: DateTime<Utc>,
    stats: &mut CleanupStats,
    dry_run: bool,
) -> Result<()> {
    let contents = std::fs::read(path)?;
    let size = contents.len() as u64;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();

    let keep = match parse_entry(name, &contents) {
        Some(entry) => entry.expiry >= cutoff,
        None => false,
    };

    if keep {
        stats.retained_files += 1;
        stats.retained_bytes += size;
        return Ok(());
    }

    tracing::debug!("Removing file `{}`", path.display());
    if !dry_run {
        remove_file(path)?;
    }
    stats.removed_files += 1;
    stats.removed_bytes += size;
    Ok(())
}
