//! On-disk snapshot format: a JSON array of [`MetricRecord`]s.
//!
//! Snapshots are written to a temporary file in the target's directory,
//! fsynced, then renamed over the target, so readers only ever see a
//! complete file.

use crate::error::{Result, StorageError};
use metrix_common::{Metric, MetricRecord};
use std::io::{ErrorKind, Write};
use std::path::Path;

/// Reads a snapshot. A missing or blank file is an empty snapshot.
pub fn load(path: &Path) -> Result<Vec<Metric>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let records: Vec<MetricRecord> = serde_json::from_slice(&bytes)?;
    records
        .into_iter()
        .map(|record| Metric::try_from(record).map_err(StorageError::Record))
        .collect()
}

/// Atomically replaces `path` with a snapshot of `metrics`.
pub fn save(path: &Path, metrics: &[Metric]) -> Result<()> {
    save_checked(path, metrics, || Ok(()))
}

/// Like [`save`], but gives up without touching `path` when `ready` fails
/// before the write starts or right before the rename.
pub fn save_checked(
    path: &Path,
    metrics: &[Metric],
    ready: impl Fn() -> Result<()>,
) -> Result<()> {
    ready()?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut records: Vec<MetricRecord> = metrics.iter().map(MetricRecord::from).collect();
    records.sort_by(|a, b| (&a.kind, &a.id).cmp(&(&b.kind, &b.id)));
    let mut bytes = serde_json::to_vec_pretty(&records)?;
    bytes.push(b'\n');

    let mut tmp = tempfile::Builder::new()
        .prefix(".metrix-snapshot-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(&bytes)?;
    keep_permissions(tmp.as_file(), path)?;
    tmp.as_file().sync_all()?;
    ready()?;
    tmp.persist(path).map_err(|e| e.error)?;
    sync_dir(dir);
    Ok(())
}

/// Gives the temporary file the target's mode, or 0644 for a new target,
/// instead of the 0600 temporary files are created with.
#[cfg(unix)]
fn keep_permissions(tmp: &std::fs::File, path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = match std::fs::metadata(path) {
        Ok(meta) => meta.permissions().mode() & 0o7777,
        Err(e) if e.kind() == ErrorKind::NotFound => 0o644,
        Err(e) => return Err(e.into()),
    };
    tmp.set_permissions(std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn keep_permissions(_tmp: &std::fs::File, _path: &Path) -> Result<()> {
    Ok(())
}

/// Flushes the directory entry for the rename. Best effort.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = std::fs::File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(dir = %dir.display(), error = %e, "Failed to fsync snapshot directory");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
