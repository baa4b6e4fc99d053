//! Versioned snapshots of a bot's asset tree.
//!
//! Each publish packages the project directory into
//! `<hosted_bots>/<bot_id>/history/<version>.zip`; starting a managed runtime
//! restores that snapshot into the serving directory so the runtime never
//! serves the live, editable tree.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use shared_types::HistoryEntry;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{PublishError, Result};

/// Top-level folder of a project that is never packaged.
pub const RUNTIME_DIR: &str = "runtime";
const HISTORY_DIR: &str = "history";
const ARCHIVE_EXT: &str = "zip";

#[derive(Debug, Clone)]
pub struct ContentVersioner {
    base_dir: PathBuf,
}

impl ContentVersioner {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn history_dir(&self, bot_id: &str) -> PathBuf {
        self.base_dir.join(bot_id).join(HISTORY_DIR)
    }

    pub fn archive_path(&self, bot_id: &str, version: &str) -> PathBuf {
        self.history_dir(bot_id)
            .join(format!("{version}.{ARCHIVE_EXT}"))
    }

    /// Zip every file under `source_dir` except the `runtime/` subtree.
    /// Overwrites any earlier archive for the same version.
    pub async fn package_version(
        &self,
        bot_id: &str,
        version: &str,
        source_dir: &Path,
    ) -> Result<PathBuf> {
        validate_version(version)?;
        if !source_dir.is_dir() {
            return Err(PublishError::NotFound(source_dir.to_path_buf()));
        }

        let archive = self.archive_path(bot_id, version);
        let source = source_dir.to_path_buf();
        let target = archive.clone();
        let count = tokio::task::spawn_blocking(move || write_archive(&source, &target)).await??;

        info!(bot_id, version, files = count, path = %archive.display(), "packaged bot version");
        Ok(archive)
    }

    /// Extract a packaged version into `dest_dir`, overwriting existing files.
    pub async fn restore_version(&self, bot_id: &str, version: &str, dest_dir: &Path) -> Result<()> {
        validate_version(version)?;
        let archive = self.archive_path(bot_id, version);
        if !archive.is_file() {
            return Err(PublishError::ArchiveNotFound {
                bot_id: bot_id.to_string(),
                version: version.to_string(),
            });
        }

        let dest = dest_dir.to_path_buf();
        let count = tokio::task::spawn_blocking(move || extract_archive(&archive, &dest)).await??;

        info!(bot_id, version, files = count, dest = %dest_dir.display(), "restored bot version");
        Ok(())
    }

    /// Packaged versions for a bot, sorted by version id.
    pub async fn list_versions(&self, bot_id: &str) -> Result<Vec<HistoryEntry>> {
        let dir = self.history_dir(bot_id);
        let mut entries = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARCHIVE_EXT) {
                continue;
            }
            let Some(version) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let meta = entry.metadata().await?;
            let packaged_at: DateTime<Utc> = meta.modified()?.into();
            entries.push(HistoryEntry {
                version: version.to_string(),
                packaged_at,
                size_bytes: meta.len(),
            });
        }

        entries.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(entries)
    }
}

/// Versions become file names, so they must be a single plain path segment.
pub fn validate_version(version: &str) -> Result<()> {
    if !is_single_segment(version) {
        return Err(PublishError::Configuration(format!(
            "Invalid publish version '{version}'"
        )));
    }
    Ok(())
}

/// Bot ids name the bot's directory under the hosted bots base.
pub fn validate_bot_id(bot_id: &str) -> Result<()> {
    if !is_single_segment(bot_id) {
        return Err(PublishError::Configuration(format!(
            "Invalid bot id '{bot_id}'"
        )));
    }
    Ok(())
}

fn is_single_segment(name: &str) -> bool {
    let mut components = Path::new(name).components();
    let single_normal = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();
    !name.is_empty() && single_normal && !name.contains(['/', '\\'])
}

fn is_runtime_subtree(relative: &Path) -> bool {
    matches!(
        relative.components().next(),
        Some(Component::Normal(first)) if first == RUNTIME_DIR
    )
}

/// Zip name for a relative path: forward slashes on every platform.
fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn write_archive(source: &Path, target: &Path) -> Result<usize> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let partial = target.with_extension("zip.partial");
    let mut writer = ZipWriter::new(File::create(&partial)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut count = 0;
    let walker = WalkDir::new(source)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.path()
                .strip_prefix(source)
                .map(|rel| !is_runtime_subtree(rel))
                .unwrap_or(true)
        });

    for entry in walker {
        let entry = entry.map_err(|e| PublishError::Io(io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| PublishError::Io(io::Error::other(e)))?;

        let name = entry_name(relative);
        debug!(entry = %name, "adding archive entry");
        writer.start_file(name, options)?;
        let mut file = File::open(entry.path())?;
        io::copy(&mut file, &mut writer)?;
        count += 1;
    }

    writer.finish()?;
    fs::rename(&partial, target)?;
    Ok(count)
}

fn extract_archive(archive: &Path, dest: &Path) -> Result<usize> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    fs::create_dir_all(dest)?;

    let mut count = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(PublishError::Configuration(format!(
                "Archive entry '{}' escapes the target directory",
                entry.name()
            )));
        };

        let out_path = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
        count += 1;
    }
    Ok(count)
}
