//! Local file helpers for Beambox.
//!
//! This module handles:
//! - Describing local files and directories as FileExplore entries
//! - Directory listings for ScanDir replies
//! - Choosing collision-free names in the download directory
//! - Writing received chunks to disk

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::protocol::messages::{FileExploreDir, FileExploreFile, ScanDirResp};

/// Milliseconds since the Unix epoch, or 0 when unknown.
fn millis(time: std::io::Result<SystemTime>) -> i64 {
    time.map_or(0, |t| DateTime::<Utc>::from(t).timestamp_millis())
}

fn entry_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |n| n.to_string_lossy().to_string(),
    )
}

/// Describe a local regular file.
///
/// # Errors
///
/// Returns [`Error::FileNotFound`] if the path does not exist and
/// [`Error::InvalidFile`] if it is not a regular file.
pub fn explore_file(path: &Path) -> Result<FileExploreFile> {
    let metadata = std::fs::metadata(path)
        .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
    if !metadata.is_file() {
        return Err(Error::InvalidFile(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    Ok(FileExploreFile {
        name: entry_name(path),
        path: path.display().to_string(),
        size: metadata.len(),
        last_modify: millis(metadata.modified()),
    })
}

/// List the direct children of `path`.
///
/// Unreadable directories and entries are skipped: the result is an empty
/// listing rather than an error. Hidden entries (leading `.`) are omitted.
#[must_use]
pub fn scan_dir(path: &Path) -> ScanDirResp {
    let mut listing = ScanDirResp {
        path: path.display().to_string(),
        children_dirs: Vec::new(),
        children_files: Vec::new(),
    };

    let Ok(entries) = std::fs::read_dir(path) else {
        tracing::debug!("Cannot read directory {}", path.display());
        return listing;
    };

    for entry in entries.flatten() {
        let child = entry.path();
        let name = entry_name(&child);
        if name.starts_with('.') {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_dir() {
            let children_count = std::fs::read_dir(&child).map_or(0, |d| d.count() as u32);
            listing.children_dirs.push(FileExploreDir {
                name,
                path: child.display().to_string(),
                children_count,
                last_modify: millis(metadata.modified()),
            });
        } else if metadata.is_file() {
            listing.children_files.push(FileExploreFile {
                name,
                path: child.display().to_string(),
                size: metadata.len(),
                last_modify: millis(metadata.modified()),
            });
        }
    }

    listing.children_dirs.sort_by(|a, b| a.name.cmp(&b.name));
    listing.children_files.sort_by(|a, b| a.name.cmp(&b.name));
    listing
}

/// Resolve a remote-visible path against a served root directory.
///
/// `"/"` and `""` map to the root itself. Returns `None` for paths that
/// would escape the root.
#[must_use]
pub fn resolve_in_root(root: &Path, requested: &str) -> Option<PathBuf> {
    let relative = Path::new(requested.trim_start_matches(['/', '\\']));
    for component in relative.components() {
        if matches!(component, Component::ParentDir | Component::Prefix(_)) {
            return None;
        }
    }
    Some(root.join(relative))
}

/// Reduce a remote file name to a single safe path component.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    match base {
        "" | "." | ".." => "unnamed".to_string(),
        other => other.to_string(),
    }
}

/// Pick a path in `dir` for `name` that does not exist yet.
///
/// `report.pdf` becomes `report(1).pdf`, `report(2).pdf`, ... on collision.
#[must_use]
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let name = sanitize_file_name(name);
    let candidate = dir.join(&name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
        _ => (name.clone(), String::new()),
    };
    (1u32..)
        .map(|i| dir.join(format!("{stem}({i}){ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Format a file size for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Writer assembling a received file from sequential chunks.
#[derive(Debug)]
pub struct FileWriter {
    /// Output file path
    pub output_path: PathBuf,
    /// Expected total file size
    pub expected_size: u64,
    /// Bytes written so far
    pub bytes_written: u64,
    file: tokio::fs::File,
}

impl FileWriter {
    /// Create the output file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub async fn create(output_path: PathBuf, expected_size: u64) -> Result<Self> {
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&output_path).await?;
        Ok(Self {
            output_path,
            expected_size,
            bytes_written: 0,
            file,
        })
    }

    /// Append a chunk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFile`] if the chunk would exceed the expected
    /// size, or an I/O error.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        let total = self.bytes_written + data.len() as u64;
        if total > self.expected_size {
            return Err(Error::InvalidFile(format!(
                "{} exceeds expected size {}",
                self.output_path.display(),
                self.expected_size
            )));
        }
        self.file.write_all(data).await?;
        self.bytes_written = total;
        Ok(())
    }

    /// Whether every expected byte has been written.
    pub fn is_complete(&self) -> bool {
        self.bytes_written == self.expected_size
    }

    /// Flush and close the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is incomplete or cannot be flushed.
    pub async fn finish(mut self) -> Result<PathBuf> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        if !self.is_complete() {
            return Err(Error::InvalidFile(format!(
                "{} incomplete: {} of {} bytes",
                self.output_path.display(),
                self.bytes_written,
                self.expected_size
            )));
        }
        Ok(self.output_path)
    }

    /// Close and delete a partially written file.
    pub async fn discard(self) {
        let path = self.output_path.clone();
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::debug!("Failed to remove partial file {}: {}", path.display(), e);
        }
    }
}
