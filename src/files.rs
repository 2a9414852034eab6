//! Local file metadata and directory listings served to the operator.

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::util::epoch_millis;

/// One entry of a listing, as sent in `getFileList` answers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub is_file: bool,
    pub create_time: i64,
    pub last_modify_time: i64,
    /// False only for a directory with at least one entry.
    pub is_leaf: bool,
    pub size: u64,
    pub mime_type: String,
    pub children: Vec<FileInfo>,
}

pub trait FileCatalog: Send + Sync {
    fn file_info(&self, path: &Path) -> io::Result<FileInfo>;

    /// Entries of `path`, directories first then by name, windowed by
    /// `offset` and `size` (`size == 0` means no limit). Each directory entry
    /// carries one level of its own listing, windowed the same way. A path
    /// that is not a readable directory lists as empty.
    fn list(&self, path: &Path, offset: usize, size: usize) -> Vec<FileInfo>;
}

/// [`FileCatalog`] over the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct LocalFiles;

impl FileCatalog for LocalFiles {
    fn file_info(&self, path: &Path) -> io::Result<FileInfo> {
        let meta = fs::metadata(path)?;
        let modified = meta.modified().map(epoch_millis).unwrap_or_default();
        let created = meta.created().map(epoch_millis).unwrap_or(modified);
        let is_leaf = !(meta.is_dir() && has_entries(path));

        Ok(FileInfo {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_string_lossy().into_owned(),
            is_file: meta.is_file(),
            create_time: created,
            last_modify_time: modified,
            is_leaf,
            size: meta.len(),
            mime_type: mime_guess::from_path(path)
                .first_raw()
                .unwrap_or_default()
                .to_string(),
            children: Vec::new(),
        })
    }

    fn list(&self, path: &Path, offset: usize, size: usize) -> Vec<FileInfo> {
        window(sorted_entries(path), offset, size)
            .filter_map(|entry| {
                let mut info = self.file_info(&entry).ok()?;
                if !info.is_file {
                    info.children = window(sorted_entries(&entry), offset, size)
                        .filter_map(|child| self.file_info(&child).ok())
                        .collect();
                }
                Some(info)
            })
            .collect()
    }
}

fn has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn sorted_entries(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "not listable");
            return Vec::new();
        }
    };

    let mut entries: Vec<(bool, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let path = entry.path();
            (path.is_file(), path)
        })
        .collect();
    entries.sort_by(|(a_file, a), (b_file, b)| match a_file.cmp(b_file) {
        Ordering::Equal => a.file_name().cmp(&b.file_name()),
        other => other,
    });
    entries.into_iter().map(|(_, path)| path).collect()
}

fn window(entries: Vec<PathBuf>, offset: usize, size: usize) -> impl Iterator<Item = PathBuf> {
    let take = if size == 0 { usize::MAX } else { size };
    entries.into_iter().skip(offset).take(take)
}
