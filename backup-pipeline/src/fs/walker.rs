//! Directory traversal for dump directories and the storage directory.
//!
//! Entries are always yielded in file-name order so that archives built from
//! the same tree are byte-for-byte reproducible.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Yield directory entries as well as files
    pub include_dirs: bool,

    /// Maximum depth below the root (None = unlimited)
    pub max_depth: Option<usize>,
}

impl WalkOptions {
    pub fn files_only() -> Self {
        Self::default()
    }

    pub fn with_dirs() -> Self {
        Self {
            include_dirs: true,
            max_depth: None,
        }
    }
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Path relative to the walk root
    pub relative_path: PathBuf,

    /// File size in bytes (0 for directories)
    pub size: u64,

    pub is_dir: bool,
}

impl FileInfo {
    /// Symlinks are not followed and are skipped; dump directories never contain them.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            return Ok(None);
        }
        let is_dir = file_type.is_dir();
        let size = if is_dir { 0 } else { entry.metadata()?.len() };
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Some(Self {
            path,
            relative_path,
            size,
            is_dir,
        }))
    }
}

/// Walk a directory tree and collect entries in sorted order.
///
/// The root itself is never yielded.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut entries = Vec::new();

    let mut walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();
    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_dir() && !options.include_dirs {
            continue;
        }
        if let Some(info) = FileInfo::from_entry(&entry, root)? {
            entries.push(info);
        }
    }

    Ok(entries)
}

/// Calculate total size of all files below `root`
pub fn calculate_total_size(root: &Path) -> std::io::Result<u64> {
    Ok(walk_directory(root, &WalkOptions::files_only())?
        .iter()
        .map(|f| f.size)
        .sum())
}

/// Names of the immediate subdirectories of `root`, sorted.
pub fn top_level_dirs(root: &Path) -> std::io::Result<Vec<String>> {
    let options = WalkOptions {
        include_dirs: true,
        max_depth: Some(1),
    };
    Ok(walk_directory(root, &options)?
        .into_iter()
        .filter(|e| e.is_dir)
        .map(|e| e.relative_path.to_string_lossy().into_owned())
        .collect())
}
