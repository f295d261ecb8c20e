use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use nomad_config::resolve_path;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Directory names never descended into while scanning a workspace.
const IGNORED_DIRS: &[&str] = &["node_modules", "target", "dist", "build", "__pycache__"];

#[derive(Debug, Error)]
pub enum FsError {
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FsEntry {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryListing {
    pub path: String,
    pub parent: Option<String>,
    pub entries: Vec<FsEntry>,
}

/// Read-only directory browsing used by the folder chooser and the
/// workspace file scan.
#[derive(Debug, Clone)]
pub struct FileSystemBrowser {
    max_scan_entries: usize,
    max_depth: usize,
}

impl Default for FileSystemBrowser {
    fn default() -> Self {
        Self {
            max_scan_entries: 5000,
            max_depth: 12,
        }
    }
}

impl FileSystemBrowser {
    pub fn new(max_scan_entries: usize, max_depth: usize) -> Self {
        Self {
            max_scan_entries,
            max_depth,
        }
    }

    /// List one directory, directories first, then by name. Hidden entries are
    /// included. `~` expands to the home directory.
    pub fn list_directory(&self, path: &str) -> Result<DirectoryListing, FsError> {
        let dir = open_dir(path)?;
        let read = std::fs::read_dir(&dir).map_err(|source| FsError::Io {
            path: path.to_string(),
            source,
        })?;

        let mut entries: Vec<FsEntry> = read
            .flatten()
            .map(|item| {
                let item_path = item.path();
                FsEntry {
                    name: item.file_name().to_string_lossy().to_string(),
                    kind: if item_path.is_dir() {
                        EntryKind::Directory
                    } else {
                        EntryKind::File
                    },
                    path: item_path.to_string_lossy().to_string(),
                }
            })
            .collect();
        entries.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.name.cmp(&b.name)));

        Ok(DirectoryListing {
            path: dir.to_string_lossy().to_string(),
            parent: dir.parent().map(|p| p.to_string_lossy().to_string()),
            entries,
        })
    }

    /// Collect file paths under `root`, relative to it and `/`-separated,
    /// sorted. Hidden entries, `.gitignore` matches and dependency/build
    /// directories are skipped. Stops silently once the entry cap is reached.
    pub fn scan(&self, root: &str) -> Result<Vec<String>, FsError> {
        let root = open_dir(root)?;
        let walker = WalkBuilder::new(&root)
            .hidden(true)
            .follow_links(false)
            .require_git(false)
            // Depth 0 is the root itself; its direct children are depth 1.
            .max_depth(Some(self.max_depth.saturating_add(1)))
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(|entry| {
                if entry.depth() == 0 {
                    return true;
                }
                if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                    let name = entry.file_name().to_string_lossy();
                    return !IGNORED_DIRS.contains(&&*name);
                }
                true
            })
            .build();

        let mut files = Vec::new();
        for entry in walker {
            if files.len() >= self.max_scan_entries {
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(&root) {
                files.push(relative_path(relative));
            }
        }
        files.sort();
        Ok(files)
    }
}

fn relative_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolve a user path and require it to be a readable directory.
pub fn open_dir(path: &str) -> Result<PathBuf, FsError> {
    let dir = resolve_path(path);
    match std::fs::metadata(&dir) {
        Ok(meta) if meta.is_dir() => Ok(dir),
        Ok(_) => Err(FsError::NotADirectory(path.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(FsError::NotFound(path.to_string()))
        }
        Err(source) => Err(FsError::Io {
            path: path.to_string(),
            source,
        }),
    }
}
