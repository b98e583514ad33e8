//! Root-jailed file store backing the file built-ins.
//!
//! [`FileStore`] confines every operation to a working-directory root: paths
//! are normalized, `..` components may not climb above the root, and symlinks
//! are resolved before the containment check so a link cannot smuggle an
//! operation outside the jail. Anything that resolves outside the root is
//! rejected with [`FileStoreError::PathEscape`].
//!
//! Besides plain read/write/list/exists, the store implements the
//! `patch_file` contract used by agents for targeted edits:
//!
//! - changes apply sequentially to an in-memory buffer;
//! - each `search` must match exactly once unless a 1-indexed `occurrence`
//!   selects among multiple matches;
//! - the operation is **atomic** — on any error the file on disk is
//!   byte-identical to its pre-call contents.
//!
//! # Example
//!
//! ```rust,no_run
//! use swarmllm::tools::filesystem::{FileStore, PatchChange};
//!
//! # fn main() -> Result<(), swarmllm::tools::filesystem::FileStoreError> {
//! let store = FileStore::new("/var/data/workspace".into())?;
//!
//! store.write_file("notes.txt", "alpha\nbeta\n")?;
//! store.patch_file(
//!     "notes.txt",
//!     &[PatchChange {
//!         search: "beta".to_string(),
//!         replace: "gamma".to_string(),
//!         occurrence: None,
//!     }],
//! )?;
//! assert_eq!(store.read_file("notes.txt")?, "alpha\ngamma\n");
//! # Ok(())
//! # }
//! ```

use crate::swarmllm::errors::TaskErrorKind;
use base64::Engine;
use serde::Deserialize;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Errors that can occur during file store operations.
#[derive(Debug)]
pub enum FileStoreError {
    /// Path resolves outside the working-directory root.
    PathEscape(String),
    /// Target file does not exist.
    FileMissing(String),
    /// A `patch_file` search string was not found (0-indexed change).
    SearchNotFound { change: usize, search: String },
    /// A `patch_file` search string matched more than once with no
    /// `occurrence` selector.
    AmbiguousMatch {
        change: usize,
        search: String,
        match_count: usize,
    },
    /// A `patch_file` `occurrence` index is out of range (1-indexed).
    InvalidOccurrence {
        change: usize,
        occurrence: usize,
        match_count: usize,
    },
    /// A file operation was attempted on a directory (or vice versa).
    NotAFile(String),
    /// Underlying IO failure with context.
    Io(String),
}

impl fmt::Display for FileStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileStoreError::PathEscape(path) => {
                write!(f, "Path escapes the working directory: {}", path)
            }
            FileStoreError::FileMissing(path) => write!(f, "File not found: {}", path),
            FileStoreError::SearchNotFound { change, search } => write!(
                f,
                "Change {}: search text not found: {:?}",
                change, search
            ),
            FileStoreError::AmbiguousMatch {
                change,
                search,
                match_count,
            } => write!(
                f,
                "Change {}: search text {:?} matches {} times; specify 'occurrence' (1-indexed) to disambiguate",
                change, search, match_count
            ),
            FileStoreError::InvalidOccurrence {
                change,
                occurrence,
                match_count,
            } => write!(
                f,
                "Change {}: occurrence {} is out of range; search matches {} time(s)",
                change, occurrence, match_count
            ),
            FileStoreError::NotAFile(path) => write!(f, "Not a regular file: {}", path),
            FileStoreError::Io(msg) => write!(f, "IO error: {}", msg),
        }
    }
}

impl Error for FileStoreError {}

impl FileStoreError {
    /// The task-level classification of this error for outcomes and traces.
    pub fn kind(&self) -> TaskErrorKind {
        match self {
            FileStoreError::PathEscape(_) => TaskErrorKind::PathEscape,
            FileStoreError::FileMissing(_) => TaskErrorKind::FileMissing,
            FileStoreError::SearchNotFound { .. } => TaskErrorKind::SearchNotFound,
            FileStoreError::AmbiguousMatch { .. } => TaskErrorKind::AmbiguousMatch,
            FileStoreError::InvalidOccurrence { .. } => TaskErrorKind::InvalidOccurrence,
            FileStoreError::NotAFile(_) | FileStoreError::Io(_) => TaskErrorKind::ToolFailed,
        }
    }
}

/// One targeted search-and-replace inside a `patch_file` call.
#[derive(Debug, Clone, Deserialize)]
pub struct PatchChange {
    /// Exact text to find.
    pub search: String,
    /// Replacement text.
    pub replace: String,
    /// 1-indexed occurrence to replace when `search` matches multiple times.
    #[serde(default)]
    pub occurrence: Option<usize>,
}

/// Entry in a directory listing.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    /// Entry name.
    pub name: String,
    /// Whether this is a directory.
    pub is_directory: bool,
    /// Size in bytes (0 for directories).
    pub size: u64,
}

/// Base64 payload returned by `read_image`.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    /// Base64-encoded file bytes.
    pub base64: String,
    /// Sniffed media type (`image/png`, `image/jpeg`, ...), when recognized.
    pub media_type: Option<String>,
    /// Raw size in bytes.
    pub size: u64,
}

/// File operations confined to a working-directory root.
#[derive(Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    ///
    /// The root is canonicalized once here so later containment checks
    /// compare against a symlink-free base.
    pub fn new(root: PathBuf) -> Result<Self, FileStoreError> {
        fs::create_dir_all(&root)
            .map_err(|e| FileStoreError::Io(format!("cannot create root: {}", e)))?;
        let root = root
            .canonicalize()
            .map_err(|e| FileStoreError::Io(format!("cannot canonicalize root: {}", e)))?;
        Ok(Self { root })
    }

    /// The canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` under the root, rejecting escapes.
    ///
    /// Normalization rejects `..` components that would climb above the
    /// root. For paths whose target does not exist yet (writes), the nearest
    /// existing ancestor is canonicalized so symlinked parent directories
    /// cannot carry the operation outside the jail.
    fn resolve(&self, path: &str) -> Result<PathBuf, FileStoreError> {
        let requested = PathBuf::from(path);

        let relative = if requested.is_absolute() {
            requested
                .strip_prefix(&self.root)
                .map(Path::to_path_buf)
                .map_err(|_| FileStoreError::PathEscape(path.to_string()))?
        } else {
            requested
        };

        let mut normalized = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(FileStoreError::PathEscape(path.to_string()));
                    }
                }
                Component::Normal(c) => normalized.push(c),
                Component::CurDir => {}
                _ => return Err(FileStoreError::PathEscape(path.to_string())),
            }
        }

        let effective = self.root.join(&normalized);

        // Resolve symlinks before the containment check. For not-yet-existing
        // targets, canonicalize the nearest existing ancestor and re-attach
        // the remaining suffix.
        let canonical = if effective.exists() {
            effective
                .canonicalize()
                .map_err(|e| FileStoreError::Io(format!("cannot canonicalize path: {}", e)))?
        } else {
            let mut ancestor = effective.as_path();
            let mut suffix = Vec::new();
            loop {
                match ancestor.parent() {
                    Some(parent) => {
                        suffix.push(
                            ancestor
                                .file_name()
                                .map(|name| name.to_os_string())
                                .unwrap_or_default(),
                        );
                        ancestor = parent;
                        if ancestor.exists() {
                            break;
                        }
                    }
                    None => return Err(FileStoreError::PathEscape(path.to_string())),
                }
            }
            let mut resolved = ancestor
                .canonicalize()
                .map_err(|e| FileStoreError::Io(format!("cannot canonicalize ancestor: {}", e)))?;
            for part in suffix.iter().rev() {
                resolved.push(part);
            }
            resolved
        };

        if !canonical.starts_with(&self.root) {
            return Err(FileStoreError::PathEscape(path.to_string()));
        }
        Ok(canonical)
    }

    /// Read a UTF-8 file.
    pub fn read_file(&self, path: &str) -> Result<String, FileStoreError> {
        let resolved = self.resolve(path)?;
        if !resolved.exists() {
            return Err(FileStoreError::FileMissing(path.to_string()));
        }
        if resolved.is_dir() {
            return Err(FileStoreError::NotAFile(path.to_string()));
        }
        fs::read_to_string(&resolved).map_err(|e| FileStoreError::Io(e.to_string()))
    }

    /// Write a file, creating parent directories as needed.
    pub fn write_file(&self, path: &str, content: &str) -> Result<(), FileStoreError> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent).map_err(|e| FileStoreError::Io(e.to_string()))?;
        }
        fs::write(&resolved, content).map_err(|e| FileStoreError::Io(e.to_string()))
    }

    /// Apply a sequence of targeted replacements atomically.
    ///
    /// All changes are applied to an in-memory buffer in order; the file is
    /// written only when every change succeeded. On error the file is
    /// untouched. Returns the number of applied changes.
    pub fn patch_file(
        &self,
        path: &str,
        changes: &[PatchChange],
    ) -> Result<usize, FileStoreError> {
        let resolved = self.resolve(path)?;
        if !resolved.exists() {
            return Err(FileStoreError::FileMissing(path.to_string()));
        }
        let mut buffer = fs::read_to_string(&resolved).map_err(|e| FileStoreError::Io(e.to_string()))?;

        for (index, change) in changes.iter().enumerate() {
            let match_count = buffer.matches(&change.search).count();
            if match_count == 0 {
                return Err(FileStoreError::SearchNotFound {
                    change: index,
                    search: change.search.clone(),
                });
            }
            let nth = match change.occurrence {
                Some(occurrence) => {
                    if occurrence == 0 || occurrence > match_count {
                        return Err(FileStoreError::InvalidOccurrence {
                            change: index,
                            occurrence,
                            match_count,
                        });
                    }
                    occurrence - 1
                }
                None => {
                    if match_count > 1 {
                        return Err(FileStoreError::AmbiguousMatch {
                            change: index,
                            search: change.search.clone(),
                            match_count,
                        });
                    }
                    0
                }
            };
            let offset = buffer
                .match_indices(&change.search)
                .nth(nth)
                .map(|(offset, _)| offset)
                .expect("nth match exists after count check");
            buffer.replace_range(offset..offset + change.search.len(), &change.replace);
        }

        fs::write(&resolved, buffer).map_err(|e| FileStoreError::Io(e.to_string()))?;
        Ok(changes.len())
    }

    /// List a directory, files and subdirectories, sorted by name.
    pub fn list_files(&self, path: &str) -> Result<Vec<DirectoryEntry>, FileStoreError> {
        let resolved = self.resolve(path)?;
        if !resolved.exists() {
            return Err(FileStoreError::FileMissing(path.to_string()));
        }
        if !resolved.is_dir() {
            return Err(FileStoreError::NotAFile(path.to_string()));
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&resolved).map_err(|e| FileStoreError::Io(e.to_string()))? {
            let entry = entry.map_err(|e| FileStoreError::Io(e.to_string()))?;
            let metadata = entry
                .metadata()
                .map_err(|e| FileStoreError::Io(e.to_string()))?;
            entries.push(DirectoryEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_directory: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Whether `path` exists inside the jail.
    ///
    /// An escaping path is an error rather than `false` so the caller can
    /// surface the violation.
    pub fn file_exists(&self, path: &str) -> Result<bool, FileStoreError> {
        Ok(self.resolve(path)?.exists())
    }

    /// Read an image file as a base64 payload with a sniffed media type.
    pub fn read_image(&self, path: &str) -> Result<ImagePayload, FileStoreError> {
        let resolved = self.resolve(path)?;
        if !resolved.exists() {
            return Err(FileStoreError::FileMissing(path.to_string()));
        }
        if resolved.is_dir() {
            return Err(FileStoreError::NotAFile(path.to_string()));
        }
        let bytes = fs::read(&resolved).map_err(|e| FileStoreError::Io(e.to_string()))?;
        Ok(ImagePayload {
            media_type: sniff_media_type(&bytes).map(str::to_string),
            size: bytes.len() as u64,
            base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
        })
    }
}

/// Recognize common image formats from magic bytes.
fn sniff_media_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF8") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}
