use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// File-name rule used to pick the restoration checkpoint out of an input tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointMatcher {
    /// Matched case-insensitively.
    pub marker: String,
    pub extension: String,
    /// Matched case-sensitively against the raw file name.
    pub exclude: String,
}

impl Default for CheckpointMatcher {
    fn default() -> Self {
        Self {
            marker: "aeneas".to_string(),
            extension: "pkl".to_string(),
            exclude: "emb".to_string(),
        }
    }
}

impl CheckpointMatcher {
    pub fn matches(&self, file_name: &str) -> bool {
        file_name.to_lowercase().contains(&self.marker.to_lowercase())
            && file_name.ends_with(&format!(".{}", self.extension))
            && (self.exclude.is_empty() || !file_name.contains(&self.exclude))
    }

    fn not_found(&self, root: &Path) -> Error {
        Error::CheckpointNotFound {
            root: root.to_path_buf(),
            marker: self.marker.clone(),
            extension: self.extension.clone(),
        }
    }
}

/// Walks `root` depth-first with entries in lexical order and returns the
/// first file accepted by `matcher`.
pub fn find_checkpoint(root: &Path, matcher: &CheckpointMatcher) -> Result<PathBuf> {
    if !root.is_dir() {
        return Err(matcher.not_found(root));
    }
    walk(root, matcher).ok_or_else(|| matcher.not_found(root))
}

fn walk(dir: &Path, matcher: &CheckpointMatcher) -> Option<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Skipping unreadable directory {}: {}", dir.display(), e);
            return None;
        }
    };

    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        if file_type.is_dir() {
            dirs.push(path);
        } else if file_type.is_symlink() && path.is_dir() {
            // linked directories are not followed
            continue;
        } else {
            files.push(path);
        }
    }
    files.sort();
    dirs.sort();

    let found = files.into_iter().find(|path| {
        path.file_name()
            .map(|name| matcher.matches(&name.to_string_lossy()))
            .unwrap_or(false)
    });
    if found.is_some() {
        return found;
    }

    dirs.iter().find_map(|sub| walk(sub, matcher))
}

/// A located checkpoint with the model configuration read back from it.
/// The trained parameters stay with whoever deserialized the file.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub path: PathBuf,
    pub model_config: Map<String, Value>,
    pub vocab_char_size: u64,
}

impl Checkpoint {
    pub fn new(path: PathBuf, model_config: Value) -> Result<Self> {
        let model_config = match model_config {
            Value::Object(map) => map,
            other => {
                return Err(Error::Checkpoint {
                    path,
                    message: format!("model_config is not a mapping: {}", other),
                })
            }
        };

        let vocab_char_size = match model_config.get("vocab_char_size").and_then(Value::as_u64) {
            Some(size) => size,
            None => {
                return Err(Error::Checkpoint {
                    path,
                    message: "model_config has no vocab_char_size".to_string(),
                })
            }
        };

        Ok(Self { path, model_config, vocab_char_size })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}
