use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use walkdir::WalkDir;

use crate::config::settings::VaultConfig;

/// An eligible file found under the vault root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// Vault-relative path with `/` separators, the record key
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    pub modified_ms: i64,
}

#[derive(Debug, Default)]
pub struct ScanResult {
    pub files: Vec<ScannedFile>,
    pub warnings: Vec<String>,
}

/// Decides which paths under a vault are indexable.
#[derive(Debug, Clone)]
pub struct FileFilter {
    extensions: HashSet<String>,
    ignored_names: HashSet<String>,
}

impl FileFilter {
    pub fn new(config: &VaultConfig) -> Self {
        Self {
            extensions: config
                .extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
            ignored_names: config.ignored_names.iter().cloned().collect(),
        }
    }

    /// Hidden or ignored directory components exclude the whole subtree.
    pub fn is_ignored_path(&self, root: &Path, path: &Path) -> bool {
        let rel = path.strip_prefix(root).unwrap_or(path);
        rel.components().any(|component| match component {
            Component::Normal(name) => {
                let name = name.to_string_lossy();
                name.starts_with('.') || self.ignored_names.contains(name.as_ref())
            }
            _ => false,
        })
    }

    pub fn has_indexable_extension(&self, path: &Path) -> bool {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => {
                let ext = ext.to_lowercase();
                !matches!(ext.as_str(), "tmp" | "temp" | "lock" | "swp" | "bak")
                    && self.extensions.contains(&ext)
            }
            None => false,
        }
    }

    pub fn is_eligible(&self, root: &Path, path: &Path) -> bool {
        !self.is_ignored_path(root, path) && self.has_indexable_extension(path)
    }
}

pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

pub fn modified_millis(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Stats a single path; `Ok(None)` when the path no longer exists.
pub fn stat_file(root: &Path, path: &Path) -> std::io::Result<Option<ScannedFile>> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if !metadata.is_file() {
        return Ok(None);
    }
    let rel_path = match relative_key(root, path) {
        Some(rel) => rel,
        None => return Ok(None),
    };
    Ok(Some(ScannedFile {
        rel_path,
        abs_path: path.to_path_buf(),
        size: metadata.len(),
        modified_ms: modified_millis(&metadata),
    }))
}

pub fn scan_vault(root: &Path, filter: &FileFilter) -> ScanResult {
    let mut result = ScanResult::default();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !filter.is_ignored_path(root, entry.path()));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                result.warnings.push(format!("Failed to read directory entry: {}", e));
                continue;
            }
        };
        if !entry.file_type().is_file() || !filter.has_indexable_extension(entry.path()) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                result
                    .warnings
                    .push(format!("Failed to stat {}: {}", entry.path().display(), e));
                continue;
            }
        };
        if let Some(rel_path) = relative_key(root, entry.path()) {
            result.files.push(ScannedFile {
                rel_path,
                abs_path: entry.path().to_path_buf(),
                size: metadata.len(),
                modified_ms: modified_millis(&metadata),
            });
        }
    }

    result.files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    result
}
