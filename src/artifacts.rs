//! Artifact Store: content layout for deploy outputs and per-build
//! metadata.
//!
//! `StoreFromDirectory` walks the deploy tree with `walkdir` and copies it
//! byte-preserving, symlinks included.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{ExtractionError, StoreError};
use crate::model::ArtifactMetadata;

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn customer_dir(&self, customer: &str) -> PathBuf {
        if customer.is_empty() {
            self.root.clone()
        } else {
            self.root.join(format!("artifact-{customer}"))
        }
    }

    pub fn artifact_path(&self, customer: &str, build_id: &str) -> PathBuf {
        self.customer_dir(customer).join(build_id)
    }

    /// Copy every regular file under `src_dir` into the store. Broken
    /// symlinks and unreadable files are skipped (reported via the
    /// returned `skipped` list so the caller can emit `meta` log lines);
    /// symlinks that do resolve are preserved as symlinks, never followed
    /// and copied as data.
    pub fn store_from_directory(
        &self,
        customer: &str,
        build_id: &str,
        src_dir: &Path,
    ) -> Result<StoreResult, ExtractionError> {
        if !src_dir.exists() {
            return Err(ExtractionError::MissingDeployDir(src_dir.display().to_string()));
        }

        let dest_dir = self.artifact_path(customer, build_id);
        std::fs::create_dir_all(&dest_dir).map_err(|e| ExtractionError::Copy {
            name: dest_dir.display().to_string(),
            source: e,
        })?;

        let mut sizes = BTreeMap::new();
        let mut skipped = Vec::new();

        for entry in WalkDir::new(src_dir).into_iter() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    skipped.push(format!("walk error: {e}"));
                    continue;
                }
            };
            let rel = match entry.path().strip_prefix(src_dir) {
                Ok(r) if !r.as_os_str().is_empty() => r.to_path_buf(),
                _ => continue,
            };
            let dest_path = dest_dir.join(&rel);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                let _ = std::fs::create_dir_all(&dest_path);
                continue;
            }

            if file_type.is_symlink() {
                match std::fs::read_link(entry.path()) {
                    Ok(target) => {
                        let resolves = src_dir.join(&rel).parent().map(|p| p.join(&target)).map(|p| p.exists()).unwrap_or(false)
                            || target.exists();
                        if !resolves {
                            skipped.push(format!("broken symlink: {}", rel.display()));
                            continue;
                        }
                        if let Some(parent) = dest_path.parent() {
                            let _ = std::fs::create_dir_all(parent);
                        }
                        let _ = std::fs::remove_file(&dest_path);
                        if std::os::unix::fs::symlink(&target, &dest_path).is_err() {
                            skipped.push(format!("failed to recreate symlink: {}", rel.display()));
                        }
                    }
                    Err(_) => skipped.push(format!("unreadable symlink: {}", rel.display())),
                }
                continue;
            }

            if !file_type.is_file() {
                continue;
            }

            if let Some(parent) = dest_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }

            match std::fs::copy(entry.path(), &dest_path) {
                Ok(bytes) => {
                    sizes.insert(rel.to_string_lossy().to_string(), bytes);
                }
                Err(_) => skipped.push(format!("unreadable file: {}", rel.display())),
            }
        }

        Ok(StoreResult { sizes, skipped })
    }

    pub fn list_artifacts(&self, customer: &str, build_id: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.artifact_path(customer, build_id);
        if !dir.exists() {
            return Err(StoreError::NotFound(build_id.to_string()));
        }
        let mut names = Vec::new();
        for entry in WalkDir::new(&dir).into_iter().filter_map(Result::ok) {
            if entry.file_type().is_file() && entry.file_name() != "metadata.json" {
                if let Ok(rel) = entry.path().strip_prefix(&dir) {
                    names.push(rel.to_string_lossy().to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn save_metadata_in(&self, customer: &str, meta: &ArtifactMetadata) -> Result<(), StoreError> {
        let dir = self.artifact_path(customer, &meta.build_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("metadata.json");
        let encoded = serde_json::to_vec_pretty(meta)?;
        std::fs::write(path, encoded)?;
        Ok(())
    }

    pub fn load_metadata(&self, customer: &str, build_id: &str) -> Result<ArtifactMetadata, StoreError> {
        let path = self.artifact_path(customer, build_id).join("metadata.json");
        let text = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// List every build for which metadata exists, across all customer
    /// subdirectories, newest first per the build-id's embedded timestamp.
    pub fn list_builds(&self) -> Vec<ArtifactMetadata> {
        let mut out = Vec::new();
        if !self.root.exists() {
            return out;
        }
        for entry in WalkDir::new(&self.root).max_depth(3).into_iter().filter_map(Result::ok) {
            if entry.file_name() == "metadata.json" {
                if let Ok(text) = std::fs::read_to_string(entry.path()) {
                    if let Ok(meta) = serde_json::from_str::<ArtifactMetadata>(&text) {
                        out.push(meta);
                    }
                }
            }
        }
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.build_id.cmp(&b.build_id)));
        out
    }

    /// Fall back to stat'ing the directory when `ArtifactSizes` is absent
    /// from metadata (e.g. written by an older daemon version).
    pub fn directory_size(&self, customer: &str, build_id: &str) -> u64 {
        let dir = self.artifact_path(customer, build_id);
        WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }
}

pub struct StoreResult {
    pub sizes: BTreeMap<String, u64>,
    pub skipped: Vec<String>,
}

/// Format a byte count as `0 B`, `1023 B`, `1.0 KB`, `1.0 MB`, ...
/// Monotonic non-decreasing in bytes.
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit_idx = 0;
    while value >= 1024.0 && unit_idx < UNITS.len() - 1 {
        value /= 1024.0;
        unit_idx += 1;
    }
    format!("{value:.1} {}", UNITS[unit_idx])
}
