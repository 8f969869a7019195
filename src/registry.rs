//! Filesystem side of model management: artifacts, their companion summary
//! files and the default-pointer mirror file.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

pub const ARTIFACT_EXT: &str = "json";
pub const POINTER_FILE: &str = ".default_model.txt";
pub const COMPAT_SUMMARY_FILE: &str = "shap_summary.csv";

pub const SHAP_VALUES_SUFFIX: &str = "_shap_values.json";
pub const SHAP_SUMMARY_SUFFIX: &str = "_shap_summary.csv";
pub const COEF_SUMMARY_SUFFIX: &str = "_coef_summary.csv";

/// Forward slashes, no leading `./`.
pub fn canonical_model_path(raw: &str) -> String {
    let mut s = raw.trim().replace('\\', "/");
    while let Some(rest) = s.strip_prefix("./") {
        s = rest.to_string();
    }
    s
}

fn basename(canonical: &str) -> &str {
    canonical.rsplit('/').next().unwrap_or(canonical)
}

/// Whether a path stored in a log row refers to `target`. Historical rows
/// carry either separator style and sometimes a different directory prefix,
/// so a basename match at a path boundary also counts.
pub fn model_paths_match(stored: &str, target: &str) -> bool {
    let stored = canonical_model_path(stored);
    let target = canonical_model_path(target);
    if stored.is_empty() || target.is_empty() {
        return false;
    }
    if stored == target {
        return true;
    }
    let name = basename(&target);
    !name.is_empty() && (stored == name || stored.ends_with(&format!("/{}", name)))
}

/// `models/foo.json` -> `models/foo`
pub fn artifact_base(model_path: &Path) -> PathBuf {
    model_path.with_extension("")
}

pub fn companion_path(model_path: &Path, suffix: &str) -> PathBuf {
    let base = artifact_base(model_path);
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.with_file_name(format!("{}{}", name, suffix))
}

pub fn path_string(path: &Path) -> String {
    canonical_model_path(&path.to_string_lossy())
}

pub fn artifact_digest(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelFileInfo {
    pub name: String,
    pub path: String,
    pub size_bytes: Option<u64>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    dir: PathBuf,
}

impl ModelRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))
    }

    fn is_artifact_name(name: &str) -> bool {
        !name.starts_with('.')
            && name.ends_with(&format!(".{}", ARTIFACT_EXT))
            && !name.ends_with(SHAP_VALUES_SUFFIX)
    }

    /// Artifact paths in the models directory, sorted.
    pub fn list_models(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list {}", self.dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if Self::is_artifact_name(&name) {
                out.push(path_string(&self.dir.join(&name)));
            }
        }
        out.sort();
        Ok(out)
    }

    /// `<dir>/<base>_auto_<YYYYmmdd_HHMMSS>.json`
    pub fn new_auto_path(&self, base_model: &str, now: DateTime<Utc>) -> String {
        let canonical = canonical_model_path(base_model);
        let stem = Path::new(&canonical)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());
        let stamp = now.format("%Y%m%d_%H%M%S");
        path_string(
            &self
                .dir
                .join(format!("{}_auto_{}.{}", stem, stamp, ARTIFACT_EXT)),
        )
    }

    pub fn pointer_path(&self) -> PathBuf {
        self.dir.join(POINTER_FILE)
    }

    pub fn compat_summary_path(&self) -> PathBuf {
        self.dir.join(COMPAT_SUMMARY_FILE)
    }

    pub fn read_pointer_file(&self) -> Result<Option<String>> {
        let path = self.pointer_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let trimmed = raw.trim();
        Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
    }

    /// Replace the pointer file through a rename so readers never see a
    /// half-written path.
    pub fn write_pointer_file(&self, model_path: &str) -> Result<()> {
        self.ensure_dir()?;
        let path = self.pointer_path();
        let tmp = self.dir.join(format!("{}.tmp", POINTER_FILE));
        std::fs::write(&tmp, canonical_model_path(model_path))
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    /// The path as given if it exists, else the same file name inside the
    /// models directory.
    pub fn resolve_existing(&self, model_path: &str) -> Option<PathBuf> {
        let given = PathBuf::from(canonical_model_path(model_path));
        if given.is_file() {
            return Some(given);
        }
        let name = given.file_name()?;
        let inside = self.dir.join(name);
        inside.is_file().then_some(inside)
    }

    /// Remove an artifact and its companions. Returns the removed paths.
    pub fn delete_model(&self, model_path: &Path) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for suffix in [SHAP_VALUES_SUFFIX, SHAP_SUMMARY_SUFFIX, COEF_SUMMARY_SUFFIX] {
            let companion = companion_path(model_path, suffix);
            if companion.exists() {
                match std::fs::remove_file(&companion) {
                    Ok(()) => removed.push(path_string(&companion)),
                    Err(e) => tracing::warn!(
                        path = %companion.display(),
                        error = %e,
                        "failed to remove companion file"
                    ),
                }
            }
        }
        std::fs::remove_file(model_path)
            .with_context(|| format!("failed to remove {}", model_path.display()))?;
        removed.push(path_string(model_path));
        Ok(removed)
    }

    pub fn file_info(&self, model_path: &Path) -> ModelFileInfo {
        let name = model_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let meta = std::fs::metadata(model_path).ok();
        ModelFileInfo {
            name,
            path: path_string(model_path),
            size_bytes: meta.as_ref().map(|m| m.len()),
            updated_at: meta
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from),
        }
    }
}
