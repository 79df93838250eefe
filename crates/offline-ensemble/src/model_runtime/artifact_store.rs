//! Artifact presence: which backend files exist, and the lifecycle state that
//! follows from it.

use super::format_detector::FormatDetector;
use crate::model_state::{ModelKind, ModelState};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactPresence {
    present: BTreeMap<ModelKind, PathBuf>,
}

impl ArtifactPresence {
    pub fn with(mut self, kind: ModelKind, path: impl Into<PathBuf>) -> Self {
        self.present.insert(kind, path.into());
        self
    }

    pub fn path(&self, kind: ModelKind) -> Option<&Path> {
        self.present.get(&kind).map(PathBuf::as_path)
    }

    pub fn contains(&self, kind: ModelKind) -> bool {
        self.present.contains_key(&kind)
    }

    pub fn present_kinds(&self) -> BTreeSet<ModelKind> {
        self.present.keys().copied().collect()
    }

    pub fn required_present(&self) -> usize {
        ModelKind::REQUIRED.iter().filter(|k| self.contains(**k)).count()
    }

    /// Required backends without an artifact. The intent classifier is
    /// optional and never listed.
    pub fn missing_required(&self) -> Vec<ModelKind> {
        ModelKind::REQUIRED
            .iter()
            .copied()
            .filter(|k| !self.contains(*k))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }
}

/// Reports which backend artifacts are available.
pub trait ArtifactStore: Send + Sync {
    fn scan(&self) -> ArtifactPresence;
}

/// Looks for `<stem>.<ext>` files in one directory, where the stem names the
/// backend kind and the extension is any supported format.
pub struct DirectoryArtifactStore {
    root: PathBuf,
}

impl DirectoryArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ArtifactStore for DirectoryArtifactStore {
    fn scan(&self) -> ArtifactPresence {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Models directory {} not readable: {}", self.root.display(), e);
                return ArtifactPresence::default();
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        // Deterministic pick when one kind exists in several formats.
        files.sort();

        let mut presence = ArtifactPresence::default();
        for path in files {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(kind) = ModelKind::ALL.into_iter().find(|k| k.file_stem() == stem) else {
                continue;
            };
            if presence.contains(kind) {
                continue;
            }
            if FormatDetector::detect_from_path(&path).is_none() {
                warn!("Ignoring {}: unsupported artifact format", path.display());
                continue;
            }
            presence.present.insert(kind, path);
        }
        presence
    }
}

/// Lifecycle state implied by artifact presence alone. Never `Ready`: that
/// requires a successful load.
pub fn derive_model_state(presence: &ArtifactPresence) -> ModelState {
    if presence.is_empty() {
        return ModelState::NotDownloaded;
    }
    let imported = presence.required_present();
    if imported == ModelKind::REQUIRED.len() {
        ModelState::Downloaded
    } else {
        ModelState::PartiallyDownloaded {
            imported,
            total: ModelKind::REQUIRED.len(),
            imported_set: presence.present_kinds(),
        }
    }
}
