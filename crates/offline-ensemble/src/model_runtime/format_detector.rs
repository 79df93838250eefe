//! Detects artifact format from file extension.
use super::runtime_trait::ModelFormat;
use std::path::Path;
use tracing::debug;

pub struct FormatDetector;

impl FormatDetector {
    pub fn detect_from_path(path: &Path) -> Option<ModelFormat> {
        let extension = path.extension()?.to_str()?.to_lowercase();

        let format = ModelFormat::ALL
            .into_iter()
            .find(|format| format.extensions().contains(&extension.as_str()));

        if let Some(fmt) = format {
            debug!("Detected model format: {} for file: {}", fmt.name(), path.display());
        }
        format
    }

    pub fn supported_extensions() -> Vec<String> {
        ModelFormat::ALL
            .iter()
            .flat_map(|format| format.extensions().iter().map(|ext| ext.to_string()))
            .collect()
    }
}
