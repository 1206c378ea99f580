use crate::paths::AppPaths;
use crate::pipeline::PipelineOptions;
use crate::{EngineError, Result};
use std::path::Path;

/// Reads saved options. A missing file yields the defaults.
pub fn load_options(path: &Path) -> Result<PipelineOptions> {
    if !path.exists() {
        return Ok(PipelineOptions::default());
    }
    let bytes = std::fs::read(path)?;
    let parsed: PipelineOptions = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::InvalidOptions(format!(
            "failed to parse options at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn save_options(path: &Path, options: &PipelineOptions) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(options)?;
    std::fs::write(path, format!("{json}\n"))?;
    Ok(())
}

pub fn load_app_options(paths: &AppPaths) -> Result<PipelineOptions> {
    load_options(&paths.options_path())
}

pub fn save_app_options(paths: &AppPaths, options: &PipelineOptions) -> Result<()> {
    save_options(&paths.options_path(), options)
}
