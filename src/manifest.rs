use crate::pipeline::RunState;
use crate::Result;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE_NAME: &str = "run_manifest.json";

/// Where a run put things. Paths are absolute.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestLayout {
    pub run_dir: PathBuf,
    pub joined: Option<PathBuf>,
    pub cue: Option<PathBuf>,
    pub segment_playlist: Option<PathBuf>,
    pub playlists: Vec<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub cookies: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub state: RunState,
    pub url: String,
    pub layout: ManifestLayout,
    pub files: Vec<ManifestFile>,
    pub errors: Vec<String>,
    pub options: serde_json::Value,
}

impl RunManifest {
    pub fn path_in(run_dir: &Path) -> PathBuf {
        run_dir.join(MANIFEST_FILE_NAME)
    }

    /// Writes `run_manifest.json` into the run dir via a temp file.
    pub fn write(&self) -> Result<PathBuf> {
        let path = Self::path_in(&self.layout.run_dir);
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(&path, format!("{json}\n").as_bytes())?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut file = std::fs::File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, bytes)?;
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
