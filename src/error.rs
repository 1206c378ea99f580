use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Sub-step of the join engine that produced a `JoinFailed` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStage {
    Transcode,
    Manifest,
    Concat,
    Encode,
    Finalize,
}

impl JoinStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinStage::Transcode => "transcode",
            JoinStage::Manifest => "manifest",
            JoinStage::Concat => "concat",
            JoinStage::Encode => "encode",
            JoinStage::Finalize => "finalize",
        }
    }
}

impl fmt::Display for JoinStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("external tool is missing: {tool}")]
    ToolNotFound { tool: String },

    #[error("external tool failed: {tool} (code={exit_code:?}) {stderr_tail}")]
    ProcessFailed {
        tool: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("external tool timed out after {timeout_secs}s and was terminated: {tool}")]
    TimeoutEscalated { tool: String, timeout_secs: u64 },

    #[error("join failed at {stage} step{}: {detail}", file_suffix(.file))]
    JoinFailed {
        stage: JoinStage,
        file: Option<PathBuf>,
        detail: String,
    },

    #[error("failed to write tags to {}: {detail}", .file.to_string_lossy())]
    TagWriteFailed { file: PathBuf, detail: String },

    #[error("cookie export could not be parsed: {0}")]
    CookieParseFailed(String),

    #[error("cookie file {} is invalid: {detail}", .path.to_string_lossy())]
    CookieFileInvalid { path: PathBuf, detail: String },

    #[error("no free name for {} after {attempts} attempts", .path.to_string_lossy())]
    RenameExhausted { path: PathBuf, attempts: usize },

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("invalid pipeline options: {0}")]
    InvalidOptions(String),

    #[error("operation canceled")]
    Canceled,

    #[error("tool install failed: {0}")]
    InstallFailed(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, EngineError::Canceled)
    }
}

fn file_suffix(file: &Option<PathBuf>) -> String {
    match file {
        Some(path) => format!(" for {}", path.to_string_lossy()),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
