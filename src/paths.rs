use std::path::{Path, PathBuf};

const BASE_DIR_ENV: &str = "WORKBENCH_BASE_DIR";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Base dir from `WORKBENCH_BASE_DIR`, else the platform app-data folder.
    pub fn from_env() -> Option<Self> {
        if let Ok(v) = std::env::var(BASE_DIR_ENV) {
            let t = v.trim();
            if !t.is_empty() {
                return Some(Self::new(PathBuf::from(t)));
            }
        }

        let app_data = if cfg!(windows) {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_DATA_HOME")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".local").join("share"))
                })
        };
        app_data.map(|dir| Self::new(dir.join("audio-workbench")))
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn options_path(&self) -> PathBuf {
        self.config_dir().join("pipeline_options.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join("tools")
    }

    pub fn ffmpeg_dir(&self) -> PathBuf {
        self.tools_dir().join("ffmpeg")
    }

    pub fn ytdlp_dir(&self) -> PathBuf {
        self.tools_dir().join("yt-dlp")
    }

    /// Where a bundled copy of `tool` would live.
    pub fn bundled_tool_path(&self, tool: &str) -> PathBuf {
        let dir = match tool {
            "ffmpeg" | "ffprobe" => self.ffmpeg_dir(),
            other => self.tools_dir().join(other),
        };
        with_exe_extension(dir.join(tool))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.ffmpeg_dir())?;
        std::fs::create_dir_all(self.ytdlp_dir())?;
        Ok(())
    }
}

pub(crate) fn with_exe_extension(mut path: PathBuf) -> PathBuf {
    if cfg!(windows) {
        path.set_extension("exe");
    }
    path
}

/// `name` with a numeric suffix inserted before the extension.
pub(crate) fn numbered_sibling(path: &Path, stem: &str, n: usize) -> PathBuf {
    let file_name = match path.extension() {
        Some(ext) => format!("{stem}_{n}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{n}"),
    };
    path.with_file_name(file_name)
}
