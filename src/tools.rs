use crate::paths::{with_exe_extension, AppPaths};
use crate::supervisor::ProcessSupervisor;
use crate::{EngineError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// External programs the pipeline drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Tool {
    Downloader,
    Transcoder,
    Prober,
    Normalizer,
}

impl Tool {
    pub const ALL: [Tool; 4] = [
        Tool::Downloader,
        Tool::Transcoder,
        Tool::Prober,
        Tool::Normalizer,
    ];

    pub fn binary_name(&self) -> &'static str {
        match self {
            Tool::Downloader => "yt-dlp",
            Tool::Transcoder => "ffmpeg",
            Tool::Prober => "ffprobe",
            Tool::Normalizer => "mp3gain",
        }
    }

    pub fn is_required(&self) -> bool {
        !matches!(self, Tool::Normalizer)
    }

    fn version_arg(&self) -> &'static str {
        match self {
            Tool::Downloader => "--version",
            Tool::Transcoder | Tool::Prober => "-version",
            Tool::Normalizer => "-v",
        }
    }
}

/// Finds tool binaries: bundled tools dir, then `PATH`, then well-known
/// install locations. Lookups are cached for the resolver's lifetime.
#[derive(Debug)]
pub struct ToolResolver {
    bundled: Option<AppPaths>,
    search_path: Option<OsString>,
    extra_dirs: Vec<PathBuf>,
    platform_dirs: bool,
    cache: Mutex<HashMap<String, Option<PathBuf>>>,
}

impl Default for ToolResolver {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ToolResolver {
    pub fn new(bundled: Option<AppPaths>) -> Self {
        Self {
            bundled,
            search_path: None,
            extra_dirs: Vec::new(),
            platform_dirs: true,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolver with an explicit search path and candidate dirs; the
    /// platform install locations are not consulted.
    pub fn with_search(search_path: OsString, extra_dirs: Vec<PathBuf>) -> Self {
        Self {
            bundled: None,
            search_path: Some(search_path),
            extra_dirs,
            platform_dirs: false,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let found = cache
            .entry(name.to_string())
            .or_insert_with(|| self.lookup(name))
            .clone();
        found.ok_or_else(|| EngineError::ToolNotFound {
            tool: name.to_string(),
        })
    }

    pub fn resolve_tool(&self, tool: Tool) -> Result<PathBuf> {
        self.resolve(tool.binary_name())
    }

    pub fn have(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    /// Drops cached lookups, e.g. after installing a tool.
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn lookup(&self, name: &str) -> Option<PathBuf> {
        if let Some(paths) = &self.bundled {
            let bundled = paths.bundled_tool_path(name);
            if bundled.is_file() {
                debug!(tool = name, path = %bundled.display(), "using bundled tool");
                return Some(bundled);
            }
        }

        let on_path = match &self.search_path {
            Some(search) => {
                let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
                which::which_in(name, Some(search), cwd).ok()
            }
            None => which::which(name).ok(),
        };
        if on_path.is_some() {
            return on_path;
        }

        let file_name = with_exe_extension(PathBuf::from(name));
        let mut dirs = self.extra_dirs.clone();
        if self.platform_dirs {
            dirs.extend(known_install_dirs(name));
        }
        dirs.into_iter()
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
    }
}

/// Package-manager shim dirs and vendor default install dirs for `name`.
pub fn known_install_dirs(name: &str) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();

    if cfg!(windows) {
        let env_dir = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        };
        if let Some(local) = env_dir("LOCALAPPDATA") {
            dirs.push(local.join("Microsoft").join("WinGet").join("Links"));
        }
        let program_data =
            env_dir("ProgramData").unwrap_or_else(|| PathBuf::from("C:\\ProgramData"));
        dirs.push(program_data.join("chocolatey").join("bin"));
        if let Some(profile) = env_dir("USERPROFILE") {
            dirs.push(profile.join("scoop").join("shims"));
        }
        let program_dirs: Vec<PathBuf> = ["ProgramFiles", "ProgramFiles(x86)"]
            .iter()
            .filter_map(|k| env_dir(k))
            .collect();
        if name.eq_ignore_ascii_case("mp3gain") {
            for base in program_dirs.iter().rev() {
                dirs.push(base.join("MP3Gain"));
            }
        }
        for base in &program_dirs {
            dirs.push(base.join("FFmpeg").join("bin"));
        }
        return dirs;
    }

    if cfg!(target_os = "macos") {
        dirs.push(PathBuf::from("/opt/homebrew/bin"));
        dirs.push(PathBuf::from("/usr/local/bin"));
    }
    dirs.push(PathBuf::from("/usr/bin"));
    dirs.push(PathBuf::from("/usr/local/bin"));
    dirs
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub tool: Tool,
    pub name: String,
    pub required: bool,
    pub path: Option<String>,
    pub version: Option<String>,
}

pub fn verify_tools(resolver: &ToolResolver, supervisor: &ProcessSupervisor) -> Vec<ToolStatus> {
    Tool::ALL
        .iter()
        .map(|tool| {
            let path = resolver.resolve_tool(*tool).ok();
            let version = path
                .as_deref()
                .and_then(|p| tool_version_first_line(supervisor, p, tool.version_arg()));
            ToolStatus {
                tool: *tool,
                name: tool.binary_name().to_string(),
                required: tool.is_required(),
                path: path.map(|p| p.to_string_lossy().to_string()),
                version,
            }
        })
        .collect()
}

fn tool_version_first_line(
    supervisor: &ProcessSupervisor,
    program: &Path,
    arg: &str,
) -> Option<String> {
    let output = supervisor
        .capture_run(
            &[program.as_os_str(), std::ffi::OsStr::new(arg)],
            Some(VERSION_PROBE_TIMEOUT),
        )
        .ok()?;
    if !output.success() {
        return None;
    }
    let first = output.stdout.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }
    Some(first.to_string())
}

pub fn install_ffmpeg_tools(paths: &AppPaths) -> Result<PathBuf> {
    paths.ensure_dirs()?;

    let destination = paths.ffmpeg_dir();
    std::fs::create_dir_all(&destination)?;

    info!(dest = %destination.display(), "downloading ffmpeg package");
    let download_url = ffmpeg_sidecar::download::ffmpeg_download_url()
        .map_err(|e| EngineError::InstallFailed(e.to_string()))?;
    let archive_path =
        ffmpeg_sidecar::download::download_ffmpeg_package(download_url, &destination)
            .map_err(|e| EngineError::InstallFailed(e.to_string()))?;
    ffmpeg_sidecar::download::unpack_ffmpeg(&archive_path, &destination)
        .map_err(|e| EngineError::InstallFailed(e.to_string()))?;

    let installed = paths.bundled_tool_path("ffmpeg");
    if !installed.is_file() {
        return Err(EngineError::InstallFailed(format!(
            "ffmpeg archive unpacked but {} is missing",
            installed.to_string_lossy()
        )));
    }
    Ok(installed)
}

pub fn install_ytdlp_tools(paths: &AppPaths) -> Result<PathBuf> {
    paths.ensure_dirs()?;

    #[cfg(not(windows))]
    {
        Err(EngineError::InstallFailed(
            "automatic yt-dlp install is only supported on Windows; use your package manager (e.g. `pip install -U yt-dlp`)"
                .to_string(),
        ))
    }

    #[cfg(windows)]
    {
        const YT_DLP_WINDOWS_DOWNLOAD_URL: &str =
            "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp.exe";

        let destination = paths.bundled_tool_path("yt-dlp");
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = destination.with_extension("download");

        info!(dest = %destination.display(), "downloading yt-dlp");
        let resp = ureq::get(YT_DLP_WINDOWS_DOWNLOAD_URL)
            .call()
            .map_err(|e| EngineError::InstallFailed(format!("yt-dlp download failed: {e}")))?;
        let status = resp.status();
        if status.as_u16() >= 400 {
            return Err(EngineError::InstallFailed(format!(
                "yt-dlp download failed (status={status})"
            )));
        }

        {
            let mut reader = resp.into_body().into_reader();
            let mut file = std::fs::File::create(&tmp_path)?;
            std::io::copy(&mut reader, &mut file)?;
            file.flush()?;
        }

        let min_size = 512 * 1024_u64;
        let downloaded_size = std::fs::metadata(&tmp_path).map(|m| m.len()).unwrap_or(0);
        if downloaded_size < min_size {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(EngineError::InstallFailed(
                "downloaded yt-dlp is unexpectedly small".to_string(),
            ));
        }

        if destination.exists() {
            let _ = std::fs::remove_file(&destination);
        }
        if std::fs::rename(&tmp_path, &destination).is_err() {
            std::fs::copy(&tmp_path, &destination)?;
            let _ = std::fs::remove_file(&tmp_path);
        }
        Ok(destination)
    }
}

/// Writes the manual install helper scripts into `dir`.
pub fn write_install_scripts(dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;

    let ps1 = dir.join("install_deps.ps1");
    std::fs::write(
        &ps1,
        "winget source update\n\
         winget install -e --id yt-dlp.yt-dlp --accept-package-agreements --accept-source-agreements\n\
         winget install -e --id Gyan.FFmpeg --accept-package-agreements --accept-source-agreements\n\
         winget install -e --id GlenSawyer.MP3Gain --accept-package-agreements --accept-source-agreements\n",
    )?;

    let sh = dir.join("install_deps.sh");
    let mut file = std::fs::File::create(&sh)?;
    file.write_all(
        b"#!/usr/bin/env bash\nset -euo pipefail\n\
if command -v brew >/dev/null 2>&1; then brew update; brew install yt-dlp ffmpeg mp3gain; exit 0; fi\n\
if command -v apt >/dev/null 2>&1; then sudo apt update; sudo apt install -y yt-dlp ffmpeg mp3gain; exit 0; fi\n\
if command -v dnf >/dev/null 2>&1; then sudo dnf install -y yt-dlp ffmpeg mp3gain; exit 0; fi\n\
if command -v pacman >/dev/null 2>&1; then sudo pacman -S --noconfirm yt-dlp ffmpeg mp3gain; exit 0; fi\n\
echo 'No supported package manager detected (checked brew, apt, dnf, pacman). Install yt-dlp, ffmpeg and mp3gain manually.'\n",
    )?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&sh, std::fs::Permissions::from_mode(0o700));
    }

    Ok(vec![ps1, sh])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_executable(dir: &Path, name: &str) -> PathBuf {
        let path = with_exe_extension(dir.join(name));
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").expect("write fake tool");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .expect("chmod");
        }
        path
    }

    #[test]
    fn resolve_prefers_search_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = dir.path().join("bin");
        let extra = dir.path().join("extra");
        std::fs::create_dir_all(&bin).expect("mkdir");
        std::fs::create_dir_all(&extra).expect("mkdir");
        let on_path = fake_executable(&bin, "yt-dlp");
        fake_executable(&extra, "yt-dlp");

        let resolver = ToolResolver::with_search(bin.clone().into_os_string(), vec![extra]);
        assert_eq!(resolver.resolve("yt-dlp").expect("resolve"), on_path);
    }

    #[test]
    fn resolve_falls_back_to_known_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let empty = dir.path().join("empty");
        let shims = dir.path().join("shims");
        std::fs::create_dir_all(&empty).expect("mkdir");
        std::fs::create_dir_all(&shims).expect("mkdir");
        let shim = fake_executable(&shims, "mp3gain");

        let resolver = ToolResolver::with_search(empty.into_os_string(), vec![shims]);
        assert_eq!(resolver.resolve("mp3gain").expect("resolve"), shim);
        assert!(resolver.have("mp3gain"));
    }

    #[test]
    fn missing_tool_is_tool_not_found_and_cached() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolver = ToolResolver::with_search(dir.path().as_os_str().to_owned(), Vec::new());
        let err = resolver.resolve("notarealtool").expect_err("missing");
        assert!(matches!(err, EngineError::ToolNotFound { ref tool } if tool == "notarealtool"));

        fake_executable(dir.path(), "notarealtool");
        assert!(!resolver.have("notarealtool"), "negative result stays cached");
        resolver.clear_cache();
        assert!(resolver.have("notarealtool"));
    }

    #[test]
    fn bundled_tool_wins_over_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().join("app"));
        paths.ensure_dirs().expect("dirs");
        let bundled = fake_executable(&paths.ffmpeg_dir(), "ffmpeg");

        let resolver = ToolResolver::new(Some(paths));
        assert_eq!(resolver.resolve_tool(Tool::Transcoder).expect("resolve"), bundled);
    }

    #[test]
    fn only_normalizer_is_optional() {
        let optional: Vec<Tool> = Tool::ALL.into_iter().filter(|t| !t.is_required()).collect();
        assert_eq!(optional, vec![Tool::Normalizer]);
    }

    #[test]
    fn install_scripts_are_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let written = write_install_scripts(dir.path()).expect("scripts");
        assert_eq!(written.len(), 2);
        let sh = std::fs::read_to_string(&written[1]).expect("read");
        assert!(sh.contains("mp3gain"));
    }
}
