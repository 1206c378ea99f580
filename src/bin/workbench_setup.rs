use std::path::PathBuf;

use workbench_engine::paths::AppPaths;
use workbench_engine::supervisor::ProcessSupervisor;
use workbench_engine::tools::{self, ToolResolver};

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut base_dir: Option<PathBuf> = None;
    let mut install_ffmpeg = false;
    let mut install_ytdlp = false;
    let mut scripts_dir: Option<PathBuf> = None;
    let mut force = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--base-dir" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--base-dir requires a value".to_string())?;
                base_dir = Some(PathBuf::from(v));
            }
            "--install-all" => {
                install_ffmpeg = true;
                install_ytdlp = true;
            }
            "--install-ffmpeg" => install_ffmpeg = true,
            "--install-ytdlp" => install_ytdlp = true,
            "--write-scripts" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--write-scripts requires a value".to_string())?;
                scripts_dir = Some(PathBuf::from(v));
            }
            "--force" => force = true,
            other => return Err(format!("unknown arg: {other} (try --help)")),
        }
        i += 1;
    }

    let paths = base_dir
        .map(AppPaths::new)
        .or_else(AppPaths::from_env)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    paths.ensure_dirs().map_err(|e| e.to_string())?;
    println!("Base dir: {}", paths.base_dir.to_string_lossy());

    if let Some(dir) = scripts_dir {
        let written = tools::write_install_scripts(&dir).map_err(|e| e.to_string())?;
        for path in written {
            println!("Wrote {}", path.to_string_lossy());
        }
    }

    let resolver = ToolResolver::new(Some(paths.clone()));
    let supervisor = ProcessSupervisor::new();

    if install_ffmpeg {
        if resolver.have("ffmpeg") && resolver.have("ffprobe") && !force {
            println!("FFmpeg: already available");
        } else {
            println!("FFmpeg: installing...");
            let dir = tools::install_ffmpeg_tools(&paths).map_err(|e| e.to_string())?;
            println!("FFmpeg: installed ({})", dir.to_string_lossy());
        }
    }

    if install_ytdlp {
        if resolver.have("yt-dlp") && !force {
            println!("yt-dlp: already available");
        } else {
            println!("yt-dlp: installing...");
            let path = tools::install_ytdlp_tools(&paths).map_err(|e| e.to_string())?;
            println!("yt-dlp: installed ({})", path.to_string_lossy());
        }
    }

    resolver.clear_cache();
    let mut missing_required = Vec::new();
    for status in tools::verify_tools(&resolver, &supervisor) {
        let kind = if status.required { "required" } else { "optional" };
        match (&status.path, &status.version) {
            (Some(path), Some(version)) => {
                println!("{:<8} OK       {path}  ({version})", status.name)
            }
            (Some(path), None) => println!("{:<8} OK       {path}", status.name),
            (None, _) => {
                println!("{:<8} MISSING  ({kind})", status.name);
                if status.required {
                    missing_required.push(status.name.clone());
                }
            }
        }
    }

    if !missing_required.is_empty() {
        return Err(format!(
            "missing required tools: {} (try --install-all)",
            missing_required.join(", ")
        ));
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"workbench_setup

Verifies the external tools (yt-dlp, ffmpeg, ffprobe, mp3gain) and optionally
installs ffmpeg/yt-dlp into the app data directory.

Usage:
  cargo run --bin workbench_setup
  cargo run --bin workbench_setup -- --install-all
  cargo run --bin workbench_setup -- --write-scripts ./scripts

Options:
  --base-dir <path>        Override base dir (default: WORKBENCH_BASE_DIR or the app data folder)
  --install-all            Install FFmpeg tools and yt-dlp
  --install-ffmpeg         Install FFmpeg tools into <base-dir>/tools/ffmpeg
  --install-ytdlp          Install yt-dlp into <base-dir>/tools/yt-dlp (Windows only)
  --write-scripts <dir>    Write install_deps.ps1 / install_deps.sh into <dir>
  --force                  Reinstall even if present
"#
    );
}
