use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use workbench_engine::config;
use workbench_engine::events::ProgressSnapshot;
use workbench_engine::paths::AppPaths;
use workbench_engine::pipeline::{self, PipelineOptions, RunState};
use workbench_engine::supervisor::ProcessSupervisor;
use workbench_engine::toolchain::ExternalToolchain;
use workbench_engine::tools::ToolResolver;

fn main() -> Result<(), String> {
    // Run lines are printed below; keep them out of the subscriber output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,run=off")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut options_file: Option<PathBuf> = None;
    let mut save_to: Option<PathBuf> = None;
    let mut base_dir: Option<PathBuf> = None;
    let mut join = false;
    let mut positional: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--options" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--options requires a value".to_string())?;
                options_file = Some(PathBuf::from(v));
            }
            "--save-options" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--save-options requires a value".to_string())?;
                save_to = Some(PathBuf::from(v));
            }
            "--base-dir" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--base-dir requires a value".to_string())?;
                base_dir = Some(PathBuf::from(v));
            }
            "--join" => join = true,
            other if other.starts_with("--") => {
                return Err(format!("unknown arg: {other} (try --help)"))
            }
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    let mut options = match &options_file {
        Some(path) => config::load_options(path).map_err(|e| e.to_string())?,
        None => PipelineOptions::default(),
    };
    match positional.as_slice() {
        [] => {}
        [url] => options.url = url.clone(),
        [url, output_dir] => {
            options.url = url.clone();
            options.output_dir = PathBuf::from(output_dir);
        }
        _ => return Err("expected at most <url> <output-dir> (try --help)".to_string()),
    }
    if join {
        options.join = true;
    }
    options.validate().map_err(|e| e.to_string())?;

    if let Some(path) = &save_to {
        config::save_options(path, &options).map_err(|e| e.to_string())?;
        println!("Saved options to {}", path.to_string_lossy());
    }

    let paths = base_dir.map(AppPaths::new).or_else(AppPaths::from_env);
    let supervisor = Arc::new(ProcessSupervisor::new());
    let toolchain = Arc::new(ExternalToolchain::new(
        ToolResolver::new(paths),
        supervisor.clone(),
    ));

    let handle =
        pipeline::spawn_run(options, toolchain, supervisor.clone()).map_err(|e| e.to_string())?;
    println!("Running. Type q + Enter to cancel.");

    let cancel_supervisor = supervisor.clone();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().eq_ignore_ascii_case("q") {
                println!("Cancelling...");
                cancel_supervisor.cancel();
                break;
            }
        }
    });

    let mut last = ProgressSnapshot::default();
    loop {
        let finished = handle.is_finished();
        while let Ok(line) = handle.logs.recv_timeout(Duration::from_millis(100)) {
            println!("{line}");
        }
        while let Ok(snap) = handle.progress.try_recv() {
            let changed = (snap.percent.is_some() && snap.percent != last.percent)
                || (snap.status.is_some() && snap.status != last.status);
            if snap.percent.is_some() {
                last.percent = snap.percent;
            }
            if snap.status.is_some() {
                last.status = snap.status;
            }
            if changed {
                println!(
                    "[{:>3}%] {}",
                    last.percent.unwrap_or(0),
                    last.status.as_deref().unwrap_or("")
                );
            }
        }
        if finished {
            break;
        }
    }

    let outcome = handle
        .wait()
        .map_err(|_| "run thread panicked".to_string())?;
    println!("Output: {}", outcome.run_dir.to_string_lossy());
    if let Some(manifest) = &outcome.manifest {
        println!("Manifest: {}", manifest.to_string_lossy());
    }
    match outcome.state {
        RunState::Done => Ok(()),
        RunState::Cancelled => Err("run cancelled".to_string()),
        other => Err(format!(
            "run ended as {}: {}",
            other.label(),
            outcome.errors.join("; ")
        )),
    }
}

fn print_help() {
    println!(
        r#"workbench_run

Downloads a playlist or video as MP3 and post-processes it.

Usage:
  cargo run --bin workbench_run -- <url> <output-dir> [--join]
  cargo run --bin workbench_run -- --options pipeline_options.json [<url> [<output-dir>]]

Options:
  --options <file>        Load options JSON (missing fields use defaults)
  --save-options <file>   Write the effective options JSON before running
  --base-dir <path>       App data dir with bundled tools (default: WORKBENCH_BASE_DIR)
  --join                  Join all tracks into one MP3 with cue/chapters

Logging goes to stderr; set RUST_LOG (e.g. RUST_LOG=debug) for more.
"#
    );
}
