//! The seam between orchestration and the external programs. The pipeline
//! and the join engine only talk to a [`Toolchain`]; [`ExternalToolchain`]
//! drives the real binaries through the process supervisor.

use crate::download::{self, DownloadEvent, DownloadOutcome, DownloadRequest};
use crate::ffmpeg::{self, AudioProbe};
use crate::supervisor::ProcessSupervisor;
use crate::tools::{Tool, ToolResolver};
use crate::{EngineError, Result};
use std::ffi::OsString;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub trait Toolchain: Send + Sync {
    fn available(&self, tool: Tool) -> bool;

    /// Runs the downloader, reporting each output line as an event. A
    /// `Break` from `on_event` stops the download with `Canceled`.
    fn download(
        &self,
        request: &DownloadRequest,
        on_event: &mut dyn FnMut(DownloadEvent) -> ControlFlow<()>,
    ) -> Result<DownloadOutcome>;

    fn transcode_to_wav(&self, input: &Path, output: &Path, sample_rate: u32) -> Result<()>;

    fn concat_wav(&self, manifest: &Path, output: &Path) -> Result<()>;

    fn encode_mp3(&self, input: &Path, output: &Path, bitrate_kbps: u32) -> Result<()>;

    fn probe(&self, input: &Path) -> Result<AudioProbe>;

    /// Applies track gain in place.
    fn normalize(&self, file: &Path) -> Result<()>;
}

pub struct ExternalToolchain {
    resolver: ToolResolver,
    supervisor: Arc<ProcessSupervisor>,
}

impl ExternalToolchain {
    pub fn new(resolver: ToolResolver, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            resolver,
            supervisor,
        }
    }

    pub fn resolver(&self) -> &ToolResolver {
        &self.resolver
    }

    fn run_tool(&self, argv: &[OsString]) -> Result<()> {
        self.supervisor.run_checked(argv, None)?;
        Ok(())
    }
}

impl Toolchain for ExternalToolchain {
    fn available(&self, tool: Tool) -> bool {
        self.resolver.have(tool.binary_name())
    }

    fn download(
        &self,
        request: &DownloadRequest,
        on_event: &mut dyn FnMut(DownloadEvent) -> ControlFlow<()>,
    ) -> Result<DownloadOutcome> {
        let downloader = self.resolver.resolve_tool(Tool::Downloader)?;
        let ffmpeg_dir: Option<PathBuf> = self
            .resolver
            .resolve_tool(Tool::Transcoder)
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf));
        let argv = download::build_args(&downloader, ffmpeg_dir.as_deref(), request);
        info!(url = %request.url, dest = %request.output_dir.display(), "starting download");

        let mut outcome = DownloadOutcome::default();
        let result = self.supervisor.stream_run(
            &argv,
            Some(&request.output_dir),
            request.timeout,
            |line| {
                let event = download::parse_line(line);
                if let DownloadEvent::File(path) = &event {
                    outcome.files.push(path.clone());
                }
                on_event(event)
            },
        );

        match result {
            Ok(output) if output.success() => {}
            Ok(output) => {
                outcome.failure = Some(format!(
                    "yt-dlp exited with code {:?}: {}",
                    output.exit_code, output.stderr_tail
                ));
            }
            Err(EngineError::Canceled) => return Err(EngineError::Canceled),
            Err(err) => outcome.failure = Some(err.to_string()),
        }
        debug!(files = outcome.files.len(), failed = outcome.failure.is_some(), "download finished");
        Ok(outcome)
    }

    fn transcode_to_wav(&self, input: &Path, output: &Path, sample_rate: u32) -> Result<()> {
        let ffmpeg_bin = self.resolver.resolve_tool(Tool::Transcoder)?;
        self.run_tool(&ffmpeg::transcode_to_wav_args(&ffmpeg_bin, input, output, sample_rate))
    }

    fn concat_wav(&self, manifest: &Path, output: &Path) -> Result<()> {
        let ffmpeg_bin = self.resolver.resolve_tool(Tool::Transcoder)?;
        self.run_tool(&ffmpeg::concat_args(&ffmpeg_bin, manifest, output))
    }

    fn encode_mp3(&self, input: &Path, output: &Path, bitrate_kbps: u32) -> Result<()> {
        let ffmpeg_bin = self.resolver.resolve_tool(Tool::Transcoder)?;
        self.run_tool(&ffmpeg::encode_mp3_args(&ffmpeg_bin, input, output, bitrate_kbps))
    }

    fn probe(&self, input: &Path) -> Result<AudioProbe> {
        let ffprobe_bin = self.resolver.resolve_tool(Tool::Prober)?;
        ffmpeg::probe(&self.supervisor, &ffprobe_bin, input)
    }

    fn normalize(&self, file: &Path) -> Result<()> {
        let mp3gain = self.resolver.resolve_tool(Tool::Normalizer)?;
        let mut argv: Vec<OsString> = vec![mp3gain.into_os_string()];
        argv.extend(["-r", "-k", "-p", "-c"].map(OsString::from));
        argv.push(file.into());
        self.run_tool(&argv)
    }
}
