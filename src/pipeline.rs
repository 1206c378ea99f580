//! One cancellable run: download, post-process, finalize.
//!
//! Runs move through `Idle → Preparing → Downloading → PostProcessing →
//! Finalizing` into one of the terminal states `Done`, `Cancelled` or
//! `Failed`. Post-processing sub-stages are independent and best-effort;
//! only a download or join failure stops its own downstream work.

use crate::artifacts::{self, PlaylistEntry};
use crate::cookies::{self, PreparedCookies};
use crate::download::{self, DownloadEvent, DownloadProgress, DownloadRequest};
use crate::events::{LogLine, ProgressSnapshot, RunReporter};
use crate::join::{self, JoinEvent, JoinRequest, JoinResult};
use crate::manifest::{self, ManifestFile, ManifestLayout, RunManifest};
use crate::rename::{self, MAX_RENAME_ATTEMPTS};
use crate::supervisor::{CancellationToken, ProcessSupervisor};
use crate::tags;
use crate::toolchain::Toolchain;
use crate::tools::Tool;
use crate::tracks::TrackFile;
use crate::{EngineError, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

pub use crate::artifacts::PlaylistFormat;
pub use crate::cookies::CookieSource;

pub const WEIGHT_PREPARING: u32 = 5;
pub const WEIGHT_DOWNLOADING: u32 = 60;
pub const WEIGHT_POST_PROCESSING: u32 = 30;
pub const WEIGHT_FINALIZING: u32 = 5;

pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const MAX_SAMPLE_RATE: u32 = 192_000;
pub const MIN_BITRATE_KBPS: u32 = 32;
pub const MAX_BITRATE_KBPS: u32 = 320;

const ARCHIVE_FILE_NAME: &str = "archive.txt";
const LOG_FILE_NAME: &str = "workbench.log";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    pub url: String,
    pub output_dir: PathBuf,
    pub sample_rate: u32,
    pub bitrate_kbps: u32,

    pub numbering: bool,
    pub fallback_numbering: bool,
    pub include_id: bool,
    pub use_run_subdir: bool,
    pub use_archive: bool,
    pub sleep_between_secs: u32,
    pub verbose_downloader: bool,
    pub download_timeout_secs: Option<u64>,
    pub cookies: CookieSource,

    pub sanitize_names: bool,
    pub embed_metadata: bool,
    /// Album tag; the run directory name when unset.
    pub album: Option<String>,
    pub dedup_artist: bool,
    pub validate_sample_rate: bool,

    pub join: bool,
    pub join_name: String,
    pub shuffle_join: bool,
    pub keep_intermediates: bool,
    pub write_cue: bool,
    pub embed_chapters: bool,
    pub vlc_segments: bool,

    pub normalize: bool,
    pub playlist: PlaylistFormat,
    pub write_log_file: bool,
    pub checksums: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            output_dir: PathBuf::new(),
            sample_rate: 44_100,
            bitrate_kbps: 192,
            numbering: true,
            fallback_numbering: true,
            include_id: false,
            use_run_subdir: true,
            use_archive: false,
            sleep_between_secs: 0,
            verbose_downloader: false,
            download_timeout_secs: None,
            cookies: CookieSource::None,
            sanitize_names: true,
            embed_metadata: true,
            album: None,
            dedup_artist: false,
            validate_sample_rate: true,
            join: false,
            join_name: "joined".to_string(),
            shuffle_join: false,
            keep_intermediates: false,
            write_cue: true,
            embed_chapters: true,
            vlc_segments: false,
            normalize: true,
            playlist: PlaylistFormat::M3u8,
            write_log_file: false,
            checksums: false,
        }
    }
}

impl PipelineOptions {
    pub fn validate(&self) -> Result<()> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(EngineError::InvalidOptions("url is empty".to_string()));
        }
        let parsed = url::Url::parse(url)
            .map_err(|e| EngineError::InvalidOptions(format!("url is invalid: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EngineError::InvalidOptions(format!(
                "url must be http(s), got scheme {:?}",
                parsed.scheme()
            )));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(EngineError::InvalidOptions("output_dir is empty".to_string()));
        }
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(EngineError::InvalidOptions(format!(
                "sample_rate {} is outside {MIN_SAMPLE_RATE}..={MAX_SAMPLE_RATE}",
                self.sample_rate
            )));
        }
        if !(MIN_BITRATE_KBPS..=MAX_BITRATE_KBPS).contains(&self.bitrate_kbps) {
            return Err(EngineError::InvalidOptions(format!(
                "bitrate_kbps {} is outside {MIN_BITRATE_KBPS}..={MAX_BITRATE_KBPS}",
                self.bitrate_kbps
            )));
        }
        if self.join {
            let name = self.join_name.trim();
            if name.is_empty() {
                return Err(EngineError::InvalidOptions(
                    "join_name is empty while join is enabled".to_string(),
                ));
            }
            if name.contains(['/', '\\']) {
                return Err(EngineError::InvalidOptions(
                    "join_name must be a file name, not a path".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// True when a join-derived artifact is requested without join.
    pub fn has_derived_without_join(&self) -> bool {
        !self.join && (self.write_cue || self.embed_chapters || self.vlc_segments)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Preparing,
    Downloading,
    PostProcessing,
    Finalizing,
    Done,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Cancelled | RunState::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            RunState::Idle => 0,
            RunState::Preparing => 1,
            RunState::Downloading => 2,
            RunState::PostProcessing => 3,
            RunState::Finalizing => 4,
            RunState::Done | RunState::Cancelled | RunState::Failed => 5,
        }
    }

    /// Forward-only transitions. `Done` is reached only from `Finalizing`;
    /// `Cancelled` and `Failed` from any non-terminal state.
    pub fn can_advance_to(&self, next: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            RunState::Done => *self == RunState::Finalizing,
            RunState::Cancelled | RunState::Failed => true,
            other => other.rank() > self.rank(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunState::Idle => "Idle",
            RunState::Preparing => "Preparing",
            RunState::Downloading => "Downloading",
            RunState::PostProcessing => "Post-processing",
            RunState::Finalizing => "Finalizing",
            RunState::Done => "Done",
            RunState::Cancelled => "Cancelled",
            RunState::Failed => "Failed",
        }
    }
}

/// Maps the current stage and its completion to an overall percentage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressModel {
    pub post_total: usize,
    pub post_done: usize,
}

impl ProgressModel {
    pub fn percent(&self, state: RunState, fraction: f64) -> u8 {
        let f = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let before_download = WEIGHT_PREPARING as f64;
        let before_post = before_download + WEIGHT_DOWNLOADING as f64;
        let before_final = before_post + WEIGHT_POST_PROCESSING as f64;

        let value = match state {
            RunState::Idle => 0.0,
            RunState::Preparing => WEIGHT_PREPARING as f64 * f,
            RunState::Downloading => before_download + WEIGHT_DOWNLOADING as f64 * f,
            RunState::PostProcessing => {
                let post = if self.post_total == 0 {
                    f
                } else {
                    (self.post_done as f64 + f) / self.post_total as f64
                };
                before_post + WEIGHT_POST_PROCESSING as f64 * post.min(1.0)
            }
            RunState::Finalizing => before_final + WEIGHT_FINALIZING as f64 * f,
            RunState::Done => 100.0,
            RunState::Cancelled | RunState::Failed => before_final,
        };
        value.floor().clamp(0.0, 100.0) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostStage {
    Sanitize,
    Tag,
    Dedup,
    ValidateSampleRate,
    Join,
    DerivedArtifacts,
    Normalize,
    Playlist,
}

impl PostStage {
    pub fn label(&self) -> &'static str {
        match self {
            PostStage::Sanitize => "Sanitizing filenames",
            PostStage::Tag => "Writing tags",
            PostStage::Dedup => "Removing repeated artist names",
            PostStage::ValidateSampleRate => "Validating sample rates",
            PostStage::Join => "Joining",
            PostStage::DerivedArtifacts => "Writing cue/chapters/segments",
            PostStage::Normalize => "Normalizing loudness",
            PostStage::Playlist => "Writing playlists",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub state: RunState,
    pub run_dir: PathBuf,
    pub files: Vec<PathBuf>,
    pub joined: Option<JoinResult>,
    pub manifest: Option<PathBuf>,
    pub errors: Vec<String>,
}

pub struct Pipeline {
    options: Arc<PipelineOptions>,
    toolchain: Arc<dyn Toolchain>,
    supervisor: Arc<ProcessSupervisor>,
}

impl Pipeline {
    /// Rejects invalid options before anything runs.
    pub fn new(
        options: PipelineOptions,
        toolchain: Arc<dyn Toolchain>,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options: Arc::new(options),
            toolchain,
            supervisor,
        })
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn run(&self, reporter: &RunReporter) -> RunOutcome {
        let mut run = Run::new(
            &self.options,
            self.toolchain.as_ref(),
            &self.supervisor,
            reporter,
        );
        run.execute()
    }
}

/// A run on its own worker thread. Poll the two receivers on any timer.
pub struct RunHandle {
    pub logs: Receiver<LogLine>,
    pub progress: Receiver<ProgressSnapshot>,
    supervisor: Arc<ProcessSupervisor>,
    thread: thread::JoinHandle<RunOutcome>,
}

impl RunHandle {
    /// Cancels the run and every process it started.
    pub fn cancel(&self) {
        self.supervisor.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn wait(self) -> thread::Result<RunOutcome> {
        self.thread.join()
    }
}

/// Validates `options`, clears a previous cancellation and starts the run
/// on a dedicated thread.
pub fn spawn_run(
    options: PipelineOptions,
    toolchain: Arc<dyn Toolchain>,
    supervisor: Arc<ProcessSupervisor>,
) -> Result<RunHandle> {
    let pipeline = Pipeline::new(options, toolchain, supervisor.clone())?;
    supervisor.token().reset();
    let (reporter, logs, progress) = RunReporter::channel();
    let thread = thread::Builder::new()
        .name("workbench-run".to_string())
        .spawn(move || pipeline.run(&reporter))?;
    Ok(RunHandle {
        logs,
        progress,
        supervisor,
        thread,
    })
}

struct Run<'a> {
    opts: &'a PipelineOptions,
    toolchain: &'a dyn Toolchain,
    supervisor: &'a ProcessSupervisor,
    token: CancellationToken,
    reporter: &'a RunReporter,

    run_id: String,
    started_at: DateTime<Local>,
    state: RunState,
    progress: ProgressModel,
    run_dir: PathBuf,
    cookies: PreparedCookies,
    have_downloader: bool,
    have_ffmpeg: bool,
    have_normalizer: bool,

    files: Vec<TrackFile>,
    joined: Option<JoinResult>,
    layout: ManifestLayout,
    errors: Vec<String>,
    failed: bool,
}

impl<'a> Run<'a> {
    fn new(
        opts: &'a PipelineOptions,
        toolchain: &'a dyn Toolchain,
        supervisor: &'a ProcessSupervisor,
        reporter: &'a RunReporter,
    ) -> Self {
        Self {
            opts,
            toolchain,
            supervisor,
            token: supervisor.token(),
            reporter,
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Local::now(),
            state: RunState::Idle,
            progress: ProgressModel::default(),
            run_dir: opts.output_dir.clone(),
            cookies: PreparedCookies::None,
            have_downloader: false,
            have_ffmpeg: false,
            have_normalizer: false,
            files: Vec::new(),
            joined: None,
            layout: ManifestLayout::default(),
            errors: Vec::new(),
            failed: false,
        }
    }

    fn execute(&mut self) -> RunOutcome {
        let result = self.run_stages();
        let terminal = match result {
            Err(EngineError::Canceled) => {
                self.reporter.warn("Run cancelled.");
                self.supervisor.cancel_all();
                RunState::Cancelled
            }
            Err(err) => {
                self.record_error(err.to_string());
                RunState::Failed
            }
            Ok(()) if self.failed => RunState::Failed,
            Ok(()) => RunState::Done,
        };

        if terminal != RunState::Cancelled {
            self.advance(RunState::Finalizing);
            self.report(0.0, RunState::Finalizing.label());
        }
        let manifest = self.write_manifest(terminal);
        self.advance(terminal);

        let percent = (terminal == RunState::Done).then_some(100);
        self.reporter
            .progress(percent, Some(terminal.label().to_string()));
        self.reporter.info(format!("Run finished: {}", terminal.label()));
        self.reporter.detach_log_file();

        RunOutcome {
            run_id: self.run_id.clone(),
            state: self.state,
            run_dir: self.run_dir.clone(),
            files: self.files.iter().map(|t| t.path.clone()).collect(),
            joined: self.joined.clone(),
            manifest,
            errors: self.errors.clone(),
        }
    }

    fn run_stages(&mut self) -> Result<()> {
        self.prepare()?;
        self.download()?;
        if self.files.is_empty() {
            self.reporter.info("No new files were downloaded.");
            return Ok(());
        }
        if self.failed {
            self.reporter.warn(format!(
                "Download incomplete; post-processing the {} file(s) that finished.",
                self.files.len()
            ));
        }
        self.post_process()
    }

    fn advance(&mut self, next: RunState) {
        if self.state.can_advance_to(next) {
            debug!(from = ?self.state, to = ?next, "run state");
            self.state = next;
        } else {
            warn!(from = ?self.state, to = ?next, "ignored backward run state transition");
        }
    }

    fn report(&self, fraction: f64, status: &str) {
        self.reporter.progress(
            Some(self.progress.percent(self.state, fraction)),
            Some(status.to_string()),
        );
    }

    fn record_error(&mut self, message: String) {
        self.reporter.error(message.clone());
        self.errors.push(message);
    }

    fn prepare(&mut self) -> Result<()> {
        self.advance(RunState::Preparing);
        self.report(0.0, RunState::Preparing.label());

        self.run_dir = self.create_run_dir()?;
        self.layout.run_dir = self.run_dir.clone();
        if self.opts.write_log_file {
            let log_path = self.run_dir.join(LOG_FILE_NAME);
            match self.reporter.attach_log_file(&log_path) {
                Ok(()) => self.layout.log_file = Some(log_path),
                Err(err) => self.reporter.warn(format!("Could not open run log file: {err}")),
            }
        }
        self.reporter.info(format!("Run {} started", self.run_id));
        self.reporter
            .info(format!("Output folder: {}", self.run_dir.display()));
        if self.opts.has_derived_without_join() {
            self.reporter
                .info("Cue sheet, chapters and segment playlist need join; ignoring them.");
        }

        self.have_downloader = self.toolchain.available(Tool::Downloader);
        self.have_ffmpeg = self.toolchain.available(Tool::Transcoder)
            && self.toolchain.available(Tool::Prober);
        self.have_normalizer = self.toolchain.available(Tool::Normalizer);
        if !self.have_ffmpeg && (self.opts.join || self.opts.validate_sample_rate) {
            self.reporter
                .warn("ffmpeg/ffprobe not found; sample-rate validation and join are disabled.");
        }
        if !self.have_normalizer && self.opts.normalize {
            debug!("mp3gain not found, normalization skipped");
        }

        match cookies::prepare_cookies(&self.opts.cookies, &self.run_dir) {
            Ok(prepared) => {
                match &prepared {
                    PreparedCookies::File(path) => {
                        self.reporter
                            .info(format!("Using cookies file: {}", path.display()));
                        self.layout.cookies = Some(path.clone());
                    }
                    PreparedCookies::Browser(name) => {
                        self.reporter.info(format!("Using cookies from browser: {name}"))
                    }
                    PreparedCookies::None => {}
                }
                self.cookies = prepared;
            }
            Err(err) => {
                self.reporter
                    .warn(format!("Cookies ignored: {err}"));
                self.errors.push(err.to_string());
            }
        }

        self.report(1.0, RunState::Preparing.label());
        self.token.check()
    }

    fn create_run_dir(&self) -> Result<PathBuf> {
        let base = self.opts.output_dir.clone();
        if !self.opts.use_run_subdir {
            std::fs::create_dir_all(&base)?;
            return Ok(base);
        }
        let name = self.started_at.format("run_%Y%m%d_%H%M%S").to_string();
        let mut candidate = base.join(&name);
        let mut n = 0;
        while candidate.exists() {
            n += 1;
            if n > MAX_RENAME_ATTEMPTS {
                return Err(EngineError::RenameExhausted {
                    path: base.join(&name),
                    attempts: MAX_RENAME_ATTEMPTS,
                });
            }
            candidate = base.join(format!("{name}_{n}"));
        }
        std::fs::create_dir_all(&candidate)?;
        Ok(candidate)
    }

    fn download(&mut self) -> Result<()> {
        self.advance(RunState::Downloading);
        self.report(0.0, RunState::Downloading.label());
        if !self.have_downloader {
            self.record_error(
                EngineError::ToolNotFound {
                    tool: Tool::Downloader.binary_name().to_string(),
                }
                .to_string(),
            );
            self.failed = true;
            return Ok(());
        }

        let request = DownloadRequest {
            url: self.opts.url.trim().to_string(),
            output_dir: self.run_dir.clone(),
            output_template: download::output_template(
                self.opts.numbering,
                self.opts.fallback_numbering,
                self.opts.include_id,
            ),
            sample_rate: self.opts.sample_rate,
            bitrate_kbps: self.opts.bitrate_kbps,
            archive: self
                .opts
                .use_archive
                .then(|| self.opts.output_dir.join(ARCHIVE_FILE_NAME)),
            sleep_between_secs: self.opts.sleep_between_secs,
            verbose: self.opts.verbose_downloader,
            cookies: self.cookies.clone(),
            timeout: self.opts.download_timeout_secs.map(Duration::from_secs),
        };

        let reporter = self.reporter;
        let token = self.token.clone();
        let model = self.progress;
        let verbose = self.opts.verbose_downloader;
        let mut tracker = DownloadProgress::default();
        let mut on_event = |event: DownloadEvent| {
            if token.is_canceled() {
                return ControlFlow::Break(());
            }
            tracker.apply(&event);
            match &event {
                DownloadEvent::Item { .. } | DownloadEvent::Percent(_) => {
                    reporter.progress(
                        Some(model.percent(RunState::Downloading, tracker.fraction())),
                        Some(tracker.status()),
                    );
                }
                DownloadEvent::File(path) => {
                    let name = path.file_name().map(|n| n.to_string_lossy().to_string());
                    reporter.info(format!("Downloaded: {}", name.unwrap_or_default()));
                }
                DownloadEvent::Message(line) if line.is_empty() => {}
                DownloadEvent::Message(line) => {
                    if verbose {
                        reporter.info(line.clone());
                    } else {
                        reporter.debug(line.clone());
                    }
                }
            }
            ControlFlow::Continue(())
        };

        let outcome = match self.toolchain.download(&request, &mut on_event) {
            Ok(outcome) => outcome,
            Err(EngineError::Canceled) => return Err(EngineError::Canceled),
            Err(err) => {
                self.record_error(EngineError::DownloadFailed(err.to_string()).to_string());
                self.failed = true;
                return Ok(());
            }
        };
        self.token.check()?;

        let mut seen = HashSet::new();
        for path in outcome.files {
            let path = if path.is_relative() {
                self.run_dir.join(path)
            } else {
                path
            };
            if path.is_file() && seen.insert(path.clone()) {
                self.files.push(TrackFile::new(path));
            }
        }
        self.reporter
            .info(format!("Downloaded {} file(s).", self.files.len()));
        if let Some(failure) = outcome.failure {
            self.record_error(EngineError::DownloadFailed(failure).to_string());
            self.failed = true;
        }
        self.report(1.0, RunState::Downloading.label());
        Ok(())
    }

    fn enabled_post_stages(&self) -> Vec<PostStage> {
        let o = self.opts;
        let join_enabled = o.join && self.have_ffmpeg;
        let mut stages = Vec::new();
        if o.sanitize_names {
            stages.push(PostStage::Sanitize);
        }
        if o.embed_metadata {
            stages.push(PostStage::Tag);
        }
        if o.dedup_artist {
            stages.push(PostStage::Dedup);
        }
        if o.validate_sample_rate && self.have_ffmpeg {
            stages.push(PostStage::ValidateSampleRate);
        }
        if join_enabled {
            stages.push(PostStage::Join);
            if o.write_cue || o.embed_chapters || o.vlc_segments {
                stages.push(PostStage::DerivedArtifacts);
            }
        }
        if o.normalize && self.have_normalizer {
            stages.push(PostStage::Normalize);
        }
        if o.playlist != PlaylistFormat::None {
            stages.push(PostStage::Playlist);
        }
        stages
    }

    fn post_process(&mut self) -> Result<()> {
        self.advance(RunState::PostProcessing);
        let stages = self.enabled_post_stages();
        self.progress = ProgressModel {
            post_total: stages.len(),
            post_done: 0,
        };
        self.report(0.0, RunState::PostProcessing.label());

        for stage in stages {
            self.token.check()?;
            self.report(0.0, stage.label());
            debug!(?stage, "post-processing stage");
            match stage {
                PostStage::Sanitize => self.sanitize_stage()?,
                PostStage::Tag => self.tag_stage()?,
                PostStage::Dedup => self.dedup_stage()?,
                PostStage::ValidateSampleRate => self.validate_stage()?,
                PostStage::Join => self.join_stage()?,
                PostStage::DerivedArtifacts => self.derived_stage()?,
                PostStage::Normalize => self.normalize_stage()?,
                PostStage::Playlist => self.playlist_stage()?,
            }
            self.progress.post_done += 1;
            self.report(0.0, stage.label());
        }
        Ok(())
    }

    fn sanitize_stage(&mut self) -> Result<()> {
        let mut claimed = HashSet::new();
        for i in 0..self.files.len() {
            self.token.check()?;
            let before = self.files[i].file_name();
            match rename::sanitize_file(&mut self.files[i], &mut claimed) {
                Ok(Some(done)) => self
                    .reporter
                    .info(format!("Renamed (sanitized): {} -> {}", done.from, done.to)),
                Ok(None) => {}
                Err(err) => self
                    .reporter
                    .warn(format!("Sanitize/rename failed for {before}: {err}")),
            }
        }
        Ok(())
    }

    fn album_name(&self) -> String {
        self.opts
            .album
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .or_else(|| {
                self.run_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| "Album".to_string())
    }

    fn tag_stage(&mut self) -> Result<()> {
        let album = self.album_name();
        for i in 0..self.files.len() {
            self.token.check()?;
            let track = &self.files[i];
            match tags::write_track_tags(track, Some(&album)) {
                Ok(()) => self.reporter.info(format!(
                    "Tagged: {}  [{} - {}]  (Album: {album})",
                    track.file_name(),
                    track.artist.as_deref().unwrap_or("-"),
                    track.title.clone().unwrap_or_else(|| track.stem()),
                )),
                Err(err) => self.reporter.warn(format!("{err}")),
            }
        }
        Ok(())
    }

    fn dedup_stage(&mut self) -> Result<()> {
        for i in 0..self.files.len() {
            self.token.check()?;
            let before = self.files[i].file_name();
            match rename::dedup_file(&mut self.files[i]) {
                Ok(Some(done)) => self
                    .reporter
                    .info(format!("Renamed (dedup artist): {} -> {}", done.from, done.to)),
                Ok(None) => {}
                Err(err) => self
                    .reporter
                    .warn(format!("Dedup rename failed for {before}: {err}")),
            }
        }
        Ok(())
    }

    fn validate_stage(&mut self) -> Result<()> {
        let expected = self.opts.sample_rate;
        let mut mismatches = Vec::new();
        for i in 0..self.files.len() {
            self.token.check()?;
            let probe = match self.toolchain.probe(&self.files[i].path) {
                Ok(probe) => probe,
                Err(EngineError::Canceled) => return Err(EngineError::Canceled),
                Err(err) => {
                    debug!(file = %self.files[i].path.display(), "probe failed: {err}");
                    continue;
                }
            };
            if let Some(duration) = probe.duration_seconds {
                self.files[i].set_duration(duration);
            }
            if let Some(sr) = probe.sample_rate {
                if sr != expected {
                    mismatches.push((self.files[i].file_name(), sr));
                }
            }
        }
        if !mismatches.is_empty() {
            self.reporter.warn("Validation warnings (sample_rate mismatch):");
            for (name, sr) in mismatches {
                self.reporter
                    .warn(format!(" - {name}: {sr} Hz (expected {expected})"));
            }
        }
        Ok(())
    }

    fn join_stage(&mut self) -> Result<()> {
        let request = JoinRequest {
            files: self.files.clone(),
            output_dir: self.run_dir.clone(),
            output_name: self.opts.join_name.trim().to_string(),
            sample_rate: self.opts.sample_rate,
            bitrate_kbps: self.opts.bitrate_kbps,
            shuffle: self.opts.shuffle_join,
            keep_intermediates: self.opts.keep_intermediates,
        };
        let reporter = self.reporter;
        let model = self.progress;
        let mut on_event = |event: JoinEvent| match event {
            JoinEvent::Progress { fraction, status } => reporter.progress(
                Some(model.percent(RunState::PostProcessing, fraction)),
                Some(status),
            ),
            JoinEvent::Log(line) => reporter.info(line),
        };

        match join::join(self.toolchain, &self.token, request, &mut on_event) {
            Ok(result) => {
                self.reporter.info(format!(
                    "Joined {} file(s) into {} ({:.1}s)",
                    result.entries.len(),
                    result.output.display(),
                    result.total_duration_seconds
                ));
                self.layout.joined = Some(result.output.clone());
                self.joined = Some(result);
                Ok(())
            }
            Err(EngineError::Canceled) => Err(EngineError::Canceled),
            Err(err) => {
                self.record_error(err.to_string());
                self.failed = true;
                Ok(())
            }
        }
    }

    fn derived_stage(&mut self) -> Result<()> {
        let Some(joined) = self.joined.clone() else {
            self.reporter
                .info("Skipping cue/chapters/segment playlist: no joined file.");
            return Ok(());
        };
        let labels: Vec<tags::TrackLabel> = joined
            .entries
            .iter()
            .map(|e| tags::track_label(&e.track))
            .collect();
        let segments = artifacts::segments_from_join(&joined, &labels);

        if self.opts.write_cue {
            match artifacts::write_cue(&joined.output, &segments) {
                Ok(path) => {
                    self.reporter.info(format!("Wrote CUE: {}", display_name(&path)));
                    self.layout.cue = Some(path);
                }
                Err(err) => self.reporter.warn(format!("CUE write failed: {err}")),
            }
        }
        self.token.check()?;
        if self.opts.embed_chapters {
            let spans = artifacts::chapter_spans(&segments);
            let toc_title = crate::tracks::file_stem(&joined.output);
            match tags::embed_chapters(&joined.output, &spans, &toc_title) {
                Ok(()) => self.reporter.info("Embedded ID3 chapters."),
                Err(err) => self.reporter.warn(format!("Chapter embed failed: {err}")),
            }
        }
        self.token.check()?;
        if self.opts.vlc_segments {
            match artifacts::write_vlc_segments(&self.run_dir, &joined.output, &segments) {
                Ok(path) => {
                    self.reporter.info(format!(
                        "Wrote VLC segment playlist: {}",
                        display_name(&path)
                    ));
                    self.layout.segment_playlist = Some(path);
                }
                Err(err) => self
                    .reporter
                    .warn(format!("Segment playlist write failed: {err}")),
            }
        }
        Ok(())
    }

    fn normalize_stage(&mut self) -> Result<()> {
        let mut targets: Vec<PathBuf> = self.files.iter().map(|t| t.path.clone()).collect();
        if let Some(joined) = &self.joined {
            targets.push(joined.output.clone());
        }
        let total = targets.len().max(1) as f64;
        for (i, path) in targets.iter().enumerate() {
            self.token.check()?;
            self.report(i as f64 / total, PostStage::Normalize.label());
            match self.toolchain.normalize(path) {
                Ok(()) => self
                    .reporter
                    .debug(format!("Normalized: {}", display_name(path))),
                Err(EngineError::Canceled) => return Err(EngineError::Canceled),
                Err(err) => self.reporter.warn(format!(
                    "Normalization failed for {}: {err}",
                    display_name(path)
                )),
            }
        }
        Ok(())
    }

    fn playlist_stage(&mut self) -> Result<()> {
        let can_probe = self.have_ffmpeg;
        let mut entries = Vec::with_capacity(self.files.len());
        for track in &self.files {
            self.token.check()?;
            let duration = track.duration_seconds().or_else(|| {
                if can_probe {
                    self.toolchain
                        .probe(&track.path)
                        .ok()
                        .and_then(|p| p.duration_seconds)
                } else {
                    None
                }
            });
            entries.push(PlaylistEntry {
                file_name: track.file_name(),
                duration_seconds: duration,
                label: tags::track_label(track),
            });
        }

        let name = rename::sanitize_component(&self.album_name());
        match artifacts::write_playlists(&self.run_dir, &name, self.opts.playlist, &entries) {
            Ok(paths) => {
                for path in &paths {
                    self.reporter
                        .info(format!("Wrote playlist: {}", display_name(path)));
                }
                self.layout.playlists = paths;
            }
            Err(err) => self.reporter.warn(format!("Playlist write failed: {err}")),
        }
        Ok(())
    }

    fn write_manifest(&mut self, terminal: RunState) -> Option<PathBuf> {
        if !self.run_dir.is_dir() {
            return None;
        }
        let mut files = Vec::with_capacity(self.files.len());
        for track in &self.files {
            let sha256 = if self.opts.checksums && terminal != RunState::Cancelled {
                match manifest::sha256_file_hex(&track.path) {
                    Ok(hex) => Some(hex),
                    Err(err) => {
                        self.reporter
                            .warn(format!("Checksum failed for {}: {err}", track.file_name()));
                        None
                    }
                }
            } else {
                None
            };
            files.push(ManifestFile {
                name: track.file_name(),
                duration_seconds: track.duration_seconds(),
                sha256,
            });
        }

        let record = RunManifest {
            run_id: self.run_id.clone(),
            started_at: self.started_at,
            finished_at: Some(Local::now()),
            state: terminal,
            url: self.opts.url.clone(),
            layout: self.layout.clone(),
            files,
            errors: self.errors.clone(),
            options: serde_json::to_value(self.opts).unwrap_or(serde_json::Value::Null),
        };
        match record.write() {
            Ok(path) => {
                self.reporter
                    .debug(format!("Wrote run manifest: {}", path.display()));
                Some(path)
            }
            Err(err) => {
                self.reporter
                    .warn(format!("Could not write run manifest: {err}"));
                None
            }
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> PipelineOptions {
        PipelineOptions {
            url: "https://www.youtube.com/playlist?list=PL123".to_string(),
            output_dir: PathBuf::from("/tmp/out"),
            ..PipelineOptions::default()
        }
    }

    #[test]
    fn defaults_match_the_documented_profile() {
        let o = PipelineOptions::default();
        assert_eq!(o.sample_rate, 44_100);
        assert_eq!(o.bitrate_kbps, 192);
        assert!(o.numbering && o.fallback_numbering && o.sanitize_names);
        assert!(o.embed_metadata && o.validate_sample_rate && o.normalize);
        assert!(o.write_cue && o.embed_chapters && o.use_run_subdir);
        assert_eq!(o.playlist, PlaylistFormat::M3u8);
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let cases: Vec<(&str, PipelineOptions)> = vec![
            ("empty url", PipelineOptions { url: " ".into(), ..valid() }),
            ("ftp url", PipelineOptions { url: "ftp://x/y".into(), ..valid() }),
            ("not a url", PipelineOptions { url: "youtube".into(), ..valid() }),
            ("no output", PipelineOptions { output_dir: PathBuf::new(), ..valid() }),
            ("low rate", PipelineOptions { sample_rate: 4000, ..valid() }),
            ("high bitrate", PipelineOptions { bitrate_kbps: 640, ..valid() }),
            (
                "empty join name",
                PipelineOptions { join: true, join_name: "  ".into(), ..valid() },
            ),
            (
                "join name path",
                PipelineOptions { join: true, join_name: "a/b".into(), ..valid() },
            ),
        ];
        for (label, opts) in cases {
            assert!(
                matches!(opts.validate(), Err(EngineError::InvalidOptions(_))),
                "{label} should be rejected"
            );
        }
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: PipelineOptions = serde_json::from_str(
            r#"{"url":"https://example.com/v","output_dir":"/music","join":true,
                "playlist":"both","cookies":{"kind":"browser","value":"firefox"}}"#,
        )
        .expect("parse");
        assert!(opts.join);
        assert_eq!(opts.playlist, PlaylistFormat::Both);
        assert_eq!(opts.cookies, CookieSource::Browser("firefox".into()));
        assert_eq!(opts.bitrate_kbps, 192);
    }

    #[test]
    fn states_only_move_forward() {
        use RunState::*;
        assert!(Idle.can_advance_to(Preparing));
        assert!(Preparing.can_advance_to(Downloading));
        assert!(Downloading.can_advance_to(Finalizing));
        assert!(!PostProcessing.can_advance_to(Downloading));
        assert!(!Downloading.can_advance_to(Done));
        assert!(Finalizing.can_advance_to(Done));
        assert!(Downloading.can_advance_to(Cancelled));
        assert!(Preparing.can_advance_to(Failed));
        assert!(!Done.can_advance_to(Failed));
        assert!(!Cancelled.can_advance_to(Finalizing));
    }

    #[test]
    fn progress_weights_add_up() {
        let mut model = ProgressModel::default();
        assert_eq!(model.percent(RunState::Preparing, 1.0), 5);
        assert_eq!(model.percent(RunState::Downloading, 0.5), 35);
        assert_eq!(model.percent(RunState::Downloading, 1.0), 65);

        model.post_total = 3;
        model.post_done = 1;
        assert_eq!(model.percent(RunState::PostProcessing, 0.5), 80);
        model.post_done = 3;
        assert_eq!(model.percent(RunState::PostProcessing, 0.0), 95);
        assert_eq!(model.percent(RunState::Finalizing, 1.0), 100);
        assert_eq!(model.percent(RunState::Done, 0.0), 100);
    }

    #[test]
    fn derived_artifacts_without_join_are_flagged() {
        let o = valid();
        assert!(o.has_derived_without_join());
        let joined = PipelineOptions { join: true, ..valid() };
        assert!(!joined.has_derived_without_join());
    }
}
