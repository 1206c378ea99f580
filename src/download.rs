//! yt-dlp command lines and the parsing of its machine-readable output.

use crate::cookies::PreparedCookies;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ITEM_PREFIX: &str = "item:";
const FILE_PREFIX: &str = "file:";
const PERCENT_PREFIX: &str = "download:";

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub output_dir: PathBuf,
    pub output_template: String,
    pub sample_rate: u32,
    pub bitrate_kbps: u32,
    pub archive: Option<PathBuf>,
    pub sleep_between_secs: u32,
    pub verbose: bool,
    pub cookies: PreparedCookies,
    pub timeout: Option<Duration>,
}

/// `-o` template: optional `NNN - ` prefix, `Uploader - Title`, optional
/// ` [id]` suffix. The prefix never renders `NA`: it takes the playlist
/// index when there is one, or the download order when fallback is off.
pub fn output_template(numbering: bool, fallback_numbering: bool, include_id: bool) -> String {
    let prefix = match (numbering, fallback_numbering) {
        (false, _) => "",
        (true, true) => "%(playlist_index,autonumber)03d - ",
        (true, false) => "%(autonumber)03d - ",
    };
    let id_suffix = if include_id { " [%(id)s]" } else { "" };
    format!("{prefix}%(uploader,channel)s - %(title)s{id_suffix}.%(ext)s")
}

pub fn build_args(
    downloader: &Path,
    ffmpeg_dir: Option<&Path>,
    request: &DownloadRequest,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![downloader.into()];
    let mut push = |values: &[&str]| args.extend(values.iter().map(OsString::from));

    push(&["--newline", "--progress", "--no-colors"]);
    push(&["--progress-template", "download:%(progress._percent_str)s"]);
    push(&["--print", "before_dl:item:%(playlist_index|1)s/%(playlist_count|1)s"]);
    push(&["--print", "after_move:file:%(filepath)s"]);
    push(&["-x", "--audio-format", "mp3"]);
    push(&["--audio-quality", &format!("{}K", request.bitrate_kbps)]);
    push(&[
        "--postprocessor-args",
        &format!("ffmpeg:-ar {}", request.sample_rate),
    ]);
    push(&["-o", &request.output_template]);
    if request.sleep_between_secs > 0 {
        push(&["--sleep-interval", &request.sleep_between_secs.to_string()]);
    }
    if request.verbose {
        push(&["--verbose"]);
    }

    args.push("-P".into());
    args.push(request.output_dir.clone().into());
    if let Some(archive) = &request.archive {
        args.push("--download-archive".into());
        args.push(archive.clone().into());
    }
    if let Some(dir) = ffmpeg_dir {
        args.push("--ffmpeg-location".into());
        args.push(dir.into());
    }
    match &request.cookies {
        PreparedCookies::None => {}
        PreparedCookies::File(path) => {
            args.push("--cookies".into());
            args.push(path.clone().into());
        }
        PreparedCookies::Browser(name) => {
            args.push("--cookies-from-browser".into());
            args.push(name.into());
        }
    }
    args.push(request.url.clone().into());
    args
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    /// Item `index` (1-based) of `count` is starting.
    Item { index: u32, count: u32 },
    Percent(f64),
    /// A finished file, after post-processing moved it into place.
    File(PathBuf),
    Message(String),
}

pub fn parse_line(line: &str) -> DownloadEvent {
    let trimmed = line.trim();

    if let Some(rest) = trimmed.strip_prefix(FILE_PREFIX) {
        let path = rest.trim();
        if !path.is_empty() {
            return DownloadEvent::File(PathBuf::from(path));
        }
    }
    if let Some(rest) = trimmed.strip_prefix(ITEM_PREFIX) {
        if let Some(event) = parse_item_fraction(rest) {
            return event;
        }
    }
    if let Some(rest) = trimmed.strip_prefix("[download] Downloading item ") {
        if let Some((index, count)) = rest.split_once(" of ") {
            if let (Ok(index), Ok(count)) = (index.trim().parse(), count.trim().parse()) {
                return DownloadEvent::Item { index, count };
            }
        }
    }
    if let Some(pct) = parse_percent(trimmed) {
        return DownloadEvent::Percent(pct);
    }
    DownloadEvent::Message(trimmed.to_string())
}

fn parse_item_fraction(text: &str) -> Option<DownloadEvent> {
    let (index, count) = text.trim().split_once('/')?;
    let index: u32 = index.trim().parse().ok()?;
    let count: u32 = count.trim().parse().ok()?;
    Some(DownloadEvent::Item {
        index: index.max(1),
        count: count.max(index).max(1),
    })
}

fn parse_percent(line: &str) -> Option<f64> {
    let pct_str = if let Some(rest) = line.strip_prefix(PERCENT_PREFIX) {
        rest.trim().trim_end_matches('%')
    } else if line.starts_with("[download]") && line.contains('%') {
        line.split_whitespace()
            .find(|word| word.ends_with('%'))?
            .trim_end_matches('%')
    } else {
        return None;
    };
    let pct: f64 = pct_str.trim().parse().ok()?;
    pct.is_finite().then(|| pct.clamp(0.0, 100.0))
}

/// Tracks overall download completion across playlist items.
#[derive(Debug, Clone, Default)]
pub struct DownloadProgress {
    index: u32,
    count: u32,
    item_percent: f64,
}

impl DownloadProgress {
    pub fn apply(&mut self, event: &DownloadEvent) {
        match event {
            DownloadEvent::Item { index, count } => {
                self.index = *index;
                self.count = *count;
                self.item_percent = 0.0;
            }
            DownloadEvent::Percent(pct) => self.item_percent = *pct,
            DownloadEvent::File(_) | DownloadEvent::Message(_) => {}
        }
    }

    pub fn fraction(&self) -> f64 {
        let count = self.count.max(1) as f64;
        let done = self.index.saturating_sub(1) as f64;
        ((done + self.item_percent / 100.0) / count).clamp(0.0, 1.0)
    }

    pub fn status(&self) -> String {
        if self.count > 1 {
            format!("Downloading {}/{}", self.index, self.count)
        } else {
            "Downloading".to_string()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadOutcome {
    pub files: Vec<PathBuf>,
    /// Set when the downloader did not finish cleanly; `files` still lists
    /// what it completed.
    pub failure: Option<String>,
}
