//! Joins N audio files into one MP3 while keeping exact per-track offsets.
//!
//! Every input is transcoded to PCM WAV at the target sample rate, the WAVs
//! are concatenated with stream copy and the result is encoded exactly once.
//! Offsets come from the intermediate WAVs, so they describe the samples that
//! actually went into the output.

use crate::error::JoinStage;
use crate::ffmpeg::{concat_manifest_text, wav_duration_seconds};
use crate::supervisor::CancellationToken;
use crate::toolchain::Toolchain;
use crate::tracks::TrackFile;
use crate::{EngineError, Result};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const JOIN_EPSILON_SECONDS: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub files: Vec<TrackFile>,
    pub output_dir: PathBuf,
    /// Output stem; `.mp3` is appended.
    pub output_name: String,
    pub sample_rate: u32,
    pub bitrate_kbps: u32,
    pub shuffle: bool,
    pub keep_intermediates: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinEntry {
    pub track: TrackFile,
    pub offset_seconds: f64,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinResult {
    pub output: PathBuf,
    pub entries: Vec<JoinEntry>,
    pub total_duration_seconds: f64,
}

impl JoinResult {
    pub fn summed_duration_seconds(&self) -> f64 {
        self.entries.iter().map(|e| e.duration_seconds).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinEvent {
    Progress { fraction: f64, status: String },
    Log(String),
}

/// Removes the scratch directory unless told to keep it.
struct WorkDir {
    path: PathBuf,
    keep: bool,
}

impl WorkDir {
    fn create(parent: &Path) -> Result<Self> {
        let path = parent.join(format!(".join-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&path).map_err(|e| EngineError::JoinFailed {
            stage: JoinStage::Transcode,
            file: None,
            detail: format!("could not create work dir: {e}"),
        })?;
        Ok(Self { path, keep: false })
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(err) = std::fs::remove_dir_all(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove join work dir {}: {err}", self.path.display());
            }
        }
    }
}

pub fn join(
    toolchain: &dyn Toolchain,
    token: &CancellationToken,
    request: JoinRequest,
    on_event: &mut dyn FnMut(JoinEvent),
) -> Result<JoinResult> {
    let JoinRequest {
        mut files,
        output_dir,
        output_name,
        sample_rate,
        bitrate_kbps,
        shuffle,
        keep_intermediates,
    } = request;

    if files.is_empty() {
        return Err(EngineError::JoinFailed {
            stage: JoinStage::Manifest,
            file: None,
            detail: "no input files".to_string(),
        });
    }
    if shuffle {
        files.shuffle(&mut rand::rng());
        let order: Vec<String> = files.iter().map(TrackFile::file_name).collect();
        on_event(JoinEvent::Log(format!(
            "Join order randomized: {}",
            order.join(" | ")
        )));
    }

    let mut work = WorkDir::create(&output_dir)?;
    let count = files.len();
    let total_steps = (count + 2) as f64;

    let mut entries = Vec::with_capacity(count);
    let mut wavs = Vec::with_capacity(count);
    let mut offset = 0.0_f64;
    for (idx, track) in files.into_iter().enumerate() {
        token.check()?;
        on_event(JoinEvent::Progress {
            fraction: idx as f64 / total_steps,
            status: format!("Joining: decoding {}/{}", idx + 1, count),
        });

        let wav = work.path.join(format!("{:04}.wav", idx + 1));
        toolchain
            .transcode_to_wav(&track.path, &wav, sample_rate)
            .map_err(stage_error(JoinStage::Transcode, Some(&track.path)))?;
        let duration = measure_wav(toolchain, &wav).ok_or_else(|| EngineError::JoinFailed {
            stage: JoinStage::Transcode,
            file: Some(track.path.clone()),
            detail: "could not measure the transcoded duration".to_string(),
        })?;

        let mut track = track;
        track.set_duration(duration);
        debug!(file = %track.path.display(), offset, duration, "join track");
        entries.push(JoinEntry {
            track,
            offset_seconds: offset,
            duration_seconds: duration,
        });
        offset += duration;
        wavs.push(wav);
    }

    token.check()?;
    on_event(JoinEvent::Progress {
        fraction: wavs.len() as f64 / total_steps,
        status: "Joining: concatenating".to_string(),
    });
    let manifest = work.path.join("concat.txt");
    std::fs::write(&manifest, concat_manifest_text(&wavs))
        .map_err(|e| stage_error(JoinStage::Manifest, None)(EngineError::Io(e)))?;
    let concat_wav = work.path.join("concat.wav");
    toolchain
        .concat_wav(&manifest, &concat_wav)
        .map_err(stage_error(JoinStage::Concat, None))?;

    token.check()?;
    on_event(JoinEvent::Progress {
        fraction: (wavs.len() + 1) as f64 / total_steps,
        status: "Joining: encoding".to_string(),
    });
    let final_path = output_dir.join(format!("{output_name}.mp3"));
    let partial = work.path.join(format!("{output_name}.mp3.partial"));
    toolchain
        .encode_mp3(&concat_wav, &partial, bitrate_kbps)
        .map_err(stage_error(JoinStage::Encode, None))?;

    let summed = offset;
    let measured = toolchain
        .probe(&partial)
        .ok()
        .and_then(|p| p.duration_seconds);
    let total = match measured {
        Some(measured) => {
            if (measured - summed).abs() > JOIN_EPSILON_SECONDS {
                let message = format!(
                    "Joined duration {measured:.2}s differs from the sum of tracks {summed:.2}s"
                );
                warn!("{message}");
                on_event(JoinEvent::Log(message));
            }
            measured
        }
        None => summed,
    };

    token.check()?;
    finalize_output(&partial, &final_path)?;
    work.keep = keep_intermediates;
    if keep_intermediates {
        on_event(JoinEvent::Log(format!(
            "Kept join intermediates in {}",
            work.path.display()
        )));
    }

    on_event(JoinEvent::Progress {
        fraction: 1.0,
        status: "Joining: done".to_string(),
    });
    Ok(JoinResult {
        output: final_path,
        entries,
        total_duration_seconds: total,
    })
}

fn measure_wav(toolchain: &dyn Toolchain, wav: &Path) -> Option<f64> {
    wav_duration_seconds(wav).or_else(|| {
        toolchain
            .probe(wav)
            .ok()
            .and_then(|p| p.duration_seconds)
    })
}

fn finalize_output(partial: &Path, final_path: &Path) -> Result<()> {
    let failed = |detail: String| EngineError::JoinFailed {
        stage: JoinStage::Finalize,
        file: Some(final_path.to_path_buf()),
        detail,
    };
    if final_path.exists() {
        std::fs::remove_file(final_path).map_err(|e| failed(e.to_string()))?;
    }
    std::fs::rename(partial, final_path).map_err(|e| failed(e.to_string()))
}

fn stage_error(stage: JoinStage, file: Option<&Path>) -> impl FnOnce(EngineError) -> EngineError {
    let file = file.map(Path::to_path_buf);
    move |err| match err {
        EngineError::Canceled => EngineError::Canceled,
        other => EngineError::JoinFailed {
            stage,
            file,
            detail: other.to_string(),
        },
    }
}
