use crate::supervisor::ProcessSupervisor;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioProbe {
    pub duration_seconds: Option<f64>,
    pub sample_rate: Option<u32>,
    pub audio_codec: Option<String>,
}

pub fn probe_args(ffprobe: &Path, input: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![ffprobe.into()];
    args.extend(
        [
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ]
        .map(OsString::from),
    );
    args.push(input.into());
    args
}

pub fn probe(supervisor: &ProcessSupervisor, ffprobe: &Path, input: &Path) -> Result<AudioProbe> {
    let output = supervisor.run_checked(&probe_args(ffprobe, input), Some(PROBE_TIMEOUT))?;
    parse_probe(output.stdout.as_bytes())
}

pub fn parse_probe(stdout: &[u8]) -> Result<AudioProbe> {
    let parsed: FfprobeOutput = serde_json::from_slice(stdout)?;

    let audio = parsed.streams.as_ref().and_then(|s| {
        s.iter()
            .find(|st| st.codec_type.as_deref() == Some("audio"))
    });

    let duration_seconds = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .and_then(parse_seconds)
        .or_else(|| audio.and_then(|st| st.duration.as_deref()).and_then(parse_seconds));
    let sample_rate = audio
        .and_then(|st| st.sample_rate.as_deref())
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|sr| *sr > 0);

    Ok(AudioProbe {
        duration_seconds,
        sample_rate,
        audio_codec: audio.and_then(|st| st.codec_name.clone()),
    })
}

/// Every join intermediate shares this layout so stream-copy concat works
/// on a mix of mono and stereo sources.
pub const JOIN_CHANNELS: u32 = 2;

pub fn transcode_to_wav_args(
    ffmpeg: &Path,
    input: &Path,
    output_wav: &Path,
    sample_rate: u32,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![ffmpeg.into(), "-nostdin".into(), "-y".into()];
    args.push("-i".into());
    args.push(input.into());
    args.extend(["-vn", "-ar"].map(OsString::from));
    args.push(sample_rate.to_string().into());
    args.push("-ac".into());
    args.push(JOIN_CHANNELS.to_string().into());
    args.extend(["-c:a", "pcm_s16le"].map(OsString::from));
    args.push(output_wav.into());
    args
}

pub fn concat_args(ffmpeg: &Path, manifest: &Path, output_wav: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![ffmpeg.into(), "-nostdin".into(), "-y".into()];
    args.extend(["-f", "concat", "-safe", "0", "-i"].map(OsString::from));
    args.push(manifest.into());
    args.extend(["-c", "copy"].map(OsString::from));
    args.push(output_wav.into());
    args
}

pub fn encode_mp3_args(
    ffmpeg: &Path,
    input_wav: &Path,
    output: &Path,
    bitrate_kbps: u32,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![ffmpeg.into(), "-nostdin".into(), "-y".into()];
    args.push("-i".into());
    args.push(input_wav.into());
    args.extend(["-codec:a", "libmp3lame", "-b:a"].map(OsString::from));
    args.push(format!("{bitrate_kbps}k").into());
    // The output is written under a temporary name, so the muxer is explicit.
    args.extend(["-f", "mp3"].map(OsString::from));
    args.push(output.into());
    args
}

/// Text of an ffmpeg concat-demuxer list, one `file '<path>'` line per input.
pub fn concat_manifest_text(files: &[PathBuf]) -> String {
    let mut out = String::from("ffconcat version 1.0\n");
    for f in files {
        let path = f.to_string_lossy().replace('\\', "/").replace('\'', "'\\''");
        out.push_str(&format!("file '{path}'\n"));
    }
    out
}

/// Duration of a PCM WAV read from its header, or `None` when unreadable.
pub fn wav_duration_seconds(path: &Path) -> Option<f64> {
    let reader = hound::WavReader::open(path).ok()?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return None;
    }
    Some(reader.duration() as f64 / spec.sample_rate as f64)
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeOutput {
    streams: Option<Vec<FfprobeStream>>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    sample_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

fn parse_seconds(value: &str) -> Option<f64> {
    let seconds: f64 = value.trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineError;

    #[test]
    fn parse_probe_reads_duration_and_sample_rate() {
        let json = br#"{
            "streams": [
                {"codec_type": "video", "codec_name": "mjpeg"},
                {"codec_type": "audio", "codec_name": "mp3", "sample_rate": "44100", "duration": "12.000"}
            ],
            "format": {"format_name": "mp3", "duration": "12.345"}
        }"#;
        let probe = parse_probe(json).expect("parse");
        assert_eq!(probe.sample_rate, Some(44100));
        assert_eq!(probe.audio_codec.as_deref(), Some("mp3"));
        assert!((probe.duration_seconds.expect("duration") - 12.345).abs() < 1e-9);
    }

    #[test]
    fn parse_probe_falls_back_to_stream_duration() {
        let json = br#"{"streams": [{"codec_type": "audio", "duration": "3.5"}], "format": {}}"#;
        let probe = parse_probe(json).expect("parse");
        assert_eq!(probe.duration_seconds, Some(3.5));
        assert_eq!(probe.sample_rate, None);
    }

    #[test]
    fn garbage_probe_output_is_a_json_error() {
        assert!(matches!(parse_probe(b"not json"), Err(EngineError::Json(_))));
    }

    #[test]
    fn concat_manifest_quotes_paths() {
        let text = concat_manifest_text(&[
            PathBuf::from("/tmp/a.wav"),
            PathBuf::from("/tmp/it's.wav"),
        ]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ffconcat version 1.0");
        assert_eq!(lines[1], "file '/tmp/a.wav'");
        assert_eq!(lines[2], "file '/tmp/it'\\''s.wav'");
    }

    #[test]
    fn transcode_args_fix_rate_channels_and_codec() {
        let args = transcode_to_wav_args(
            Path::new("ffmpeg"),
            Path::new("mono.mp3"),
            Path::new("0001.wav"),
            44_100,
        );
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().to_string()).collect();
        assert!(args.windows(2).any(|w| w == ["-ar", "44100"]));
        assert!(args.windows(2).any(|w| w == ["-ac", "2"]));
        assert!(args.windows(2).any(|w| w == ["-c:a", "pcm_s16le"]));
        assert_eq!(args.last().map(String::as_str), Some("0001.wav"));
    }

    #[test]
    fn encode_args_carry_bitrate_and_format() {
        let args = encode_mp3_args(
            Path::new("ffmpeg"),
            Path::new("in.wav"),
            Path::new("out.mp3.partial"),
            192,
        );
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().to_string()).collect();
        assert!(args.windows(2).any(|w| w == ["-b:a", "192k"]));
        assert!(args.windows(2).any(|w| w == ["-f", "mp3"]));
        assert_eq!(args.last().map(String::as_str), Some("out.mp3.partial"));
    }

    #[test]
    fn wav_duration_reads_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tone.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).expect("writer");
        for _ in 0..12000 {
            writer.write_sample(0i16).expect("sample");
        }
        writer.finalize().expect("finalize");

        let secs = wav_duration_seconds(&path).expect("duration");
        assert!((secs - 1.5).abs() < 1e-9);
        assert_eq!(wav_duration_seconds(&dir.path().join("missing.wav")), None);
    }
}
