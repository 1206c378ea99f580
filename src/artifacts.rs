//! Text artifacts derived from a run: cue sheet, playlists and the VLC
//! segment playlist. Renderers are pure; `write_*` put them on disk.

use crate::join::JoinResult;
use crate::tags::{clean_display, ChapterSpan, TrackLabel};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CUE_FRAMES_PER_SECOND: f64 = 75.0;
const MIN_SEGMENT_SECONDS: f64 = 0.1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaylistFormat {
    None,
    #[default]
    M3u8,
    M3u,
    Both,
}

impl PlaylistFormat {
    pub fn writes_m3u8(&self) -> bool {
        matches!(self, PlaylistFormat::M3u8 | PlaylistFormat::Both)
    }

    pub fn writes_m3u(&self) -> bool {
        matches!(self, PlaylistFormat::M3u | PlaylistFormat::Both)
    }
}

/// One track's span inside the joined file.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub label: TrackLabel,
    pub start_seconds: f64,
    pub end_seconds: f64,
}

/// Spans from join offsets: each track runs to the next offset, the last
/// one to the measured total.
pub fn segments_from_join(join: &JoinResult, labels: &[TrackLabel]) -> Vec<Segment> {
    join.entries
        .iter()
        .zip(labels)
        .enumerate()
        .map(|(i, (entry, label))| {
            let end = join
                .entries
                .get(i + 1)
                .map(|next| next.offset_seconds)
                .unwrap_or(join.total_duration_seconds);
            Segment {
                label: label.clone(),
                start_seconds: entry.offset_seconds,
                end_seconds: end.max(entry.offset_seconds),
            }
        })
        .collect()
}

pub fn chapter_spans(segments: &[Segment]) -> Vec<ChapterSpan> {
    segments
        .iter()
        .enumerate()
        .map(|(i, seg)| ChapterSpan {
            element_id: format!("chp{}", i + 1),
            start_ms: seconds_to_ms(seg.start_seconds),
            end_ms: seconds_to_ms(seg.end_seconds),
            label: seg.label.clone(),
        })
        .collect()
}

pub fn render_cue(joined_file_name: &str, title: &str, segments: &[Segment]) -> String {
    let mut lines = vec![format!("TITLE \"{}\"", cue_text(title))];
    if let Some(artist) = segments.first().and_then(|s| s.label.artist.as_deref()) {
        lines.push(format!("PERFORMER \"{}\"", cue_text(artist)));
    }
    lines.push(format!("FILE \"{}\" MP3", cue_text(joined_file_name)));

    for (i, seg) in segments.iter().enumerate() {
        lines.push(format!("  TRACK {:02} AUDIO", i + 1));
        if let Some(artist) = seg.label.artist.as_deref() {
            lines.push(format!("    PERFORMER \"{}\"", cue_text(artist)));
        }
        lines.push(format!("    TITLE \"{}\"", cue_text(&seg.label.title)));
        lines.push(format!("    INDEX 01 {}", cue_timestamp(seg.start_seconds)));
    }
    lines.join("\n") + "\n"
}

/// `mm:ss:ff` at 75 frames per second.
pub fn cue_timestamp(seconds: f64) -> String {
    let fps = CUE_FRAMES_PER_SECOND as u64;
    let frames = (seconds.max(0.0) * CUE_FRAMES_PER_SECOND).round() as u64;
    let mm = frames / (60 * fps);
    let ss = (frames / fps) % 60;
    let ff = frames % fps;
    format!("{mm:02}:{ss:02}:{ff:02}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    pub file_name: String,
    pub duration_seconds: Option<f64>,
    pub label: TrackLabel,
}

pub fn render_m3u8(entries: &[PlaylistEntry]) -> String {
    let mut lines = vec!["#EXTM3U".to_string()];
    for entry in entries {
        let secs = entry
            .duration_seconds
            .map(|d| d.round() as i64)
            .unwrap_or(-1);
        lines.push(format!("#EXTINF:{secs},{}", entry.label.display()));
        lines.push(entry.file_name.clone());
    }
    lines.join("\n") + "\n"
}

pub fn render_m3u(entries: &[PlaylistEntry]) -> String {
    let names: Vec<&str> = entries.iter().map(|e| e.file_name.as_str()).collect();
    names.join("\n") + "\n"
}

/// Latin-1 bytes when every character fits, UTF-8 otherwise.
pub fn encode_legacy(text: &str) -> Vec<u8> {
    let latin1: Option<Vec<u8>> = text
        .chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect();
    latin1.unwrap_or_else(|| text.as_bytes().to_vec())
}

pub fn render_vlc_segments(joined_file_name: &str, segments: &[Segment]) -> String {
    let mut lines = vec!["#EXTM3U".to_string()];
    let mut start = 0.0_f64;
    for seg in segments {
        let span = (seg.end_seconds - seg.start_seconds).max(MIN_SEGMENT_SECONDS);
        let end = start + span;
        let secs = ((end - start).round() as i64).max(1);
        lines.push(format!("#EXTINF:{secs},{}", seg.label.display()));
        lines.push(format!("#EXTVLCOPT:start-time={}", start.round() as i64));
        lines.push(format!("#EXTVLCOPT:stop-time={}", end.round() as i64));
        lines.push(joined_file_name.to_string());
        start = end;
    }
    lines.join("\n") + "\n"
}

/// Writes `<joined stem>.cue` next to the joined file.
pub fn write_cue(joined: &Path, segments: &[Segment]) -> Result<PathBuf> {
    let path = joined.with_extension("cue");
    std::fs::write(
        &path,
        render_cue(&file_name(joined), &stem(joined), segments),
    )?;
    Ok(path)
}

/// Writes `<joined stem>.vlc-segments.m3u` into `dir`.
pub fn write_vlc_segments(dir: &Path, joined: &Path, segments: &[Segment]) -> Result<PathBuf> {
    let path = dir.join(format!("{}.vlc-segments.m3u", stem(joined)));
    std::fs::write(&path, render_vlc_segments(&file_name(joined), segments))?;
    Ok(path)
}

/// Writes `<name>.m3u8` and/or `<name>.m3u` into `dir` per `format`.
pub fn write_playlists(
    dir: &Path,
    name: &str,
    format: PlaylistFormat,
    entries: &[PlaylistEntry],
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    if format.writes_m3u8() {
        let path = dir.join(format!("{name}.m3u8"));
        std::fs::write(&path, render_m3u8(entries))?;
        written.push(path);
    }
    if format.writes_m3u() {
        let path = dir.join(format!("{name}.m3u"));
        std::fs::write(&path, encode_legacy(&render_m3u(entries)))?;
        written.push(path);
    }
    Ok(written)
}

fn cue_text(text: &str) -> String {
    clean_display(text).replace('"', "'")
}

fn seconds_to_ms(seconds: f64) -> u32 {
    (seconds.max(0.0) * 1000.0).round().min(u32::MAX as f64) as u32
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn stem(path: &Path) -> String {
    crate::tracks::file_stem(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::JoinEntry;
    use crate::tracks::TrackFile;

    fn label(title: &str, artist: Option<&str>) -> TrackLabel {
        TrackLabel {
            title: title.to_string(),
            artist: artist.map(str::to_string),
        }
    }

    fn two_track_join() -> JoinResult {
        JoinResult {
            output: PathBuf::from("/out/mix.mp3"),
            entries: vec![
                JoinEntry {
                    track: TrackFile::new("/out/A - One.mp3"),
                    offset_seconds: 0.0,
                    duration_seconds: 10.0,
                },
                JoinEntry {
                    track: TrackFile::new("/out/B - Two.mp3"),
                    offset_seconds: 10.0,
                    duration_seconds: 15.0,
                },
            ],
            total_duration_seconds: 25.0,
        }
    }

    #[test]
    fn segments_follow_offsets() {
        let join = two_track_join();
        let segs = segments_from_join(&join, &[label("One", Some("A")), label("Two", Some("B"))]);
        assert_eq!(segs.len(), 2);
        assert_eq!((segs[0].start_seconds, segs[0].end_seconds), (0.0, 10.0));
        assert_eq!((segs[1].start_seconds, segs[1].end_seconds), (10.0, 25.0));

        let spans = chapter_spans(&segs);
        assert_eq!(spans[1].element_id, "chp2");
        assert_eq!((spans[1].start_ms, spans[1].end_ms), (10_000, 25_000));
    }

    #[test]
    fn cue_sheet_layout() {
        let segs = segments_from_join(
            &two_track_join(),
            &[label("One", Some("A")), label("Two \"live\"", None)],
        );
        let cue = render_cue("mix.mp3", "mix", &segs);
        let expected = "TITLE \"mix\"\n\
PERFORMER \"A\"\n\
FILE \"mix.mp3\" MP3\n\
  TRACK 01 AUDIO\n\
    PERFORMER \"A\"\n\
    TITLE \"One\"\n\
    INDEX 01 00:00:00\n\
  TRACK 02 AUDIO\n\
    TITLE \"Two 'live'\"\n\
    INDEX 01 00:10:00\n";
        assert_eq!(cue, expected);
    }

    #[test]
    fn cue_timestamp_uses_75_fps() {
        assert_eq!(cue_timestamp(0.0), "00:00:00");
        assert_eq!(cue_timestamp(61.5), "01:01:38");
        assert_eq!(cue_timestamp(3599.99), "59:59:74");
    }

    #[test]
    fn extended_playlist_has_extinf() {
        let entries = vec![
            PlaylistEntry {
                file_name: "01 - A - One.mp3".into(),
                duration_seconds: Some(9.6),
                label: label("One", Some("A")),
            },
            PlaylistEntry {
                file_name: "x.mp3".into(),
                duration_seconds: None,
                label: label("#x", None),
            },
        ];
        assert_eq!(
            render_m3u8(&entries),
            "#EXTM3U\n#EXTINF:10,A - One\n01 - A - One.mp3\n#EXTINF:-1,x\nx.mp3\n"
        );
        assert_eq!(render_m3u(&entries), "01 - A - One.mp3\nx.mp3\n");
    }

    #[test]
    fn legacy_encoding_prefers_latin1() {
        assert_eq!(encode_legacy("café\n"), vec![b'c', b'a', b'f', 0xE9, b'\n']);
        assert_eq!(encode_legacy("日本\n"), "日本\n".as_bytes().to_vec());
    }

    #[test]
    fn vlc_segments_repeat_the_joined_file() {
        let segs = segments_from_join(&two_track_join(), &[label("One", None), label("Two", None)]);
        let text = render_vlc_segments("mix.mp3", &segs);
        assert_eq!(
            text,
            "#EXTM3U\n\
#EXTINF:10,One\n#EXTVLCOPT:start-time=0\n#EXTVLCOPT:stop-time=10\nmix.mp3\n\
#EXTINF:15,Two\n#EXTVLCOPT:start-time=10\n#EXTVLCOPT:stop-time=25\nmix.mp3\n"
        );
    }

    #[test]
    fn very_short_segments_are_padded() {
        let segs = vec![Segment {
            label: label("blip", None),
            start_seconds: 0.0,
            end_seconds: 0.0,
        }];
        let text = render_vlc_segments("j.mp3", &segs);
        assert!(text.contains("#EXTINF:1,blip"));
    }

    #[test]
    fn playlists_written_per_format() {
        let dir = tempfile::tempdir().expect("tempdir");
        let entries = vec![PlaylistEntry {
            file_name: "a.mp3".into(),
            duration_seconds: Some(1.0),
            label: label("a", None),
        }];
        let written =
            write_playlists(dir.path(), "run", PlaylistFormat::Both, &entries).expect("write");
        assert_eq!(written, vec![dir.path().join("run.m3u8"), dir.path().join("run.m3u")]);
        let none = write_playlists(dir.path(), "x", PlaylistFormat::None, &entries).expect("write");
        assert!(none.is_empty());
    }
}
