//! ID3 tagging of per-track files and chapter frames for the joined file.

use crate::tracks::TrackFile;
use crate::{EngineError, Result};
use id3::frame::{Chapter, TableOfContents};
use id3::{Frame, Tag, TagLike, Version};
use std::path::Path;
use tracing::debug;

/// Title/artist shown for a track in chapters, cue sheets and playlists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackLabel {
    pub title: String,
    pub artist: Option<String>,
}

impl TrackLabel {
    /// `Artist - Title` (or just the title), safe for one playlist line.
    pub fn display(&self) -> String {
        let joined = match &self.artist {
            Some(artist) => format!("{artist} - {}", self.title),
            None => self.title.clone(),
        };
        clean_display(&joined)
    }
}

/// Strips line breaks and leading `#` so the text cannot start a directive.
pub fn clean_display(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
        .trim_start_matches('#')
        .trim()
        .to_string()
}

fn read_tag(path: &Path) -> Result<Option<Tag>> {
    match Tag::read_from_path(path) {
        Ok(tag) => Ok(Some(tag)),
        Err(err) if matches!(err.kind, id3::ErrorKind::NoTag) => Ok(None),
        Err(err) => Err(EngineError::TagWriteFailed {
            file: path.to_path_buf(),
            detail: err.to_string(),
        }),
    }
}

/// Label from the file's own tags, falling back to what its name says.
pub fn track_label(track: &TrackFile) -> TrackLabel {
    let tag = read_tag(&track.path).ok().flatten();
    let tagged_title = tag
        .as_ref()
        .and_then(|t| t.title())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    let tagged_artist = tag
        .as_ref()
        .and_then(|t| t.artist())
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string);

    TrackLabel {
        title: tagged_title
            .or_else(|| track.title.clone())
            .unwrap_or_else(|| track.stem()),
        artist: tagged_artist.or_else(|| track.artist.clone()),
    }
}

/// Writes title, artist, track number and album when known. Other frames
/// already in the file are kept.
pub fn write_track_tags(track: &TrackFile, album: Option<&str>) -> Result<()> {
    let existing = read_tag(&track.path)?;
    let (mut tag, version) = match existing {
        Some(tag) => {
            let version = tag.version();
            (tag, version)
        }
        None => (Tag::new(), Version::Id3v24),
    };

    if let Some(title) = &track.title {
        tag.set_title(title.as_str());
    }
    if let Some(artist) = &track.artist {
        tag.set_artist(artist.as_str());
    }
    if let Some(album) = album.map(str::trim).filter(|a| !a.is_empty()) {
        tag.set_album(album);
    }
    if let Some(n) = track.track_number {
        tag.set_track(n);
    }

    tag.write_to_path(&track.path, version)
        .map_err(|e| EngineError::TagWriteFailed {
            file: track.path.clone(),
            detail: e.to_string(),
        })?;
    debug!(file = %track.path.display(), "tagged");
    Ok(())
}

/// One chapter of the joined file, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterSpan {
    pub element_id: String,
    pub start_ms: u32,
    pub end_ms: u32,
    pub label: TrackLabel,
}

/// Replaces any chapter frames in `joined` with `chapters` plus a top-level
/// ordered table of contents titled `toc_title`. Saved as ID3v2.3.
pub fn embed_chapters(joined: &Path, chapters: &[ChapterSpan], toc_title: &str) -> Result<()> {
    let mut tag = read_tag(joined)?.unwrap_or_else(Tag::new);
    tag.remove("CHAP");
    tag.remove("CTOC");

    for span in chapters {
        let mut frames = vec![Frame::text("TIT2", span.label.title.as_str())];
        if let Some(artist) = &span.label.artist {
            frames.push(Frame::text("TPE1", artist.as_str()));
        }
        tag.add_frame(Chapter {
            element_id: span.element_id.clone(),
            start_time: span.start_ms,
            end_time: span.end_ms,
            start_offset: u32::MAX,
            end_offset: u32::MAX,
            frames,
        });
    }

    tag.add_frame(TableOfContents {
        element_id: "toc".to_string(),
        top_level: true,
        ordered: true,
        elements: chapters.iter().map(|c| c.element_id.clone()).collect(),
        frames: vec![Frame::text("TIT2", toc_title)],
    });

    tag.write_to_path(joined, Version::Id3v23)
        .map_err(|e| EngineError::TagWriteFailed {
            file: joined.to_path_buf(),
            detail: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_mp3(path: &Path) {
        // An MPEG frame header followed by padding; enough for tag I/O.
        let mut bytes = vec![0xFF, 0xFB, 0x90, 0x64];
        bytes.resize(417, 0);
        std::fs::write(path, bytes).expect("write mp3");
    }

    #[test]
    fn writes_only_derived_fields_and_keeps_others() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("03 - Artist - Song.mp3");
        fake_mp3(&path);

        let mut pre = Tag::new();
        pre.set_genre("Jazz");
        pre.write_to_path(&path, Version::Id3v24).expect("pre-tag");

        let track = TrackFile::new(path.clone());
        write_track_tags(&track, Some("Album X")).expect("tag");

        let tag = Tag::read_from_path(&path).expect("read");
        assert_eq!(tag.title(), Some("Song"));
        assert_eq!(tag.artist(), Some("Artist"));
        assert_eq!(tag.album(), Some("Album X"));
        assert_eq!(tag.track(), Some(3));
        assert_eq!(tag.genre(), Some("Jazz"));
    }

    #[test]
    fn untagged_file_gets_a_fresh_tag_and_label_prefers_tags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("Plain Name.mp3");
        fake_mp3(&path);
        let track = TrackFile::new(path.clone());

        let label = track_label(&track);
        assert_eq!(label.title, "Plain Name");
        assert_eq!(label.artist, None);

        let mut tag = Tag::new();
        tag.set_title("Real Title");
        tag.set_artist("Real Artist");
        tag.write_to_path(&path, Version::Id3v23).expect("write");
        let label = track_label(&track);
        assert_eq!(label.display(), "Real Artist - Real Title");
    }

    #[test]
    fn missing_file_is_tag_write_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let track = TrackFile::new(dir.path().join("gone.mp3"));
        let err = write_track_tags(&track, None).expect_err("must fail");
        assert!(matches!(err, EngineError::TagWriteFailed { .. }));
    }

    #[test]
    fn chapters_and_toc_are_embedded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let joined = dir.path().join("joined.mp3");
        fake_mp3(&joined);

        let spans = vec![
            ChapterSpan {
                element_id: "chp1".into(),
                start_ms: 0,
                end_ms: 10_000,
                label: TrackLabel {
                    title: "One".into(),
                    artist: Some("A".into()),
                },
            },
            ChapterSpan {
                element_id: "chp2".into(),
                start_ms: 10_000,
                end_ms: 25_000,
                label: TrackLabel {
                    title: "Two".into(),
                    artist: None,
                },
            },
        ];
        embed_chapters(&joined, &spans, "joined").expect("embed");
        // Embedding twice must not duplicate frames.
        embed_chapters(&joined, &spans, "joined").expect("embed again");

        let tag = Tag::read_from_path(&joined).expect("read");
        let chapters: Vec<&Chapter> = tag.chapters().collect();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[1].start_time, 10_000);
        assert_eq!(chapters[1].end_time, 25_000);
        let tocs: Vec<&TableOfContents> = tag.tables_of_contents().collect();
        assert_eq!(tocs.len(), 1);
        assert_eq!(tocs[0].elements, vec!["chp1".to_string(), "chp2".to_string()]);
    }

    #[test]
    fn display_is_single_line() {
        let label = TrackLabel {
            title: "Line\nBreak".into(),
            artist: None,
        };
        assert_eq!(label.display(), "Line Break");
        assert_eq!(clean_display("## heading "), "heading");
    }
}
