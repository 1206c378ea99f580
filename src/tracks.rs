use serde::Serialize;
use std::path::{Path, PathBuf};

/// One audio file of a run plus what its name says about it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackFile {
    pub path: PathBuf,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub track_number: Option<u32>,
    duration_seconds: Option<f64>,
}

impl TrackFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let mut track = Self {
            path: path.into(),
            artist: None,
            title: None,
            track_number: None,
            duration_seconds: None,
        };
        track.reparse();
        track
    }

    /// Points the track at a renamed file and re-derives its fields.
    pub fn set_path(&mut self, path: PathBuf) {
        self.path = path;
        self.reparse();
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn stem(&self) -> String {
        file_stem(&self.path)
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.duration_seconds
    }

    pub fn set_duration(&mut self, seconds: f64) {
        if seconds.is_finite() && seconds >= 0.0 {
            self.duration_seconds = Some(seconds);
        }
    }

    fn reparse(&mut self) {
        let parsed = parse_track_name(&self.stem());
        self.artist = parsed.artist;
        self.title = parsed.title;
        self.track_number = parsed.track_number;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedName {
    pub artist: Option<String>,
    pub title: Option<String>,
    pub track_number: Option<u32>,
}

/// Splits `[NN - ]Artist - Title`. Anything after the first artist
/// separator belongs to the title; a stem with no separator is all title.
pub fn parse_track_name(stem: &str) -> ParsedName {
    let parts: Vec<&str> = stem.split(" - ").collect();
    let mut first = 0;
    let mut track_number = None;
    if let Some(head) = parts.first() {
        if !head.is_empty() && head.chars().all(|c| c.is_ascii_digit()) {
            track_number = head.parse::<u32>().ok();
            first = 1;
        }
    }

    if parts.len() - first >= 2 {
        let artist = parts[first].trim();
        let title = parts[first + 1..].join(" - ");
        let title = title.trim();
        return ParsedName {
            artist: (!artist.is_empty()).then(|| artist.to_string()),
            title: (!title.is_empty()).then(|| title.to_string()),
            track_number,
        };
    }

    ParsedName {
        artist: None,
        title: Some(stem.to_string()),
        track_number,
    }
}

pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}
