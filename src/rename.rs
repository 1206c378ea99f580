//! Filename clean-up stages: sanitizing risky characters and collapsing an
//! artist name the downloader repeated.

use crate::paths::numbered_sibling;
use crate::tracks::{file_stem, TrackFile};
use crate::{EngineError, Result};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const MAX_RENAME_ATTEMPTS: usize = 999;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Renamed {
    pub from: String,
    pub to: String,
}

/// Makes a filename stem safe for Windows, shells and old players. The
/// ` - ` separators of the `NN - Artist - Title` convention are kept.
pub fn sanitize_component(name: &str) -> String {
    static RESERVED: OnceLock<Regex> = OnceLock::new();
    static SPACES: OnceLock<Regex> = OnceLock::new();
    static SEPARATOR_RUNS: OnceLock<Regex> = OnceLock::new();

    let reserved = RESERVED.get_or_init(|| {
        Regex::new(r#"[<>:"/\\|?*&;$'()!\[\]{}#%,]"#).expect("reserved chars regex")
    });
    let spaces = SPACES.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"));
    let separator_runs =
        SEPARATOR_RUNS.get_or_init(|| Regex::new(r"[-\s]{2,}").expect("separator regex"));

    let visible: String = name.chars().filter(|c| *c >= ' ' && *c != '\x7f').collect();
    let collapsed = spaces.replace_all(&visible, " ");
    let segments: Vec<String> = collapsed
        .split(" - ")
        .map(|segment| {
            let replaced = reserved.replace_all(segment, "-");
            let collapsed = separator_runs.replace_all(&replaced, " ");
            collapsed
                .trim_matches(|c| matches!(c, ' ' | '.' | '-' | '_'))
                .to_string()
        })
        .filter(|segment| !segment.is_empty())
        .collect();
    if segments.is_empty() {
        "untitled".to_string()
    } else {
        segments.join(" - ")
    }
}

/// First free `<stem>.<ext>`, `<stem>_1.<ext>`, ... next to `original`.
/// `original` itself counts as free.
pub fn free_name(original: &Path, stem: &str) -> Result<PathBuf> {
    let ext = original.extension().map(|e| e.to_string_lossy().to_string());
    let base = match &ext {
        Some(ext) => original.with_file_name(format!("{stem}.{ext}")),
        None => original.with_file_name(stem),
    };
    if !base.exists() || base == original {
        return Ok(base);
    }
    for n in 1..=MAX_RENAME_ATTEMPTS {
        let candidate = numbered_sibling(&base, stem, n);
        if !candidate.exists() || candidate == original {
            return Ok(candidate);
        }
    }
    Err(EngineError::RenameExhausted {
        path: base,
        attempts: MAX_RENAME_ATTEMPTS,
    })
}

/// Sanitizes one file's name in place. `claimed` holds the names already
/// produced in this run so two inputs never end up under one name.
pub fn sanitize_file(track: &mut TrackFile, claimed: &mut HashSet<String>) -> Result<Option<Renamed>> {
    let original = track.path.clone();
    let clean = sanitize_component(&track.stem());
    let mut target = free_name(&original, &clean)?;

    if claimed.contains(&name_of(&target)) {
        let stem = file_stem(&target);
        target = (1..=MAX_RENAME_ATTEMPTS)
            .map(|n| numbered_sibling(&target, &stem, n))
            .find(|c| !c.exists() && !claimed.contains(&name_of(c)))
            .ok_or_else(|| EngineError::RenameExhausted {
                path: target.clone(),
                attempts: MAX_RENAME_ATTEMPTS,
            })?;
    }

    claimed.insert(name_of(&target));
    if target == original {
        return Ok(None);
    }
    std::fs::rename(&original, &target)?;
    let from = track.file_name();
    track.set_path(target);
    Ok(Some(Renamed {
        from,
        to: track.file_name(),
    }))
}

/// `Artist - Artist - Title` (optionally numbered) to `Artist - Title`.
/// Artist names containing hyphens are not recognised.
pub fn dedup_artist_stem(stem: &str) -> Option<String> {
    static NUMBERED: OnceLock<Regex> = OnceLock::new();
    static PLAIN: OnceLock<Regex> = OnceLock::new();

    let numbered = NUMBERED.get_or_init(|| {
        Regex::new(r"^(\d+)\s*-\s*([^-]+?)\s-\s([^-]+?)\s-\s(.+)$").expect("numbered dedup regex")
    });
    let plain = PLAIN.get_or_init(|| {
        Regex::new(r"^([^-]+?)\s-\s([^-]+?)\s-\s(.+)$").expect("plain dedup regex")
    });

    if let Some(caps) = numbered.captures(stem) {
        let (num, first, second, rest) = (&caps[1], &caps[2], &caps[3], &caps[4]);
        if first.to_lowercase() == second.to_lowercase() {
            return Some(format!("{num} - {} - {}", first.trim(), rest.trim()));
        }
    }
    let caps = plain.captures(stem)?;
    let (first, second, rest) = (&caps[1], &caps[2], &caps[3]);
    (first.to_lowercase() == second.to_lowercase())
        .then(|| format!("{} - {}", first.trim(), rest.trim()))
}

/// Applies `dedup_artist_stem`; an existing target leaves the file alone.
pub fn dedup_file(track: &mut TrackFile) -> Result<Option<Renamed>> {
    let Some(new_stem) = dedup_artist_stem(&track.stem()) else {
        return Ok(None);
    };
    let target = match track.path.extension() {
        Some(ext) => track
            .path
            .with_file_name(format!("{new_stem}.{}", ext.to_string_lossy())),
        None => track.path.with_file_name(&new_stem),
    };
    if target.exists() {
        return Ok(None);
    }
    std::fs::rename(&track.path, &target)?;
    let from = track.file_name();
    track.set_path(target);
    Ok(Some(Renamed {
        from,
        to: track.file_name(),
    }))
}

fn name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_and_collapses() {
        assert_eq!(
            sanitize_component("AC/DC: Back in Black (Live!)"),
            "AC-DC Back in Black Live"
        );
        assert_eq!(sanitize_component("001 - Artist - Title"), "001 - Artist - Title");
        assert_eq!(sanitize_component("  ..tab\there.. "), "tabhere");
        assert_eq!(sanitize_component("???"), "untitled");
        assert_eq!(sanitize_component("01 - [Band] - Song?"), "01 - Band - Song");
    }

    #[test]
    fn sanitize_file_renames_and_avoids_collisions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("a*b.mp3");
        std::fs::write(&src, b"x").expect("write");
        std::fs::write(dir.path().join("a-b.mp3"), b"taken").expect("write");

        let mut track = TrackFile::new(src);
        let mut claimed = HashSet::new();
        let renamed = sanitize_file(&mut track, &mut claimed)
            .expect("sanitize")
            .expect("renamed");
        assert_eq!(renamed.from, "a*b.mp3");
        assert_eq!(renamed.to, "a-b_1.mp3");
        assert!(track.path.exists());
    }

    #[test]
    fn clean_name_is_left_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("01 - Artist - Title.mp3");
        std::fs::write(&src, b"x").expect("write");
        let mut track = TrackFile::new(src.clone());
        let mut claimed = HashSet::new();
        assert_eq!(sanitize_file(&mut track, &mut claimed).expect("sanitize"), None);
        assert_eq!(track.path, src);
        assert!(claimed.contains("01 - Artist - Title.mp3"));
    }

    #[test]
    fn free_name_gives_up_past_the_cap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = dir.path().join("orig.mp3");
        std::fs::write(dir.path().join("x.mp3"), b"").expect("write");
        for n in 1..=MAX_RENAME_ATTEMPTS {
            std::fs::write(dir.path().join(format!("x_{n}.mp3")), b"").expect("write");
        }
        let err = free_name(&original, "x").expect_err("exhausted");
        assert!(matches!(
            err,
            EngineError::RenameExhausted { attempts: MAX_RENAME_ATTEMPTS, .. }
        ));
    }

    #[test]
    fn dedup_collapses_repeated_artist() {
        assert_eq!(
            dedup_artist_stem("Artist - artist - Title").as_deref(),
            Some("Artist - Title")
        );
        assert_eq!(
            dedup_artist_stem("001 - Band - Band - Song - Remix").as_deref(),
            Some("001 - Band - Song - Remix")
        );
        assert_eq!(dedup_artist_stem("01 - 01 - Title - x").as_deref(), Some("01 - Title - x"));
        assert_eq!(dedup_artist_stem("Artist - Other - Title"), None);
        assert_eq!(dedup_artist_stem("Artist - Title"), None);
    }

    #[test]
    fn dedup_file_skips_existing_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("A - A - T.mp3");
        std::fs::write(&src, b"x").expect("write");
        std::fs::write(dir.path().join("A - T.mp3"), b"y").expect("write");

        let mut track = TrackFile::new(src.clone());
        assert_eq!(dedup_file(&mut track).expect("dedup"), None);
        assert_eq!(track.path, src);

        std::fs::remove_file(dir.path().join("A - T.mp3")).expect("rm");
        let renamed = dedup_file(&mut track).expect("dedup").expect("renamed");
        assert_eq!(renamed.to, "A - T.mp3");
        assert_eq!(track.artist.as_deref(), Some("A"));
        assert_eq!(track.title.as_deref(), Some("T"));
    }
}
