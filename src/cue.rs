//! Cue sheet rendering (C9 output): a `CueEntry` is a small projection of a
//! merged [`crate::types::Match`], and this module turns a list of them into
//! the banner-delimited text the CLI prints.

const BANNER_WIDTH: usize = 60;

/// A single line in a derived cue sheet. Produced by projecting merged
/// matches; never constructed directly from fingerprints or postings.
#[derive(Debug, Clone, PartialEq)]
pub struct CueEntry {
    pub start_time_ms: i64,
    pub track_id: i64,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub filename: String,
    pub confidence: f32,
}

impl CueEntry {
    pub fn display_name(&self) -> String {
        match (&self.artist, &self.title) {
            (Some(artist), Some(title)) => format!("{artist} - {title}"),
            (None, Some(title)) => title.clone(),
            _ => self.filename.clone(),
        }
    }
}

/// `HH:MM:SS` past the one-hour mark, `MM:SS` otherwise.
fn format_time(ms: i64) -> String {
    let total_seconds = ms.max(0) / 1000;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

fn format_entry(index: usize, entry: &CueEntry) -> String {
    format!(
        "{:2}. [{}] {} ({:.0}%)",
        index,
        format_time(entry.start_time_ms),
        entry.display_name(),
        entry.confidence * 100.0
    )
}

/// Render the full cue sheet: banner, blank line, numbered entries (or
/// `No matches found.` when empty), blank line, closing banner.
pub fn format_cue_sheet(entries: &[CueEntry]) -> String {
    let banner = "=".repeat(BANNER_WIDTH);
    let mut out = String::new();
    out.push_str(&banner);
    out.push('\n');
    out.push('\n');

    if entries.is_empty() {
        out.push_str("No matches found.\n");
    } else {
        for (i, entry) in entries.iter().enumerate() {
            out.push_str(&format_entry(i + 1, entry));
            out.push('\n');
        }
    }

    out.push('\n');
    out.push_str(&banner);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start_ms: i64, confidence: f32) -> CueEntry {
        CueEntry {
            start_time_ms: start_ms,
            track_id: 1,
            title: Some("T".into()),
            artist: Some("A".into()),
            filename: "a.mp3".into(),
            confidence,
        }
    }

    #[test]
    fn test_cue_entry_formats_exactly() {
        assert_eq!(format_entry(1, &entry(0, 0.75)), " 1. [00:00] A - T (75%)");
    }

    #[test]
    fn test_format_time_switches_to_hours() {
        assert_eq!(format_time(65_000), "01:05");
        assert_eq!(format_time(3_665_000), "01:01:05");
    }

    #[test]
    fn test_display_name_falls_back_to_filename() {
        let mut e = entry(0, 0.5);
        e.title = None;
        e.artist = None;
        assert_eq!(e.display_name(), "a.mp3");
    }

    #[test]
    fn test_format_cue_sheet_empty_says_no_matches() {
        let sheet = format_cue_sheet(&[]);
        assert!(sheet.contains("No matches found."));
    }

    #[test]
    fn test_format_cue_sheet_has_closing_banner() {
        let sheet = format_cue_sheet(&[entry(0, 0.9)]);
        let lines: Vec<&str> = sheet.lines().collect();
        assert_eq!(lines.first(), lines.last());
        assert!(lines.first().unwrap().chars().all(|c| c == '='));
    }
}
