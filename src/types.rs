//! Shared result types produced by the Stage-1/Stage-2 matchers and consumed
//! by the mix analyzer and CLI.

use serde::{Deserialize, Serialize};

/// A candidate track match for one query window, produced by C7 or C8.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub track_id: i64,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub filename: String,
    pub filepath: String,
    pub confidence: f32,
    pub query_start_ms: i64,
    pub track_start_ms: i64,
    pub duration_ms: i64,
    pub match_count: usize,
    pub time_stretch_ratio: f32,
}

impl Match {
    /// `"Artist - Title"`, falling back to title alone, then the filename --
    /// the same precedence [`crate::track::Track::display_name`] uses.
    pub fn display_name(&self) -> String {
        match (&self.artist, &self.title) {
            (Some(artist), Some(title)) => format!("{artist} - {title}"),
            (None, Some(title)) => title.clone(),
            _ => self.filename.clone(),
        }
    }
}
