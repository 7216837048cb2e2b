//! The read-only `tracks` view the engine consumes but never writes to.
//! Ownership of rows in this table belongs entirely to the host library.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Track {
    pub id: i64,
    pub filepath: String,
    pub filename: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub duration_seconds: Option<f64>,
    pub mode: Option<String>,
}

impl Track {
    /// `"Artist - Title"`, falling back to title alone, then the filename.
    pub fn display_name(&self) -> String {
        match (&self.artist, &self.title) {
            (Some(artist), Some(title)) => format!("{artist} - {title}"),
            (None, Some(title)) => title.clone(),
            _ => self.filename.clone(),
        }
    }
}
