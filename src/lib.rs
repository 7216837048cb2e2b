//! mixprint - identifies which recorded tracks appear within a continuous DJ
//! mix and produces a time-stamped cue sheet.
//!
//! The pipeline is three stages: acoustic fingerprint extraction (C1-C3),
//! a persistent hash-join index (C5) populated by the indexer (C6), and a
//! two-stage matcher (C7 histogram scoring, falling back to C8's dual-feature
//! sustained-run scorer) that C9 drives across a windowed mix.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use mixprint::{config::Config, Engine};
//!
//! let engine = Engine::connect(Config::default()).await?;
//! let report = engine.index(None, None, |_, _| {}).await?;
//! println!("indexed {} tracks", report.indexed);
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod cqt;
pub mod cue;
pub mod error;
pub mod features;
pub mod fingerprint;
pub mod indexer;
pub mod matcher;
pub mod mix;
pub mod stage2;
pub mod store;
pub mod track;
pub mod types;

use std::path::Path;

use cue::CueEntry;
use error::{EngineError, Result};
use indexer::IndexReport;
use store::{FingerprintStore, Stats};
use track::Track;
use types::Match;

/// The engine's public entry point: an audio loader and a fingerprint store,
/// both constructed once from a [`config::Config`] and reused across calls.
/// Holds no other mutable state; everything that changes lives in the store.
pub struct Engine {
    config: config::Config,
    loader: audio::AudioLoader,
    store: FingerprintStore,
}

impl Engine {
    /// Open (creating if missing) the configured fingerprint store and
    /// return an engine ready to index and identify.
    pub async fn connect(config: config::Config) -> Result<Self> {
        let store = FingerprintStore::connect(&config.store.url, config.store.max_connections).await?;
        let loader = audio::AudioLoader::new(config.audio.sample_rate);
        Ok(Self { config, loader, store })
    }

    pub fn store(&self) -> &FingerprintStore {
        &self.store
    }

    pub fn config(&self) -> &config::Config {
        &self.config
    }

    /// Drive C6: fingerprint and feature-summarize every unindexed track,
    /// optionally filtered by `mode` and capped at `limit`. `on_progress`
    /// is called at the coordinator's bounded reporting rate.
    pub async fn index(
        &self,
        mode: Option<&str>,
        limit: Option<i64>,
        on_progress: impl FnMut(usize, usize),
    ) -> Result<IndexReport> {
        let tracks = self.store.tracks_to_index(mode, limit).await?;
        indexer::index_tracks(&self.store, &self.loader, &self.config, tracks, on_progress).await
    }

    /// Identify `path` as a whole: decode it, extract fingerprints, and run
    /// Stage-1 over the whole track. Returns candidates sorted by
    /// `(-confidence, -match_count, track_id)`.
    pub async fn identify_track(&self, path: &Path) -> Result<Vec<Match>> {
        let samples = self.loader.load(path, None, None)?;
        if samples.is_empty() {
            return Err(EngineError::EmptyAudio);
        }
        let peaks = cqt::extract_peaks(&samples, self.config.audio.sample_rate, &self.config.fingerprint);
        let query = fingerprint::encode(&peaks, self.config.ms_per_frame(), &self.config.fingerprint);
        matcher::identify(&self.store, &query, &self.config.matching).await
    }

    /// Identify a single `[start_ms, end_ms)` window of `path` directly
    /// against Stage-2's dual-feature scorer, bypassing Stage-1 entirely.
    pub async fn identify_segment_by_features(&self, path: &Path, start_ms: i64, end_ms: i64) -> Result<Option<Match>> {
        let offset_s = start_ms as f64 / 1000.0;
        let duration_s = (end_ms - start_ms) as f64 / 1000.0;
        let samples = self.loader.load(path, Some(offset_s), Some(duration_s))?;
        stage2::match_segment(&self.store, &self.loader, &self.config, &samples).await
    }

    /// Drive C9 end to end: window `path` into overlapping blocks, match
    /// each (falling back to Stage-2 on a Stage-1 miss), merge close
    /// matches per track, and return both the merged matches and the cue
    /// sheet derived from them.
    pub async fn analyze_mix(&self, path: &Path) -> Result<(Vec<Match>, Vec<CueEntry>)> {
        mix::analyze_mix(&self.store, &self.loader, &self.config, path).await
    }

    pub async fn stats(&self) -> Result<Stats> {
        self.store.stats().await
    }

    /// Wipe all postings and statuses (the CLI's `clear` command).
    pub async fn clear(&self) -> Result<()> {
        self.store.clear_all().await
    }

    /// Purge every posting, status, and feature row owned by one track.
    pub async fn delete_track(&self, track_id: i64) -> Result<()> {
        self.store.delete_track(track_id).await
    }

    /// Register or update a row in the read-only `tracks` view. Production
    /// callers don't use this -- the host library owns the table -- but a
    /// standalone deployment (or a test) needs some way to seed it.
    pub async fn register_track(&self, track: &Track) -> Result<()> {
        self.store.upsert_track(track).await
    }
}
