//! Indexer (C6): a rayon worker pool computes peaks, hashes, and feature
//! summaries for a batch of tracks in parallel; a single coordinator task
//! persists each result to the store, so postings are never written from more
//! than one place at a time.

use crate::audio::AudioLoader;
use crate::config::{Config, FeatureConfig, FingerprintConfig};
use crate::cqt;
use crate::error::EngineError;
use crate::features;
use crate::fingerprint::{self, Fingerprint};
use crate::store::{FeatureKind, FingerprintStore};
use crate::track::Track;
use rayon::prelude::*;
use tracing::{info, warn};

#[derive(Debug, Default, Clone)]
pub struct IndexReport {
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<(i64, String)>,
}

struct ComputedTrack {
    track_id: i64,
    fingerprints: Vec<Fingerprint>,
    mfcc: Vec<f32>,
    chroma: Vec<f32>,
}

/// Index every track in `tracks`, calling `on_progress(completed, total)`
/// every `cfg.indexing.progress_every` completions (and once more on the
/// final item). A per-track decode/IO failure is recorded in the report and
/// does not abort the rest of the batch; anything else propagates.
pub async fn index_tracks(
    store: &FingerprintStore,
    loader: &AudioLoader,
    cfg: &Config,
    tracks: Vec<Track>,
    mut on_progress: impl FnMut(usize, usize),
) -> Result<IndexReport, EngineError> {
    let total = tracks.len();
    let mut report = IndexReport::default();
    if total == 0 {
        return Ok(report);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.indexing.workers)
        .build()
        .map_err(|e| EngineError::decode("indexer thread pool", anyhow::anyhow!(e)))?;

    let loader = *loader;
    let fingerprint_cfg = cfg.fingerprint.clone();
    let feature_cfg = cfg.features.clone();
    let sample_rate = cfg.audio.sample_rate;
    let ms_per_frame = cfg.ms_per_frame();

    let results: Vec<Result<ComputedTrack, (i64, EngineError)>> = tokio::task::spawn_blocking(move || {
        pool.install(|| {
            tracks
                .par_iter()
                .map(|track| {
                    compute_track(&loader, track, sample_rate, ms_per_frame, &fingerprint_cfg, &feature_cfg)
                })
                .collect()
        })
    })
    .await
    .map_err(|e| EngineError::decode("indexer worker pool", anyhow::anyhow!(e)))?;

    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(computed) if computed.fingerprints.is_empty() => {
                report.skipped += 1;
            }
            Ok(computed) => {
                store
                    .store_fingerprints(computed.track_id, &computed.fingerprints, true)
                    .await?;
                store
                    .store_feature(computed.track_id, FeatureKind::MfccSummary, &computed.mfcc)
                    .await?;
                store
                    .store_feature(computed.track_id, FeatureKind::ChromaSummary, &computed.chroma)
                    .await?;
                report.indexed += 1;
            }
            Err((track_id, err)) => {
                if !err.is_per_track() {
                    return Err(err);
                }
                warn!(track_id, %err, "failed to index track");
                report.failed += 1;
                report.failures.push((track_id, err.to_string()));
            }
        }

        if (i + 1) % cfg.indexing.progress_every == 0 || i + 1 == total {
            on_progress(i + 1, total);
        }
    }

    info!(
        indexed = report.indexed,
        skipped = report.skipped,
        failed = report.failed,
        "indexing batch complete"
    );
    Ok(report)
}

fn compute_track(
    loader: &AudioLoader,
    track: &Track,
    sample_rate: u32,
    ms_per_frame: f64,
    fingerprint_cfg: &FingerprintConfig,
    feature_cfg: &FeatureConfig,
) -> Result<ComputedTrack, (i64, EngineError)> {
    let samples = loader
        .load(std::path::Path::new(&track.filepath), None, None)
        .map_err(|e| (track.id, e))?;
    if samples.is_empty() {
        return Err((track.id, EngineError::EmptyAudio));
    }

    let peaks = cqt::extract_peaks(&samples, sample_rate, fingerprint_cfg);
    let fingerprints = fingerprint::encode(&peaks, ms_per_frame, fingerprint_cfg);
    let mfcc = features::mfcc_summary(&samples, sample_rate, feature_cfg);
    let chroma = features::chroma_summary(&samples, sample_rate, feature_cfg);

    Ok(ComputedTrack {
        track_id: track.id,
        fingerprints,
        mfcc,
        chroma,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FingerprintStore;

    #[tokio::test]
    async fn test_index_tracks_empty_batch_is_noop() {
        let store = FingerprintStore::connect("sqlite::memory:", 1).await.unwrap();
        let loader = AudioLoader::new(22_050);
        let cfg = Config::default();
        let report = index_tracks(&store, &loader, &cfg, vec![], |_, _| {}).await.unwrap();
        assert_eq!(report.indexed, 0);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_index_tracks_missing_file_is_counted_not_fatal() {
        let store = FingerprintStore::connect("sqlite::memory:", 1).await.unwrap();
        let loader = AudioLoader::new(22_050);
        let mut cfg = Config::default();
        cfg.indexing.workers = 1;
        cfg.indexing.progress_every = 1;

        let track = Track {
            id: 1,
            filepath: "/nonexistent/does-not-exist.mp3".into(),
            filename: "does-not-exist.mp3".into(),
            title: None,
            artist: None,
            duration_seconds: None,
            mode: None,
        };
        store.upsert_track(&track).await.unwrap();

        let mut calls = Vec::new();
        let report = index_tracks(&store, &loader, &cfg, vec![track], |done, total| {
            calls.push((done, total));
        })
        .await
        .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.indexed, 0);
        assert_eq!(calls, vec![(1, 1)]);
    }
}
