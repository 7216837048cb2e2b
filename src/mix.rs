//! Mix Analyzer (C9): windows a long mix file into overlapping blocks, runs
//! Stage-1 (falling back to Stage-2) per block, then merges per-track
//! matches that are close enough in time to be the same play-through.

use crate::audio::AudioLoader;
use crate::config::{Config, MixConfig};
use crate::cqt;
use crate::cue::CueEntry;
use crate::error::EngineError;
use crate::fingerprint::{self, Fingerprint};
use crate::matcher;
use crate::stage2;
use crate::store::FingerprintStore;
use crate::types::Match;
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

struct Block {
    start_ms: i64,
    samples: Vec<f32>,
}

/// Decode `mix_path`, window it, match each block, and return the merged
/// matches alongside the cue sheet derived from them.
pub async fn analyze_mix(
    store: &FingerprintStore,
    loader: &AudioLoader,
    cfg: &Config,
    mix_path: &Path,
) -> Result<(Vec<Match>, Vec<CueEntry>), EngineError> {
    let samples = loader.load(mix_path, None, None)?;
    let blocks = window_blocks(&samples, cfg.audio.sample_rate, &cfg.mix);

    let sample_rate = cfg.audio.sample_rate;
    let ms_per_frame = cfg.ms_per_frame();
    let fingerprint_cfg = cfg.fingerprint.clone();

    // CPU-bound extraction runs across the worker pool; matching against the
    // store happens afterward on the coordinator so writes stay serialized.
    let extracted: Vec<(i64, Vec<Fingerprint>, Vec<f32>)> = blocks
        .into_par_iter()
        .map(|block| {
            let peaks = cqt::extract_peaks(&block.samples, sample_rate, &fingerprint_cfg);
            let mut fps = fingerprint::encode(&peaks, ms_per_frame, &fingerprint_cfg);
            for fp in &mut fps {
                fp.time_offset_ms += block.start_ms as i32;
            }
            (block.start_ms, fps, block.samples)
        })
        .collect();

    let mut matches = Vec::new();
    for (start_ms, fps, block_samples) in extracted {
        let stage1 = matcher::identify(store, &fps, &cfg.matching).await?;
        if !stage1.is_empty() {
            matches.extend(stage1);
            continue;
        }
        if let Some(mut fallback) = stage2::match_segment(store, loader, cfg, &block_samples).await? {
            fallback.query_start_ms = start_ms;
            matches.push(fallback);
        }
    }

    let merged = merge_matches(matches, cfg.mix.merge_gap_ms);
    let cues = merged.iter().map(to_cue_entry).collect();
    info!(segments = merged.len(), "mix analysis complete");
    Ok((merged, cues))
}

/// Blocks of `segment_s` seconds advancing by `segment_s - overlap_s`; a
/// trailing block shorter than `min_segment_s` is dropped.
fn window_blocks(samples: &[f32], sample_rate: u32, cfg: &MixConfig) -> Vec<Block> {
    let sr = sample_rate as f64;
    let block_len = (cfg.segment_s as f64 * sr).round() as usize;
    let step = ((cfg.segment_s - cfg.overlap_s) as f64 * sr).round().max(1.0) as usize;
    let min_len = (cfg.min_segment_s as f64 * sr).round() as usize;

    let mut blocks = Vec::new();
    let mut start = 0usize;
    while start < samples.len() {
        let end = (start + block_len).min(samples.len());
        if end - start < min_len {
            break;
        }
        blocks.push(Block {
            start_ms: (start as f64 / sr * 1000.0).round() as i64,
            samples: samples[start..end].to_vec(),
        });
        start += step;
    }
    blocks
}

/// Group by `track_id`, then fold adjacent matches (by `query_start_ms`)
/// whose separation is under `merge_gap_ms` into one, per spec: extend
/// duration to span both, keep the max confidence, sum match counts, and
/// average the time-stretch ratio.
fn merge_matches(mut matches: Vec<Match>, merge_gap_ms: i64) -> Vec<Match> {
    matches.sort_by_key(|m| m.query_start_ms);

    let mut by_track: HashMap<i64, Vec<Match>> = HashMap::new();
    for m in matches.drain(..) {
        by_track.entry(m.track_id).or_default().push(m);
    }

    let mut merged = Vec::new();
    for group in by_track.into_values() {
        let mut iter = group.into_iter();
        let Some(mut current) = iter.next() else { continue };
        for next in iter {
            let gap = next.query_start_ms - (current.query_start_ms + current.duration_ms);
            if gap < merge_gap_ms {
                current.duration_ms = (next.query_start_ms + next.duration_ms) - current.query_start_ms;
                current.confidence = current.confidence.max(next.confidence);
                current.match_count += next.match_count;
                current.time_stretch_ratio = (current.time_stretch_ratio + next.time_stretch_ratio) / 2.0;
            } else {
                merged.push(current);
                current = next;
            }
        }
        merged.push(current);
    }

    merged.sort_by_key(|m| m.query_start_ms);
    merged
}

fn to_cue_entry(m: &Match) -> CueEntry {
    CueEntry {
        start_time_ms: m.query_start_ms,
        track_id: m.track_id,
        title: m.title.clone(),
        artist: m.artist.clone(),
        filename: m.filename.clone(),
        confidence: m.confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_match(track_id: i64, start_ms: i64, duration_ms: i64, confidence: f32, count: usize) -> Match {
        Match {
            track_id,
            title: Some("T".into()),
            artist: Some("A".into()),
            filename: "a.mp3".into(),
            filepath: "/music/a.mp3".into(),
            confidence,
            query_start_ms: start_ms,
            track_start_ms: 0,
            duration_ms,
            match_count: count,
            time_stretch_ratio: 1.0,
        }
    }

    #[test]
    fn test_window_blocks_skips_short_tail() {
        let cfg = crate::config::Config::default().mix;
        let samples = vec![0.0f32; (22_050.0 * 32.0) as usize]; // 32s at 22.05kHz
        let blocks = window_blocks(&samples, 22_050, &cfg);
        // one full 30s block, then a 17s-advance tail of ~2s, dropped (< min_segment_s)
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start_ms, 0);
    }

    #[test]
    fn test_window_blocks_two_segments() {
        let cfg = crate::config::Config::default().mix;
        let samples = vec![0.0f32; (22_050.0 * 60.0) as usize]; // 60s
        let blocks = window_blocks(&samples, 22_050, &cfg);
        assert_eq!(blocks.len(), 3); // starts at 0s, 15s, 30s; 45s start has 15s left, dropped
        assert_eq!(blocks[1].start_ms, 15_000);
    }

    #[test]
    fn test_merge_matches_folds_close_segments() {
        let matches = vec![
            base_match(1, 0, 25_000, 0.6, 10),
            base_match(1, 30_000, 25_000, 0.9, 8), // gap = 30_000 - 25_000 = 5_000 < 30_000
        ];
        let merged = merge_matches(matches, 30_000);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].duration_ms, 55_000);
        assert_eq!(merged[0].confidence, 0.9);
        assert_eq!(merged[0].match_count, 18);
    }

    #[test]
    fn test_merge_matches_keeps_distant_segments_separate() {
        let matches = vec![
            base_match(1, 0, 10_000, 0.6, 10),
            base_match(1, 100_000, 10_000, 0.9, 8),
        ];
        let merged = merge_matches(matches, 30_000);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merge_matches_keeps_different_tracks_separate() {
        let matches = vec![base_match(1, 0, 10_000, 0.6, 10), base_match(2, 5_000, 10_000, 0.9, 8)];
        let merged = merge_matches(matches, 30_000);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_two_track_mix_merges_into_two_ordered_segments() {
        // one match per half of a 2-minute mix: track A at 0s, track B at 60s
        let matches = vec![base_match(2, 60_000, 25_000, 0.85, 12), base_match(1, 0, 25_000, 0.8, 15)];
        let merged = merge_matches(matches, 30_000);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].track_id, 1);
        assert_eq!(merged[1].track_id, 2);
        assert!((merged[0].query_start_ms - 0).abs() <= 5_000);
        assert!((merged[1].query_start_ms - 60_000).abs() <= 5_000);
    }
}
