//! Stage-1 Matcher (C7): hash-join postings into an offset histogram per
//! candidate track, scoring temporal coherence between the query and the
//! indexed reference without ever decoding reference audio.

use crate::config::MatchingConfig;
use crate::fingerprint::Fingerprint;
use crate::store::FingerprintStore;
use crate::types::Match;
use std::collections::HashMap;

struct Cluster {
    center: f64,
    count: usize,
    min_offset: i64,
    max_offset: i64,
    stddev: f64,
}

/// Score `query` (already in absolute query-timeline milliseconds) against
/// every track with at least one matching hash, returning candidates with
/// `confidence >= cfg.min_confidence` sorted by `(-confidence, -count, track_id)`.
pub async fn identify(
    store: &FingerprintStore,
    query: &[Fingerprint],
    cfg: &MatchingConfig,
) -> Result<Vec<Match>, crate::error::EngineError> {
    if query.is_empty() {
        return Ok(Vec::new());
    }

    let mut query_times_by_hash: HashMap<u32, Vec<i64>> = HashMap::new();
    for fp in query {
        query_times_by_hash
            .entry(fp.hash)
            .or_default()
            .push(fp.time_offset_ms as i64);
    }

    let hashes: Vec<u32> = query_times_by_hash.keys().copied().collect();
    let postings = store.query_fingerprints(&hashes).await?;

    let mut track_offsets: HashMap<i64, Vec<i64>> = HashMap::new();
    for (track_id, db_time, hash) in postings {
        if let Some(query_times) = query_times_by_hash.get(&hash) {
            let entry = track_offsets.entry(track_id).or_default();
            for &qt in query_times {
                entry.push(qt - db_time as i64);
            }
        }
    }

    let mut matches = Vec::new();
    for (track_id, offsets) in track_offsets {
        for cluster in cluster_offsets(&offsets, cfg.bin_width_ms, cfg.min_matches) {
            let match_ratio = cluster.count as f64 / query.len() as f64;
            let tightness_bonus = if cluster.count <= 1 {
                1.0
            } else {
                (1.0 - cluster.stddev / 1000.0).max(0.0)
            };
            let confidence = (match_ratio * 10.0 * (0.5 + 0.5 * tightness_bonus)).min(1.0) as f32;
            if confidence < cfg.min_confidence {
                continue;
            }

            let query_start_ms = cluster.center.max(0.0).round() as i64;
            let track_start_ms = (-cluster.center).max(0.0).round() as i64;
            let duration_ms = cluster.max_offset - cluster.min_offset;

            let track = store.get_track(track_id).await?;
            let (title, artist, filename, filepath) = match track {
                Some(t) => (t.title, t.artist, t.filename, t.filepath),
                None => (None, None, String::new(), String::new()),
            };

            matches.push(Match {
                track_id,
                title,
                artist,
                filename,
                filepath,
                confidence,
                query_start_ms,
                track_start_ms,
                duration_ms,
                match_count: cluster.count,
                time_stretch_ratio: 1.0,
            });
        }
    }

    matches.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap()
            .then(b.match_count.cmp(&a.match_count))
            .then(a.track_id.cmp(&b.track_id))
    });

    Ok(matches)
}

/// Bin `offsets` (ms) into `bin_width_ms`-wide buckets, emitting a cluster
/// for every bucket holding at least `min_matches` offsets.
fn cluster_offsets(offsets: &[i64], bin_width_ms: i64, min_matches: usize) -> Vec<Cluster> {
    let mut buckets: HashMap<i64, Vec<i64>> = HashMap::new();
    for &offset in offsets {
        let bucket = (offset as f64 / bin_width_ms as f64).floor() as i64;
        buckets.entry(bucket).or_default().push(offset);
    }

    buckets
        .into_iter()
        .filter(|(_, bucket_offsets)| bucket_offsets.len() >= min_matches)
        .map(|(bucket, bucket_offsets)| {
            let center = bucket as f64 * bin_width_ms as f64 + bin_width_ms as f64 / 2.0;
            let mean = bucket_offsets.iter().sum::<i64>() as f64 / bucket_offsets.len() as f64;
            let variance = bucket_offsets
                .iter()
                .map(|&o| (o as f64 - mean).powi(2))
                .sum::<f64>()
                / bucket_offsets.len() as f64;
            Cluster {
                center,
                count: bucket_offsets.len(),
                min_offset: *bucket_offsets.iter().min().unwrap(),
                max_offset: *bucket_offsets.iter().max().unwrap(),
                stddev: variance.sqrt(),
            }
        })
        .collect()
}
