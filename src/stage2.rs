//! Stage-2 Matcher (C8): a dual-feature fallback invoked when Stage-1 finds
//! no confident hash match. Screens candidates by cosine similarity over
//! cheap per-track summaries, then re-ranks the survivors by the longest
//! sustained run of frame-level agreement against the reference audio.

use crate::audio::AudioLoader;
use crate::config::Config;
use crate::error::EngineError;
use crate::features;
use crate::store::{FeatureKind, FingerprintStore};
use crate::types::Match;
use ndarray::{Array2, ArrayView1};
use std::path::Path;

/// Identify `query_samples` (already decoded at the engine sample rate)
/// against every track with stored MFCC and chroma summaries. Returns `None`
/// if the query has zero-norm features or no candidate achieves a positive
/// sustained-run score.
pub async fn match_segment(
    store: &FingerprintStore,
    loader: &AudioLoader,
    cfg: &Config,
    query_samples: &[f32],
) -> Result<Option<Match>, EngineError> {
    let qm = features::mfcc_summary(query_samples, cfg.audio.sample_rate, &cfg.features);
    let qc = features::chroma_summary(query_samples, cfg.audio.sample_rate, &cfg.features);
    if norm(&qm) < 1e-12 || norm(&qc) < 1e-12 {
        return Ok(None);
    }
    let query_combined = normalized_concat(&qm, &qc);

    let mfcc_all = store.get_all_audio_features(FeatureKind::MfccSummary).await?;
    let chroma_all = store.get_all_audio_features(FeatureKind::ChromaSummary).await?;

    let mut screened: Vec<(i64, f32)> = mfcc_all
        .iter()
        .filter_map(|(track_id, m)| {
            let c = chroma_all.get(track_id)?;
            if norm(m) < 1e-12 || norm(c) < 1e-12 {
                return None;
            }
            let reference_combined = normalized_concat(m, c);
            Some((*track_id, cosine(&query_combined, &reference_combined)))
        })
        .collect();
    screened.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
    screened.truncate(cfg.stage2.screen_top_n);

    let query_combined_frames = features::combined_frame_features(query_samples, cfg.audio.sample_rate, &cfg.features);
    let query_chroma_frames = features::chroma_frame_features(query_samples, cfg.audio.sample_rate, &cfg.features);

    let mut best: Option<(i64, usize, f32)> = None;
    for (track_id, _) in screened {
        let Some(track) = store.get_track(track_id).await? else { continue };
        let samples = match loader.load(Path::new(&track.filepath), None, None) {
            Ok(s) if !s.is_empty() => s,
            _ => continue,
        };

        let ref_combined_frames = features::combined_frame_features(&samples, cfg.audio.sample_rate, &cfg.features);
        let ref_chroma_frames = features::chroma_frame_features(&samples, cfg.audio.sample_rate, &cfg.features);
        if ref_combined_frames.ncols() < cfg.stage2.min_overlap {
            continue;
        }

        let (combined_run, combined_avg) = best_sliding_run(
            &query_combined_frames,
            &ref_combined_frames,
            cfg.stage2.combined_threshold,
            cfg.stage2.slide_step,
            cfg.stage2.min_overlap,
        );
        let (chroma_run, chroma_avg) = best_sliding_run(
            &query_chroma_frames,
            &ref_chroma_frames,
            cfg.stage2.chroma_threshold,
            cfg.stage2.slide_step,
            cfg.stage2.min_overlap,
        );

        let final_score = combined_run.min(chroma_run);
        if final_score == 0 {
            continue;
        }
        let final_avg = combined_avg.min(chroma_avg);

        if best.as_ref().map_or(true, |&(_, len, _)| final_score > len) {
            best = Some((track_id, final_score, final_avg));
        }
    }

    let Some((track_id, run_len, avg_sim)) = best else {
        return Ok(None);
    };

    let track = store.get_track(track_id).await?;
    let hop = cfg.features.hop as f64;
    let sr = cfg.audio.sample_rate as f64;
    let duration_ms = (run_len as f64 * hop / sr * 1000.0).round() as i64;
    let (title, artist, filename, filepath) = match track {
        Some(t) => (t.title, t.artist, t.filename, t.filepath),
        None => (None, None, String::new(), String::new()),
    };

    Ok(Some(Match {
        track_id,
        title,
        artist,
        filename,
        filepath,
        confidence: avg_sim.clamp(0.0, 1.0),
        query_start_ms: 0,
        track_start_ms: 0,
        duration_ms,
        match_count: run_len,
        time_stretch_ratio: 1.0,
    }))
}

/// Slide `query`'s frames across `reference` in steps of `slide_step`
/// columns, keeping every alignment with at least `min_overlap` overlapping
/// columns, and return the longest contiguous run of column similarities
/// at or above `threshold` seen at any alignment (and its average).
fn best_sliding_run(
    query: &Array2<f32>,
    reference: &Array2<f32>,
    threshold: f32,
    slide_step: usize,
    min_overlap: usize,
) -> (usize, f32) {
    let (n_q, n_r) = (query.ncols(), reference.ncols());
    if n_q == 0 || n_r < min_overlap {
        return (0, 0.0);
    }

    let mut best_len = 0usize;
    let mut best_avg = 0.0f32;
    let mut offset = 0usize;
    while offset < n_r {
        let overlap = n_q.min(n_r - offset);
        if overlap < min_overlap {
            break;
        }
        let sims: Vec<f32> = (0..overlap)
            .map(|i| unit_cosine(query.column(i), reference.column(offset + i)))
            .collect();
        let (len, avg) = longest_run_above(&sims, threshold);
        if len > best_len {
            best_len = len;
            best_avg = avg;
        }
        offset += slide_step;
    }

    (best_len, best_avg)
}

/// Columns from [`features::combined_frame_features`]/[`features::chroma_frame_features`]
/// are already unit-norm, so their cosine similarity is a plain dot product.
fn unit_cosine(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.dot(&b)
}

fn longest_run_above(sims: &[f32], threshold: f32) -> (usize, f32) {
    let mut best_len = 0usize;
    let mut best_avg = 0.0f32;
    let mut cur_len = 0usize;
    let mut cur_sum = 0.0f32;

    for &s in sims {
        if s >= threshold {
            cur_len += 1;
            cur_sum += s;
            if cur_len > best_len {
                best_len = cur_len;
                best_avg = cur_sum / cur_len as f32;
            }
        } else {
            cur_len = 0;
            cur_sum = 0.0;
        }
    }
    (best_len, best_avg)
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn normalized_concat(a: &[f32], b: &[f32]) -> Vec<f32> {
    let (na, nb) = (norm(a), norm(b));
    a.iter()
        .map(|x| x / na)
        .chain(b.iter().map(|x| x / nb))
        .collect()
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let (na, nb) = (norm(a), norm(b));
    if na < 1e-12 || nb < 1e-12 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_run_above_threshold() {
        let sims = vec![0.9, 0.9, 0.3, 0.95, 0.95, 0.95, 0.1];
        let (len, avg) = longest_run_above(&sims, 0.8);
        assert_eq!(len, 3);
        assert!((avg - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_longest_run_above_threshold_no_run() {
        let sims = vec![0.1, 0.2, 0.3];
        assert_eq!(longest_run_above(&sims, 0.8), (0, 0.0));
    }

    #[test]
    fn test_cosine_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector_is_zero() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_best_sliding_run_respects_min_overlap() {
        let query = Array2::from_shape_fn((2, 40), |(r, _)| if r == 0 { 1.0 } else { 0.0 });
        let reference = Array2::from_shape_fn((2, 10), |(r, _)| if r == 0 { 1.0 } else { 0.0 });
        let (len, _) = best_sliding_run(&query, &reference, 0.5, 5, 30);
        assert_eq!(len, 0);
    }

    #[test]
    fn test_best_sliding_run_finds_full_match() {
        let data = Array2::from_shape_fn((2, 40), |(r, _)| if r == 0 { 1.0 } else { 0.0 });
        let (len, avg) = best_sliding_run(&data, &data, 0.8, 5, 30);
        assert_eq!(len, 40);
        assert!((avg - 1.0).abs() < 1e-6);
    }

    fn write_tone(dir: &std::path::Path, name: &str, freq: f32, sample_rate: u32, secs: f32) -> std::path::PathBuf {
        let path = dir.join(name);
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        let n = (sample_rate as f32 * secs) as usize;
        for i in 0..n {
            let s = (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin();
            writer.write_sample((s * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    async fn seeded_store(cfg: &crate::config::Config, dir: &std::path::Path) -> FingerprintStore {
        use crate::track::Track;

        let store = FingerprintStore::connect("sqlite::memory:", 2).await.unwrap();
        let loader = AudioLoader::new(cfg.audio.sample_rate);

        for (id, (name, freq)) in [("low.wav", 220.0f32), ("high.wav", 880.0f32)].iter().enumerate() {
            let id = id as i64 + 1;
            let path = write_tone(dir, name, *freq, cfg.audio.sample_rate, 6.0);
            store
                .upsert_track(&Track {
                    id,
                    filepath: path.display().to_string(),
                    filename: name.to_string(),
                    title: Some(name.to_string()),
                    artist: Some("Fixture".into()),
                    duration_seconds: Some(6.0),
                    mode: None,
                })
                .await
                .unwrap();
            let samples = loader.load(&path, None, None).unwrap();
            let mfcc = features::mfcc_summary(&samples, cfg.audio.sample_rate, &cfg.features);
            let chroma = features::chroma_summary(&samples, cfg.audio.sample_rate, &cfg.features);
            store.store_feature(id, FeatureKind::MfccSummary, &mfcc).await.unwrap();
            store.store_feature(id, FeatureKind::ChromaSummary, &chroma).await.unwrap();
        }

        store
    }

    #[tokio::test]
    async fn test_match_segment_prefers_matching_reference() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = crate::config::Config::default();
        let store = seeded_store(&cfg, dir.path()).await;
        let loader = AudioLoader::new(cfg.audio.sample_rate);

        // Query is the same 880Hz tone as track 2: should win over track 1's 220Hz tone.
        let query_path = write_tone(dir.path(), "query.wav", 880.0, cfg.audio.sample_rate, 6.0);
        let query_samples = loader.load(&query_path, None, None).unwrap();

        let result = match_segment(&store, &loader, &cfg, &query_samples).await.unwrap();
        let best = result.expect("expected a stage-2 match");
        assert_eq!(best.track_id, 2);
        assert!(best.confidence > 0.0);
    }

    #[tokio::test]
    async fn test_match_segment_zero_norm_query_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = crate::config::Config::default();
        let store = seeded_store(&cfg, dir.path()).await;
        let loader = AudioLoader::new(cfg.audio.sample_rate);

        // Shorter than one analysis frame, so the query summary is the all-zero vector.
        let too_short = vec![0.0f32; 100];
        let result = match_segment(&store, &loader, &cfg, &too_short).await.unwrap();
        assert!(result.is_none());
    }
}
