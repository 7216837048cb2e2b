//! Configuration management for the fingerprinting engine

use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub audio: AudioConfig,
    pub fingerprint: FingerprintConfig,
    pub features: FeatureConfig,
    pub matching: MatchingConfig,
    pub stage2: Stage2Config,
    pub mix: MixConfig,
    pub indexing: IndexingConfig,
}

/// Persistent store connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub url: String,
    pub max_connections: u32,
}

/// C1 Audio Loader knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Working sample rate every decoded buffer is resampled to.
    pub sample_rate: u32,
}

/// C2/C3 constant-Q peak extraction and hash encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintConfig {
    pub hop: usize,
    pub n_bins: usize,
    pub bins_per_octave: usize,
    pub peak_neighborhood_time: usize,
    pub peak_neighborhood_freq: usize,
    pub peak_threshold_db: f32,
    pub max_peaks: usize,
    pub target_t_min: i32,
    pub target_t_max: i32,
    pub target_f_min: i32,
    pub target_f_max: i32,
    pub fan_out: usize,
}

/// C4 Feature Summarizer knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub hop: usize,
    pub mfcc_coefficients: usize,
    pub chroma_bins: usize,
}

/// C7 Stage-1 histogram matcher knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    pub bin_width_ms: i64,
    pub min_matches: usize,
    pub min_confidence: f32,
}

/// C8 Stage-2 dual-feature matcher knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage2Config {
    pub screen_top_n: usize,
    pub combined_threshold: f32,
    pub chroma_threshold: f32,
    pub slide_step: usize,
    pub min_overlap: usize,
}

/// C9 Mix Analyzer windowing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixConfig {
    pub segment_s: f32,
    pub overlap_s: f32,
    pub min_segment_s: f32,
    pub merge_gap_ms: i64,
}

/// C6 Indexer knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    pub workers: usize,
    pub progress_every: usize,
}

impl Config {
    /// Load configuration from environment variables and config files, falling
    /// back to [`Config::default`] for anything left unset.
    pub fn load() -> Result<Self, config::ConfigError> {
        let mut settings = config::Config::builder();

        if let Ok(config_file) = env::var("MIXPRINT_CONFIG_FILE") {
            settings = settings.add_source(config::File::with_name(&config_file));
        } else {
            for config_file in &["config.toml", "config.yaml", "config.json"] {
                if std::path::Path::new(config_file).exists() {
                    settings = settings.add_source(config::File::with_name(config_file));
                    break;
                }
            }
        }

        let settings = settings
            .add_source(
                config::Environment::with_prefix("MIXPRINT")
                    .separator("_")
                    .list_separator(","),
            )
            .build()?;

        match settings.try_deserialize::<Config>() {
            Ok(cfg) => Ok(cfg),
            Err(_) => Ok(Config::default()),
        }
    }

    pub fn default() -> Self {
        Self {
            store: StoreConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://mixprint.db".to_string()),
                max_connections: 10,
            },
            audio: AudioConfig { sample_rate: 22_050 },
            fingerprint: FingerprintConfig {
                hop: 512,
                n_bins: 84,
                bins_per_octave: 12,
                peak_neighborhood_time: 5,
                peak_neighborhood_freq: 5,
                peak_threshold_db: 20.0,
                max_peaks: 1000,
                target_t_min: 2,
                target_t_max: 30,
                target_f_min: -8,
                target_f_max: 8,
                fan_out: 3,
            },
            features: FeatureConfig {
                hop: 2048,
                mfcc_coefficients: 20,
                chroma_bins: 12,
            },
            matching: MatchingConfig {
                bin_width_ms: 100,
                min_matches: 5,
                min_confidence: 0.1,
            },
            stage2: Stage2Config {
                screen_top_n: 200,
                combined_threshold: 0.80,
                chroma_threshold: 0.92,
                slide_step: 15,
                min_overlap: 30,
            },
            mix: MixConfig {
                segment_s: 30.0,
                overlap_s: 15.0,
                min_segment_s: 5.0,
                merge_gap_ms: 30_000,
            },
            indexing: IndexingConfig {
                workers: num_cpus::get().saturating_sub(1).max(1),
                progress_every: 10,
            },
        }
    }

    /// `ms_per_frame = hop / sr * 1000`, the authoritative frame-to-time conversion.
    pub fn ms_per_frame(&self) -> f64 {
        self.fingerprint.hop as f64 / self.audio.sample_rate as f64 * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.audio.sample_rate, 22_050);
        assert_eq!(config.fingerprint.fan_out, 3);
        assert!(!config.store.url.is_empty());
    }

    #[test]
    fn test_ms_per_frame() {
        let config = Config::default();
        let expected = 512.0 / 22_050.0 * 1000.0;
        assert!((config.ms_per_frame() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_config_validation() {
        let config = Config::default();
        assert!(config.audio.sample_rate > 0);
        assert!(config.fingerprint.max_peaks > 0);
        assert!(config.matching.min_confidence > 0.0 && config.matching.min_confidence < 1.0);
        assert!(config.mix.overlap_s < config.mix.segment_s);
        assert!(config.indexing.workers > 0);
    }
}
