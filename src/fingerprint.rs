//! Fingerprint Encoder (C3): turns anchor/target peak pairs into 32-bit hashes
//! invariant to moderate pitch and tempo change.

use crate::config::FingerprintConfig;
use crate::cqt::Peak;
use serde::{Deserialize, Serialize};

/// An immutable (hash, time, frequency) triple. Produced by [`encode`],
/// stored verbatim by the fingerprint store, consumed by the Stage-1 matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: u32,
    pub time_offset_ms: i32,
    pub freq_bin: i16,
}

impl Fingerprint {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Encode every anchor/target peak pair within the configured target zone
/// into a fingerprint. `peaks` must already be sorted by `(time_frame asc)`,
/// the order [`crate::cqt::extract_peaks`] guarantees.
pub fn encode(peaks: &[Peak], ms_per_frame: f64, cfg: &FingerprintConfig) -> Vec<Fingerprint> {
    let mut out = Vec::new();

    for (i, anchor) in peaks.iter().enumerate() {
        let mut targets_found = 0;
        for target in &peaks[i + 1..] {
            let dt = target.time_frame - anchor.time_frame;
            if dt > cfg.target_t_max {
                break;
            }
            if dt < cfg.target_t_min {
                continue;
            }
            let df = target.freq_bin as i32 - anchor.freq_bin as i32;
            if df < cfg.target_f_min || df > cfg.target_f_max {
                continue;
            }

            out.push(Fingerprint {
                hash: pack_hash(anchor, target),
                time_offset_ms: (anchor.time_frame as f64 * ms_per_frame).round() as i32,
                freq_bin: anchor.freq_bin,
            });

            targets_found += 1;
            if targets_found >= cfg.fan_out {
                break;
            }
        }
    }

    out
}

fn pack_hash(anchor: &Peak, target: &Peak) -> u32 {
    let anchor_freq = (anchor.freq_bin as u32) & 0x7F;
    let target_freq = (target.freq_bin as u32) & 0x7F;
    let freq_diff = (((target.freq_bin as i32 - anchor.freq_bin as i32) + 32) as u32) & 0x3F;
    let time_diff = ((target.time_frame - anchor.time_frame).min(63) as u32) & 0x3F;
    let mag_ratio = (((anchor.magnitude_db - target.magnitude_db) + 30.0) / 60.0 * 63.0)
        .round()
        .clamp(0.0, 63.0) as u32;

    (anchor_freq << 25) | (target_freq << 18) | (freq_diff << 12) | (time_diff << 6) | mag_ratio
}
