//! CQT Peak Extractor (C2): a log-frequency magnitude spectrogram, reduced to
//! a sparse set of local-maxima peaks used downstream by the fingerprint encoder.

use crate::audio::hann_window;
use crate::config::FingerprintConfig;
use ndarray::Array2;
use num_complex::Complex;
use rustfft::FftPlanner;

/// One local maximum in the time/log-frequency plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub time_frame: i32,
    pub freq_bin: i16,
    pub magnitude_db: f32,
}

/// Lowest CQT bin center, tuned to the C1 note (32.70 Hz) as is conventional
/// for music-oriented constant-Q analysis.
const F_MIN_HZ: f32 = 32.70;

pub fn extract_peaks(samples: &[f32], sample_rate: u32, cfg: &FingerprintConfig) -> Vec<Peak> {
    if samples.is_empty() {
        return Vec::new();
    }

    let spectrogram = log_frequency_spectrogram(samples, sample_rate, cfg);
    if spectrogram.ncols() == 0 {
        return Vec::new();
    }

    let mut peaks = find_peaks(&spectrogram, cfg);

    if peaks.len() > cfg.max_peaks {
        peaks.sort_by(|a, b| b.magnitude_db.partial_cmp(&a.magnitude_db).unwrap());
        peaks.truncate(cfg.max_peaks);
    }

    peaks.sort_by(|a, b| {
        a.time_frame
            .cmp(&b.time_frame)
            .then(b.magnitude_db.partial_cmp(&a.magnitude_db).unwrap())
    });
    peaks
}

/// Builds an `n_bins x n_frames` dB-scale spectrogram with geometrically
/// spaced frequency bins, approximated by averaging a linear FFT's bins
/// across each log-spaced band (a "pseudo-CQT").
fn log_frequency_spectrogram(samples: &[f32], sample_rate: u32, cfg: &FingerprintConfig) -> Array2<f32> {
    let fft_size = (cfg.hop * 4).next_power_of_two();
    if samples.len() < fft_size {
        return Array2::zeros((cfg.n_bins, 0));
    }

    let window = hann_window(fft_size);
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(fft_size);

    let n_frames = (samples.len() - fft_size) / cfg.hop + 1;
    let linear_bins = fft_size / 2 + 1;
    let bin_edges = cqt_bin_edges(cfg, sample_rate, linear_bins, fft_size);

    let mut out = Array2::<f32>::zeros((cfg.n_bins, n_frames));
    let mut buf = vec![Complex::new(0.0f32, 0.0); fft_size];

    for frame in 0..n_frames {
        let start = frame * cfg.hop;
        for (i, sample) in samples[start..start + fft_size].iter().enumerate() {
            buf[i] = Complex::new(sample * window[i], 0.0);
        }
        fft.process(&mut buf);

        for bin in 0..cfg.n_bins {
            let (lo, hi) = bin_edges[bin];
            if lo >= hi {
                continue;
            }
            let energy: f32 = buf[lo..hi].iter().map(|c| c.norm()).sum::<f32>() / (hi - lo) as f32;
            out[[bin, frame]] = energy;
        }
    }

    to_db(out)
}

/// For each of `n_bins` geometrically spaced CQT bins, the `[lo, hi)` range
/// of linear FFT bins it averages over.
fn cqt_bin_edges(cfg: &FingerprintConfig, sample_rate: u32, linear_bins: usize, fft_size: usize) -> Vec<(usize, usize)> {
    let bin_hz = sample_rate as f32 / fft_size as f32;
    (0..cfg.n_bins)
        .map(|bin| {
            let f_lo = F_MIN_HZ * 2f32.powf(bin as f32 / cfg.bins_per_octave as f32);
            let f_hi = F_MIN_HZ * 2f32.powf((bin + 1) as f32 / cfg.bins_per_octave as f32);
            let lo = ((f_lo / bin_hz).floor() as usize).min(linear_bins.saturating_sub(1));
            let hi = ((f_hi / bin_hz).ceil() as usize).clamp(lo + 1, linear_bins);
            (lo, hi)
        })
        .collect()
}

fn to_db(mut spectrogram: Array2<f32>) -> Array2<f32> {
    let max = spectrogram.iter().cloned().fold(0.0f32, f32::max).max(1e-10);
    spectrogram.mapv_inplace(|v| 20.0 * ((v.max(1e-10)) / max).log10());
    spectrogram
}

fn find_peaks(spectrogram: &Array2<f32>, cfg: &FingerprintConfig) -> Vec<Peak> {
    let (n_bins, n_frames) = spectrogram.dim();
    let median = median_of(spectrogram);
    let threshold = median + cfg.peak_threshold_db;

    let tr = cfg.peak_neighborhood_time as i64;
    let fr = cfg.peak_neighborhood_freq as i64;

    let mut peaks = Vec::new();
    for frame in 0..n_frames {
        for bin in 0..n_bins {
            let value = spectrogram[[bin, frame]];
            if value <= threshold {
                continue;
            }
            if !is_local_max(spectrogram, bin, frame, fr, tr, n_bins, n_frames) {
                continue;
            }
            peaks.push(Peak {
                time_frame: frame as i32,
                freq_bin: bin as i16,
                magnitude_db: value,
            });
        }
    }
    peaks
}

fn is_local_max(
    spectrogram: &Array2<f32>,
    bin: usize,
    frame: usize,
    fr: i64,
    tr: i64,
    n_bins: usize,
    n_frames: usize,
) -> bool {
    let value = spectrogram[[bin, frame]];
    for df in -fr..=fr {
        for dt in -tr..=tr {
            if df == 0 && dt == 0 {
                continue;
            }
            let nb = bin as i64 + df;
            let nf = frame as i64 + dt;
            if nb < 0 || nf < 0 || nb as usize >= n_bins || nf as usize >= n_frames {
                continue;
            }
            if spectrogram[[nb as usize, nf as usize]] >= value {
                return false;
            }
        }
    }
    true
}

fn median_of(spectrogram: &Array2<f32>) -> f32 {
    let mut values: Vec<f32> = spectrogram.iter().cloned().collect();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    values[values.len() / 2]
}
