//! Feature Summarizer (C4): compact per-track MFCC and chroma aggregates used
//! for fast Stage-2 screening, plus the per-frame variants Stage-2 needs for
//! frame-aligned sustained-run scoring.

use crate::audio::hann_window;
use crate::config::FeatureConfig;
use ndarray::{Array1, Array2, Axis};
use num_complex::Complex;
use rustfft::FftPlanner;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::OnceLock;

static MEL_FILTER_CACHE: OnceLock<Mutex<HashMap<(u32, usize, usize), Array2<f32>>>> = OnceLock::new();
static CHROMA_FILTER_CACHE: OnceLock<Mutex<HashMap<(u32, usize), Array2<f32>>>> = OnceLock::new();

/// `[mean_1..mean_k, std_1..std_k]` over the track's MFCC frames. Zero-length
/// audio yields a zero vector.
pub fn mfcc_summary(samples: &[f32], sample_rate: u32, cfg: &FeatureConfig) -> Vec<f32> {
    summarize(mfcc_frames(samples, sample_rate, cfg), cfg.mfcc_coefficients)
}

/// `[mean_1..mean_12, std_1..std_12]` mean pitch-class energy. Zero-length
/// audio yields a zero vector.
pub fn chroma_summary(samples: &[f32], sample_rate: u32, cfg: &FeatureConfig) -> Vec<f32> {
    summarize(chroma_frames(samples, sample_rate, cfg), cfg.chroma_bins)
}

fn summarize(frames: Array2<f32>, dim: usize) -> Vec<f32> {
    if frames.ncols() == 0 {
        return vec![0.0; dim * 2];
    }
    let mean = frames.mean_axis(Axis(1)).unwrap();
    let std = frames.std_axis(Axis(1), 0.0);
    mean.iter().chain(std.iter()).cloned().collect()
}

/// Per-frame `[chroma(12); mfcc(20)]` stacked features, each column
/// L2-normalized to unit norm -- the query/reference representation Stage-2
/// slides across each other.
pub fn combined_frame_features(samples: &[f32], sample_rate: u32, cfg: &FeatureConfig) -> Array2<f32> {
    let chroma = chroma_frames(samples, sample_rate, cfg);
    let mfcc = mfcc_frames(samples, sample_rate, cfg);
    let n_frames = chroma.ncols().min(mfcc.ncols());

    let mut combined = Array2::zeros((cfg.chroma_bins + cfg.mfcc_coefficients, n_frames));
    combined
        .slice_mut(ndarray::s![..cfg.chroma_bins, ..])
        .assign(&chroma.slice(ndarray::s![.., ..n_frames]));
    combined
        .slice_mut(ndarray::s![cfg.chroma_bins.., ..])
        .assign(&mfcc.slice(ndarray::s![.., ..n_frames]));

    normalize_columns(combined)
}

/// Per-frame chroma, columns L2-normalized to unit norm.
pub fn chroma_frame_features(samples: &[f32], sample_rate: u32, cfg: &FeatureConfig) -> Array2<f32> {
    normalize_columns(chroma_frames(samples, sample_rate, cfg))
}

fn normalize_columns(mut m: Array2<f32>) -> Array2<f32> {
    for mut col in m.axis_iter_mut(Axis(1)) {
        let norm = col.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 1e-12 {
            col.mapv_inplace(|v| v / norm);
        }
    }
    m
}

fn mfcc_frames(samples: &[f32], sample_rate: u32, cfg: &FeatureConfig) -> Array2<f32> {
    let power = power_spectrogram(samples, cfg.hop);
    if power.ncols() == 0 {
        return Array2::zeros((cfg.mfcc_coefficients, 0));
    }
    let mel_filters = cached_mel_filter_bank(sample_rate, power.nrows(), 26);
    let mel = mel_filters.dot(&power);
    let log_mel = mel.mapv(|v| (v + 1e-10).ln());
    dct(&log_mel, cfg.mfcc_coefficients)
}

fn chroma_frames(samples: &[f32], sample_rate: u32, cfg: &FeatureConfig) -> Array2<f32> {
    let power = power_spectrogram(samples, cfg.hop);
    if power.ncols() == 0 {
        return Array2::zeros((cfg.chroma_bins, 0));
    }
    let chroma_filters = cached_chroma_filter_bank(sample_rate, power.nrows());
    chroma_filters.dot(&power)
}

/// `n_linear_bins x n_frames` magnitude spectrogram, STFT with a Hann window
/// and `hop` frame advance, FFT size fixed at `4 * hop`.
fn power_spectrogram(samples: &[f32], hop: usize) -> Array2<f32> {
    let fft_size = (hop * 4).next_power_of_two();
    if samples.len() < fft_size {
        return Array2::zeros((fft_size / 2 + 1, 0));
    }

    let window = hann_window(fft_size);
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(fft_size);

    let n_frames = (samples.len() - fft_size) / hop + 1;
    let n_bins = fft_size / 2 + 1;
    let mut out = Array2::zeros((n_bins, n_frames));
    let mut buf = vec![Complex::new(0.0f32, 0.0); fft_size];

    for frame in 0..n_frames {
        let start = frame * hop;
        for (i, sample) in samples[start..start + fft_size].iter().enumerate() {
            buf[i] = Complex::new(sample * window[i], 0.0);
        }
        fft.process(&mut buf);
        for (bin, c) in buf.iter().take(n_bins).enumerate() {
            out[[bin, frame]] = c.norm();
        }
    }

    out
}

fn cached_mel_filter_bank(sample_rate: u32, n_linear_bins: usize, n_filters: usize) -> Array2<f32> {
    let cache = MEL_FILTER_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let key = (sample_rate, n_linear_bins, n_filters);
    let mut guard = cache.lock().unwrap();
    guard
        .entry(key)
        .or_insert_with(|| build_mel_filter_bank(sample_rate, n_linear_bins, n_filters))
        .clone()
}

fn cached_chroma_filter_bank(sample_rate: u32, n_linear_bins: usize) -> Array2<f32> {
    let cache = CHROMA_FILTER_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let key = (sample_rate, n_linear_bins);
    let mut guard = cache.lock().unwrap();
    guard
        .entry(key)
        .or_insert_with(|| build_chroma_filter_bank(sample_rate, n_linear_bins))
        .clone()
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2595.0) - 1.0)
}

/// Triangular mel filter bank, `n_filters x n_linear_bins`.
fn build_mel_filter_bank(sample_rate: u32, n_linear_bins: usize, n_filters: usize) -> Array2<f32> {
    let nyquist = sample_rate as f32 / 2.0;
    let mel_max = hz_to_mel(nyquist);
    let mel_points: Vec<f32> = (0..n_filters + 2)
        .map(|i| i as f32 * mel_max / (n_filters + 1) as f32)
        .collect();
    let hz_points: Vec<f32> = mel_points.iter().map(|&m| mel_to_hz(m)).collect();
    let bin_points: Vec<usize> = hz_points
        .iter()
        .map(|&hz| ((hz / nyquist) * (n_linear_bins - 1) as f32).round() as usize)
        .collect();

    let mut bank = Array2::zeros((n_filters, n_linear_bins));
    for m in 0..n_filters {
        let (left, center, right) = (bin_points[m], bin_points[m + 1], bin_points[m + 2]);
        for bin in left..center.max(left + 1) {
            if center > left {
                bank[[m, bin.min(n_linear_bins - 1)]] = (bin - left) as f32 / (center - left) as f32;
            }
        }
        for bin in center..right.max(center + 1) {
            if right > center && bin < n_linear_bins {
                bank[[m, bin]] = (right - bin) as f32 / (right - center) as f32;
            }
        }
    }
    bank
}

/// Chroma (pitch-class) filter bank, `12 x n_linear_bins`: each linear bin's
/// energy is folded into the pitch class its center frequency falls under.
fn build_chroma_filter_bank(sample_rate: u32, n_linear_bins: usize) -> Array2<f32> {
    let fft_size = (n_linear_bins - 1) * 2;
    let mut bank = Array2::zeros((12, n_linear_bins));

    for bin in 1..n_linear_bins {
        let freq = bin as f32 * sample_rate as f32 / fft_size as f32;
        if freq < 20.0 {
            continue;
        }
        // MIDI pitch number relative to A4 = 440 Hz, folded into [0, 12).
        let midi = 69.0 + 12.0 * (freq / 440.0).log2();
        let pitch_class = midi.rem_euclid(12.0).round() as usize % 12;
        bank[[pitch_class, bin]] += 1.0;
    }
    bank
}

fn dct(log_mel: &Array2<f32>, n_coeffs: usize) -> Array2<f32> {
    let (n_filters, n_frames) = log_mel.dim();
    let mut out = Array2::zeros((n_coeffs, n_frames));
    let scale = (2.0 / n_filters as f32).sqrt();

    for k in 0..n_coeffs {
        let basis: Array1<f32> = Array1::from_iter((0..n_filters).map(|n| {
            (std::f32::consts::PI * k as f32 * (2 * n + 1) as f32 / (2.0 * n_filters as f32)).cos()
        }));
        for frame in 0..n_frames {
            out[[k, frame]] = log_mel.column(frame).dot(&basis) * scale;
        }
    }
    out
}
