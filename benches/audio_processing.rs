use criterion::{criterion_group, criterion_main, Criterion};
use mixprint::config::Config;
use mixprint::{cqt, fingerprint};

fn sine(freq: f32, sr: u32, secs: f32) -> Vec<f32> {
    let n = (sr as f32 * secs) as usize;
    (0..n)
        .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sr as f32).sin())
        .collect()
}

fn bench_peak_extraction(c: &mut Criterion) {
    let cfg = Config::default();
    let samples = sine(440.0, cfg.audio.sample_rate, 30.0);

    c.bench_function("cqt_extract_peaks_30s", |b| {
        b.iter(|| cqt::extract_peaks(&samples, cfg.audio.sample_rate, &cfg.fingerprint))
    });
}

fn bench_fingerprint_encode(c: &mut Criterion) {
    let cfg = Config::default();
    let samples = sine(440.0, cfg.audio.sample_rate, 30.0);
    let peaks = cqt::extract_peaks(&samples, cfg.audio.sample_rate, &cfg.fingerprint);
    let ms_per_frame = cfg.ms_per_frame();

    c.bench_function("fingerprint_encode_30s", |b| {
        b.iter(|| fingerprint::encode(&peaks, ms_per_frame, &cfg.fingerprint))
    });
}

criterion_group!(benches, bench_peak_extraction, bench_fingerprint_encode);
criterion_main!(benches);
