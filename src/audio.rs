//! Audio Loader (C1): decode an arbitrary audio file to mono PCM at a target
//! sample rate, with optional offset/duration windows.

use crate::error::EngineError;
use rubato::{InterpolationParameters, InterpolationType, Resampler, SincFixedIn, WindowFunction};
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Decodes files through symphonia and resamples with rubato. Holds no
/// per-file state; every `load` call opens and closes its own decoder, so
/// callers decide whether to cache the result.
#[derive(Debug, Clone, Copy)]
pub struct AudioLoader {
    sample_rate: u32,
}

impl AudioLoader {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    /// Decode `path` to mono f32 samples at `self.sample_rate`. `offset_s`
    /// and `duration_s` select a window of the decoded stream; a window that
    /// starts beyond end-of-stream yields an empty buffer rather than an error.
    pub fn load(
        &self,
        path: &Path,
        offset_s: Option<f64>,
        duration_s: Option<f64>,
    ) -> Result<Vec<f32>, EngineError> {
        let (mono, native_rate) = self.decode_file(path)?;
        let resampled = if native_rate == self.sample_rate {
            mono
        } else {
            resample(&mono, native_rate, self.sample_rate)
                .map_err(|e| EngineError::decode(path.display().to_string(), e))?
        };

        Ok(window(&resampled, self.sample_rate, offset_s, duration_s))
    }

    fn decode_file(&self, path: &Path) -> Result<(Vec<f32>, u32), EngineError> {
        let file = File::open(path).map_err(|e| EngineError::io(path.display().to_string(), e))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| EngineError::decode(path.display().to_string(), e))?;

        let mut format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != symphonia::core::codecs::CODEC_TYPE_NULL)
            .ok_or_else(|| {
                EngineError::decode(path.display().to_string(), anyhow::anyhow!("no audio track"))
            })?
            .clone();

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| EngineError::decode(path.display().to_string(), e))?;

        let track_id = track.id;
        let mut mono = Vec::new();
        let mut spec: Option<SignalSpec> = None;

        loop {
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(symphonia::core::errors::Error::IoError(_)) => break,
                Err(symphonia::core::errors::Error::ResetRequired) => break,
                Err(e) => return Err(EngineError::decode(path.display().to_string(), e)),
            };
            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let buf_spec = *decoded.spec();
                    spec.get_or_insert(buf_spec);
                    let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, buf_spec);
                    sample_buf.copy_interleaved_ref(decoded);
                    downmix_into(sample_buf.samples(), buf_spec.channels.count(), &mut mono);
                }
                Err(symphonia::core::errors::Error::DecodeError(e)) => {
                    warn!(%e, path = %path.display(), "skipping undecodable packet");
                    continue;
                }
                Err(e) => return Err(EngineError::decode(path.display().to_string(), e)),
            }
        }

        let native_rate = spec.map(|s| s.rate).unwrap_or(self.sample_rate);
        debug!(path = %path.display(), samples = mono.len(), native_rate, "decoded audio");
        Ok((mono, native_rate))
    }
}

fn downmix_into(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    out.reserve(interleaved.len() / channels);
    for frame in interleaved.chunks_exact(channels) {
        out.push(frame.iter().sum::<f32>() / channels as f32);
    }
}

fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> anyhow::Result<Vec<f32>> {
    if samples.is_empty() {
        return Ok(Vec::new());
    }
    let ratio = to_rate as f64 / from_rate as f64;
    let params = InterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: InterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, samples.len(), 1)?;
    let output = resampler.process(&[samples.to_vec()], None)?;
    Ok(output.into_iter().next().unwrap_or_default())
}

/// Slice `[offset_s, offset_s + duration_s)` out of `samples`, clamping to
/// the available range. Returns an empty vector if the window starts past
/// end-of-stream.
fn window(samples: &[f32], sample_rate: u32, offset_s: Option<f64>, duration_s: Option<f64>) -> Vec<f32> {
    let start = (offset_s.unwrap_or(0.0) * sample_rate as f64).round() as usize;
    if start >= samples.len() {
        return Vec::new();
    }
    let end = match duration_s {
        Some(d) => (start + (d * sample_rate as f64).round() as usize).min(samples.len()),
        None => samples.len(),
    };
    samples[start..end].to_vec()
}

/// Hann window, used by both the CQT peak extractor and the feature
/// summarizer ahead of their respective FFTs.
pub fn hann_window(n: usize) -> Vec<f32> {
    if n <= 1 {
        return vec![1.0; n];
    }
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / (n - 1) as f32).cos())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_stereo() {
        let mut out = Vec::new();
        downmix_into(&[1.0, -1.0, 0.5, 0.5], 2, &mut out);
        assert_eq!(out, vec![0.0, 0.5]);
    }

    #[test]
    fn test_window_clamps_past_end() {
        let samples = vec![0.0f32; 100];
        let w = window(&samples, 10, Some(20.0), Some(5.0));
        assert!(w.is_empty());
    }

    #[test]
    fn test_window_offset_duration() {
        let samples: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let w = window(&samples, 10, Some(1.0), Some(2.0));
        assert_eq!(w, vec![10.0, 11.0, 12.0, 13.0, 14.0, 15.0, 16.0, 17.0, 18.0, 19.0]);
    }

    #[test]
    fn test_hann_window_endpoints_near_zero() {
        let w = hann_window(64);
        assert!(w[0] < 1e-6);
        assert!(w[63] < 1e-6);
    }

    fn write_wav_fixture(path: &std::path::Path, sample_rate: u32, secs: f32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let n = (sample_rate as f32 * secs) as usize;
        for i in 0..n {
            let sample = (2.0 * std::f32::consts::PI * 440.0 * i as f32 / sample_rate as f32).sin();
            writer.write_sample((sample * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_load_decodes_real_wav_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav_fixture(&path, 44_100, 1.0);

        let loader = AudioLoader::new(22_050);
        let samples = loader.load(&path, None, None).unwrap();

        // Resampled from 44.1kHz to 22.05kHz: roughly half the original length.
        assert!((samples.len() as i64 - 22_050).abs() < 2_000);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let loader = AudioLoader::new(22_050);
        let err = loader.load(std::path::Path::new("/nonexistent/track.wav"), None, None).unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
    }

    #[test]
    fn test_load_window_past_end_of_real_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.wav");
        write_wav_fixture(&path, 22_050, 1.0);

        let loader = AudioLoader::new(22_050);
        let samples = loader.load(&path, Some(10.0), Some(1.0)).unwrap();
        assert!(samples.is_empty());
    }
}
