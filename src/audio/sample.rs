//! Click sample loading
//!
//! The click is either a user-supplied sound file or a short generated noise
//! burst, so no binary assets need to ship. WAV files are read with hound;
//! anything else (MP3) goes through rodio's decoder.

use super::AudioSample;
use crate::error::AudioError;
use hound::{SampleFormat, WavReader};
use rodio::{Decoder, Source};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Name selecting the generated click in `audio.sample`
pub const BUILTIN_CLICK: &str = "click";

const GENERATED_RATE: u32 = 44100;
const GENERATED_CLICK_MS: u32 = 25;

/// Longer files are cut; a click has to finish before the next key press
const MAX_SAMPLE_SECS: usize = 5;

/// Resolve `audio.sample` to a click, falling back to the generated one
pub fn load_click(setting: &str) -> AudioSample {
    if setting.is_empty() || setting == BUILTIN_CLICK {
        return generate_click(GENERATED_CLICK_MS);
    }

    match load_file(Path::new(setting)) {
        Ok(sample) => {
            tracing::debug!(
                "Loaded click sample {:?} ({} Hz, {} ch, {} ms)",
                setting,
                sample.sample_rate,
                sample.channels,
                sample.duration_ms()
            );
            sample
        }
        Err(e) => {
            tracing::warn!("{}; using the built-in click", e);
            generate_click(GENERATED_CLICK_MS)
        }
    }
}

/// Load a sound file, picking the reader by extension
pub fn load_file(path: &Path) -> Result<AudioSample, AudioError> {
    let is_wav = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("wav"))
        .unwrap_or(false);

    if is_wav {
        load_wav(path)
    } else {
        decode_file(path)
    }
}

/// Decode a compressed sound file (MP3) into 16-bit interleaved samples
pub fn decode_file(path: &Path) -> Result<AudioSample, AudioError> {
    let file = File::open(path).map_err(|e| AudioError::Sample(path.to_path_buf(), e.to_string()))?;
    let decoder = Decoder::new(BufReader::new(file))
        .map_err(|e| AudioError::Sample(path.to_path_buf(), e.to_string()))?;

    let channels = decoder.channels();
    let sample_rate = decoder.sample_rate();
    let limit = sample_rate as usize * usize::from(channels.max(1)) * MAX_SAMPLE_SECS;
    let samples: Vec<i16> = decoder.convert_samples::<i16>().take(limit).collect();

    if samples.is_empty() {
        return Err(AudioError::Sample(
            path.to_path_buf(),
            "file contains no audio".to_string(),
        ));
    }
    if samples.len() == limit {
        tracing::warn!("Click sample {:?} is longer than {}s, truncated", path, MAX_SAMPLE_SECS);
    }

    Ok(AudioSample::new(sample_rate, channels, samples))
}

/// Decode a WAV file into 16-bit interleaved samples
pub fn load_wav(path: &Path) -> Result<AudioSample, AudioError> {
    let err = |e: hound::Error| AudioError::Sample(path.to_path_buf(), e.to_string());

    let reader = WavReader::open(path).map_err(err)?;
    let spec = reader.spec();

    let samples: Vec<i16> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16))
            .collect::<Result<_, _>>()
            .map_err(err)?,
        SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| scale_to_i16(v, bits)))
                .collect::<Result<_, _>>()
                .map_err(err)?
        }
    };

    if samples.is_empty() {
        return Err(AudioError::Sample(
            path.to_path_buf(),
            "file contains no audio".to_string(),
        ));
    }

    Ok(AudioSample::new(spec.sample_rate, spec.channels, samples))
}

fn scale_to_i16(value: i32, bits: u16) -> i16 {
    if bits > 16 {
        (value >> (bits - 16)) as i16
    } else {
        (value << (16 - bits)) as i16
    }
}

/// Generate a click sound (short burst of noise with envelope)
pub fn generate_click(duration_ms: u32) -> AudioSample {
    let num_samples = (GENERATED_RATE * duration_ms / 1000) as usize;

    let mut samples: Vec<i16> = Vec::with_capacity(num_samples);
    for i in 0..num_samples {
        // Quick exponential decay envelope
        let envelope = (-5.0 * i as f32 / num_samples as f32).exp();
        // High-frequency noise burst
        let noise = if i % 2 == 0 { 1.0 } else { -1.0 };
        samples.push((noise * envelope * 12000.0) as i16);
    }

    AudioSample::new(GENERATED_RATE, 1, samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, spec: hound::WavSpec, samples: &[i32]) {
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for s in samples {
            writer.write_sample(*s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_generate_click() {
        let click = generate_click(25);
        assert_eq!(click.sample_rate, 44100);
        assert_eq!(click.channels, 1);
        assert_eq!(click.samples.len(), 1102);
        assert_eq!(click.duration_ms(), 24);
        // Envelope decays
        assert!(click.samples[0].unsigned_abs() > click.samples[1000].unsigned_abs());
    }

    #[test]
    fn test_load_16bit_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("click.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 48000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        write_wav(&path, spec, &[100, -100, 2000, -2000]);

        let sample = load_wav(&path).unwrap();
        assert_eq!(sample.sample_rate, 48000);
        assert_eq!(sample.channels, 2);
        assert_eq!(&*sample.samples, &[100, -100, 2000, -2000]);
    }

    #[test]
    fn test_load_24bit_wav_scales_down() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("click24.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44100,
            bits_per_sample: 24,
            sample_format: hound::SampleFormat::Int,
        };
        write_wav(&path, spec, &[256 * 1000, -256 * 1000]);

        let sample = load_wav(&path).unwrap();
        assert_eq!(&*sample.samples, &[1000, -1000]);
    }

    #[test]
    fn test_missing_file_falls_back_to_builtin() {
        let click = load_click("/nonexistent/click.wav");
        assert_eq!(click, generate_click(GENERATED_CLICK_MS));
        assert!(matches!(
            load_wav(Path::new("/nonexistent/click.wav")),
            Err(AudioError::Sample(..))
        ));
    }

    #[test]
    fn test_decoder_reads_files_without_wav_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.snd");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 22050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        write_wav(&path, spec, &[300, -300, 1200, -1200, 0]);

        let sample = load_file(&path).unwrap();
        assert_eq!(sample.sample_rate, 22050);
        assert_eq!(sample.channels, 1);
        assert_eq!(&*sample.samples, &[300, -300, 1200, -1200, 0]);
    }

    #[test]
    fn test_undecodable_file_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.mp3");
        std::fs::write(&path, b"definitely not audio").unwrap();

        assert!(matches!(decode_file(&path), Err(AudioError::Sample(..))));
        assert_eq!(load_click(path.to_str().unwrap()), generate_click(GENERATED_CLICK_MS));
    }

    #[test]
    fn test_builtin_name() {
        assert_eq!(load_click("click").sample_rate, GENERATED_RATE);
    }
}
