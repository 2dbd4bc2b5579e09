use std::path::Path;

use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};

/// Encodes mono float samples as 16-bit PCM WAV.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    // 44-byte header plus two bytes per sample
    let mut buffer = Vec::with_capacity(44 + samples.len() * 2);

    {
        let mut cursor = std::io::Cursor::new(&mut buffer);
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            let clamped = sample.clamp(-1.0, 1.0);
            writer.write_sample((clamped * i16::MAX as f32) as i16)?;
        }
        writer.finalize()?;
    }

    Ok(buffer)
}

pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let bytes = encode_wav(samples, sample_rate)?;
    std::fs::write(path, bytes)
        .with_context(|| format!("failed to write waveform to {}", path.display()))
}
