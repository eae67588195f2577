//! Fixtures shared by the unit tests: in-memory WAV files and a synthetic stream.

use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;
use std::sync::Arc;

use super::decoder::SampleStream;
use crate::error::Result;

/// 16-bit WAV whose every sample of frame `i` holds the integer `i`, so the
/// decoded value identifies its own frame (see [`frame_index`]).
pub fn ramp_wav(frames: usize, channels: u16, sample_rate: u32) -> Arc<[u8]> {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut bytes = Vec::new();
    {
        let mut writer = WavWriter::new(Cursor::new(&mut bytes), spec).expect("wav header");
        for i in 0..frames {
            for _ in 0..channels {
                writer.write_sample((i % 32768) as i16).expect("wav sample");
            }
        }
        writer.finalize().expect("wav finalize");
    }
    bytes.into()
}

pub fn frame_index(sample: f32) -> i64 {
    (sample * 32768.0).round() as i64
}

/// Mono stream of `total` frames whose sample values are frame indices
/// divided by 32768, mirroring [`ramp_wav`].
pub struct RampStream {
    pub total: u64,
    pub position: u64,
}

impl RampStream {
    pub fn new(total: u64) -> Self {
        Self { total, position: 0 }
    }
}

impl SampleStream for RampStream {
    fn channels(&self) -> usize {
        1
    }

    fn sample_rate(&self) -> u32 {
        8000
    }

    fn total_frames(&self) -> u64 {
        self.total
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn stream_block(&mut self, out: &mut Vec<f32>, max_samples: usize) -> usize {
        let frames = (max_samples as u64).min(self.total - self.position);
        for i in 0..frames {
            out.push(((self.position + i) % 32768) as f32 / 32768.0);
        }
        self.position += frames;
        frames as usize
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        self.position = frame.min(self.total);
        Ok(())
    }
}
