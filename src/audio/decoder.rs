use std::io::Cursor;
use std::sync::Arc;
use symphonia::core::audio::{Channels, SampleBuffer};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::mixer::Pcm;
use crate::error::{AudioError, Result};

/// Interleaved samples requested per `decode_all` step.
const DECODE_ALL_BLOCK_FRAMES: usize = 4096;

/// A pull-based source of interleaved f32 PCM.
///
/// Positions are absolute frame indices. `stream_block` only ever hands out
/// whole frames and returns 0 once the stream is exhausted.
pub trait SampleStream: Send {
    fn channels(&self) -> usize;

    fn sample_rate(&self) -> u32;

    fn total_frames(&self) -> u64;

    /// Frames handed out since the start of the stream.
    fn position(&self) -> u64;

    fn samples_remaining(&self) -> u64 {
        self.total_frames().saturating_sub(self.position())
    }

    /// Appends up to `max_samples` interleaved samples (rounded down to whole
    /// frames) to `out` and returns the number of frames appended.
    fn stream_block(&mut self, out: &mut Vec<f32>, max_samples: usize) -> usize;

    fn seek(&mut self, frame: u64) -> Result<()>;

    fn rewind(&mut self) -> Result<()> {
        self.seek(0)
    }
}

struct Opened {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    channels: usize,
    sample_rate: u32,
    n_frames: Option<u64>,
}

fn open_reader(data: &Arc<[u8]>) -> Result<Opened> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(data.clone())), Default::default());

    let fmt_opts = FormatOptions {
        enable_gapless: true,
        ..Default::default()
    };

    let probed = symphonia::default::get_probe()
        .format(&Hint::new(), mss, &fmt_opts, &MetadataOptions::default())
        .map_err(|e| AudioError::Decode(format!("Failed to probe format: {}", e)))?;

    let format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AudioError::Decode("No audio tracks found".into()))?;

    let track_id = track.id;
    let sample_rate = track.codec_params.sample_rate.unwrap_or(44100);
    let channels = track
        .codec_params
        .channels
        .unwrap_or(Channels::FRONT_LEFT | Channels::FRONT_RIGHT)
        .count();
    let n_frames = track.codec_params.n_frames;

    let decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AudioError::Decode(format!("Failed to create decoder: {}", e)))?;

    Ok(Opened {
        format,
        decoder,
        track_id,
        channels,
        sample_rate,
        n_frames,
    })
}

/// Sums packet durations for containers that don't report a frame count.
fn count_frames(data: &Arc<[u8]>) -> Result<u64> {
    let mut opened = open_reader(data)?;
    let mut total = 0u64;
    loop {
        match opened.format.next_packet() {
            Ok(packet) if packet.track_id() == opened.track_id => total += packet.dur,
            Ok(_) => {}
            Err(_) => break,
        }
    }
    Ok(total)
}

/// Streaming decoder over an in-memory encoded buffer (Ogg Vorbis for music,
/// anything symphonia probes in general).
pub struct BitstreamDecoder {
    data: Arc<[u8]>,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    channels: usize,
    sample_rate: u32,
    total_frames: u64,
    position: u64,
    /// Decoded samples not yet handed out.
    pending: Vec<f32>,
    pending_offset: usize,
    /// Frames to drop after a seek landed before the requested frame.
    skip_frames: u64,
    finished: bool,
}

impl BitstreamDecoder {
    pub fn open(data: Arc<[u8]>) -> Result<Self> {
        let opened = open_reader(&data)?;
        let total_frames = match opened.n_frames {
            Some(n) => n,
            None => count_frames(&data)?,
        };

        Ok(Self {
            data,
            format: opened.format,
            decoder: opened.decoder,
            track_id: opened.track_id,
            channels: opened.channels.max(1),
            sample_rate: opened.sample_rate,
            total_frames,
            position: 0,
            pending: Vec::new(),
            pending_offset: 0,
            skip_frames: 0,
            finished: false,
        })
    }

    /// Fully decodes a short clip.
    pub fn decode_all(data: Arc<[u8]>) -> Result<Pcm> {
        let mut decoder = Self::open(data)?;
        let mut samples = Vec::with_capacity(decoder.total_frames as usize * decoder.channels);
        let block = DECODE_ALL_BLOCK_FRAMES * decoder.channels;
        while decoder.stream_block(&mut samples, block) > 0 {}
        Ok(Pcm::new(samples, decoder.channels, decoder.sample_rate))
    }

    pub fn duration_secs(&self) -> f64 {
        self.total_frames as f64 / self.sample_rate.max(1) as f64
    }

    fn clear_pending(&mut self) {
        self.pending.clear();
        self.pending_offset = 0;
    }

    /// Decodes the next packet into `pending`. Returns false at end of stream.
    fn decode_next(&mut self) -> bool {
        if self.finished {
            return false;
        }
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.finished = true;
                    return false;
                }
                Err(e) => {
                    log::warn!("Stream read error, treating as end of stream: {}", e);
                    self.finished = true;
                    return false;
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    log::debug!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => {
                    log::warn!("Decode error, treating as end of stream: {}", e);
                    self.finished = true;
                    return false;
                }
            };

            let spec = *decoded.spec();
            let num_frames = decoded.frames();
            if num_frames == 0 {
                continue;
            }
            let mut sample_buf = SampleBuffer::<f32>::new(num_frames as u64, spec);
            sample_buf.copy_interleaved_ref(decoded);

            let skip = (self.skip_frames as usize).min(num_frames);
            self.skip_frames -= skip as u64;
            if skip == num_frames {
                continue;
            }

            self.pending.clear();
            self.pending
                .extend_from_slice(&sample_buf.samples()[skip * self.channels..]);
            self.pending_offset = 0;
            return true;
        }
    }

    fn reopen(&mut self) -> Result<()> {
        let opened = open_reader(&self.data)?;
        self.format = opened.format;
        self.decoder = opened.decoder;
        self.track_id = opened.track_id;
        Ok(())
    }
}

impl SampleStream for BitstreamDecoder {
    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_frames(&self) -> u64 {
        self.total_frames
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn stream_block(&mut self, out: &mut Vec<f32>, max_samples: usize) -> usize {
        let ch = self.channels;
        let max_frames = max_samples / ch;
        let mut frames = 0;

        while frames < max_frames {
            if self.pending_offset >= self.pending.len() {
                if !self.decode_next() {
                    break;
                }
                continue;
            }
            let available = (self.pending.len() - self.pending_offset) / ch;
            if available == 0 {
                // Ragged packet tail; never hand out a partial frame.
                self.clear_pending();
                continue;
            }
            let take = available.min(max_frames - frames);
            let end = self.pending_offset + take * ch;
            out.extend_from_slice(&self.pending[self.pending_offset..end]);
            self.pending_offset = end;
            frames += take;
        }

        self.position += frames as u64;
        frames
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        let frame = frame.min(self.total_frames);
        self.clear_pending();
        self.skip_frames = 0;
        self.finished = false;

        if frame == 0 {
            self.reopen()?;
            self.position = 0;
            return Ok(());
        }

        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: frame,
                    track_id: self.track_id,
                },
            )
            .map_err(|e| AudioError::Decode(format!("Seek failed: {}", e)))?;
        self.decoder.reset();
        self.skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts);
        self.position = frame;
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        self.seek(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::test_support::{frame_index, ramp_wav};

    #[test]
    fn rejects_garbage_header() {
        let data: Arc<[u8]> = vec![0x13u8; 512].into();
        assert!(matches!(
            BitstreamDecoder::open(data),
            Err(AudioError::Decode(_))
        ));
    }

    #[test]
    fn streams_whole_frames_until_exhausted() {
        let mut dec = BitstreamDecoder::open(ramp_wav(1000, 2, 8000)).unwrap();
        assert_eq!(dec.channels(), 2);
        assert_eq!(dec.sample_rate(), 8000);
        assert_eq!(dec.total_frames(), 1000);

        let mut out = Vec::new();
        let mut total = 0;
        loop {
            // Odd request size: must round down to whole frames.
            let frames = dec.stream_block(&mut out, 301);
            if frames == 0 {
                break;
            }
            assert!(frames <= 150);
            total += frames;
        }

        assert_eq!(total, 1000);
        assert_eq!(out.len(), 2000);
        assert_eq!(dec.samples_remaining(), 0);
        for (i, frame) in out.chunks(2).enumerate() {
            assert_eq!(frame_index(frame[0]), i as i64);
        }
    }

    #[test]
    fn rewind_restores_remaining_count() {
        let mut dec = BitstreamDecoder::open(ramp_wav(500, 1, 8000)).unwrap();
        let mut out = Vec::new();
        dec.stream_block(&mut out, 200);
        assert_eq!(dec.samples_remaining(), 300);

        dec.rewind().unwrap();
        assert_eq!(dec.samples_remaining(), 500);
        out.clear();
        assert_eq!(dec.stream_block(&mut out, 1), 1);
        assert_eq!(frame_index(out[0]), 0);
    }

    #[test]
    fn seek_lands_on_requested_frame() {
        let mut dec = BitstreamDecoder::open(ramp_wav(2000, 1, 8000)).unwrap();
        dec.seek(1234).unwrap();
        assert_eq!(dec.position(), 1234);
        assert_eq!(dec.samples_remaining(), 766);

        let mut out = Vec::new();
        dec.stream_block(&mut out, 4);
        assert_eq!(frame_index(out[0]), 1234);
    }

    #[test]
    fn decode_all_returns_full_clip() {
        let pcm = BitstreamDecoder::decode_all(ramp_wav(300, 1, 8000)).unwrap();
        assert_eq!(pcm.frames(), 300);
        assert_eq!(pcm.sample_rate, 8000);
        assert_eq!(frame_index(pcm.samples[299]), 299);
    }
}
