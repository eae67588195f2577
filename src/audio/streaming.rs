/// Double-buffered streaming voice.
///
/// One voice, two buffers. Each tick, buffers the voice has finished are
/// unqueued, refilled from the decoder and queued again, so only two blocks
/// of decoded audio are ever resident.

use std::sync::Arc;

use super::decoder::SampleStream;
use super::mixer::{report, BufferId, Pcm, SharedMixer, VoiceId, VoiceState};

pub struct StreamingSource {
    mixer: SharedMixer,
    voice: VoiceId,
    buffers: [BufferId; 2],
    decoder: Box<dyn SampleStream>,
    looping: bool,
    block_samples: usize,
    scratch: Vec<f32>,
}

impl StreamingSource {
    pub fn new(
        mixer: SharedMixer,
        decoder: Box<dyn SampleStream>,
        looping: bool,
        block_samples: usize,
    ) -> Self {
        let (voice, buffers) = {
            let mut m = mixer.lock();
            (m.create_voice(), [m.create_buffer(), m.create_buffer()])
        };
        let block_samples = block_samples.max(decoder.channels());
        Self {
            mixer,
            voice,
            buffers,
            decoder,
            looping,
            block_samples,
            scratch: Vec::with_capacity(block_samples),
        }
    }

    pub fn voice(&self) -> VoiceId {
        self.voice
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    /// Takes effect the next time the decoder runs dry.
    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    /// Decodes the next block into `buffer`. False when the decoder had nothing left.
    fn stream(&mut self, buffer: BufferId) -> bool {
        self.scratch.clear();
        let frames = self.decoder.stream_block(&mut self.scratch, self.block_samples);
        if frames == 0 {
            return false;
        }
        let pcm = Pcm {
            samples: Arc::from(&self.scratch[..]),
            channels: self.decoder.channels(),
            sample_rate: self.decoder.sample_rate(),
        };
        report(self.mixer.lock().buffer_data(buffer, pcm));
        true
    }

    /// Fills both buffers and queues them without starting the voice.
    /// Nothing is queued when the stream is empty.
    pub fn prepare(&mut self) -> bool {
        let [first, second] = self.buffers;
        if !self.stream(first) || !self.stream(second) {
            return false;
        }
        let mut m = self.mixer.lock();
        report(m.queue_buffers(self.voice, &self.buffers));
        report(m.rewind(self.voice));
        true
    }

    /// Both buffers queued and the voice not yet started.
    fn primed(&self) -> bool {
        let m = self.mixer.lock();
        matches!(m.voice_state(self.voice), Ok(VoiceState::Initial))
            && matches!(m.buffers_queued(self.voice), Ok(n) if n > 0)
    }

    /// `prepare` followed by play. A voice that is already primed just plays.
    pub fn start(&mut self) -> bool {
        if !self.primed() && !self.prepare() {
            return false;
        }
        self.play();
        true
    }

    /// Refills whatever the voice has consumed. Returns false once the track
    /// has finished (decoder exhausted and not looping).
    pub fn tick(&mut self) -> bool {
        let processed = report(self.mixer.lock().buffers_processed(self.voice)).unwrap_or(0);

        for _ in 0..processed {
            let buffer = match report(self.mixer.lock().unqueue_buffers(self.voice, 1)) {
                Some(mut removed) if !removed.is_empty() => removed.remove(0),
                _ => return false,
            };

            if !self.stream(buffer) {
                let mut exhausted = true;
                if self.looping {
                    match self.decoder.rewind() {
                        Ok(()) => exhausted = !self.stream(buffer),
                        Err(e) => log::warn!("Rewind failed, ending track: {}", e),
                    }
                }
                if exhausted {
                    return false;
                }
            }

            report(self.mixer.lock().queue_buffers(self.voice, &[buffer]));
        }

        // Both buffers ran dry in one tick: the voice stopped itself.
        if processed == 2 {
            self.play();
        }

        true
    }

    pub fn play(&self) {
        report(self.mixer.lock().play(self.voice));
    }

    pub fn pause(&self) {
        report(self.mixer.lock().pause(self.voice));
    }

    pub fn set_volume(&self, gain: f32) {
        report(self.mixer.lock().set_gain(self.voice, gain));
    }

    pub fn voice_state(&self) -> VoiceState {
        report(self.mixer.lock().voice_state(self.voice)).unwrap_or(VoiceState::Stopped)
    }

    /// Halts the voice and drops every queued buffer.
    fn halt(&self) {
        let mut m = self.mixer.lock();
        report(m.stop(self.voice));
        report(m.set_buffer(self.voice, None));
    }

    /// Stops playback and rewinds the decoder; `start` plays from the top again.
    pub fn stop(&mut self) {
        self.halt();
        if let Err(e) = self.decoder.rewind() {
            log::warn!("Rewind after stop failed: {}", e);
        }
    }

    /// Moves playback to `frame`, keeping the voice's play/pause state.
    /// Returns false if nothing could be decoded at the new position.
    pub fn seek(&mut self, frame: u64) -> bool {
        let was_playing = self.voice_state() == VoiceState::Playing;
        self.halt();
        if let Err(e) = self.decoder.seek(frame) {
            log::warn!("Seek to frame {} failed: {}", frame, e);
            return false;
        }
        if !self.prepare() {
            return false;
        }
        if was_playing {
            self.play();
        }
        true
    }

    /// Playback progress from 0 to 1, measured at the decoder.
    pub fn progress(&self) -> f32 {
        let total = self.decoder.total_frames();
        if total == 0 {
            return 0.0;
        }
        1.0 - self.decoder.samples_remaining() as f32 / total as f32
    }

    pub fn position_frames(&self) -> u64 {
        self.decoder.position()
    }

    pub fn position_secs(&self) -> f64 {
        self.decoder.position() as f64 / self.decoder.sample_rate().max(1) as f64
    }

    pub fn duration_secs(&self) -> f64 {
        self.decoder.total_frames() as f64 / self.decoder.sample_rate().max(1) as f64
    }

    pub fn sample_rate(&self) -> u32 {
        self.decoder.sample_rate()
    }

    pub fn total_frames(&self) -> u64 {
        self.decoder.total_frames()
    }
}

impl Drop for StreamingSource {
    fn drop(&mut self) {
        let mut m = self.mixer.lock();
        report(m.stop(self.voice));
        report(m.delete_voice(self.voice));
        for buffer in self.buffers {
            report(m.delete_buffer(buffer));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mixer::Mixer;
    use crate::audio::test_support::{frame_index, RampStream};

    fn source(total: u64, looping: bool) -> (SharedMixer, StreamingSource) {
        let mixer = Mixer::shared(8000, 1);
        let src = StreamingSource::new(mixer.clone(), Box::new(RampStream::new(total)), looping, 100);
        (mixer, src)
    }

    fn render(mixer: &SharedMixer, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames];
        mixer.lock().render(&mut out);
        out
    }

    #[test]
    fn start_queues_both_buffers_and_plays() {
        let (mixer, mut src) = source(1000, false);
        assert!(src.start());
        assert_eq!(mixer.lock().buffers_queued(src.voice()).unwrap(), 2);
        assert_eq!(src.voice_state(), VoiceState::Playing);
        assert_eq!(src.position_frames(), 200);
    }

    #[test]
    fn empty_stream_fails_to_start_and_queues_nothing() {
        let (mixer, mut src) = source(0, false);
        assert!(!src.start());
        assert_eq!(mixer.lock().buffers_queued(src.voice()).unwrap(), 0);
        assert_eq!(src.voice_state(), VoiceState::Initial);
    }

    #[test]
    fn refilled_audio_is_continuous() {
        let (mixer, mut src) = source(1000, false);
        src.start();

        let mut heard = Vec::new();
        for _ in 0..8 {
            heard.extend(render(&mixer, 100));
            assert!(src.tick());
        }

        for (i, s) in heard.iter().enumerate() {
            assert_eq!(frame_index(*s), i as i64);
        }
    }

    #[test]
    fn finite_stream_reports_finished() {
        let (mixer, mut src) = source(250, false);
        src.start();

        render(&mixer, 150);
        assert!(src.tick());
        render(&mixer, 100);
        assert!(!src.tick());
    }

    #[test]
    fn looping_stream_wraps_instead_of_finishing() {
        let (mixer, mut src) = source(250, true);
        src.start();

        let mut wrapped = false;
        let mut last = src.progress();
        for _ in 0..10 {
            render(&mixer, 100);
            assert!(src.tick());
            wrapped |= src.progress() < last;
            last = src.progress();
        }
        assert!(wrapped);
    }

    #[test]
    fn looping_can_be_switched_on_while_playing() {
        let (mixer, mut src) = source(250, false);
        src.start();
        src.set_looping(true);

        render(&mixer, 150);
        assert!(src.tick());
        render(&mixer, 100);
        assert!(src.tick());
        let out = render(&mixer, 1);
        assert_eq!(frame_index(out[0]), 0);
    }

    #[test]
    fn stalled_voice_is_restarted() {
        let (mixer, mut src) = source(1000, false);
        src.start();

        render(&mixer, 400);
        assert_eq!(src.voice_state(), VoiceState::Stopped);

        assert!(src.tick());
        assert_eq!(src.voice_state(), VoiceState::Playing);
        let out = render(&mixer, 1);
        assert_eq!(frame_index(out[0]), 200);
    }

    #[test]
    fn stop_rewinds_and_start_replays_from_top() {
        let (mixer, mut src) = source(1000, false);
        src.start();
        render(&mixer, 150);
        src.tick();

        src.stop();
        assert_eq!(mixer.lock().buffers_queued(src.voice()).unwrap(), 0);
        assert_eq!(src.progress(), 0.0);

        assert!(src.start());
        let out = render(&mixer, 1);
        assert_eq!(frame_index(out[0]), 0);
    }

    #[test]
    fn seek_keeps_paused_voice_paused() {
        let (mixer, mut src) = source(1000, false);
        src.start();
        src.pause();

        assert!(src.seek(500));
        assert_eq!(src.voice_state(), VoiceState::Initial);
        assert_eq!(mixer.lock().buffers_processed(src.voice()).unwrap(), 0);

        src.play();
        let out = render(&mixer, 1);
        assert_eq!(frame_index(out[0]), 500);
    }

    #[test]
    fn start_after_prepare_does_not_queue_twice() {
        let (mixer, mut src) = source(1000, false);
        assert!(src.prepare());
        assert!(src.start());
        assert_eq!(mixer.lock().buffers_queued(src.voice()).unwrap(), 2);
        assert_eq!(src.position_frames(), 200);
    }

    #[test]
    fn drop_releases_voice_and_buffers() {
        let (mixer, mut src) = source(1000, false);
        src.start();
        drop(src);
        assert_eq!(mixer.lock().voice_count(), 0);
        assert_eq!(mixer.lock().buffer_count(), 0);
    }
}
