/// Software voices and buffers.
///
/// The playback code is written against a small voice/buffer API:
///   - buffers hold immutable interleaved f32 PCM,
///   - a voice either plays one bound buffer (optionally looping) or walks a
///     queue of buffers, reporting how many it has finished ("processed"),
///   - voices have gain, pitch and an Initial/Playing/Paused/Stopped state.
///
/// `Mixer::render` sums every playing voice into the output block. It is called
/// from the cpal callback (or by hand for headless devices), always under the
/// shared mutex, so every operation here must stay short and allocation-free
/// on the render path.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Output ceiling applied after mixing. Catches NaN/Inf and overlapping voices.
const HARD_LIMIT_CEILING: f32 = 0.99;

/// Lowest pitch a voice accepts. Zero would freeze the voice forever.
const MIN_PITCH: f32 = 0.01;

pub type SharedMixer = Arc<Mutex<Mixer>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u32);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    #[error("invalid voice {0:?}")]
    InvalidVoice(VoiceId),
    #[error("invalid buffer {0:?}")]
    InvalidBuffer(BufferId),
    #[error("buffer {0:?} is attached to a voice")]
    BufferInUse(BufferId),
    #[error("voice {0:?} is playing")]
    VoiceBusy(VoiceId),
    #[error("cannot unqueue {requested} buffers, only {processed} processed")]
    NotProcessed { requested: usize, processed: usize },
    #[error("invalid PCM layout: {samples} samples, {channels} channels")]
    InvalidFormat { samples: usize, channels: usize },
}

/// Hardware errors are diagnostics, not failures: logged in debug builds,
/// dropped in release.
pub fn report<T>(result: Result<T, HardwareError>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            if cfg!(debug_assertions) {
                log::warn!("Audio hardware error: {}", e);
            }
            None
        }
    }
}

/// Interleaved PCM block.
#[derive(Clone, Debug)]
pub struct Pcm {
    pub samples: Arc<[f32]>,
    pub channels: usize,
    pub sample_rate: u32,
}

impl Pcm {
    pub fn new(samples: Vec<f32>, channels: usize, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            channels,
            sample_rate,
        }
    }

    fn empty() -> Self {
        Self::new(Vec::new(), 1, 0)
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// One output channel of frame `frame`, mapped onto an `out_channels` layout.
    /// Mono is duplicated, multichannel is averaged down to mono, and extra
    /// output channels beyond the source layout stay silent.
    #[inline]
    fn channel_sample(&self, frame: usize, out_c: usize, out_channels: usize) -> f32 {
        let base = frame * self.channels;
        if self.channels == 1 {
            self.samples[base]
        } else if out_channels == 1 {
            let sum: f32 = self.samples[base..base + self.channels].iter().sum();
            sum / self.channels as f32
        } else if out_c < self.channels {
            self.samples[base + out_c]
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Initial,
    Playing,
    Paused,
    Stopped,
}

struct Voice {
    state: VoiceState,
    gain: f32,
    pitch: f32,
    looping: bool,
    /// Bound buffer (len 1) or streaming queue.
    queue: Vec<BufferId>,
    /// Index of the buffer being played; everything before it is processed.
    cursor: usize,
    /// Fractional frame offset into `queue[cursor]`.
    position: f64,
}

impl Voice {
    fn new() -> Self {
        Self {
            state: VoiceState::Initial,
            gain: 1.0,
            pitch: 1.0,
            looping: false,
            queue: Vec::new(),
            cursor: 0,
            position: 0.0,
        }
    }

    fn processed(&self) -> usize {
        match self.state {
            VoiceState::Stopped => self.queue.len(),
            VoiceState::Initial => 0,
            _ if self.looping => 0,
            _ => self.cursor.min(self.queue.len()),
        }
    }

    fn restart(&mut self) {
        self.cursor = 0;
        self.position = 0.0;
    }
}

pub struct Mixer {
    sample_rate: u32,
    channels: usize,
    voices: HashMap<VoiceId, Voice>,
    buffers: HashMap<BufferId, Pcm>,
    next_id: u32,
}

impl Mixer {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            voices: HashMap::new(),
            buffers: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn shared(sample_rate: u32, channels: usize) -> SharedMixer {
        Arc::new(Mutex::new(Self::new(sample_rate, channels)))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    // ─── Buffers ───

    pub fn create_buffer(&mut self) -> BufferId {
        let id = BufferId(self.next_id());
        self.buffers.insert(id, Pcm::empty());
        id
    }

    pub fn buffer_data(&mut self, buffer: BufferId, pcm: Pcm) -> Result<(), HardwareError> {
        if pcm.channels == 0 || pcm.samples.len() % pcm.channels != 0 {
            return Err(HardwareError::InvalidFormat {
                samples: pcm.samples.len(),
                channels: pcm.channels,
            });
        }
        if !self.buffers.contains_key(&buffer) {
            return Err(HardwareError::InvalidBuffer(buffer));
        }
        if self.buffer_attached(buffer) {
            return Err(HardwareError::BufferInUse(buffer));
        }
        self.buffers.insert(buffer, pcm);
        Ok(())
    }

    pub fn delete_buffer(&mut self, buffer: BufferId) -> Result<(), HardwareError> {
        if self.buffer_attached(buffer) {
            return Err(HardwareError::BufferInUse(buffer));
        }
        self.buffers
            .remove(&buffer)
            .map(|_| ())
            .ok_or(HardwareError::InvalidBuffer(buffer))
    }

    /// Stops and detaches every voice still using `buffer`, then deletes it.
    pub fn release_buffer(&mut self, buffer: BufferId) {
        for v in self.voices.values_mut() {
            if v.queue.contains(&buffer) {
                v.queue.retain(|b| *b != buffer);
                v.state = VoiceState::Stopped;
                v.cursor = v.queue.len();
                v.position = 0.0;
            }
        }
        self.buffers.remove(&buffer);
    }

    fn buffer_attached(&self, buffer: BufferId) -> bool {
        self.voices.values().any(|v| v.queue.contains(&buffer))
    }

    // ─── Voices ───

    pub fn create_voice(&mut self) -> VoiceId {
        let id = VoiceId(self.next_id());
        self.voices.insert(id, Voice::new());
        id
    }

    /// Removes the voice and detaches everything it referenced.
    pub fn delete_voice(&mut self, voice: VoiceId) -> Result<(), HardwareError> {
        self.voices
            .remove(&voice)
            .map(|_| ())
            .ok_or(HardwareError::InvalidVoice(voice))
    }

    fn voice_mut(&mut self, voice: VoiceId) -> Result<&mut Voice, HardwareError> {
        self.voices
            .get_mut(&voice)
            .ok_or(HardwareError::InvalidVoice(voice))
    }

    fn voice(&self, voice: VoiceId) -> Result<&Voice, HardwareError> {
        self.voices.get(&voice).ok_or(HardwareError::InvalidVoice(voice))
    }

    /// Binds a single buffer (or none) to a voice that is not currently active.
    pub fn set_buffer(&mut self, voice: VoiceId, buffer: Option<BufferId>) -> Result<(), HardwareError> {
        if let Some(b) = buffer {
            if !self.buffers.contains_key(&b) {
                return Err(HardwareError::InvalidBuffer(b));
            }
        }
        let v = self.voice_mut(voice)?;
        if matches!(v.state, VoiceState::Playing | VoiceState::Paused) {
            return Err(HardwareError::VoiceBusy(voice));
        }
        v.queue.clear();
        v.queue.extend(buffer);
        v.restart();
        v.state = VoiceState::Initial;
        Ok(())
    }

    pub fn queue_buffers(&mut self, voice: VoiceId, buffers: &[BufferId]) -> Result<(), HardwareError> {
        if let Some(missing) = buffers.iter().find(|b| !self.buffers.contains_key(b)) {
            return Err(HardwareError::InvalidBuffer(*missing));
        }
        let v = self.voice_mut(voice)?;
        v.queue.extend_from_slice(buffers);
        Ok(())
    }

    /// Removes `count` processed buffers from the front of the voice's queue.
    pub fn unqueue_buffers(&mut self, voice: VoiceId, count: usize) -> Result<Vec<BufferId>, HardwareError> {
        let v = self.voice_mut(voice)?;
        let processed = v.processed();
        if count > processed {
            return Err(HardwareError::NotProcessed {
                requested: count,
                processed,
            });
        }
        let removed: Vec<BufferId> = v.queue.drain(..count).collect();
        v.cursor = v.cursor.saturating_sub(count);
        Ok(removed)
    }

    pub fn buffers_processed(&self, voice: VoiceId) -> Result<usize, HardwareError> {
        Ok(self.voice(voice)?.processed())
    }

    pub fn buffers_queued(&self, voice: VoiceId) -> Result<usize, HardwareError> {
        Ok(self.voice(voice)?.queue.len())
    }

    /// Starts the voice. Playing voices are left untouched; stopped or initial
    /// voices restart from the front of their queue; paused voices continue.
    pub fn play(&mut self, voice: VoiceId) -> Result<(), HardwareError> {
        let v = self.voice_mut(voice)?;
        match v.state {
            VoiceState::Playing => {}
            VoiceState::Paused => v.state = VoiceState::Playing,
            VoiceState::Initial | VoiceState::Stopped => {
                v.restart();
                v.state = VoiceState::Playing;
            }
        }
        Ok(())
    }

    pub fn pause(&mut self, voice: VoiceId) -> Result<(), HardwareError> {
        let v = self.voice_mut(voice)?;
        if v.state == VoiceState::Playing {
            v.state = VoiceState::Paused;
        }
        Ok(())
    }

    /// Stops the voice; every queued buffer counts as processed afterwards.
    pub fn stop(&mut self, voice: VoiceId) -> Result<(), HardwareError> {
        let v = self.voice_mut(voice)?;
        if v.state != VoiceState::Initial {
            v.state = VoiceState::Stopped;
            v.cursor = v.queue.len();
            v.position = 0.0;
        }
        Ok(())
    }

    pub fn rewind(&mut self, voice: VoiceId) -> Result<(), HardwareError> {
        let v = self.voice_mut(voice)?;
        v.state = VoiceState::Initial;
        v.restart();
        Ok(())
    }

    pub fn voice_state(&self, voice: VoiceId) -> Result<VoiceState, HardwareError> {
        Ok(self.voice(voice)?.state)
    }

    pub fn set_gain(&mut self, voice: VoiceId, gain: f32) -> Result<(), HardwareError> {
        self.voice_mut(voice)?.gain = gain.max(0.0);
        Ok(())
    }

    pub fn gain(&self, voice: VoiceId) -> Result<f32, HardwareError> {
        Ok(self.voice(voice)?.gain)
    }

    pub fn set_pitch(&mut self, voice: VoiceId, pitch: f32) -> Result<(), HardwareError> {
        self.voice_mut(voice)?.pitch = pitch.max(MIN_PITCH);
        Ok(())
    }

    pub fn pitch(&self, voice: VoiceId) -> Result<f32, HardwareError> {
        Ok(self.voice(voice)?.pitch)
    }

    pub fn set_looping(&mut self, voice: VoiceId, looping: bool) -> Result<(), HardwareError> {
        self.voice_mut(voice)?.looping = looping;
        Ok(())
    }

    // ─── Rendering ───

    /// Mixes all playing voices into `out` (interleaved, `self.channels` wide).
    pub fn render(&mut self, out: &mut [f32]) {
        for s in out.iter_mut() {
            *s = 0.0;
        }

        let out_channels = self.channels;
        let device_rate = self.sample_rate as f64;
        let buffers = &self.buffers;
        for voice in self.voices.values_mut() {
            if voice.state == VoiceState::Playing {
                mix_voice(voice, buffers, out, out_channels, device_rate);
            }
        }

        for s in out.iter_mut() {
            *s = hard_limit(*s);
        }
    }
}

/// Moves the voice onto a buffer that still has data at its offset, wrapping
/// when looping. Returns false once the voice has run out and stopped.
fn settle(voice: &mut Voice, buffers: &HashMap<BufferId, Pcm>) -> bool {
    let mut skipped = 0;
    loop {
        if voice.cursor >= voice.queue.len() {
            if voice.looping && !voice.queue.is_empty() && skipped <= voice.queue.len() {
                voice.cursor = 0;
            } else {
                voice.state = VoiceState::Stopped;
                voice.cursor = voice.queue.len();
                voice.position = 0.0;
                return false;
            }
        }
        let frames = buffers
            .get(&voice.queue[voice.cursor])
            .map(|pcm| pcm.frames() as f64)
            .unwrap_or(0.0);
        if voice.position < frames {
            return true;
        }
        voice.position = (voice.position - frames).max(0.0);
        voice.cursor += 1;
        skipped += 1;
    }
}

fn mix_voice(
    voice: &mut Voice,
    buffers: &HashMap<BufferId, Pcm>,
    out: &mut [f32],
    out_channels: usize,
    device_rate: f64,
) {
    let frames_out = out.len() / out_channels;

    for frame in 0..frames_out {
        if !settle(voice, buffers) {
            return;
        }
        let Some(pcm) = buffers.get(&voice.queue[voice.cursor]) else {
            return;
        };

        let frames = pcm.frames();
        let idx = voice.position as usize;
        let next = (idx + 1).min(frames - 1);
        let frac = (voice.position - idx as f64) as f32;

        let base = frame * out_channels;
        for c in 0..out_channels {
            let a = pcm.channel_sample(idx, c, out_channels);
            let s = if frac > 0.0 {
                let b = pcm.channel_sample(next, c, out_channels);
                a + (b - a) * frac
            } else {
                a
            };
            out[base + c] += s * voice.gain;
        }

        voice.position += voice.pitch as f64 * pcm.sample_rate as f64 / device_rate;
    }

    // Finished buffers count as processed as soon as the block ends.
    settle(voice, buffers);
}

#[inline(always)]
fn hard_limit(s: f32) -> f32 {
    if s.is_finite() {
        s.clamp(-HARD_LIMIT_CEILING, HARD_LIMIT_CEILING)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono(samples: &[f32], rate: u32) -> Pcm {
        Pcm::new(samples.to_vec(), 1, rate)
    }

    #[test]
    fn static_voice_plays_once_then_stops() {
        let mut mixer = Mixer::new(100, 1);
        let buf = mixer.create_buffer();
        mixer.buffer_data(buf, mono(&[0.5, 0.25], 100)).unwrap();
        let voice = mixer.create_voice();
        mixer.set_buffer(voice, Some(buf)).unwrap();
        mixer.play(voice).unwrap();

        let mut out = [0.0f32; 4];
        mixer.render(&mut out);

        assert_eq!(out, [0.5, 0.25, 0.0, 0.0]);
        assert_eq!(mixer.voice_state(voice).unwrap(), VoiceState::Stopped);
    }

    #[test]
    fn looping_voice_wraps() {
        let mut mixer = Mixer::new(100, 1);
        let buf = mixer.create_buffer();
        mixer.buffer_data(buf, mono(&[0.1, 0.2], 100)).unwrap();
        let voice = mixer.create_voice();
        mixer.set_buffer(voice, Some(buf)).unwrap();
        mixer.set_looping(voice, true).unwrap();
        mixer.play(voice).unwrap();

        let mut out = [0.0f32; 5];
        mixer.render(&mut out);

        assert_eq!(out, [0.1, 0.2, 0.1, 0.2, 0.1]);
        assert_eq!(mixer.voice_state(voice).unwrap(), VoiceState::Playing);
    }

    #[test]
    fn queue_reports_processed_buffers() {
        let mut mixer = Mixer::new(100, 1);
        let a = mixer.create_buffer();
        let b = mixer.create_buffer();
        mixer.buffer_data(a, mono(&[0.1; 4], 100)).unwrap();
        mixer.buffer_data(b, mono(&[0.2; 4], 100)).unwrap();
        let voice = mixer.create_voice();
        mixer.queue_buffers(voice, &[a, b]).unwrap();
        mixer.play(voice).unwrap();

        let mut out = [0.0f32; 5];
        mixer.render(&mut out);
        assert_eq!(mixer.buffers_processed(voice).unwrap(), 1);
        assert_eq!(mixer.unqueue_buffers(voice, 1).unwrap(), vec![a]);

        // Unqueueing more than processed is refused.
        assert!(matches!(
            mixer.unqueue_buffers(voice, 1),
            Err(HardwareError::NotProcessed { .. })
        ));

        let mut out = [0.0f32; 8];
        mixer.render(&mut out);
        assert_eq!(mixer.voice_state(voice).unwrap(), VoiceState::Stopped);
        assert_eq!(mixer.buffers_processed(voice).unwrap(), 1);
    }

    #[test]
    fn play_on_playing_voice_does_not_restart() {
        let mut mixer = Mixer::new(100, 1);
        let buf = mixer.create_buffer();
        mixer.buffer_data(buf, mono(&[0.1, 0.2, 0.3, 0.4], 100)).unwrap();
        let voice = mixer.create_voice();
        mixer.set_buffer(voice, Some(buf)).unwrap();
        mixer.play(voice).unwrap();

        let mut out = [0.0f32; 2];
        mixer.render(&mut out);
        mixer.play(voice).unwrap();
        mixer.render(&mut out);

        assert_eq!(out, [0.3, 0.4]);
    }

    #[test]
    fn paused_voice_is_silent_and_keeps_position() {
        let mut mixer = Mixer::new(100, 1);
        let buf = mixer.create_buffer();
        mixer.buffer_data(buf, mono(&[0.1, 0.2, 0.3], 100)).unwrap();
        let voice = mixer.create_voice();
        mixer.set_buffer(voice, Some(buf)).unwrap();
        mixer.play(voice).unwrap();

        let mut out = [0.0f32; 1];
        mixer.render(&mut out);
        mixer.pause(voice).unwrap();
        mixer.render(&mut out);
        assert_eq!(out, [0.0]);

        mixer.play(voice).unwrap();
        mixer.render(&mut out);
        assert_eq!(out, [0.2]);
    }

    #[test]
    fn gain_pitch_and_channel_mapping() {
        let mut mixer = Mixer::new(100, 2);
        let buf = mixer.create_buffer();
        mixer.buffer_data(buf, mono(&[0.4, 0.4, 0.4, 0.4], 100)).unwrap();
        let voice = mixer.create_voice();
        mixer.set_buffer(voice, Some(buf)).unwrap();
        mixer.set_gain(voice, 0.5).unwrap();
        mixer.set_pitch(voice, 2.0).unwrap();
        mixer.play(voice).unwrap();

        let mut out = [0.0f32; 8];
        mixer.render(&mut out);

        // Mono duplicated to both channels; pitch 2 consumes the clip in two frames.
        assert_eq!(&out[..4], &[0.2, 0.2, 0.2, 0.2]);
        assert_eq!(&out[4..], &[0.0; 4]);
    }

    #[test]
    fn output_is_hard_limited() {
        let mut mixer = Mixer::new(100, 1);
        let buf = mixer.create_buffer();
        mixer.buffer_data(buf, mono(&[0.8], 100)).unwrap();
        for _ in 0..2 {
            let voice = mixer.create_voice();
            mixer.set_buffer(voice, Some(buf)).unwrap();
            mixer.play(voice).unwrap();
        }

        let mut out = [0.0f32; 1];
        mixer.render(&mut out);
        assert_eq!(out[0], HARD_LIMIT_CEILING);
    }

    #[test]
    fn attached_buffers_cannot_be_rewritten_or_deleted() {
        let mut mixer = Mixer::new(100, 1);
        let buf = mixer.create_buffer();
        let voice = mixer.create_voice();
        mixer.queue_buffers(voice, &[buf]).unwrap();

        assert_eq!(
            mixer.buffer_data(buf, mono(&[0.1], 100)),
            Err(HardwareError::BufferInUse(buf))
        );
        assert_eq!(mixer.delete_buffer(buf), Err(HardwareError::BufferInUse(buf)));

        mixer.delete_voice(voice).unwrap();
        mixer.delete_buffer(buf).unwrap();
        assert_eq!(mixer.voice_count(), 0);
        assert_eq!(mixer.buffer_count(), 0);
    }
}
