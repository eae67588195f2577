/// Music playback session.
///
/// Owns the current streaming source, an optional pending source that the
/// next tick swaps in, and a queue of pre-filled sources that take over when
/// a non-looping track runs out. A fade envelope is evaluated on every tick
/// before the streaming buffers are refilled.

use std::collections::VecDeque;
use std::time::Duration;

use super::decoder::SampleStream;
use super::mixer::SharedMixer;
use super::streaming::StreamingSource;
use crate::error::{AudioError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MusicState {
    Stopped,
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy)]
struct Fade {
    start: f32,
    end: f32,
    start_time: Duration,
    duration: Duration,
    stop_on_end: bool,
}

impl Fade {
    fn full() -> Self {
        Self {
            start: 1.0,
            end: 1.0,
            start_time: Duration::ZERO,
            duration: Duration::ZERO,
            stop_on_end: false,
        }
    }

    fn gain_at(&self, now: Duration) -> f32 {
        if self.duration.is_zero() {
            return self.end;
        }
        let elapsed = now.saturating_sub(self.start_time).as_secs_f32();
        let step = (elapsed / self.duration.as_secs_f32()).clamp(0.0, 1.0);
        if step >= 1.0 {
            return self.end;
        }
        self.start + (self.end - self.start) * step
    }
}

struct QueuedTrack {
    name: String,
    source: StreamingSource,
}

/// What is needed to rebuild the session on another device.
#[derive(Debug, Clone, PartialEq)]
pub struct MusicSnapshot {
    pub name: String,
    pub looping: bool,
    pub position_frames: u64,
    pub state: MusicState,
    pub queue: Vec<(String, bool)>,
}

pub struct MusicSession {
    mixer: SharedMixer,
    block_samples: usize,
    current_name: String,
    current: Option<StreamingSource>,
    pending: Option<StreamingSource>,
    queue: VecDeque<QueuedTrack>,
    state: MusicState,
    fade: Fade,
    fade_gain: f32,
    applied_gain: Option<f32>,
    volume: f32,
    enabled: bool,
}

impl MusicSession {
    pub fn new(mixer: SharedMixer, block_samples: usize, volume: f32, enabled: bool) -> Self {
        Self {
            mixer,
            block_samples,
            current_name: String::new(),
            current: None,
            pending: None,
            queue: VecDeque::new(),
            state: MusicState::Stopped,
            fade: Fade::full(),
            fade_gain: 1.0,
            applied_gain: None,
            volume: volume.clamp(0.0, 1.0),
            enabled,
        }
    }

    pub fn state(&self) -> MusicState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == MusicState::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.state == MusicState::Paused
    }

    /// Name of the current (or pending) track; empty when nothing is loaded.
    pub fn current_name(&self) -> &str {
        &self.current_name
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn fade_target(&self) -> f32 {
        self.fade.end
    }

    /// Fade factor evaluated by the last tick.
    pub fn fade_gain(&self) -> f32 {
        self.fade_gain
    }

    pub fn queued_names(&self) -> Vec<String> {
        self.queue.iter().map(|t| t.name.clone()).collect()
    }

    fn open_source<F>(&self, name: &str, looping: bool, open: F) -> Result<StreamingSource>
    where
        F: FnOnce() -> Result<Box<dyn SampleStream>>,
    {
        let decoder = open()?;
        let mut source = StreamingSource::new(self.mixer.clone(), decoder, looping, self.block_samples);
        if !source.prepare() {
            return Err(AudioError::EmptyStream(name.to_string()));
        }
        Ok(source)
    }

    fn target_gain(&self) -> f32 {
        self.volume * self.fade_gain
    }

    /// Plays `source` as the current track, held paused when the session is
    /// paused or music is disabled.
    fn install(&mut self, mut source: StreamingSource) {
        let gain = self.target_gain();
        source.set_volume(gain);
        self.applied_gain = Some(gain);

        match self.state {
            MusicState::Stopped => source.stop(),
            MusicState::Playing if self.enabled => source.play(),
            _ => {
                source.play();
                source.pause();
            }
        }
        self.current = Some(source);
    }

    fn install_pending(&mut self) {
        if let Some(source) = self.pending.take() {
            // Old source goes first so its voice is released before the new one starts.
            self.current = None;
            self.install(source);
        }
    }

    /// Switches to `name`. The track is decoded and pre-filled now and takes
    /// over on the next tick. Playing the current track again resumes it with
    /// the new loop flag.
    pub fn play<F>(&mut self, name: &str, looping: bool, open: F) -> Result<()>
    where
        F: FnOnce() -> Result<Box<dyn SampleStream>>,
    {
        if !self.current_name.is_empty() && self.current_name == name {
            if let Some(source) = self.pending.as_mut().or(self.current.as_mut()) {
                source.set_looping(looping);
            }
            self.resume();
            return Ok(());
        }

        let source = self.open_source(name, looping, open)?;
        self.pending = Some(source);
        self.current_name = name.to_string();
        self.fade = Fade::full();
        self.fade_gain = 1.0;
        self.applied_gain = None;
        self.state = MusicState::Playing;
        log::info!("Switching music to '{}'", name);
        Ok(())
    }

    /// Appends `name` to the queue, pre-filled so the handoff is seamless.
    /// With nothing loaded, or with the session stopped, this is the same as
    /// [`MusicSession::play`].
    pub fn queue<F>(&mut self, name: &str, looping: bool, open: F) -> Result<()>
    where
        F: FnOnce() -> Result<Box<dyn SampleStream>>,
    {
        let stopped = self.state == MusicState::Stopped && self.pending.is_none();
        if self.current_name.is_empty() || stopped {
            return self.play(name, looping, open);
        }
        let source = self.open_source(name, looping, open)?;
        self.queue.push_back(QueuedTrack {
            name: name.to_string(),
            source,
        });
        log::debug!("Queued '{}' ({} waiting)", name, self.queue.len());
        Ok(())
    }

    /// Stops and rewinds. A pending switch is installed, stopped. Cancels any fade.
    pub fn stop(&mut self) {
        self.state = MusicState::Stopped;
        self.install_pending();
        if let Some(source) = self.current.as_mut() {
            source.stop();
        }
        self.fade = Fade::full();
        self.fade_gain = 1.0;
        self.applied_gain = None;
    }

    /// Only a playing session can be paused.
    pub fn pause(&mut self) {
        if self.state != MusicState::Playing {
            return;
        }
        self.state = MusicState::Paused;
        if let Some(source) = self.current.as_ref() {
            source.pause();
        }
    }

    pub fn resume(&mut self) {
        if self.current.is_none() && self.pending.is_none() {
            return;
        }
        let previous = self.state;
        self.state = MusicState::Playing;
        // A finished fade to silence would pause again on the next tick.
        if self.fade.end == 0.0 && self.fade_gain == 0.0 {
            self.fade = Fade::full();
            self.fade_gain = 1.0;
            self.applied_gain = None;
        }
        // A pending source is started by the next tick.
        if self.pending.is_some() {
            return;
        }
        let Some(source) = self.current.as_mut() else {
            return;
        };

        let started = match previous {
            MusicState::Stopped => source.start(),
            MusicState::Paused => {
                source.play();
                true
            }
            MusicState::Playing => true,
        };
        if !started {
            log::warn!("Could not restart '{}'", self.current_name);
            self.state = MusicState::Stopped;
            return;
        }
        if !self.enabled {
            source.pause();
        }
    }

    /// Starts a fade from `start` to `end` over `duration`. Fading to silence
    /// while not playing takes effect at once.
    pub fn set_fade(&mut self, start: f32, end: f32, duration: Duration, stop_on_end: bool, now: Duration) {
        let start = start.clamp(0.0, 1.0);
        let end = end.clamp(0.0, 1.0);

        if end == 0.0 && self.state != MusicState::Playing {
            if stop_on_end {
                self.stop();
            } else {
                self.pause();
            }
            return;
        }

        self.fade = Fade {
            start,
            end,
            start_time: now,
            duration,
            stop_on_end,
        };
        if self.state == MusicState::Paused {
            self.resume();
        }
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        let gain = self.target_gain();
        if let Some(source) = self.current.as_ref() {
            source.set_volume(gain);
            self.applied_gain = Some(gain);
        }
    }

    /// Disabled music keeps its logical state; the voice is held paused.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if self.state != MusicState::Playing {
            return;
        }
        if let Some(source) = self.current.as_ref() {
            if enabled {
                source.play();
            } else {
                source.pause();
            }
        }
    }

    /// One update step: install a pending switch, evaluate the fade, then
    /// refill buffers and advance the queue when the track has finished.
    pub fn tick(&mut self, now: Duration) {
        self.install_pending();

        if self.state != MusicState::Playing {
            return;
        }

        self.fade_gain = self.fade.gain_at(now);
        let gain = self.target_gain();
        if self.applied_gain != Some(gain) {
            if let Some(source) = self.current.as_ref() {
                source.set_volume(gain);
            }
            self.applied_gain = Some(gain);
        }

        if self.fade_gain == 0.0 && self.fade.end == 0.0 {
            log::debug!("Fade finished on '{}'", self.current_name);
            if self.fade.stop_on_end {
                self.stop();
            } else {
                self.pause();
            }
            return;
        }

        let finished = match self.current.as_mut() {
            Some(source) => !source.tick(),
            None => false,
        };
        if finished {
            self.advance();
        }
    }

    /// Hands over to the next queued track, or stops when the queue is empty.
    fn advance(&mut self) {
        match self.queue.pop_front() {
            Some(next) => {
                log::info!("'{}' finished, continuing with '{}'", self.current_name, next.name);
                self.current = None;
                self.current_name = next.name;
                self.install(next.source);
            }
            None => {
                log::debug!("'{}' finished", self.current_name);
                self.stop();
            }
        }
    }

    fn active(&self) -> Option<&StreamingSource> {
        self.pending.as_ref().or(self.current.as_ref())
    }

    pub fn progress(&self) -> f32 {
        self.active().map(|s| s.progress()).unwrap_or(0.0)
    }

    pub fn position_secs(&self) -> f64 {
        self.active().map(|s| s.position_secs()).unwrap_or(0.0)
    }

    pub fn duration_secs(&self) -> f64 {
        self.active().map(|s| s.duration_secs()).unwrap_or(0.0)
    }

    pub fn seek_frame(&mut self, frame: u64) {
        let ok = match self.pending.as_mut().or(self.current.as_mut()) {
            Some(source) => source.seek(frame),
            None => return,
        };
        if !ok && self.pending.is_none() && self.state != MusicState::Stopped {
            self.advance();
        }
    }

    /// Seeks to `fraction` of the track. Seeking to the very end finishes it.
    pub fn seek(&mut self, fraction: f32) {
        let Some(total) = self.active().map(|s| s.total_frames()) else {
            return;
        };
        let frame = (fraction.clamp(0.0, 1.0) as f64 * total as f64) as u64;
        self.seek_frame(frame);
    }

    /// Moves the play position by `seconds`, which may be negative.
    pub fn skip(&mut self, seconds: f64) {
        let Some((position, rate)) = self.active().map(|s| (s.position_secs(), s.sample_rate())) else {
            return;
        };
        let target = ((position + seconds).max(0.0) * rate as f64).round() as u64;
        self.seek_frame(target);
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    /// Drops every source and forgets the current track.
    pub fn clear(&mut self) {
        self.pending = None;
        self.current = None;
        self.queue.clear();
        self.current_name.clear();
        self.state = MusicState::Stopped;
        self.fade = Fade::full();
        self.fade_gain = 1.0;
        self.applied_gain = None;
    }

    pub fn snapshot(&self) -> Option<MusicSnapshot> {
        let source = self.active()?;
        Some(MusicSnapshot {
            name: self.current_name.clone(),
            looping: source.looping(),
            position_frames: source.position_frames(),
            state: self.state,
            queue: self
                .queue
                .iter()
                .map(|t| (t.name.clone(), t.source.looping()))
                .collect(),
        })
    }
}
