use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::clock::{Clock, MonotonicClock};
use super::decoder::{BitstreamDecoder, SampleStream};
use super::device::{get_output_devices, AudioDeviceInfo, Device};
use super::library::AudioLibrary;
use super::mixer::SharedMixer;
use super::session::{MusicSession, MusicSnapshot, MusicState};
use super::sfx::{LoopingSfxInfo, SfxPlayer};
use crate::config::{AudioConfig, DeviceProfile, DeviceSelector};
use crate::error::{AudioError, Result};

/// State that only exists while a device is open.
struct Live {
    device: Device,
    music: MusicSession,
}

/// The audio engine as seen by the host: sound effects, music and the
/// per-frame `tick`. Nothing is global; hosts that tick from another thread
/// share the context through [`crate::audio::driver::AudioDriver`].
pub struct AudioContext {
    config: AudioConfig,
    clock: Box<dyn Clock>,
    library: AudioLibrary,
    sfx: SfxPlayer,
    live: Option<Live>,
}

fn opener(bytes: Arc<[u8]>) -> impl FnOnce() -> Result<Box<dyn SampleStream>> {
    move || Ok(Box::new(BitstreamDecoder::open(bytes)?) as Box<dyn SampleStream>)
}

impl AudioContext {
    /// A closed context; call [`AudioContext::init_context`] to open the device.
    pub fn new(config: AudioConfig) -> Self {
        Self::with_clock(config, Box::new(MonotonicClock::new()))
    }

    pub fn with_clock(config: AudioConfig, clock: Box<dyn Clock>) -> Self {
        let config = config.sanitized();
        let sfx = SfxPlayer::new(config.sfx_volume, config.sfx_enabled);
        Self {
            config,
            clock,
            library: AudioLibrary::new(),
            sfx,
            live: None,
        }
    }

    /// `new` followed by `init_context`.
    pub fn open(config: AudioConfig) -> Result<Self> {
        let mut ctx = Self::new(config);
        ctx.init_context()?;
        Ok(ctx)
    }

    // ─── Lifecycle ───

    /// Opens the configured output device. Does nothing if already open.
    pub fn init_context(&mut self) -> Result<()> {
        if self.live.is_some() {
            return Ok(());
        }
        let device = Device::open(&self.config.device)?;
        self.start_on(device);
        Ok(())
    }

    fn start_on(&mut self, device: Device) {
        self.apply_profile(device.name());
        self.sfx = SfxPlayer::new(self.config.sfx_volume, self.config.sfx_enabled);
        let music = MusicSession::new(
            device.mixer().clone(),
            self.config.stream_block_samples,
            self.config.music_volume,
            self.config.music_enabled,
        );
        self.live = Some(Live { device, music });
    }

    fn apply_profile(&mut self, device_name: &str) {
        if let Some(p) = self.config.profile(device_name).cloned() {
            log::info!(
                "Applying profile for '{}' (sfx {:.2}, music {:.2})",
                device_name,
                p.sfx_volume,
                p.music_volume
            );
            self.config.sfx_volume = p.sfx_volume;
            self.config.music_volume = p.music_volume;
        }
    }

    /// Frees every voice and buffer, forgets all loaded audio and closes the
    /// device. Calling it again is a no-op.
    pub fn destroy_context(&mut self) {
        let Some(mut live) = self.live.take() else {
            return;
        };
        let mixer = live.device.mixer().clone();
        self.sfx.clear(&mixer);
        live.music.clear();
        self.library.clear(&mixer);
        {
            let m = mixer.lock();
            if m.voice_count() > 0 || m.buffer_count() > 0 {
                log::warn!(
                    "Teardown left {} voices and {} buffers",
                    m.voice_count(),
                    m.buffer_count()
                );
            }
        }
        live.device.close();
        log::info!("Audio context destroyed");
    }

    pub fn is_open(&self) -> bool {
        self.live.is_some()
    }

    /// Moves playback to the output device called `name`.
    pub fn switch_to_device(&mut self, name: &str) -> Result<()> {
        self.switch_device(DeviceSelector::Named(name.to_string()))
    }

    /// Opens `selector` and moves everything over: sounds are uploaded
    /// again, music resumes where it was (queue included) and looping
    /// effects restart. The device's saved volumes are applied. The old
    /// device is kept if the new one cannot be opened.
    pub fn switch_device(&mut self, selector: DeviceSelector) -> Result<()> {
        let device = Device::open(&selector)?;
        let music = self.live.as_ref().and_then(|l| l.music.snapshot());
        let loops = self.sfx.looping_snapshot();

        if let Some(mut old) = self.live.take() {
            let mixer = old.device.mixer().clone();
            self.sfx.clear(&mixer);
            old.music.clear();
            self.library.release_buffers(&mixer);
            old.device.close();
        }

        self.library.reupload(device.mixer())?;
        log::info!("Switched output to '{}'", device.name());
        self.config.device = selector;
        self.start_on(device);

        if let Some(snapshot) = music {
            self.restore_music(snapshot);
        }
        self.restore_loops(loops);
        Ok(())
    }

    fn restore_music(&mut self, snapshot: MusicSnapshot) {
        if let Err(e) = self.play_music(&snapshot.name, snapshot.looping) {
            log::warn!("Could not restore '{}': {}", snapshot.name, e);
            return;
        }
        // Queued while the switch is pending, so nothing jumps the queue.
        for (name, looping) in snapshot.queue {
            if let Err(e) = self.queue_music(&name, looping) {
                log::warn!("Could not restore queued '{}': {}", name, e);
            }
        }
        if let Some(live) = self.live.as_mut() {
            live.music.seek_frame(snapshot.position_frames);
            match snapshot.state {
                MusicState::Playing => {}
                MusicState::Paused => live.music.pause(),
                MusicState::Stopped => live.music.stop(),
            }
        }
    }

    fn restore_loops(&mut self, loops: Vec<LoopingSfxInfo>) {
        for info in loops {
            if let Err(e) = self.loop_sfx(&info.name, info.gain) {
                log::warn!("Could not restore loop '{}': {}", info.name, e);
                continue;
            }
            if let Some(live) = self.live.as_ref() {
                let mixer = live.device.mixer();
                self.sfx.set_looping_pitch(mixer, &info.name, info.pitch);
                if info.paused {
                    self.sfx.pause_looping(mixer, &info.name);
                }
            }
        }
    }

    pub fn output_devices() -> Vec<AudioDeviceInfo> {
        get_output_devices()
    }

    pub fn device_name(&self) -> Option<&str> {
        self.live.as_ref().map(|l| l.device.name())
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Saves the current volumes as the profile of the open device.
    pub fn remember_device_volumes(&mut self) {
        let Some(name) = self.device_name().map(str::to_string) else {
            return;
        };
        let profile = DeviceProfile {
            sfx_volume: self.config.sfx_volume,
            music_volume: self.config.music_volume,
        };
        self.config.set_profile(&name, profile);
    }

    // ─── Loading ───

    fn mixer_or_err(&self) -> Result<SharedMixer> {
        self.live
            .as_ref()
            .map(|l| l.device.mixer().clone())
            .ok_or(AudioError::NoContext)
    }

    pub fn load_sound(&mut self, name: &str, path: &Path) -> Result<()> {
        let mixer = self.mixer_or_err()?;
        self.library.load_sound(&mixer, name, path)
    }

    pub fn load_sound_bytes(&mut self, name: &str, bytes: Arc<[u8]>) -> Result<()> {
        let mixer = self.mixer_or_err()?;
        self.library.load_sound_bytes(&mixer, name, bytes)
    }

    pub fn load_track(&mut self, name: &str, path: &Path) -> Result<()> {
        self.library.load_track(name, path)
    }

    pub fn load_track_bytes(&mut self, name: &str, bytes: Arc<[u8]>) {
        self.library.load_track_bytes(name, bytes);
    }

    pub fn load_index(&mut self, path: &Path) -> Result<usize> {
        let mixer = self.mixer_or_err()?;
        self.library.load_index(&mixer, path)
    }

    pub fn track_names(&self) -> Vec<String> {
        self.library.track_names()
    }

    pub fn track_count(&self) -> usize {
        self.library.track_count()
    }

    // ─── Sound effects ───

    pub fn play_sfx(&mut self, name: &str, gain: f32, pitch: f32) -> Result<()> {
        let live = self.live.as_ref().ok_or(AudioError::NoContext)?;
        let sound = self.library.sound(name)?;
        self.sfx.play(live.device.mixer(), sound, gain, pitch);
        Ok(())
    }

    pub fn loop_sfx(&mut self, name: &str, gain: f32) -> Result<()> {
        let live = self.live.as_ref().ok_or(AudioError::NoContext)?;
        let sound = self.library.sound(name)?;
        self.sfx.play_looping(live.device.mixer(), name, sound, gain);
        Ok(())
    }

    /// Returns false when `name` was not looping.
    pub fn stop_looping_sfx(&mut self, name: &str) -> bool {
        match self.live.as_ref() {
            Some(live) => self.sfx.stop_looping(live.device.mixer(), name),
            None => false,
        }
    }

    pub fn pause_all_looping_sfx(&mut self) {
        if let Some(live) = self.live.as_ref() {
            self.sfx.pause_all_looping(live.device.mixer());
        }
    }

    pub fn unpause_all_looping_sfx(&mut self) {
        if let Some(live) = self.live.as_ref() {
            self.sfx.unpause_all_looping(live.device.mixer());
        }
    }

    pub fn stop_all_looping_sfx(&mut self) {
        if let Some(live) = self.live.as_ref() {
            self.sfx.stop_all_looping(live.device.mixer());
        }
    }

    pub fn set_looping_sfx_gain(&mut self, name: &str, gain: f32) -> bool {
        match self.live.as_ref() {
            Some(live) => self.sfx.set_looping_gain(live.device.mixer(), name, gain),
            None => false,
        }
    }

    pub fn set_looping_sfx_pitch(&mut self, name: &str, pitch: f32) -> bool {
        match self.live.as_ref() {
            Some(live) => self.sfx.set_looping_pitch(live.device.mixer(), name, pitch),
            None => false,
        }
    }

    pub fn is_looping_sfx(&self, name: &str) -> bool {
        self.sfx.is_looping(name)
    }

    pub fn transient_voice_count(&self) -> usize {
        self.sfx.transient_voice_count()
    }

    pub fn set_sfx_volume(&mut self, volume: f32) {
        self.config.sfx_volume = volume.clamp(0.0, 1.0);
        match self.live.as_ref() {
            Some(live) => self.sfx.set_volume(live.device.mixer(), volume),
            None => self.sfx = SfxPlayer::new(self.config.sfx_volume, self.config.sfx_enabled),
        }
    }

    pub fn sfx_volume(&self) -> f32 {
        self.config.sfx_volume
    }

    pub fn enable_sfx(&mut self, enabled: bool) {
        self.config.sfx_enabled = enabled;
        match self.live.as_ref() {
            Some(live) => self.sfx.set_enabled(live.device.mixer(), enabled),
            None => self.sfx = SfxPlayer::new(self.config.sfx_volume, enabled),
        }
    }

    pub fn is_sfx_enabled(&self) -> bool {
        self.config.sfx_enabled
    }

    // ─── Music ───

    fn music(&self) -> Option<&MusicSession> {
        self.live.as_ref().map(|l| &l.music)
    }

    fn music_mut(&mut self) -> Option<&mut MusicSession> {
        self.live.as_mut().map(|l| &mut l.music)
    }

    /// Switches to track `name`, or resumes it if it is already the current one.
    pub fn play_music(&mut self, name: &str, looping: bool) -> Result<()> {
        if self.live.is_none() {
            return Err(AudioError::NoContext);
        }
        let open = opener(self.library.track(name)?);
        match self.music_mut() {
            Some(music) => music.play(name, looping, open),
            None => Err(AudioError::NoContext),
        }
    }

    pub fn queue_music(&mut self, name: &str, looping: bool) -> Result<()> {
        if self.live.is_none() {
            return Err(AudioError::NoContext);
        }
        let open = opener(self.library.track(name)?);
        match self.music_mut() {
            Some(music) => music.queue(name, looping, open),
            None => Err(AudioError::NoContext),
        }
    }

    pub fn stop_music(&mut self) {
        if let Some(music) = self.music_mut() {
            music.stop();
        }
    }

    pub fn pause_music(&mut self) {
        if let Some(music) = self.music_mut() {
            music.pause();
        }
    }

    pub fn resume_music(&mut self) {
        if let Some(music) = self.music_mut() {
            music.resume();
        }
    }

    pub fn set_music_volume(&mut self, volume: f32) {
        self.config.music_volume = volume.clamp(0.0, 1.0);
        if let Some(music) = self.music_mut() {
            music.set_volume(volume);
        }
    }

    pub fn music_volume(&self) -> f32 {
        self.config.music_volume
    }

    /// Fades music gain from `start` to `end` over `duration`. With `end` at
    /// zero the music stops (`stop_on_end`) or pauses when the fade completes.
    pub fn set_music_fade(&mut self, start: f32, end: f32, duration: Duration, stop_on_end: bool) {
        let now = self.clock.now();
        if let Some(music) = self.music_mut() {
            music.set_fade(start, end, duration, stop_on_end, now);
        }
    }

    pub fn enable_music(&mut self, enabled: bool) {
        self.config.music_enabled = enabled;
        if let Some(music) = self.music_mut() {
            music.set_enabled(enabled);
        }
    }

    pub fn is_music_enabled(&self) -> bool {
        self.config.music_enabled
    }

    pub fn is_music_playing(&self) -> bool {
        self.music().map(|m| m.is_playing()).unwrap_or(false)
    }

    pub fn is_music_paused(&self) -> bool {
        self.music().map(|m| m.is_paused()).unwrap_or(false)
    }

    /// Empty when no track is loaded.
    pub fn current_music(&self) -> &str {
        self.music().map(|m| m.current_name()).unwrap_or("")
    }

    pub fn current_fade_target(&self) -> f32 {
        self.music().map(|m| m.fade_target()).unwrap_or(1.0)
    }

    pub fn current_fade_gain(&self) -> f32 {
        self.music().map(|m| m.fade_gain()).unwrap_or(1.0)
    }

    pub fn music_progress(&self) -> f32 {
        self.music().map(|m| m.progress()).unwrap_or(0.0)
    }

    pub fn music_position_secs(&self) -> f64 {
        self.music().map(|m| m.position_secs()).unwrap_or(0.0)
    }

    pub fn music_duration_secs(&self) -> f64 {
        self.music().map(|m| m.duration_secs()).unwrap_or(0.0)
    }

    /// Jumps to `fraction` (0 to 1) of the current track.
    pub fn seek_music(&mut self, fraction: f32) {
        if let Some(music) = self.music_mut() {
            music.seek(fraction);
        }
    }

    pub fn skip_music(&mut self, seconds: f64) {
        if let Some(music) = self.music_mut() {
            music.skip(seconds);
        }
    }

    pub fn queued_music(&self) -> Vec<String> {
        self.music().map(|m| m.queued_names()).unwrap_or_default()
    }

    pub fn clear_music_queue(&mut self) {
        if let Some(music) = self.music_mut() {
            music.clear_queue();
        }
    }

    /// Drops the current track, any pending switch and the queue.
    pub fn clear_music(&mut self) {
        if let Some(music) = self.music_mut() {
            music.clear();
        }
    }

    // ─── Driver ───

    /// One update step; call once per frame or let an `AudioDriver` do it.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        if let Some(music) = self.music_mut() {
            music.tick(now);
        }
    }

    // ─── Diagnostics ───

    pub fn mixer(&self) -> Option<&SharedMixer> {
        self.live.as_ref().map(|l| l.device.mixer())
    }

    pub fn voice_count(&self) -> usize {
        self.mixer().map(|m| m.lock().voice_count()).unwrap_or(0)
    }

    pub fn buffer_count(&self) -> usize {
        self.mixer().map(|m| m.lock().buffer_count()).unwrap_or(0)
    }

    /// Renders the next block of a headless device.
    pub fn render(&self, out: &mut [f32]) -> Result<()> {
        self.live
            .as_ref()
            .ok_or(AudioError::NoContext)?
            .device
            .render(out)
    }
}

impl Drop for AudioContext {
    fn drop(&mut self) {
        self.destroy_context();
    }
}
