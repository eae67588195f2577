/// Sound effect voices.
///
/// One-shots go to a transient pool that only grows: the first voice that is
/// not playing is reused, otherwise a new one is appended. Looping effects get
/// a dedicated voice per name that lives until stopped by name.

use std::collections::HashMap;

use super::library::SoundBuffer;
use super::mixer::{report, SharedMixer, VoiceId, VoiceState};

struct LoopingSfx {
    voice: VoiceId,
    gain: f32,
    pitch: f32,
    paused: bool,
}

/// Settings of a looping effect, used to rebuild it on another device.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopingSfxInfo {
    pub name: String,
    pub gain: f32,
    pub pitch: f32,
    pub paused: bool,
}

pub struct SfxPlayer {
    transient: Vec<VoiceId>,
    looping: HashMap<String, LoopingSfx>,
    volume: f32,
    enabled: bool,
}

impl SfxPlayer {
    pub fn new(volume: f32, enabled: bool) -> Self {
        Self {
            transient: Vec::new(),
            looping: HashMap::new(),
            volume: volume.clamp(0.0, 1.0),
            enabled,
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn transient_voice_count(&self) -> usize {
        self.transient.len()
    }

    pub fn looping_count(&self) -> usize {
        self.looping.len()
    }

    pub fn is_looping(&self, name: &str) -> bool {
        self.looping.contains_key(name)
    }

    /// Plays a one-shot. Does nothing while sound effects are disabled.
    pub fn play(&mut self, mixer: &SharedMixer, sound: &SoundBuffer, gain: f32, pitch: f32) {
        if !self.enabled {
            return;
        }
        let mut m = mixer.lock();

        let free = self
            .transient
            .iter()
            .copied()
            .find(|v| !matches!(m.voice_state(*v), Ok(VoiceState::Playing)));
        let voice = match free {
            Some(v) => v,
            None => {
                let v = m.create_voice();
                self.transient.push(v);
                log::debug!("Sfx pool grew to {} voices", self.transient.len());
                v
            }
        };

        report(m.stop(voice));
        report(m.set_buffer(voice, Some(sound.buffer())));
        report(m.set_looping(voice, false));
        report(m.set_gain(voice, gain * self.volume));
        report(m.set_pitch(voice, pitch));
        report(m.play(voice));
    }

    /// Starts `name` looping on its own voice, replacing any loop of the same name.
    pub fn play_looping(&mut self, mixer: &SharedMixer, name: &str, sound: &SoundBuffer, gain: f32) {
        self.stop_looping(mixer, name);

        let mut m = mixer.lock();
        let voice = m.create_voice();
        report(m.set_buffer(voice, Some(sound.buffer())));
        report(m.set_looping(voice, true));
        report(m.set_gain(voice, gain * self.volume));
        if self.enabled {
            report(m.play(voice));
        }
        self.looping.insert(
            name.to_string(),
            LoopingSfx {
                voice,
                gain,
                pitch: 1.0,
                paused: false,
            },
        );
    }

    /// Halts and destroys the looping voice for `name`. Returns false if there was none.
    pub fn stop_looping(&mut self, mixer: &SharedMixer, name: &str) -> bool {
        let Some(entry) = self.looping.remove(name) else {
            return false;
        };
        let mut m = mixer.lock();
        report(m.stop(entry.voice));
        report(m.delete_voice(entry.voice));
        true
    }

    pub fn set_looping_gain(&mut self, mixer: &SharedMixer, name: &str, gain: f32) -> bool {
        let Some(entry) = self.looping.get_mut(name) else {
            return false;
        };
        entry.gain = gain;
        report(mixer.lock().set_gain(entry.voice, gain * self.volume));
        true
    }

    pub fn set_looping_pitch(&mut self, mixer: &SharedMixer, name: &str, pitch: f32) -> bool {
        let Some(entry) = self.looping.get_mut(name) else {
            return false;
        };
        entry.pitch = pitch;
        report(mixer.lock().set_pitch(entry.voice, pitch));
        true
    }

    pub fn pause_looping(&mut self, mixer: &SharedMixer, name: &str) -> bool {
        let Some(entry) = self.looping.get_mut(name) else {
            return false;
        };
        entry.paused = true;
        report(mixer.lock().pause(entry.voice));
        true
    }

    pub fn pause_all_looping(&mut self, mixer: &SharedMixer) {
        let mut m = mixer.lock();
        for entry in self.looping.values_mut() {
            entry.paused = true;
            report(m.pause(entry.voice));
        }
    }

    pub fn unpause_all_looping(&mut self, mixer: &SharedMixer) {
        let mut m = mixer.lock();
        for entry in self.looping.values_mut() {
            entry.paused = false;
            if self.enabled {
                report(m.play(entry.voice));
            }
        }
    }

    pub fn stop_all_looping(&mut self, mixer: &SharedMixer) {
        let names: Vec<String> = self.looping.keys().cloned().collect();
        for name in names {
            self.stop_looping(mixer, &name);
        }
    }

    /// Scales every effect; looping voices pick the new volume up immediately.
    pub fn set_volume(&mut self, mixer: &SharedMixer, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        let mut m = mixer.lock();
        for entry in self.looping.values() {
            report(m.set_gain(entry.voice, entry.gain * self.volume));
        }
    }

    /// Disabling pauses looping effects and blocks new one-shots; enabling
    /// resumes the loops that were not paused explicitly.
    pub fn set_enabled(&mut self, mixer: &SharedMixer, enabled: bool) {
        self.enabled = enabled;
        let mut m = mixer.lock();
        for entry in self.looping.values() {
            if !enabled {
                report(m.pause(entry.voice));
            } else if !entry.paused {
                report(m.play(entry.voice));
            }
        }
    }

    pub fn looping_snapshot(&self) -> Vec<LoopingSfxInfo> {
        let mut out: Vec<LoopingSfxInfo> = self
            .looping
            .iter()
            .map(|(name, e)| LoopingSfxInfo {
                name: name.clone(),
                gain: e.gain,
                pitch: e.pitch,
                paused: e.paused,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Destroys every transient and looping voice.
    pub fn clear(&mut self, mixer: &SharedMixer) {
        self.stop_all_looping(mixer);
        let mut m = mixer.lock();
        for voice in self.transient.drain(..) {
            report(m.stop(voice));
            report(m.delete_voice(voice));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::library::AudioLibrary;
    use crate::audio::mixer::{Mixer, Pcm};

    fn setup() -> (SharedMixer, AudioLibrary, SfxPlayer) {
        let mixer = Mixer::shared(8000, 1);
        let mut lib = AudioLibrary::new();
        lib.add_sound(&mixer, "click", Pcm::new(vec![0.1; 100], 1, 8000)).unwrap();
        lib.add_sound(&mixer, "hum", Pcm::new(vec![0.1; 1000], 1, 8000)).unwrap();
        (mixer, lib, SfxPlayer::new(1.0, true))
    }

    fn render(mixer: &SharedMixer, frames: usize) {
        let mut out = vec![0.0; frames];
        mixer.lock().render(&mut out);
    }

    #[test]
    fn pool_grows_then_reuses_finished_voices() {
        let (mixer, lib, mut sfx) = setup();
        let click = lib.sound("click").unwrap();

        for _ in 0..3 {
            sfx.play(&mixer, click, 1.0, 1.0);
        }
        assert_eq!(sfx.transient_voice_count(), 3);

        render(&mixer, 200);
        sfx.play(&mixer, click, 1.0, 1.0);
        sfx.play(&mixer, click, 1.0, 1.0);
        assert_eq!(sfx.transient_voice_count(), 3);
    }

    #[test]
    fn reuse_skips_voices_still_playing() {
        let (mixer, lib, mut sfx) = setup();
        sfx.play(&mixer, lib.sound("hum").unwrap(), 1.0, 1.0);
        sfx.play(&mixer, lib.sound("click").unwrap(), 1.0, 1.0);
        render(&mixer, 200);

        // First voice still hums; the finished click voice is picked.
        sfx.play(&mixer, lib.sound("click").unwrap(), 1.0, 1.0);
        assert_eq!(sfx.transient_voice_count(), 2);
        let playing = sfx
            .transient
            .iter()
            .filter(|v| mixer.lock().voice_state(**v) == Ok(VoiceState::Playing))
            .count();
        assert_eq!(playing, 2);
    }

    #[test]
    fn gain_is_scaled_by_sfx_volume() {
        let (mixer, lib, mut sfx) = setup();
        sfx.set_volume(&mixer, 0.5);
        sfx.play(&mixer, lib.sound("click").unwrap(), 0.8, 1.5);

        let voice = sfx.transient[0];
        let m = mixer.lock();
        assert!((m.gain(voice).unwrap() - 0.4).abs() < 1e-6);
        assert_eq!(m.pitch(voice).unwrap(), 1.5);
    }

    #[test]
    fn disabled_sfx_do_not_allocate() {
        let (mixer, lib, _) = setup();
        let mut sfx = SfxPlayer::new(1.0, false);
        sfx.play(&mixer, lib.sound("click").unwrap(), 1.0, 1.0);
        assert_eq!(sfx.transient_voice_count(), 0);
    }

    #[test]
    fn looping_is_one_voice_per_name() {
        let (mixer, lib, mut sfx) = setup();
        let hum = lib.sound("hum").unwrap();
        sfx.play_looping(&mixer, "hum", hum, 1.0);
        sfx.play_looping(&mixer, "hum", hum, 0.5);

        assert_eq!(sfx.looping_count(), 1);
        assert_eq!(mixer.lock().voice_count(), 1);

        assert!(sfx.stop_looping(&mixer, "hum"));
        assert!(!sfx.stop_looping(&mixer, "hum"));
        assert_eq!(mixer.lock().voice_count(), 0);
    }

    #[test]
    fn looping_voices_pause_and_resume_as_a_group() {
        let (mixer, lib, mut sfx) = setup();
        sfx.play_looping(&mixer, "a", lib.sound("hum").unwrap(), 1.0);
        sfx.play_looping(&mixer, "b", lib.sound("click").unwrap(), 1.0);

        sfx.pause_all_looping(&mixer);
        for e in sfx.looping.values() {
            assert_eq!(mixer.lock().voice_state(e.voice), Ok(VoiceState::Paused));
        }

        sfx.unpause_all_looping(&mixer);
        render(&mixer, 500);
        for e in sfx.looping.values() {
            assert_eq!(mixer.lock().voice_state(e.voice), Ok(VoiceState::Playing));
        }

        sfx.stop_all_looping(&mixer);
        assert_eq!(sfx.looping_count(), 0);
    }

    #[test]
    fn disabling_pauses_loops_and_enabling_resumes_them() {
        let (mixer, lib, mut sfx) = setup();
        sfx.play_looping(&mixer, "hum", lib.sound("hum").unwrap(), 1.0);
        let voice = sfx.looping["hum"].voice;

        sfx.set_enabled(&mixer, false);
        assert_eq!(mixer.lock().voice_state(voice), Ok(VoiceState::Paused));
        sfx.set_enabled(&mixer, true);
        assert_eq!(mixer.lock().voice_state(voice), Ok(VoiceState::Playing));
    }

    #[test]
    fn looping_gain_follows_volume_changes() {
        let (mixer, lib, mut sfx) = setup();
        sfx.play_looping(&mixer, "hum", lib.sound("hum").unwrap(), 0.5);
        sfx.set_volume(&mixer, 0.5);
        let voice = sfx.looping["hum"].voice;
        assert!((mixer.lock().gain(voice).unwrap() - 0.25).abs() < 1e-6);

        assert!(sfx.set_looping_gain(&mixer, "hum", 1.0));
        assert!((mixer.lock().gain(voice).unwrap() - 0.5).abs() < 1e-6);
        assert!(!sfx.set_looping_pitch(&mixer, "missing", 2.0));
    }

    #[test]
    fn clear_destroys_all_voices() {
        let (mixer, lib, mut sfx) = setup();
        sfx.play(&mixer, lib.sound("click").unwrap(), 1.0, 1.0);
        sfx.play_looping(&mixer, "hum", lib.sound("hum").unwrap(), 1.0);

        sfx.clear(&mixer);
        assert_eq!(mixer.lock().voice_count(), 0);
        assert_eq!(sfx.transient_voice_count(), 0);
    }
}
