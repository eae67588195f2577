use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::decoder::BitstreamDecoder;
use super::mixer::{report, BufferId, Pcm, SharedMixer};
use crate::error::{AudioError, Result};

/// Fully decoded, resident clips.
const SOUND_EXTENSIONS: &[&str] = &["wav"];
/// Streamed lazily at play time.
const TRACK_EXTENSIONS: &[&str] = &["ogg"];

/// A short clip decoded up front and uploaded into a mixer buffer.
#[derive(Clone)]
pub struct SoundBuffer {
    buffer: BufferId,
    pcm: Pcm,
}

impl SoundBuffer {
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn pcm(&self) -> &Pcm {
        &self.pcm
    }

    pub fn duration_secs(&self) -> f64 {
        self.pcm.duration_secs()
    }
}

/// Name → sound effect and name → encoded music track registries.
#[derive(Default)]
pub struct AudioLibrary {
    sounds: HashMap<String, SoundBuffer>,
    tracks: HashMap<String, Arc<[u8]>>,
}

impl AudioLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uploads `pcm` under `name`, replacing (and releasing) any previous clip.
    pub fn add_sound(&mut self, mixer: &SharedMixer, name: &str, pcm: Pcm) -> Result<()> {
        let mut m = mixer.lock();
        let buffer = m.create_buffer();
        if let Err(e) = m.buffer_data(buffer, pcm.clone()) {
            report(m.delete_buffer(buffer));
            return Err(e.into());
        }
        if let Some(old) = self.sounds.insert(name.to_string(), SoundBuffer { buffer, pcm }) {
            m.release_buffer(old.buffer);
        }
        log::debug!("Loaded sound '{}'", name);
        Ok(())
    }

    pub fn load_sound_bytes(&mut self, mixer: &SharedMixer, name: &str, bytes: Arc<[u8]>) -> Result<()> {
        let pcm = BitstreamDecoder::decode_all(bytes)?;
        self.add_sound(mixer, name, pcm)
    }

    pub fn load_sound(&mut self, mixer: &SharedMixer, name: &str, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        self.load_sound_bytes(mixer, name, bytes.into())
    }

    /// Registers encoded track data. Nothing is decoded until the track plays.
    pub fn load_track_bytes(&mut self, name: &str, bytes: Arc<[u8]>) {
        self.tracks.insert(name.to_string(), bytes);
        log::debug!("Registered track '{}'", name);
    }

    pub fn load_track(&mut self, name: &str, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        self.load_track_bytes(name, bytes.into());
        Ok(())
    }

    /// Loads every entry of an index file.
    ///
    /// Each line is `name<TAB>file.ext`, with the file relative to the index.
    /// Blank lines and `#` comments are skipped; malformed lines and unknown
    /// extensions are logged and skipped. Returns the number of entries loaded.
    pub fn load_index(&mut self, mixer: &SharedMixer, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mut loaded = 0;

        for line in text.lines() {
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let keys: Vec<&str> = line
                .split('\t')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .collect();
            let (name, file) = match keys.as_slice() {
                [name, file] if file.contains('.') => (*name, *file),
                _ => {
                    log::warn!("Invalid audio index line: {}", line);
                    continue;
                }
            };

            let ext = Path::new(file)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase())
                .unwrap_or_default();
            let file_path = base.join(file);

            if SOUND_EXTENSIONS.contains(&ext.as_str()) {
                self.load_sound(mixer, name, &file_path)?;
            } else if TRACK_EXTENSIONS.contains(&ext.as_str()) {
                self.load_track(name, &file_path)?;
            } else {
                log::error!("Invalid audio file format: {}", file);
                continue;
            }
            loaded += 1;
        }

        log::info!("Loaded {} audio entries from {}", loaded, path.display());
        Ok(loaded)
    }

    pub fn sound(&self, name: &str) -> Result<&SoundBuffer> {
        self.sounds
            .get(name)
            .ok_or_else(|| AudioError::UnknownSound(name.to_string()))
    }

    pub fn track(&self, name: &str) -> Result<Arc<[u8]>> {
        self.tracks
            .get(name)
            .cloned()
            .ok_or_else(|| AudioError::UnknownTrack(name.to_string()))
    }

    pub fn has_track(&self, name: &str) -> bool {
        self.tracks.contains_key(name)
    }

    /// Registered track names, sorted.
    pub fn track_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tracks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn sound_count(&self) -> usize {
        self.sounds.len()
    }

    /// Frees every sound's mixer buffer but keeps the decoded PCM, so the
    /// clips can be uploaded again with [`AudioLibrary::reupload`].
    pub fn release_buffers(&mut self, mixer: &SharedMixer) {
        let mut m = mixer.lock();
        for sound in self.sounds.values() {
            m.release_buffer(sound.buffer);
        }
    }

    /// Uploads every sound into `mixer`, e.g. after switching devices.
    pub fn reupload(&mut self, mixer: &SharedMixer) -> Result<()> {
        let mut m = mixer.lock();
        for sound in self.sounds.values_mut() {
            let buffer = m.create_buffer();
            m.buffer_data(buffer, sound.pcm.clone())?;
            sound.buffer = buffer;
        }
        Ok(())
    }

    /// Frees every buffer and forgets all sounds and tracks.
    pub fn clear(&mut self, mixer: &SharedMixer) {
        self.release_buffers(mixer);
        self.sounds.clear();
        self.tracks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mixer::Mixer;
    use crate::audio::test_support::ramp_wav;
    use std::fs;

    #[test]
    fn index_loads_sounds_and_tracks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("click.wav"), &*ramp_wav(64, 1, 8000)).unwrap();
        fs::write(dir.path().join("theme.ogg"), b"not decoded until played").unwrap();
        let index = dir.path().join("audio.txt");
        fs::write(
            &index,
            "# comment\n\nclick\tclick.wav\ntheme\t\ttheme.ogg\nbroken line\nmidi\tsong.mid\n",
        )
        .unwrap();

        let mixer = Mixer::shared(8000, 1);
        let mut lib = AudioLibrary::new();
        let loaded = lib.load_index(&mixer, &index).unwrap();

        assert_eq!(loaded, 2);
        assert_eq!(lib.sound("click").unwrap().pcm().frames(), 64);
        assert_eq!(lib.track_names(), vec!["theme".to_string()]);
        assert_eq!(mixer.lock().buffer_count(), 1);
    }

    #[test]
    fn missing_index_file_is_an_error() {
        let mixer = Mixer::shared(8000, 1);
        let mut lib = AudioLibrary::new();
        assert!(matches!(
            lib.load_index(&mixer, Path::new("/nonexistent/audio.txt")),
            Err(AudioError::Io(_))
        ));
    }

    #[test]
    fn unknown_names_fail_fast() {
        let lib = AudioLibrary::new();
        assert!(matches!(lib.sound("nope"), Err(AudioError::UnknownSound(_))));
        assert!(matches!(lib.track("nope"), Err(AudioError::UnknownTrack(_))));
    }

    #[test]
    fn replacing_a_sound_releases_the_old_buffer() {
        let mixer = Mixer::shared(8000, 1);
        let mut lib = AudioLibrary::new();
        lib.load_sound_bytes(&mixer, "click", ramp_wav(10, 1, 8000)).unwrap();
        lib.load_sound_bytes(&mixer, "click", ramp_wav(20, 1, 8000)).unwrap();

        assert_eq!(mixer.lock().buffer_count(), 1);
        assert_eq!(lib.sound("click").unwrap().pcm().frames(), 20);
    }

    #[test]
    fn buffers_move_between_mixers() {
        let old = Mixer::shared(8000, 1);
        let new = Mixer::shared(44100, 2);
        let mut lib = AudioLibrary::new();
        lib.load_sound_bytes(&old, "click", ramp_wav(10, 1, 8000)).unwrap();

        lib.release_buffers(&old);
        lib.reupload(&new).unwrap();

        assert_eq!(old.lock().buffer_count(), 0);
        assert_eq!(new.lock().buffer_count(), 1);
    }

    #[test]
    fn clear_forgets_everything() {
        let mixer = Mixer::shared(8000, 1);
        let mut lib = AudioLibrary::new();
        lib.load_sound_bytes(&mixer, "click", ramp_wav(10, 1, 8000)).unwrap();
        lib.load_track_bytes("theme", ramp_wav(10, 1, 8000));

        lib.clear(&mixer);

        assert_eq!(lib.sound_count(), 0);
        assert_eq!(lib.track_count(), 0);
        assert_eq!(mixer.lock().buffer_count(), 0);
    }
}
