/// Audio configuration.
///
/// Output device, streaming block size, driver interval, default volumes and
/// per-device volume profiles, stored as JSON. Missing fields fall back to
/// their defaults so older files keep loading.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{AudioError, Result};

const CONFIG_FILE: &str = "cadenza.json";
const MIN_BLOCK_SAMPLES: usize = 64;

/// Which output the context opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSelector {
    /// The host's default output device.
    #[default]
    Default,
    /// An output device by the name cpal reports for it.
    Named(String),
    /// No hardware; the caller renders the mix.
    Headless { sample_rate: u32, channels: usize },
}

/// Volumes remembered for one output device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub sfx_volume: f32,
    pub music_volume: f32,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            sfx_volume: 1.0,
            music_volume: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub device: DeviceSelector,
    /// Interleaved samples decoded per streaming buffer.
    pub stream_block_samples: usize,
    /// Update interval of the background driver.
    pub tick_interval_ms: u64,
    pub sfx_volume: f32,
    pub music_volume: f32,
    pub sfx_enabled: bool,
    pub music_enabled: bool,
    /// Device name → saved volumes.
    pub profiles: HashMap<String, DeviceProfile>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: DeviceSelector::Default,
            stream_block_samples: 4096,
            tick_interval_ms: 30,
            sfx_volume: 1.0,
            music_volume: 1.0,
            sfx_enabled: true,
            music_enabled: true,
            profiles: HashMap::new(),
        }
    }
}

impl AudioConfig {
    /// Headless defaults, convenient for tests and offline rendering.
    pub fn headless(sample_rate: u32, channels: usize) -> Self {
        Self {
            device: DeviceSelector::Headless {
                sample_rate,
                channels,
            },
            ..Self::default()
        }
    }

    /// `<config dir>/cadenza/cadenza.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs_next::config_dir().map(|d| d.join("cadenza").join(CONFIG_FILE))
    }

    /// Loads `path`. A missing file yields the defaults; malformed JSON is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config.sanitized())
    }

    /// Rejects settings that cannot be clamped into something usable.
    pub fn validate(&self) -> Result<()> {
        match &self.device {
            DeviceSelector::Named(name) if name.trim().is_empty() => {
                Err(AudioError::Config("device name is empty".into()))
            }
            DeviceSelector::Headless { sample_rate: 0, .. } | DeviceSelector::Headless { channels: 0, .. } => {
                Err(AudioError::Config("headless device needs a sample rate and channels".into()))
            }
            _ => Ok(()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        log::debug!("Saved config to {}", path.display());
        Ok(())
    }

    /// Clamps out-of-range values instead of rejecting the file.
    pub fn sanitized(mut self) -> Self {
        self.stream_block_samples = self.stream_block_samples.max(MIN_BLOCK_SAMPLES);
        self.tick_interval_ms = self.tick_interval_ms.max(1);
        self.sfx_volume = self.sfx_volume.clamp(0.0, 1.0);
        self.music_volume = self.music_volume.clamp(0.0, 1.0);
        for p in self.profiles.values_mut() {
            p.sfx_volume = p.sfx_volume.clamp(0.0, 1.0);
            p.music_volume = p.music_volume.clamp(0.0, 1.0);
        }
        self
    }

    pub fn profile(&self, device_name: &str) -> Option<&DeviceProfile> {
        self.profiles.get(device_name)
    }

    pub fn set_profile(&mut self, device_name: &str, profile: DeviceProfile) {
        self.profiles.insert(device_name.to_string(), profile);
    }

    pub fn remove_profile(&mut self, device_name: &str) {
        self.profiles.remove(device_name);
    }
}
