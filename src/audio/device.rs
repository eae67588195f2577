use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::{self, JoinHandle};

use super::mixer::{Mixer, SharedMixer};
use crate::config::DeviceSelector;
use crate::error::{AudioError, Result};

/// Open output: a mixer plus whatever renders it.
///
/// Hardware devices render from a cpal stream owned by a dedicated
/// `audio-output` thread (cpal streams cannot leave the thread that built
/// them). Headless devices are rendered by the caller through
/// [`Device::render`].
pub struct Device {
    name: String,
    mixer: SharedMixer,
    output: Option<OutputThread>,
}

struct OutputThread {
    shutdown_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl Device {
    pub fn open(selector: &DeviceSelector) -> Result<Self> {
        match selector {
            DeviceSelector::Headless {
                sample_rate,
                channels,
            } => Ok(Self::headless(*sample_rate, *channels)),
            DeviceSelector::Default => Self::open_output(None),
            DeviceSelector::Named(name) => Self::open_output(Some(name.clone())),
        }
    }

    pub fn headless(sample_rate: u32, channels: usize) -> Self {
        log::info!("Opened headless device ({} Hz, {} ch)", sample_rate, channels);
        Self {
            name: "headless".to_string(),
            mixer: Mixer::shared(sample_rate.max(1), channels.max(1)),
            output: None,
        }
    }

    fn open_output(name: Option<String>) -> Result<Self> {
        let (ready_tx, ready_rx) = bounded::<std::result::Result<(String, SharedMixer), String>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || output_thread(name, ready_tx, shutdown_rx))?;

        match ready_rx.recv() {
            Ok(Ok((name, mixer))) => {
                {
                    let m = mixer.lock();
                    log::info!(
                        "Opened output '{}' ({} Hz, {} ch)",
                        name,
                        m.sample_rate(),
                        m.channels()
                    );
                }
                Ok(Self {
                    name,
                    mixer,
                    output: Some(OutputThread {
                        shutdown_tx,
                        handle,
                    }),
                })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(AudioError::Device(e))
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::Device("output thread exited during startup".into()))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mixer(&self) -> &SharedMixer {
        &self.mixer
    }

    pub fn is_headless(&self) -> bool {
        self.output.is_none()
    }

    pub fn sample_rate(&self) -> u32 {
        self.mixer.lock().sample_rate()
    }

    pub fn channels(&self) -> usize {
        self.mixer.lock().channels()
    }

    /// Pulls the next block of interleaved output from a headless device.
    pub fn render(&self, out: &mut [f32]) -> Result<()> {
        if !self.is_headless() {
            return Err(AudioError::Device(format!(
                "'{}' is rendered by its output stream",
                self.name
            )));
        }
        self.mixer.lock().render(out);
        Ok(())
    }

    /// Stops the output stream and waits for its thread. Safe to call twice.
    pub fn close(&mut self) {
        if let Some(output) = self.output.take() {
            let _ = output.shutdown_tx.send(());
            if output.handle.join().is_err() {
                log::error!("Output thread for '{}' panicked", self.name);
            }
            log::info!("Closed output '{}'", self.name);
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}

fn find_device(host: &cpal::Host, name: Option<&str>) -> std::result::Result<cpal::Device, String> {
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| "No output device".to_string()),
        Some(wanted) => host
            .output_devices()
            .map_err(|e| format!("Cannot enumerate devices: {}", e))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| format!("Output device '{}' not found", wanted)),
    }
}

fn output_thread(
    name: Option<String>,
    ready_tx: Sender<std::result::Result<(String, SharedMixer), String>>,
    shutdown_rx: Receiver<()>,
) {
    let host = cpal::default_host();
    let device = match find_device(&host, name.as_deref()) {
        Ok(d) => d,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let device_name = device.name().unwrap_or_else(|_| "unknown".into());

    let supported = match device.default_output_config() {
        Ok(c) => c,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("No usable output config: {}", e)));
            return;
        }
    };
    let config: StreamConfig = supported.into();
    let mixer = Mixer::shared(config.sample_rate.0, config.channels as usize);

    let mixer_cb = mixer.clone();
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            fill_output(&mixer_cb, data);
        },
        |err| log::error!("Output stream error: {}", err),
        None,
    );
    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("Failed to build output stream: {}", e)));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(format!("Failed to start output stream: {}", e)));
        return;
    }

    if ready_tx.send(Ok((device_name, mixer))).is_err() {
        return;
    }

    // Closed explicitly or by the device being dropped.
    let _ = shutdown_rx.recv();
    drop(stream);
}

// ─── Device Enumeration ───

pub fn get_output_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    let mut devices = Vec::new();
    if let Ok(out) = host.output_devices() {
        for dev in out {
            if let Ok(name) = dev.name() {
                let is_default = default_name.as_deref() == Some(name.as_str());
                devices.push(AudioDeviceInfo { name, is_default });
            }
        }
    }
    devices
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_default: bool,
}

/// Output callback body. Never blocks the real-time thread on a host call;
/// a contended block plays as silence.
fn fill_output(mixer: &SharedMixer, data: &mut [f32]) {
    match mixer.try_lock() {
        Some(mut mixer) => mixer.render(data),
        None => data.fill(0.0),
    }
}
