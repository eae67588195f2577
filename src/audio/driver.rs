/// Background update driver.
///
/// Ticks a shared [`AudioContext`] on a fixed interval from a dedicated
/// `audio-driver` thread. Host calls and ticks take the same mutex, so a
/// session is never mutated from two places at once.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::context::AudioContext;
use crate::error::Result;

pub type SharedContext = Arc<Mutex<AudioContext>>;

pub enum DriverCommand {
    /// Tick immediately instead of waiting for the interval.
    TickNow,
    Shutdown,
}

pub struct AudioDriver {
    cmd_tx: Sender<DriverCommand>,
    handle: Option<JoinHandle<()>>,
    ticks: Arc<AtomicU64>,
}

impl AudioDriver {
    pub fn spawn(context: SharedContext, interval: Duration) -> Result<Self> {
        let (cmd_tx, cmd_rx) = bounded::<DriverCommand>(16);
        let ticks = Arc::new(AtomicU64::new(0));
        let ticks_c = ticks.clone();
        let interval = interval.max(Duration::from_millis(1));

        let handle = thread::Builder::new()
            .name("audio-driver".into())
            .spawn(move || driver_thread(context, interval, cmd_rx, ticks_c))?;

        log::debug!("Audio driver started ({} ms interval)", interval.as_millis());
        Ok(Self {
            cmd_tx,
            handle: Some(handle),
            ticks,
        })
    }

    pub fn send_command(&self, cmd: DriverCommand) {
        let _ = self.cmd_tx.send(cmd);
    }

    pub fn tick_now(&self) {
        self.send_command(DriverCommand::TickNow);
    }

    /// Ticks performed so far.
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Stops the thread and waits for it. Safe to call twice.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.cmd_tx.send(DriverCommand::Shutdown);
            if handle.join().is_err() {
                log::error!("Audio driver thread panicked");
            }
            log::debug!("Audio driver stopped after {} ticks", self.tick_count());
        }
    }
}

impl Drop for AudioDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn driver_thread(
    context: SharedContext,
    interval: Duration,
    cmd_rx: Receiver<DriverCommand>,
    ticks: Arc<AtomicU64>,
) {
    loop {
        match cmd_rx.recv_timeout(interval) {
            Ok(DriverCommand::TickNow) | Err(RecvTimeoutError::Timeout) => {
                context.lock().tick();
                ticks.fetch_add(1, Ordering::Relaxed);
            }
            Ok(DriverCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::test_support::ramp_wav;
    use crate::config::AudioConfig;
    use std::time::Instant;

    fn shared_context() -> SharedContext {
        let mut config = AudioConfig::headless(8000, 1);
        config.stream_block_samples = 256;
        let ctx = AudioContext::open(config).unwrap();
        Arc::new(Mutex::new(ctx))
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn driver_ticks_on_its_interval() {
        let context = shared_context();
        let driver = AudioDriver::spawn(context.clone(), Duration::from_millis(5)).unwrap();
        assert!(wait_for(|| driver.tick_count() >= 3));
    }

    #[test]
    fn driver_installs_music_requested_from_the_host() {
        let context = shared_context();
        {
            let mut ctx = context.lock();
            ctx.load_track_bytes("theme", ramp_wav(20_000, 1, 8000));
            ctx.play_music("theme", true).unwrap();
        }
        let mut driver = AudioDriver::spawn(context.clone(), Duration::from_secs(3600)).unwrap();
        driver.tick_now();
        assert!(wait_for(|| driver.tick_count() >= 1));

        // Host renders while the driver keeps refilling.
        for _ in 0..5 {
            let mut out = vec![0.0; 256];
            context.lock().render(&mut out).unwrap();
            driver.tick_now();
        }
        assert!(wait_for(|| driver.tick_count() >= 6));
        assert!(context.lock().is_music_playing());

        driver.shutdown();
        driver.shutdown();
        let count = driver.tick_count();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(driver.tick_count(), count);
    }
}
