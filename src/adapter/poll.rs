use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{DeviceConfig, RegisterInterface, RxEngine, RxFrame, RxMode, SharedMemory, WakeMode};

/// Size of a timestamp delivered by the interrupt device (`HH:MM:SS.uuuuuu` plus a nul)
const TIMESTAMP_SIZE: usize = 16;

/// Something the poll loop can sleep on until the device has news
pub trait WakeSource: Send {
    /// Block until the next device event
    fn wait(&mut self) -> Result<(), crate::Error>;
}

/// Never blocks, for spinning loops
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWake;
impl WakeSource for NoWake {
    fn wait(&mut self) -> Result<(), crate::Error> {
        Ok(())
    }
}

/// Blocks on the character device that publishes the time of every device interrupt
pub struct IrqTimestampWaker {
    fd: libc::c_int,
    last_timestamp: [u8; TIMESTAMP_SIZE],
}
impl IrqTimestampWaker {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, crate::Error> {
        let fd = crate::utils::open_device(path.as_ref(), libc::O_RDONLY)?;
        tracing::debug!(path = %path.as_ref().display(), "opened interrupt device");
        Ok(Self { fd, last_timestamp: [0; TIMESTAMP_SIZE] })
    }

    /// Time of the last interrupt, as published by the device
    pub fn last_timestamp(&self) -> &str {
        let len = self.last_timestamp.iter().position(|byte| *byte == 0).unwrap_or(TIMESTAMP_SIZE);
        std::str::from_utf8(&self.last_timestamp[..len]).unwrap_or_default()
    }
}
impl WakeSource for IrqTimestampWaker {
    fn wait(&mut self) -> Result<(), crate::Error> {
        let mut timestamp = [0_u8; TIMESTAMP_SIZE];
        loop {
            match crate::utils::read_device(self.fd, &mut timestamp) {
                Ok(0) => return Err(crate::Error::WakeFailure { error: std::io::ErrorKind::UnexpectedEof.into() }),
                Ok(_) => break,
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(crate::Error::WakeFailure { error }),
            }
        }
        self.last_timestamp = timestamp;
        tracing::trace!(timestamp = self.last_timestamp(), "woken up");
        Ok(())
    }
}
impl Drop for IrqTimestampWaker {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Drain loop for devices running with interrupts disabled
pub struct PollAdapter<W> {
    waker: W,
    mode: WakeMode,
    budget: usize,
    stop: Arc<AtomicBool>,
}
impl PollAdapter<NoWake> {
    /// A loop that never sleeps
    pub fn spinning(config: &DeviceConfig) -> Result<Self, crate::Error> {
        Self::new(config, NoWake)
    }
}
impl<W: WakeSource> PollAdapter<W> {
    pub fn new(config: &DeviceConfig, waker: W) -> Result<Self, crate::Error> {
        let RxMode::Poll(mode) = config.rx_mode else {
            return Err(crate::Error::Config { reason: "device runs in interrupt mode".into() });
        };
        Ok(Self { waker, mode, budget: config.budget, stop: Arc::new(AtomicBool::new(false)) })
    }

    /// Flag that ends [`PollAdapter::run`] once set
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// One drain pass, preceded by a wait in blocking mode
    pub fn run_once<R: RegisterInterface, M: SharedMemory>(&mut self, engine: &mut RxEngine<R, M>, sink: impl FnMut(RxFrame)) -> Result<usize, crate::Error> {
        if self.mode == WakeMode::Blocking {
            self.waker.wait()?;
        }
        Ok(engine.poll(self.budget, sink))
    }

    /// Drain until stopped, returning the number of packets handled
    pub fn run<R: RegisterInterface, M: SharedMemory>(&mut self, engine: &mut RxEngine<R, M>, mut sink: impl FnMut(RxFrame)) -> Result<u64, crate::Error> {
        tracing::debug!(mode = ?self.mode, budget = self.budget, "poll loop started");
        let mut total = 0;
        while !self.stop.load(Ordering::Acquire) {
            let processed = self.run_once(engine, &mut sink)?;
            if processed == 0 && self.mode == WakeMode::Spin {
                std::hint::spin_loop();
            }
            total += processed as u64;
        }
        tracing::debug!(total, "poll loop stopped");
        Ok(total)
    }
}

impl<W> std::fmt::Debug for PollAdapter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollAdapter")
            .field("mode", &self.mode)
            .field("budget", &self.budget)
            .field("stopped", &self.stop.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
