use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};

use crate::{Device, RegisterInterface, RxEngine, RxFrame, RxMode, SharedMemory};

/// Interrupt-driven drain scheduling
///
/// At most one drain is pending or running at any time, the global interrupt stays masked until the
/// engine finds the rings empty.
pub struct InterruptAdapter<R, M> {
    device: Arc<Device<R, M>>,
    budget: usize,

    // single-slot drain schedule
    schedule_tx: Sender<()>,
    schedule_rx: Receiver<()>,

    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}
impl<R: RegisterInterface, M: SharedMemory> InterruptAdapter<R, M> {
    pub fn new(device: Arc<Device<R, M>>) -> Result<Self, crate::Error> {
        let config = device.config();
        if config.rx_mode != RxMode::Interrupt {
            return Err(crate::Error::Config { reason: format!("device runs in {:?} mode", config.rx_mode) });
        }
        let (schedule_tx, schedule_rx) = crossbeam::channel::bounded(1);
        let (stop_tx, stop_rx) = crossbeam::channel::bounded(1);
        Ok(Self {
            device,
            budget: config.budget,
            schedule_tx,
            schedule_rx,
            stop_tx,
            stop_rx,
        })
    }

    /// Top half: mask, schedule a drain, acknowledge
    ///
    /// Returns whether a new drain got scheduled, `false` means one was already pending.
    pub fn on_interrupt(&self) -> bool {
        let state = self.device.read();
        if let Err(error) = state.ring.set_global_interrupt(false) {
            tracing::error!(%error, "unable to mask the global interrupt");
        }
        let scheduled = self.schedule_tx.try_send(()).is_ok();
        if let Err(error) = state.ring.acknowledge_interrupt() {
            tracing::error!(%error, "unable to acknowledge the interrupt");
        }
        tracing::trace!(scheduled, "interrupt");
        scheduled
    }

    /// Run one scheduled drain, if any
    pub fn run_pending(&self, engine: &mut RxEngine<R, M>, sink: impl FnMut(RxFrame)) -> Option<usize> {
        self.schedule_rx.try_recv().ok()?;
        Some(self.drain(engine, sink))
    }

    /// Serve drain schedules until [`InterruptAdapter::stop`] is called
    pub fn run_drain_worker(&self, engine: &mut RxEngine<R, M>, mut sink: impl FnMut(RxFrame)) {
        tracing::debug!(budget = self.budget, "drain worker started");
        loop {
            crossbeam::channel::select! {
                recv(self.schedule_rx) -> _ => { self.drain(engine, &mut sink); },
                recv(self.stop_rx) -> _ => break,
            }
        }
        tracing::debug!("drain worker stopped");
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    // budgeted passes until one ends short, which is when the engine re-arms
    fn drain(&self, engine: &mut RxEngine<R, M>, mut sink: impl FnMut(RxFrame)) -> usize {
        let mut total = 0;
        loop {
            let processed = engine.poll(self.budget, &mut sink);
            total += processed;
            if processed < self.budget {
                return total;
            }
        }
    }
}

impl<R, M> std::fmt::Debug for InterruptAdapter<R, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptAdapter")
            .field("budget", &self.budget)
            .field("pending", &!self.schedule_rx.is_empty())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    use crate::testing::{self, FakeHardware};
    use crate::{registers, DeviceConfig, MmapRegion, RawPacketHeader, WakeMode};

    fn setup(budget: usize) -> (FakeHardware, Arc<InterruptAdapter<FakeHardware, MmapRegion>>, RxEngine<FakeHardware, MmapRegion>) {
        testing::init_tracing();
        let hardware = FakeHardware::new();
        let config = DeviceConfig { budget, ..Default::default() };
        let device = Arc::new(Device::bring_up(config, hardware.clone(), testing::ring_memory()).unwrap());
        hardware.clear_log();
        let adapter = Arc::new(InterruptAdapter::new(Arc::clone(&device)).unwrap());
        (hardware, adapter, RxEngine::new(device))
    }

    fn deliver(hardware: &FakeHardware, engine: &RxEngine<FakeHardware, MmapRegion>, count: usize) {
        let header = RawPacketHeader::new(
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 2), 5000),
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 128), 7400),
            4,
        );
        for _ in 0..count {
            assert!(hardware.inject(engine.device().memory(), 0, header, b"ping"));
        }
    }

    #[test]
    fn interrupt_masks_schedules_and_acknowledges() {
        let (hardware, adapter, _engine) = setup(64);
        assert!(adapter.on_interrupt());
        assert_eq!(hardware.write_log(), vec![(registers::GIE, 0), (registers::ISR0, 0)]);

        assert!(!adapter.on_interrupt(), "one drain at a time");
    }

    #[test]
    fn drain_rearms_once_the_backlog_is_gone() {
        let (hardware, adapter, mut engine) = setup(4);
        deliver(&hardware, &engine, 10);

        assert!(adapter.on_interrupt());
        let mut received = 0;
        assert_eq!(adapter.run_pending(&mut engine, |_| received += 1), Some(10));
        assert_eq!(received, 10);
        assert_eq!(hardware.pending(0), 0);
        assert_eq!(hardware.writes_to(registers::GIE), vec![0, 1]);

        assert_eq!(adapter.run_pending(&mut engine, |_| ()), None, "nothing left scheduled");
    }

    #[test]
    fn exact_budget_takes_an_extra_pass() {
        let (hardware, adapter, mut engine) = setup(4);
        deliver(&hardware, &engine, 4);

        adapter.on_interrupt();
        assert_eq!(adapter.run_pending(&mut engine, |_| ()), Some(4));
        assert_eq!(hardware.writes_to(registers::GIE), vec![0, 1]);
    }

    #[test]
    fn worker_thread() {
        let (hardware, adapter, mut engine) = setup(8);
        deliver(&hardware, &engine, 3);
        let (frames_tx, frames_rx) = crossbeam::channel::unbounded();

        let worker = {
            let adapter = Arc::clone(&adapter);
            std::thread::spawn(move || adapter.run_drain_worker(&mut engine, |frame| frames_tx.send(frame).unwrap()))
        };

        adapter.on_interrupt();
        for _ in 0..3 {
            let frame = frames_rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
            assert_eq!(frame.payload(), b"ping");
        }

        adapter.stop();
        worker.join().unwrap();
        assert_eq!(hardware.pending(0), 0);
    }

    #[test]
    fn poll_mode_device_refused() {
        let hardware = FakeHardware::new();
        let config = DeviceConfig { rx_mode: RxMode::Poll(WakeMode::Spin), ..Default::default() };
        let device = Arc::new(Device::bring_up(config, hardware, testing::ring_memory()).unwrap());
        assert!(InterruptAdapter::new(device).unwrap_err().is_config());
    }
}
