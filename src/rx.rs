use std::sync::Arc;

use crate::device::DeviceState;
use crate::packet::{self, RAW_HEADER_SIZE};
use crate::shmem::{self, SLOT_SIZE};
use crate::{Device, RawPacketHeader, RegisterInterface, RxFrame, RxMode, SharedMemory};

/// Where the receive engine stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxState {
    /// Not draining, interrupts (if any) left disabled
    #[default]
    Idle,
    /// Sweeping the opened ports
    Polling,
    /// Consuming a slot of `port`
    Draining { port: u16 },
    /// The backlog was exhausted and the global interrupt re-enabled
    Rearm,
}

/// Budgeted drain of the RX rings
pub struct RxEngine<R, M> {
    device: Arc<Device<R, M>>,
    state: RxState,
}
impl<R: RegisterInterface, M: SharedMemory> RxEngine<R, M> {
    pub fn new(device: Arc<Device<R, M>>) -> Self {
        Self { device, state: RxState::Idle }
    }

    pub fn device(&self) -> &Arc<Device<R, M>> {
        &self.device
    }

    /// State reached by the last drain
    pub fn state(&self) -> RxState {
        self.state
    }

    /// Drain at most `budget` packets, handing every rebuilt frame to `sink`
    ///
    /// Opened ports are swept in ascending order taking one packet from each non-empty ring,
    /// sweeps are repeated until one finds nothing or the budget is spent.
    /// Every call starts again from the lowest port.
    /// When the backlog runs out before the budget, interrupt mode re-enables the global interrupt.
    ///
    /// `sink` runs while the device configuration is locked and must not reconfigure the device.
    #[tracing::instrument(skip(self, sink), level = tracing::Level::TRACE, ret)]
    pub fn poll(&mut self, budget: usize, mut sink: impl FnMut(RxFrame)) -> usize {
        let device = Arc::clone(&self.device);
        let state = device.read();
        self.state = RxState::Polling;

        let mut processed = 0;
        'drain: while processed < budget {
            let mut found = 0;
            for buffer_id in state.ring.ports().open_buffers() {
                if processed == budget {
                    break 'drain;
                }

                let control = match state.ring.rx_snapshot(buffer_id) {
                    Ok(control) => control,
                    Err(error) => {
                        tracing::warn!(buffer_id, %error, "unable to read RX control register");
                        device.statistics().record_rx_error();
                        continue;
                    },
                };
                if control.empty() {
                    continue;
                }

                self.state = RxState::Draining { port: state.ring.ports().port_for(buffer_id) };
                if let Some(frame) = consume_slot(&device, &state, buffer_id, control.tail()) {
                    sink(frame);
                }
                processed += 1;
                found += 1;
            }
            if found == 0 {
                break;
            }
        }

        self.state = RxState::Idle;
        if processed < budget && state.config.rx_mode == RxMode::Interrupt {
            self.state = RxState::Rearm;
            if let Err(error) = state.ring.set_global_interrupt(true) {
                tracing::error!(%error, "unable to re-enable the global interrupt");
            }
        }
        processed
    }

    /// Take the oldest packet waiting on `port`, whether the port is still open or not
    pub fn recv(&self, port: u16) -> Result<Option<RxFrame>, crate::Error> {
        let state = self.device.read();
        let buffer_id = state.ring.ports().buffer_id(port)?;
        let control = state.ring.rx_snapshot(buffer_id)?;
        if control.empty() {
            return Ok(None);
        }

        let frame = read_slot(&self.device, &state, buffer_id, control.tail());
        state.ring.rx_pop_pulse(buffer_id)?;
        match frame {
            Ok(frame) => {
                self.device.statistics().record_rx(frame.data().len());
                Ok(Some(frame))
            },
            Err(error) => {
                self.device.statistics().record_rx_error();
                Err(error)
            },
        }
    }

    /// Whether data is waiting on `port`
    pub fn probe(&self, port: u16) -> Result<bool, crate::Error> {
        self.device.probe(port)
    }
}

/// Read the slot at `tail`, release it to the hardware and account for it
fn consume_slot<R: RegisterInterface, M: SharedMemory>(
    device: &Device<R, M>,
    state: &DeviceState<R>,
    buffer_id: usize,
    tail: usize,
) -> Option<RxFrame> {
    let frame = read_slot(device, state, buffer_id, tail);
    if let Err(error) = state.ring.rx_pop_pulse(buffer_id) {
        tracing::warn!(buffer_id, %error, "unable to release RX slot");
    }
    match frame {
        Ok(frame) => {
            device.statistics().record_rx(frame.data().len());
            Some(frame)
        },
        Err(error) => {
            tracing::warn!(buffer_id, tail, %error, "dropped RX slot");
            device.statistics().record_rx_error();
            None
        },
    }
}

fn read_slot<R: RegisterInterface, M: SharedMemory>(device: &Device<R, M>, state: &DeviceState<R>, buffer_id: usize, tail: usize) -> Result<RxFrame, crate::Error> {
    let memory = device.memory();
    let offset = shmem::rx_slot_offset(buffer_id, tail);
    memory.sync_for_cpu(offset, SLOT_SIZE);

    let mut header = [0_u8; RAW_HEADER_SIZE];
    memory.read_at(offset, &mut header)?;
    let header = RawPacketHeader::from_bytes(&header)?;

    // a slot never holds more than its own size
    let payload_len = (header.payload_size as usize).min(SLOT_SIZE - RAW_HEADER_SIZE);
    if payload_len as u64 != header.payload_size {
        tracing::warn!(buffer_id, payload_size = header.payload_size, "RX payload size exceeds the slot");
    }
    let mut payload = vec![0_u8; payload_len];
    memory.read_at(shmem::rx_payload_offset(buffer_id, tail), &mut payload)?;

    Ok(packet::decompose_with(&state.template, &header, &payload))
}

impl<R, M> std::fmt::Debug for RxEngine<R, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxEngine").field("state", &self.state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    use crate::testing::{self, FakeHardware};
    use crate::{registers, DeviceConfig, MmapRegion, WakeMode};

    const PEER: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 2), 5000);

    fn engine(config: DeviceConfig) -> (FakeHardware, RxEngine<FakeHardware, MmapRegion>) {
        testing::init_tracing();
        let hardware = FakeHardware::new();
        let device = Device::bring_up(config, hardware.clone(), testing::ring_memory()).unwrap();
        hardware.clear_log();
        (hardware, RxEngine::new(Arc::new(device)))
    }

    fn deliver(hardware: &FakeHardware, engine: &RxEngine<FakeHardware, MmapRegion>, port: u16, payload: &[u8]) {
        let header = RawPacketHeader::new(PEER, SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 128), port), payload.len());
        let buffer_id = (port - engine.device().config().port_min) as usize;
        assert!(hardware.inject(engine.device().memory(), buffer_id, header, payload), "port {port} refused the packet");
    }

    fn drain(engine: &mut RxEngine<FakeHardware, MmapRegion>, budget: usize) -> Vec<RxFrame> {
        let mut frames = Vec::new();
        let processed = engine.poll(budget, |frame| frames.push(frame));
        assert_eq!(processed, frames.len());
        frames
    }

    #[test]
    fn drains_everything_within_budget() {
        let (hardware, mut engine) = engine(DeviceConfig::default());
        for payload in [b"a0", b"a1", b"a2"] {
            deliver(&hardware, &engine, 7400, payload);
        }
        deliver(&hardware, &engine, 7411, b"b0");
        deliver(&hardware, &engine, 7411, b"b1");

        let frames = drain(&mut engine, 64);

        let payloads = frames.iter().map(|frame| frame.payload().to_vec()).collect::<Vec<_>>();
        assert_eq!(payloads, vec![b"a0".to_vec(), b"b0".to_vec(), b"a1".to_vec(), b"b1".to_vec(), b"a2".to_vec()]);
        assert_eq!(hardware.pending(0), 0);
        assert_eq!(hardware.pending(11), 0);
        assert_eq!(engine.state(), RxState::Rearm);
        assert_eq!(hardware.writes_to(registers::GIE), vec![1]);
    }

    #[test]
    fn budget_bounds_a_drain() {
        let (hardware, mut engine) = engine(DeviceConfig::default());
        for index in 0..10_u8 {
            deliver(&hardware, &engine, 7401, &[index]);
        }

        assert_eq!(drain(&mut engine, 4).len(), 4);
        assert_eq!(hardware.pending(1), 6);
        assert_eq!(engine.state(), RxState::Idle);
        assert!(hardware.writes_to(registers::GIE).is_empty(), "no re-arm while backlog remains");

        assert_eq!(drain(&mut engine, 64).len(), 6);
        assert_eq!(engine.state(), RxState::Rearm);
    }

    #[test]
    fn zero_budget_does_nothing() {
        let (hardware, mut engine) = engine(DeviceConfig::default());
        deliver(&hardware, &engine, 7400, b"x");
        assert_eq!(drain(&mut engine, 0).len(), 0);
        assert_eq!(hardware.pending(0), 1);
        assert!(hardware.writes_to(registers::GIE).is_empty());
    }

    #[test]
    fn empty_rings_rearm_immediately() {
        let (hardware, mut engine) = engine(DeviceConfig::default());
        assert_eq!(drain(&mut engine, 64).len(), 0);
        assert_eq!(engine.state(), RxState::Rearm);
        assert_eq!(hardware.writes_to(registers::GIE), vec![1]);
    }

    #[test]
    fn every_drain_restarts_at_the_lowest_port() {
        let (hardware, mut engine) = engine(DeviceConfig::default());
        for _ in 0..5 {
            deliver(&hardware, &engine, 7400, b"low");
            deliver(&hardware, &engine, 7401, b"low");
        }
        deliver(&hardware, &engine, 7410, b"high");

        for _ in 0..3 {
            let frames = drain(&mut engine, 2);
            let ports = frames.iter().map(|frame| frame.destination().port()).collect::<Vec<_>>();
            assert_eq!(ports, vec![7400, 7401]);
        }
        assert_eq!(hardware.pending(10), 1, "higher ports wait while lower ones exhaust the budget");

        let frames = drain(&mut engine, 64);
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[2].destination().port(), 7410);
    }

    #[test]
    fn frames_are_rebuilt_from_the_slot() {
        let (hardware, mut engine) = engine(DeviceConfig::default());
        deliver(&hardware, &engine, 7410, b"hello core");

        let frames = drain(&mut engine, 64);
        let frame = &frames[0];
        assert_eq!(frame.source(), PEER);
        assert_eq!(frame.destination(), SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 128), 7410));
        assert_eq!(frame.payload(), b"hello core");
        assert_eq!(&frame.data()[0..6], &crate::config::DEFAULT_LOCAL_MAC);
        assert_eq!(packet::ipv4_checksum(frame.ip_header()), 0);

        let statistics = engine.device().statistics().snapshot();
        assert_eq!(statistics.rx_packets, 1);
        assert_eq!(statistics.rx_bytes, (packet::FRAME_HEADER_SIZE + 10) as u64);
    }

    #[test]
    fn oversized_header_is_clamped_to_the_slot() {
        let (hardware, mut engine) = engine(DeviceConfig::default());
        let mut header = RawPacketHeader::new(PEER, SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 128), 7400), 0);
        header.payload_size = 5000;
        assert!(hardware.inject(engine.device().memory(), 0, header, &[0xEE; 16]));

        let frames = drain(&mut engine, 64);
        assert_eq!(frames[0].payload().len(), SLOT_SIZE - RAW_HEADER_SIZE);
        assert_eq!(&frames[0].payload()[..16], &[0xEE; 16]);
    }

    #[test]
    fn poll_mode_never_touches_interrupts() {
        let config = DeviceConfig { rx_mode: RxMode::Poll(WakeMode::Spin), ..Default::default() };
        let (hardware, mut engine) = engine(config);
        deliver(&hardware, &engine, 7400, b"x");

        assert_eq!(drain(&mut engine, 64).len(), 1);
        assert_eq!(engine.state(), RxState::Idle);
        assert!(hardware.writes_to(registers::GIE).is_empty());
    }

    #[test]
    fn freshly_opened_port_is_empty() {
        let (_hardware, engine) = engine(DeviceConfig::default());
        engine.device().open_port(7450).unwrap();
        assert!(!engine.probe(7450).unwrap());
        assert_eq!(engine.recv(7450).unwrap(), None);
    }

    #[test]
    fn closed_port_keeps_buffered_data() {
        let (hardware, mut engine) = engine(DeviceConfig::default());
        deliver(&hardware, &engine, 7410, b"before");
        deliver(&hardware, &engine, 7410, b"close");
        engine.device().close_port(7410).unwrap();

        // nothing new gets in
        let header = RawPacketHeader::new(PEER, SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 128), 7410), 5);
        assert!(!hardware.inject(engine.device().memory(), 10, header, b"after"));

        // the sweep skips the closed port
        assert_eq!(drain(&mut engine, 64).len(), 0);
        assert!(engine.probe(7410).unwrap());

        assert_eq!(engine.recv(7410).unwrap().unwrap().payload(), b"before");
        assert_eq!(engine.recv(7410).unwrap().unwrap().payload(), b"close");
        assert_eq!(engine.recv(7410).unwrap(), None);
        assert!(!engine.probe(7410).unwrap());
    }

    #[test]
    fn recv_outside_range_is_a_config_error() {
        let (_hardware, engine) = engine(DeviceConfig::default());
        assert!(engine.recv(80).unwrap_err().is_config());
    }

    #[test]
    fn unreadable_port_is_skipped() {
        let (hardware, mut engine) = engine(DeviceConfig::default());
        deliver(&hardware, &engine, 7400, b"stuck");
        deliver(&hardware, &engine, 7401, b"fine");
        hardware.fail_reads_of(registers::rx_control(0));

        let frames = drain(&mut engine, 64);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"fine");
        assert!(engine.device().statistics().snapshot().rx_errors >= 1);

        hardware.clear_failures();
        assert_eq!(drain(&mut engine, 64).len(), 1);
    }
}
