use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::ring::{RingProtocol, RxBufferControl, TxRingState};
use crate::{registers, shmem, utils};
use crate::{DeviceConfig, FrameTemplate, MappingConfig, PortTable, RegisterInterface, RxMode, SharedMemory};
use crate::{MappedRegisters, MmapRegion};

//
// statistics
//

/// Traffic counters of a device, updated by the engines
#[derive(Debug, Default)]
pub struct Statistics {
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    rx_errors: AtomicU64,
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    tx_dropped: AtomicU64,
    tx_busy: AtomicU64,
}
impl Statistics {
    pub(crate) fn record_rx(&self, frame_len: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(frame_len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_rx_error(&self) {
        self.rx_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tx(&self, payload_len: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(payload_len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_tx_dropped(&self) {
        self.tx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tx_busy(&self) {
        self.tx_busy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_errors: self.rx_errors.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
            tx_busy: self.tx_busy.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Statistics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub rx_packets: u64,
    /// Bytes of the rebuilt frames, headers included
    pub rx_bytes: u64,
    pub rx_errors: u64,
    pub tx_packets: u64,
    /// Payload bytes handed to the core
    pub tx_bytes: u64,
    /// Frames refused by the codec
    pub tx_dropped: u64,
    /// Frames refused because the TX ring was full
    pub tx_busy: u64,
}

//
// device
//

/// Everything a configuration change has to replace at once
pub(crate) struct DeviceState<R> {
    pub(crate) ring: RingProtocol<R>,
    pub(crate) config: DeviceConfig,
    pub(crate) template: FrameTemplate,
}

/// Handle to one offload core
///
/// Draining and sending share the device, configuration changes lock it exclusively.
pub struct Device<R, M> {
    state: RwLock<DeviceState<R>>,
    memory: M,
    statistics: Statistics,
}
impl<R: RegisterInterface, M: SharedMemory> Device<R, M> {
    /// Program the core and start it
    ///
    /// The configuration is checked before the first register write, any register failure aborts the bring-up.
    #[tracing::instrument(skip_all, level = tracing::Level::INFO)]
    pub fn bring_up(config: DeviceConfig, interface: R, memory: M) -> Result<Self, crate::Error> {
        config.validate()?;
        if memory.size() < shmem::TOTAL_SIZE {
            return Err(crate::Error::Config { reason: format!("shared memory holds {} bytes, {} needed", memory.size(), shmem::TOTAL_SIZE) });
        }
        let shmem_address = u32::try_from(memory.device_address())
            .map_err(|_| crate::Error::Config { reason: format!("device address {:#x} is not 32-bit addressable", memory.device_address()) })?;

        let mut ring = RingProtocol::new(interface, PortTable::new(config.port_min, config.port_max)?);

        // hold the core in reset while it is programmed
        ring.assert_reset()?;

        let (mac_high, mac_low) = utils::mac_to_registers(config.local_mac);
        ring.write_register(registers::MAC_0, mac_low)?;
        ring.write_register(registers::MAC_1, mac_high)?;
        ring.write_register(registers::GATEWAY, utils::ipv4_to_register(config.gateway_ip))?;
        ring.write_register(registers::SUBNET_MASK, utils::ipv4_to_register(config.subnet_mask))?;
        ring.write_register(registers::LOCAL_IP, utils::ipv4_to_register(config.local_ip))?;
        ring.write_register(registers::SHMEM, shmem_address)?;
        ring.write_register(registers::UDP_RANGE_LOW, config.port_min as u32)?;
        ring.write_register(registers::UDP_RANGE_HIGH, config.port_max as u32)?;

        // start from clean rings
        ring.reset_all_rx_buffers()?;
        ring.clear_tx_push()?;
        for port in &config.open_ports {
            ring.open_port(*port)?;
        }

        let interrupts = matches!(config.rx_mode, RxMode::Interrupt);
        ring.set_interrupt_enable(interrupts)?;
        ring.set_global_interrupt(interrupts)?;

        ring.deassert_reset()?;
        tracing::info!(
            mac = utils::format_mac(config.local_mac),
            ip = %config.local_ip,
            gateway = %config.gateway_ip,
            ports = ?ring.ports(),
            mode = ?config.rx_mode,
            "device up"
        );

        let template = config.frame_template();
        Ok(Self {
            state: RwLock::new(DeviceState { ring, config, template }),
            memory,
            statistics: Statistics::default(),
        })
    }

    /// Stop the core, pending data is lost
    ///
    /// Every step is attempted, the first failure is reported. The core is left in reset.
    #[tracing::instrument(skip_all, level = tracing::Level::INFO)]
    pub fn shutdown(&self) -> Result<(), crate::Error> {
        let mut state = self.write();
        let ring = &mut state.ring;
        let mut first_error = None;

        best_effort(&mut first_error, "assert reset", ring.assert_reset());
        best_effort(&mut first_error, "clear shared memory address", ring.write_register(registers::SHMEM, 0));
        best_effort(&mut first_error, "reset RX buffers", ring.reset_all_rx_buffers());
        best_effort(&mut first_error, "clear TX push", ring.clear_tx_push());
        best_effort(&mut first_error, "disable interrupt", ring.set_interrupt_enable(false));
        best_effort(&mut first_error, "disable global interrupt", ring.set_global_interrupt(false));
        state.config.open_ports.clear();

        tracing::info!("device down");
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Hold the core in reset, there is no other way to keep it quiet
    pub fn interface_down(&self) -> Result<(), crate::Error> {
        self.read().ring.assert_reset()
    }

    //
    // reconfiguration
    //

    /// Move to a new port range, opened port set and gateway, dropping everything in flight
    pub fn notify_change(&self, port_min: u16, port_max: u16, open_ports: &[u16], gateway: Ipv4Addr) -> Result<(), crate::Error> {
        let mut state = self.write();
        let result = state.ring.notify_change(port_min, port_max, open_ports, gateway);
        let ports = state.ring.ports();
        let (low, high, opened) = (ports.port_min(), ports.port_max(), ports.open_ports());
        state.config.port_min = low;
        state.config.port_max = high;
        state.config.open_ports = opened;
        result?;
        state.config.gateway_ip = gateway;
        Ok(())
    }

    pub fn set_mac_address(&self, mac: [u8; 6]) -> Result<(), crate::Error> {
        if !utils::is_valid_unicast_mac(mac) {
            return Err(crate::Error::Config { reason: format!("MAC address {} not valid", utils::format_mac(mac)) });
        }
        let mut state = self.write();
        let (mac_high, mac_low) = utils::mac_to_registers(mac);
        state.ring.write_register(registers::MAC_0, mac_low)?;
        state.ring.write_register(registers::MAC_1, mac_high)?;
        state.config.local_mac = mac;
        state.template = state.config.frame_template();
        tracing::info!(mac = utils::format_mac(mac), "changed MAC address");
        Ok(())
    }

    /// Apply a new interface address, the core is held in reset meanwhile
    pub fn set_interface_address(&self, local_ip: Ipv4Addr, subnet_mask: Ipv4Addr, gateway: Ipv4Addr) -> Result<(), crate::Error> {
        let mut state = self.write();
        state.ring.assert_reset()?;
        state.ring.write_register(registers::LOCAL_IP, utils::ipv4_to_register(local_ip))?;
        state.ring.write_register(registers::SUBNET_MASK, utils::ipv4_to_register(subnet_mask))?;
        state.ring.write_register(registers::GATEWAY, utils::ipv4_to_register(gateway))?;
        state.ring.deassert_reset()?;
        state.config.local_ip = local_ip;
        state.config.subnet_mask = subnet_mask;
        state.config.gateway_ip = gateway;
        tracing::info!(%local_ip, %subnet_mask, %gateway, "changed interface address");
        Ok(())
    }

    pub fn open_port(&self, port: u16) -> Result<usize, crate::Error> {
        let mut state = self.write();
        let buffer_id = state.ring.open_port(port)?;
        state.config.open_ports = state.ring.ports().open_ports();
        Ok(buffer_id)
    }

    pub fn close_port(&self, port: u16) -> Result<usize, crate::Error> {
        let mut state = self.write();
        let buffer_id = state.ring.close_port(port)?;
        state.config.open_ports = state.ring.ports().open_ports();
        Ok(buffer_id)
    }

    //
    // readback
    //

    pub fn config(&self) -> DeviceConfig {
        self.read().config.clone()
    }

    pub fn local_ip(&self) -> Result<Ipv4Addr, crate::Error> {
        Ok(utils::register_to_ipv4(self.read().ring.read_register(registers::LOCAL_IP)?))
    }

    pub fn port_range_low(&self) -> Result<u16, crate::Error> {
        Ok(self.read().ring.read_register(registers::UDP_RANGE_LOW)? as u16)
    }

    pub fn port_range_high(&self) -> Result<u16, crate::Error> {
        Ok(self.read().ring.read_register(registers::UDP_RANGE_HIGH)? as u16)
    }

    /// Values of all fixed control registers, by name
    pub fn register_dump(&self) -> Result<Vec<(&'static str, u32)>, crate::Error> {
        let state = self.read();
        registers::REGISTER_NAMES.iter()
            .map(|(name, offset)| state.ring.read_register(*offset).map(|value| (*name, value)))
            .collect()
    }

    pub fn rx_snapshot(&self, port: u16) -> Result<RxBufferControl, crate::Error> {
        let state = self.read();
        let buffer_id = state.ring.ports().buffer_id(port)?;
        state.ring.rx_snapshot(buffer_id)
    }

    /// Whether data is waiting on `port`
    pub fn probe(&self, port: u16) -> Result<bool, crate::Error> {
        Ok(!self.rx_snapshot(port)?.empty())
    }

    pub fn tx_ring_state(&self) -> Result<TxRingState, crate::Error> {
        self.read().ring.tx_ring_state()
    }

    //
    // engine access
    //

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, DeviceState<R>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DeviceState<R>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Device<MappedRegisters, MmapRegion> {
    /// Map a physical core through its memory device and bring it up
    pub fn map(mapping: &MappingConfig, config: DeviceConfig) -> Result<Self, crate::Error> {
        let shmem_address = mapping.shmem_address
            .ok_or_else(|| crate::Error::Config { reason: "no shared memory address configured".into() })?;
        let interface = MappedRegisters::map(&mapping.memory_device, mapping.device_address, mapping.page_size)?;
        let memory = MmapRegion::physical(&mapping.memory_device, shmem_address, shmem::TOTAL_SIZE)?;
        Self::bring_up(config, interface, memory)
    }
}

impl<R, M> std::fmt::Debug for Device<R, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Device")
            .field("config", &state.config)
            .field("ports", state.ring.ports())
            .field("statistics", &self.statistics.snapshot())
            .finish_non_exhaustive()
    }
}

fn best_effort(first_error: &mut Option<crate::Error>, step: &'static str, result: Result<(), crate::Error>) {
    if let Err(error) = result {
        tracing::error!(step, %error, "teardown step failed");
        first_error.get_or_insert(error);
    }
}
