use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{registers, PortTable, RegisterInterface};
use crate::shmem::{MAX_UDP_PORTS, RX_SLOTS};

//
// RX control word
//

const POPPED_BIT: u32 = 0;
const PUSHED_BIT: u32 = 1;
const FULL_BIT: u32 = 2;
const EMPTY_BIT: u32 = 3;
const TAIL_SHIFT: u32 = 4;
const HEAD_SHIFT: u32 = 9;
const INDEX_MASK: u32 = 0x1F;
const SOCKET_STATE_BIT: u32 = 14;
const DUMMY_BIT: u32 = 15;

/// Mask of the "popped" bit of an RX control word
pub const POPPED_MASK: u32 = 1 << POPPED_BIT;
/// Mask of the "socket state" bit of an RX control word
pub const SOCKET_STATE_MASK: u32 = 1 << SOCKET_STATE_BIT;

/// Status of the RX ring of one port, as read out of its control register
///
/// | Bit(s) | Field        |
/// |--------|--------------|
/// | 0      | popped       |
/// | 1      | pushed       |
/// | 2      | full         |
/// | 3      | empty        |
/// | 4-8    | tail         |
/// | 9-13   | head         |
/// | 14     | socket state |
/// | 15     | dummy        |
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RxBufferControl(u32);
impl RxBufferControl {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    const fn bit(&self, bit: u32) -> bool {
        self.0 & (1 << bit) != 0
    }

    pub const fn popped(&self) -> bool {
        self.bit(POPPED_BIT)
    }

    pub const fn pushed(&self) -> bool {
        self.bit(PUSHED_BIT)
    }

    pub const fn full(&self) -> bool {
        self.bit(FULL_BIT)
    }

    pub const fn empty(&self) -> bool {
        self.bit(EMPTY_BIT)
    }

    /// The next slot the driver should consume
    pub const fn tail(&self) -> usize {
        ((self.0 >> TAIL_SHIFT) & INDEX_MASK) as usize
    }

    /// The next slot the hardware will fill
    pub const fn head(&self) -> usize {
        ((self.0 >> HEAD_SHIFT) & INDEX_MASK) as usize
    }

    pub const fn is_open(&self) -> bool {
        self.bit(SOCKET_STATE_BIT)
    }

    pub const fn dummy(&self) -> bool {
        self.bit(DUMMY_BIT)
    }

    /// Number of slots waiting to be drained
    pub const fn pending(&self) -> usize {
        if self.empty() {
            0
        } else if self.full() {
            RX_SLOTS
        } else {
            (self.head() + RX_SLOTS - self.tail()) % RX_SLOTS
        }
    }

    /// Encode a control word out of its fields
    pub const fn encode(popped: bool, pushed: bool, full: bool, empty: bool, tail: usize, head: usize, open: bool) -> Self {
        Self(
            (popped as u32) << POPPED_BIT
                | (pushed as u32) << PUSHED_BIT
                | (full as u32) << FULL_BIT
                | (empty as u32) << EMPTY_BIT
                | (tail as u32 & INDEX_MASK) << TAIL_SHIFT
                | (head as u32 & INDEX_MASK) << HEAD_SHIFT
                | (open as u32) << SOCKET_STATE_BIT
        )
    }
}
impl std::fmt::Debug for RxBufferControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxBufferControl")
            .field("popped", &self.popped())
            .field("pushed", &self.pushed())
            .field("full", &self.full())
            .field("empty", &self.empty())
            .field("tail", &self.tail())
            .field("head", &self.head())
            .field("open", &self.is_open())
            .finish()
    }
}

//
// TX status
//

/// Whether the TX ring can take a packet, and where
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Full,
    Ready { head: usize },
}

/// Hardware-owned TX ring registers, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRingState {
    pub head: u32,
    pub tail: u32,
    pub empty: bool,
    pub full: bool,
    pub popped: bool,
}

//
// protocol
//

/// Register-level control of the RX and TX rings
///
/// Every multi-write sequence (read-modify-write, pulses) runs with the register interface locked.
/// Operations taking `&mut self` reshape the port configuration and must not overlap with draining or sending.
pub struct RingProtocol<R> {
    registers: Mutex<R>,
    ports: PortTable,
}
impl<R> RingProtocol<R> {
    pub fn new(registers: R, ports: PortTable) -> Self {
        Self { registers: Mutex::new(registers), ports }
    }

    pub const fn ports(&self) -> &PortTable {
        &self.ports
    }
}
impl<R: RegisterInterface> RingProtocol<R> {

    fn lock(&self) -> MutexGuard<'_, R> {
        self.registers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    //
    // plain registers
    //

    pub fn read_register(&self, offset: u32) -> Result<u32, crate::Error> {
        self.lock().read32(offset)
    }

    pub fn write_register(&self, offset: u32, value: u32) -> Result<(), crate::Error> {
        self.lock().write32(offset, value)
    }

    pub fn assert_reset(&self) -> Result<(), crate::Error> {
        self.write_register(registers::RESET, 1)
    }

    pub fn deassert_reset(&self) -> Result<(), crate::Error> {
        self.write_register(registers::RESET, 0)
    }

    pub fn set_global_interrupt(&self, enabled: bool) -> Result<(), crate::Error> {
        self.write_register(registers::GIE, enabled as u32)
    }

    pub fn set_interrupt_enable(&self, enabled: bool) -> Result<(), crate::Error> {
        self.write_register(registers::IER0, enabled as u32)
    }

    pub fn acknowledge_interrupt(&self) -> Result<(), crate::Error> {
        self.write_register(registers::ISR0, 0)
    }

    //
    // RX
    //

    /// Read the control word of the `buffer_id`-th RX ring
    pub fn rx_snapshot(&self, buffer_id: usize) -> Result<RxBufferControl, crate::Error> {
        let value = self.lock().read32(registers::rx_control(buffer_id as u32))?;
        Ok(RxBufferControl::from_raw(value))
    }

    /// Tell the hardware the slot at `tail` has been consumed
    ///
    /// The hardware advances its tail on the rising edge of "popped", so the bit goes 0, 1, 0
    /// on top of the value read once at the start.
    #[tracing::instrument(skip(self), level = tracing::Level::TRACE)]
    pub fn rx_pop_pulse(&self, buffer_id: usize) -> Result<(), crate::Error> {
        let offset = registers::rx_control(buffer_id as u32);
        let mut interface = self.lock();
        let value = interface.read32(offset)?;
        interface.write32(offset, value & !POPPED_MASK)?;
        interface.write32(offset, value | POPPED_MASK)?;
        interface.write32(offset, value & !POPPED_MASK)
    }

    fn set_socket_state(&mut self, buffer_id: usize, open: bool) -> Result<(), crate::Error> {
        let offset = registers::rx_control(buffer_id as u32);
        let interface = self.registers.get_mut().unwrap_or_else(PoisonError::into_inner);
        let value = interface.read32(offset)?;
        let value = if open { value | SOCKET_STATE_MASK } else { value & !SOCKET_STATE_MASK };
        interface.write32(offset, value)
    }

    /// Let the hardware accept datagrams for `port`, returning its buffer
    #[tracing::instrument(skip(self), level = tracing::Level::DEBUG)]
    pub fn open_port(&mut self, port: u16) -> Result<usize, crate::Error> {
        let buffer_id = self.ports.buffer_id(port)?;
        self.set_socket_state(buffer_id, true)?;
        self.ports.mark_open(port)?;
        Ok(buffer_id)
    }

    /// Stop accepting datagrams for `port`, already buffered slots stay readable
    #[tracing::instrument(skip(self), level = tracing::Level::DEBUG)]
    pub fn close_port(&mut self, port: u16) -> Result<usize, crate::Error> {
        let buffer_id = self.ports.buffer_id(port)?;
        self.set_socket_state(buffer_id, false)?;
        self.ports.mark_closed(port)?;
        Ok(buffer_id)
    }

    /// Drop the pending pulse state of a buffer and close it
    pub fn reset_rx_buffer(&mut self, buffer_id: usize) -> Result<(), crate::Error> {
        self.rx_pop_pulse(buffer_id)?;
        self.set_socket_state(buffer_id, false)
    }

    /// Reset every RX buffer and forget the opened ports
    pub fn reset_all_rx_buffers(&mut self) -> Result<(), crate::Error> {
        for buffer_id in 0..MAX_UDP_PORTS {
            self.reset_rx_buffer(buffer_id)?;
        }
        self.ports.reset(self.ports.port_min(), self.ports.port_max())
    }

    //
    // TX
    //

    /// Check whether the TX ring has room, reading the head only when it does
    pub fn tx_status(&self) -> Result<TxStatus, crate::Error> {
        let interface = self.lock();
        if interface.read32(registers::BUFTX_FULL)? != 0 {
            return Ok(TxStatus::Full);
        }
        let head = interface.read32(registers::BUFTX_HEAD)? as usize;
        Ok(TxStatus::Ready { head })
    }

    /// Hand the slot at head over to the hardware with a 0, 1, 0 pulse on "pushed"
    #[tracing::instrument(skip(self), level = tracing::Level::TRACE)]
    pub fn tx_push_pulse(&self) -> Result<(), crate::Error> {
        let mut interface = self.lock();
        interface.write32(registers::BUFTX_PUSHED, 0)?;
        interface.write32(registers::BUFTX_PUSHED, 1)?;
        interface.write32(registers::BUFTX_PUSHED, 0)
    }

    pub fn clear_tx_push(&self) -> Result<(), crate::Error> {
        self.write_register(registers::BUFTX_PUSHED, 0)
    }

    pub fn tx_ring_state(&self) -> Result<TxRingState, crate::Error> {
        let interface = self.lock();
        Ok(TxRingState {
            head: interface.read32(registers::BUFTX_HEAD)?,
            tail: interface.read32(registers::BUFTX_TAIL)?,
            empty: interface.read32(registers::BUFTX_EMPTY)? != 0,
            full: interface.read32(registers::BUFTX_FULL)? != 0,
            popped: interface.read32(registers::BUFTX_POPPED)? != 0,
        })
    }

    //
    // reconfiguration
    //

    /// Apply a new port range, opened port set and gateway
    ///
    /// Runs under device reset and throws away every pending RX and TX slot. When a register access
    /// fails the core stays in reset and the table only lists the sockets opened so far.
    #[tracing::instrument(skip(self, open_ports), level = tracing::Level::DEBUG)]
    pub fn notify_change(&mut self, port_min: u16, port_max: u16, open_ports: &[u16], gateway: Ipv4Addr) -> Result<(), crate::Error> {
        // validate before touching the hardware
        let mut ports = PortTable::new(port_min, port_max)?;
        for port in open_ports {
            ports.mark_open(*port)?;
        }

        self.assert_reset()?;

        // from here on the table follows the hardware, even when a step fails
        self.ports.reset(port_min, port_max)?;

        // close all sockets, then open the needed ones
        for buffer_id in 0..MAX_UDP_PORTS {
            self.set_socket_state(buffer_id, false)?;
        }
        for buffer_id in ports.open_buffers() {
            self.set_socket_state(buffer_id, true)?;
            self.ports.mark_open(ports.port_for(buffer_id))?;
        }

        self.write_register(registers::UDP_RANGE_LOW, port_min as u32)?;
        self.write_register(registers::UDP_RANGE_HIGH, port_max as u32)?;
        self.write_register(registers::GATEWAY, crate::utils::ipv4_to_register(gateway))?;

        self.deassert_reset()?;
        tracing::info!(port_min, port_max, opened = self.ports.num_open(), %gateway, "applied port configuration");
        Ok(())
    }
}
