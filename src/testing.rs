use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::packet::RAW_HEADER_SIZE;
use crate::ring::{RxBufferControl, POPPED_MASK, SOCKET_STATE_MASK};
use crate::shmem::{self, MAX_UDP_PORTS, RX_SLOTS, TX_SLOTS};
use crate::{registers, MmapRegion, RawPacketHeader, RegisterInterface, SharedMemory};

/// Device address advertised by test memory regions
pub(crate) const TEST_DEVICE_ADDRESS: u64 = 0x4000_0000;

/// Install a subscriber printing through the test harness
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

/// A region large enough for the whole ring layout
pub(crate) fn ring_memory() -> MmapRegion {
    MmapRegion::for_rings(TEST_DEVICE_ADDRESS).unwrap()
}

/// Read back the header and payload the driver placed in a TX slot
pub(crate) fn read_tx_slot(memory: &impl SharedMemory, slot: usize) -> (RawPacketHeader, Vec<u8>) {
    let mut header = [0_u8; RAW_HEADER_SIZE];
    memory.read_at(shmem::tx_slot_offset(slot), &mut header).unwrap();
    let header = RawPacketHeader::from_bytes(&header).unwrap();
    let mut payload = vec![0_u8; header.payload_size as usize];
    memory.read_at(shmem::tx_slot_offset(slot) + RAW_HEADER_SIZE, &mut payload).unwrap();
    (header, payload)
}

#[derive(Debug, Default, Clone, Copy)]
struct FakeRxRing {
    head: usize,
    tail: usize,
    count: usize,
    open: bool,
    popped: bool,
}

#[derive(Debug)]
struct FakeState {
    registers: HashMap<u32, u32>,
    rx: Vec<FakeRxRing>,

    tx_head: usize,
    tx_forced_full: bool,
    tx_pushed: bool,
    tx_pushed_slots: Vec<usize>,

    writes: Vec<(u32, u32)>,
    reads: HashMap<u32, usize>,
    failing_reads: HashSet<u32>,
    failing_writes: HashSet<u32>,
}

/// Register file of a simulated core
///
/// Clones share the same state, so a test keeps one handle while the device owns another.
#[derive(Debug, Clone)]
pub(crate) struct FakeHardware {
    state: Arc<Mutex<FakeState>>,
}
impl FakeHardware {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                registers: HashMap::new(),
                rx: vec![FakeRxRing::default(); MAX_UDP_PORTS],
                tx_head: 0,
                tx_forced_full: false,
                tx_pushed: false,
                tx_pushed_slots: Vec::new(),
                writes: Vec::new(),
                reads: HashMap::new(),
                failing_reads: HashSet::new(),
                failing_writes: HashSet::new(),
            })),
        }
    }

    fn rx_buffer(offset: u32) -> Option<usize> {
        if offset >= registers::BUFRX_BASE && offset < registers::REGISTER_SPACE_END {
            Some(((offset - registers::BUFRX_BASE) / registers::REGISTER_STRIDE) as usize)
        } else {
            None
        }
    }

    //
    // RX side
    //

    /// Place a datagram in the RX ring of `buffer_id` as the core would, false when the port is closed or the ring full
    pub(crate) fn inject(&self, memory: &impl SharedMemory, buffer_id: usize, header: RawPacketHeader, payload: &[u8]) -> bool {
        let mut state = self.state.lock().unwrap();
        let ring = &mut state.rx[buffer_id];
        if !ring.open || ring.count == RX_SLOTS {
            return false;
        }
        let slot = ring.head;
        memory.write_at(shmem::rx_slot_offset(buffer_id, slot), &header.to_bytes()).unwrap();
        memory.write_at(shmem::rx_payload_offset(buffer_id, slot), payload).unwrap();
        ring.head = (ring.head + 1) % RX_SLOTS;
        ring.count += 1;
        true
    }

    pub(crate) fn pending(&self, buffer_id: usize) -> usize {
        self.state.lock().unwrap().rx[buffer_id].count
    }

    pub(crate) fn is_open(&self, buffer_id: usize) -> bool {
        self.state.lock().unwrap().rx[buffer_id].open
    }

    /// Force the software-visible bits of a control register, as left over by a previous run
    pub(crate) fn set_rx_control_bits(&self, buffer_id: usize, bits: u32) {
        let mut state = self.state.lock().unwrap();
        let ring = &mut state.rx[buffer_id];
        ring.popped = bits & POPPED_MASK != 0;
        ring.open = bits & SOCKET_STATE_MASK != 0;
    }

    //
    // TX side
    //

    pub(crate) fn set_tx_head(&self, head: usize) {
        self.state.lock().unwrap().tx_head = head % TX_SLOTS;
    }

    pub(crate) fn fill_tx_ring(&self) {
        self.state.lock().unwrap().tx_forced_full = true;
    }

    pub(crate) fn drain_tx_ring(&self) {
        self.state.lock().unwrap().tx_forced_full = false;
    }

    /// Slots handed over through a rising edge of "pushed", in order
    pub(crate) fn tx_pushed_slots(&self) -> Vec<usize> {
        self.state.lock().unwrap().tx_pushed_slots.clone()
    }

    //
    // failures
    //

    pub(crate) fn fail_reads_of(&self, offset: u32) {
        self.state.lock().unwrap().failing_reads.insert(offset);
    }

    pub(crate) fn fail_writes_to(&self, offset: u32) {
        self.state.lock().unwrap().failing_writes.insert(offset);
    }

    pub(crate) fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing_reads.clear();
        state.failing_writes.clear();
    }

    //
    // inspection
    //

    pub(crate) fn write_log(&self) -> Vec<(u32, u32)> {
        self.state.lock().unwrap().writes.clone()
    }

    pub(crate) fn writes_to(&self, offset: u32) -> Vec<u32> {
        self.state.lock().unwrap().writes.iter()
            .filter(|(written, _)| *written == offset)
            .map(|(_, value)| *value)
            .collect()
    }

    pub(crate) fn reads_of(&self, offset: u32) -> usize {
        self.state.lock().unwrap().reads.get(&offset).copied().unwrap_or(0)
    }

    pub(crate) fn clear_log(&self) {
        let mut state = self.state.lock().unwrap();
        state.writes.clear();
        state.reads.clear();
    }

    /// Last value written into `offset`
    pub(crate) fn register(&self, offset: u32) -> u32 {
        self.state.lock().unwrap().registers.get(&offset).copied().unwrap_or(0)
    }
}
impl RegisterInterface for FakeHardware {
    fn read32(&self, offset: u32) -> Result<u32, crate::Error> {
        let mut state = self.state.lock().unwrap();
        if !registers::is_valid_offset(offset) || state.failing_reads.contains(&offset) {
            return Err(crate::Error::RegisterAccess { offset });
        }
        *state.reads.entry(offset).or_default() += 1;

        if let Some(buffer_id) = Self::rx_buffer(offset) {
            let ring = state.rx[buffer_id];
            let word = RxBufferControl::encode(
                ring.popped,
                false,
                ring.count == RX_SLOTS,
                ring.count == 0,
                ring.tail,
                ring.head,
                ring.open,
            );
            return Ok(word.raw());
        }
        let value = match offset {
            registers::BUFTX_FULL => state.tx_forced_full as u32,
            registers::BUFTX_EMPTY => !state.tx_forced_full as u32,
            registers::BUFTX_HEAD | registers::BUFTX_TAIL => state.tx_head as u32,
            registers::BUFTX_PUSHED => state.tx_pushed as u32,
            _ => state.registers.get(&offset).copied().unwrap_or(0),
        };
        Ok(value)
    }

    fn write32(&mut self, offset: u32, value: u32) -> Result<(), crate::Error> {
        let mut state = self.state.lock().unwrap();
        if !registers::is_valid_offset(offset) || state.failing_writes.contains(&offset) {
            return Err(crate::Error::RegisterAccess { offset });
        }
        state.writes.push((offset, value));
        state.registers.insert(offset, value);

        if let Some(buffer_id) = Self::rx_buffer(offset) {
            let ring = &mut state.rx[buffer_id];
            ring.open = value & SOCKET_STATE_MASK != 0;
            let popped = value & POPPED_MASK != 0;
            if popped && !ring.popped && ring.count > 0 {
                ring.tail = (ring.tail + 1) % RX_SLOTS;
                ring.count -= 1;
            }
            ring.popped = popped;
        } else if offset == registers::BUFTX_PUSHED {
            // transmitted as soon as it is pushed
            let pushed = value & 1 != 0;
            if pushed && !state.tx_pushed {
                let slot = state.tx_head;
                state.tx_pushed_slots.push(slot);
                state.tx_head = (slot + 1) % TX_SLOTS;
            }
            state.tx_pushed = pushed;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn popped_edge_advances_tail() {
        let memory = ring_memory();
        let mut hardware = FakeHardware::new();
        hardware.set_rx_control_bits(2, SOCKET_STATE_MASK);
        let header = RawPacketHeader::new(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1000),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 7402),
            3,
        );
        assert!(hardware.inject(&memory, 2, header, b"abc"));
        assert_eq!(hardware.pending(2), 1);

        // level writes without an edge do nothing
        hardware.write32(registers::rx_control(2), SOCKET_STATE_MASK).unwrap();
        assert_eq!(hardware.pending(2), 1);

        hardware.write32(registers::rx_control(2), SOCKET_STATE_MASK | POPPED_MASK).unwrap();
        assert_eq!(hardware.pending(2), 0);
        let word = RxBufferControl::from_raw(hardware.read32(registers::rx_control(2)).unwrap());
        assert_eq!(word.tail(), 1);
        assert!(word.empty());
    }

    #[test]
    fn closed_port_refuses_injection() {
        let memory = ring_memory();
        let hardware = FakeHardware::new();
        assert!(!hardware.inject(&memory, 0, RawPacketHeader::default(), &[]));
    }
}
