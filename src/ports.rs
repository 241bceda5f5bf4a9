use crate::shmem::MAX_UDP_PORTS;

const WORD_BITS: usize = 64;
const WORDS: usize = MAX_UDP_PORTS / WORD_BITS;

/// Open/closed state of the ports served by the device
///
/// A port maps to the RX buffer `port - port_min`, one bit per buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct PortTable {
    port_min: u16,
    port_max: u16,
    storage: [u64; WORDS],
}
impl PortTable {
    /// Create a table for `[port_min, port_max)` with every port closed
    pub fn new(port_min: u16, port_max: u16) -> Result<Self, crate::Error> {
        crate::config::validate_port_range(port_min, port_max)?;
        Ok(Self { port_min, port_max, storage: [0; WORDS] })
    }

    pub const fn port_min(&self) -> u16 {
        self.port_min
    }

    pub const fn port_max(&self) -> u16 {
        self.port_max
    }

    /// The RX buffer serving `port`
    pub fn buffer_id(&self, port: u16) -> Result<usize, crate::Error> {
        if port < self.port_min || port >= self.port_max {
            return Err(crate::Error::PortOutOfRange { port, low: self.port_min, high: self.port_max });
        }
        let buffer_id = (port - self.port_min) as usize;
        debug_assert!(buffer_id < MAX_UDP_PORTS);
        Ok(buffer_id)
    }

    /// The port served by the RX buffer `buffer_id`
    pub fn port_for(&self, buffer_id: usize) -> u16 {
        self.port_min + buffer_id as u16
    }

    const fn locate(buffer_id: usize) -> (usize, u64) {
        (buffer_id / WORD_BITS, 1_u64 << (buffer_id % WORD_BITS))
    }

    /// Mark `port` open, returning its buffer
    #[tracing::instrument(skip(self), level = tracing::Level::TRACE, ret)]
    pub fn mark_open(&mut self, port: u16) -> Result<usize, crate::Error> {
        let buffer_id = self.buffer_id(port)?;
        let (word, mask) = Self::locate(buffer_id);
        self.storage[word] |= mask;
        Ok(buffer_id)
    }

    /// Mark `port` closed, returning its buffer
    #[tracing::instrument(skip(self), level = tracing::Level::TRACE, ret)]
    pub fn mark_closed(&mut self, port: u16) -> Result<usize, crate::Error> {
        let buffer_id = self.buffer_id(port)?;
        let (word, mask) = Self::locate(buffer_id);
        self.storage[word] &= !mask;
        Ok(buffer_id)
    }

    pub fn is_open(&self, port: u16) -> bool {
        match self.buffer_id(port) {
            Ok(buffer_id) => {
                let (word, mask) = Self::locate(buffer_id);
                self.storage[word] & mask != 0
            },
            Err(_) => false,
        }
    }

    /// Opened buffers in ascending order (hence ascending port order)
    pub fn open_buffers(&self) -> impl Iterator<Item = usize> + '_ {
        self.storage.iter()
            .enumerate()
            .flat_map(|(word_index, word)| {
                let word = *word;
                (0..WORD_BITS)
                    .filter(move |bit| word & (1 << bit) != 0)
                    .map(move |bit| word_index * WORD_BITS + bit)
            })
    }

    /// Opened ports in ascending order
    pub fn open_ports(&self) -> Vec<u16> {
        self.open_buffers().map(|buffer_id| self.port_for(buffer_id)).collect()
    }

    pub fn num_open(&self) -> usize {
        self.storage.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Close everything and move to a new range
    pub fn reset(&mut self, port_min: u16, port_max: u16) -> Result<(), crate::Error> {
        crate::config::validate_port_range(port_min, port_max)?;
        self.port_min = port_min;
        self.port_max = port_max;
        self.storage = [0; WORDS];
        Ok(())
    }
}
impl std::fmt::Debug for PortTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortTable")
            .field("range", &(self.port_min..self.port_max))
            .field("open", &self.open_ports())
            .finish()
    }
}
