use crate::packet::RAW_HEADER_SIZE;

//
// layout
//

/// Number of RX rings, i.e. the widest supported port range
pub const MAX_UDP_PORTS: usize = 1024;
/// Slots in every RX ring
pub const RX_SLOTS: usize = 32;
/// Slots in the TX ring
pub const TX_SLOTS: usize = 32;
/// Size in bytes of a single slot
pub const SLOT_SIZE: usize = 2048;
/// Size in bytes of a whole ring
pub const BUFFER_SIZE: usize = RX_SLOTS * SLOT_SIZE;
/// Size in bytes of the whole region (all RX rings plus the TX ring)
pub const TOTAL_SIZE: usize = BUFFER_SIZE * (MAX_UDP_PORTS + 1);
/// Offset of the first RX ring
pub const RX_OFFSET: usize = 0;
/// Offset of the TX ring
pub const TX_OFFSET: usize = RX_OFFSET + MAX_UDP_PORTS * BUFFER_SIZE;

/// Offset of the RX ring of the `buffer_id`-th port
pub const fn rx_buffer_offset(buffer_id: usize) -> usize {
    RX_OFFSET + buffer_id * BUFFER_SIZE
}

/// Offset of the header of slot `slot` in the RX ring of the `buffer_id`-th port
pub const fn rx_slot_offset(buffer_id: usize, slot: usize) -> usize {
    rx_buffer_offset(buffer_id) + slot * SLOT_SIZE
}

/// Offset of the payload of slot `slot` in the RX ring of the `buffer_id`-th port
pub const fn rx_payload_offset(buffer_id: usize, slot: usize) -> usize {
    rx_slot_offset(buffer_id, slot) + RAW_HEADER_SIZE
}

/// Offset of the header of slot `slot` in the TX ring
pub const fn tx_slot_offset(slot: usize) -> usize {
    TX_OFFSET + slot * SLOT_SIZE
}

//
// access
//

/// A memory area reachable by both the CPU and the device
///
/// Laid out as one ring per possible UDP port followed by the TX ring. A slot holds a
/// [`RAW_HEADER_SIZE`] bytes header followed by the payload.
pub trait SharedMemory: Send + Sync {
    /// Size in bytes of the area
    fn size(&self) -> usize;

    /// Address of the area as seen by the device (what goes into the SHMEM register)
    fn device_address(&self) -> u64;

    /// Copy `buffer.len()` bytes starting at `offset` into `buffer`
    fn read_at(&self, offset: usize, buffer: &mut [u8]) -> Result<(), crate::Error>;

    /// Copy `data` into the area starting at `offset`
    fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), crate::Error>;

    /// Make `len` bytes at `offset` written by the CPU visible to the device
    fn sync_for_device(&self, _offset: usize, _len: usize) {}

    /// Make `len` bytes at `offset` written by the device visible to the CPU
    fn sync_for_cpu(&self, _offset: usize, _len: usize) {}
}

/// A shared memory area obtained through `mmap`
pub struct MmapRegion {
    // metadata
    size: usize,
    device_address: u64,

    // memory allocation
    allocation: std::ptr::NonNull<libc::c_void>,
}
impl MmapRegion {
    /// Create a zeroed anonymous region of `size` bytes, advertised to the device as `device_address`
    pub fn anonymous(size: usize, device_address: u64) -> Result<Self, crate::Error> {
        Self::check_device_address(device_address)?;

        // allocate memory, anonymous mappings come zero filled
        let allocation = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0
            )
        };
        if allocation == libc::MAP_FAILED || allocation.is_null() {
            return Err(crate::Error::MemoryMapFailure { error: std::io::Error::last_os_error() });
        }

        Ok(Self {
            size,
            device_address,
            allocation: unsafe { std::ptr::NonNull::new_unchecked(allocation) },
        })
    }

    /// Map `size` bytes of physical memory starting at `physical_address` through the memory device at `path`
    pub fn physical(path: impl AsRef<std::path::Path>, physical_address: u64, size: usize) -> Result<Self, crate::Error> {
        Self::check_device_address(physical_address)?;

        let fd = crate::utils::open_device(path.as_ref(), libc::O_RDWR | libc::O_SYNC)?;
        let allocation = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                physical_address as libc::off_t,
            )
        };
        // the mapping outlives the descriptor
        unsafe { libc::close(fd) };
        if allocation == libc::MAP_FAILED || allocation.is_null() {
            return Err(crate::Error::MemoryMapFailure { error: std::io::Error::last_os_error() });
        }
        tracing::info!(physical_address, size, "mapped shared memory");

        Ok(Self {
            size,
            device_address: physical_address,
            allocation: unsafe { std::ptr::NonNull::new_unchecked(allocation) },
        })
    }

    /// Create an anonymous region sized for the whole ring layout
    pub fn for_rings(device_address: u64) -> Result<Self, crate::Error> {
        Self::anonymous(TOTAL_SIZE, device_address)
    }

    // the SHMEM register is 32 bits wide
    fn check_device_address(device_address: u64) -> Result<(), crate::Error> {
        if device_address > u32::MAX as u64 {
            return Err(crate::Error::Config { reason: format!("device address {device_address:#x} is not 32-bit addressable") });
        }
        Ok(())
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), crate::Error> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(crate::Error::MemoryOutOfBounds { offset, len, size: self.size }),
        }
    }

    /// Obtain a pointer to the mapped area
    ///
    /// # Safety
    /// The device may write into the area at any time, callers must not build references out of this pointer
    pub const unsafe fn memory_ptr(&self) -> *const u8 {
        self.allocation.as_ptr().cast()
    }
}
impl SharedMemory for MmapRegion {
    fn size(&self) -> usize {
        self.size
    }

    fn device_address(&self) -> u64 {
        self.device_address
    }

    fn read_at(&self, offset: usize, buffer: &mut [u8]) -> Result<(), crate::Error> {
        self.check_bounds(offset, buffer.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.memory_ptr().add(offset), buffer.as_mut_ptr(), buffer.len());
        }
        Ok(())
    }

    fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), crate::Error> {
        self.check_bounds(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.memory_ptr().cast_mut().add(offset), data.len());
        }
        Ok(())
    }

    fn sync_for_device(&self, _offset: usize, _len: usize) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
    }

    fn sync_for_cpu(&self, _offset: usize, _len: usize) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
    }
}
impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.allocation.as_ptr(), self.size) };
    }
}
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}
