use crate::shmem::MAX_UDP_PORTS;

//
// layout
//

/// Distance in bytes between two consecutive registers
///
/// Registers are 64 bits wide, only the low 32 bits carry information.
pub const REGISTER_STRIDE: u32 = 8;

/// Number of fixed control registers preceding the per-port RX control registers
pub const CONTROL_REGISTER_COUNT: u32 = 20;

pub const AP_CTRL: u32 = 0x00;
pub const RESET: u32 = 0x08;
pub const MAC_0: u32 = 0x10;
pub const MAC_1: u32 = 0x18;
pub const GATEWAY: u32 = 0x20;
pub const SUBNET_MASK: u32 = 0x28;
pub const LOCAL_IP: u32 = 0x30;
pub const UDP_RANGE_LOW: u32 = 0x38;
pub const UDP_RANGE_HIGH: u32 = 0x40;
pub const SHMEM: u32 = 0x48;
pub const ISR0: u32 = 0x50;
pub const IER0: u32 = 0x58;
pub const GIE: u32 = 0x60;
pub const BUFTX_HEAD: u32 = 0x68;
pub const BUFTX_TAIL: u32 = 0x70;
pub const BUFTX_EMPTY: u32 = 0x78;
pub const BUFTX_FULL: u32 = 0x80;
pub const BUFTX_PUSHED: u32 = 0x88;
pub const BUFTX_POPPED: u32 = 0x90;
pub const BUFRX_PUSH_IRQ: u32 = 0x98;
pub const BUFRX_BASE: u32 = 0xA0;

/// First offset past the last RX control register
pub const REGISTER_SPACE_END: u32 = rx_control(MAX_UDP_PORTS as u32);

/// Offset of the RX control register of the `buffer_id`-th buffer
pub const fn rx_control(buffer_id: u32) -> u32 {
    BUFRX_BASE + buffer_id * REGISTER_STRIDE
}

/// Whether `offset` addresses a register of the device
pub const fn is_valid_offset(offset: u32) -> bool {
    offset % REGISTER_STRIDE == 0 && offset < REGISTER_SPACE_END
}

/// Names of the fixed control registers, in offset order
pub const REGISTER_NAMES: [(&str, u32); CONTROL_REGISTER_COUNT as usize] = [
    ("AP_CTRL", AP_CTRL),
    ("RESET", RESET),
    ("MAC_0", MAC_0),
    ("MAC_1", MAC_1),
    ("GATEWAY", GATEWAY),
    ("SUBNET_MASK", SUBNET_MASK),
    ("LOCAL_IP", LOCAL_IP),
    ("UDP_RANGE_LOW", UDP_RANGE_LOW),
    ("UDP_RANGE_HIGH", UDP_RANGE_HIGH),
    ("SHMEM", SHMEM),
    ("ISR0", ISR0),
    ("IER0", IER0),
    ("GIE", GIE),
    ("BUFTX_HEAD", BUFTX_HEAD),
    ("BUFTX_TAIL", BUFTX_TAIL),
    ("BUFTX_EMPTY", BUFTX_EMPTY),
    ("BUFTX_FULL", BUFTX_FULL),
    ("BUFTX_PUSHED", BUFTX_PUSHED),
    ("BUFTX_POPPED", BUFTX_POPPED),
    ("BUFRX_PUSH_IRQ", BUFRX_PUSH_IRQ),
];

//
// access
//

/// Typed 32-bit access to the register file
///
/// Implementations are supplied by whatever maps the device (a memory device file, a bus adapter, a test double).
/// Successive writes must reach the hardware in program order.
pub trait RegisterInterface: Send {
    /// Read the register at `offset`
    fn read32(&self, offset: u32) -> Result<u32, crate::Error>;

    /// Write `value` into the register at `offset`
    fn write32(&mut self, offset: u32, value: u32) -> Result<(), crate::Error>;
}

impl<R: RegisterInterface + ?Sized> RegisterInterface for Box<R> {
    fn read32(&self, offset: u32) -> Result<u32, crate::Error> {
        (**self).read32(offset)
    }

    fn write32(&mut self, offset: u32, value: u32) -> Result<(), crate::Error> {
        (**self).write32(offset, value)
    }
}

/// The register page of a device, mapped through a memory device file such as `/dev/mem`
pub struct MappedRegisters {
    // metadata
    page_size: usize,
    page_offset: usize,

    // mapping
    fd: libc::c_int,
    base: std::ptr::NonNull<libc::c_void>,
}
impl MappedRegisters {
    /// Map the page containing `device_address` out of the memory device at `path`
    ///
    /// `page_size` must be a power of two and large enough to hold the whole register space.
    pub fn map(path: impl AsRef<std::path::Path>, device_address: u64, page_size: usize) -> Result<Self, crate::Error> {
        if !page_size.is_power_of_two() {
            return Err(crate::Error::Config { reason: format!("page size {page_size} is not a power of two") });
        }
        let page_base = device_address & !(page_size as u64 - 1);
        let page_offset = (device_address - page_base) as usize;
        if page_offset + REGISTER_SPACE_END as usize > page_size {
            return Err(crate::Error::Config { reason: format!("page size {page_size} cannot hold the register space") });
        }

        // open device
        let fd = crate::utils::open_device(path.as_ref(), libc::O_RDWR | libc::O_SYNC)?;

        // map registers
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                page_base as libc::off_t,
            )
        };
        if base == libc::MAP_FAILED || base.is_null() {
            let error = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(crate::Error::RegisterMapFailure { error });
        }
        tracing::info!(device_address, page_base, page_size, "mapped device registers");

        Ok(Self {
            page_size,
            page_offset,
            fd,
            base: unsafe { std::ptr::NonNull::new_unchecked(base) },
        })
    }

    fn register_ptr(&self, offset: u32) -> Result<*mut u32, crate::Error> {
        if !is_valid_offset(offset) {
            return Err(crate::Error::RegisterAccess { offset });
        }
        Ok(unsafe { self.base.as_ptr().byte_add(self.page_offset + offset as usize).cast() })
    }
}
impl RegisterInterface for MappedRegisters {
    fn read32(&self, offset: u32) -> Result<u32, crate::Error> {
        let ptr = self.register_ptr(offset)?;
        Ok(unsafe { std::ptr::read_volatile(ptr) })
    }

    fn write32(&mut self, offset: u32, value: u32) -> Result<(), crate::Error> {
        let ptr = self.register_ptr(offset)?;
        unsafe { std::ptr::write_volatile(ptr, value) };
        Ok(())
    }
}
impl Drop for MappedRegisters {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr(), self.page_size);
            libc::close(self.fd);
        }
    }
}
unsafe impl Send for MappedRegisters {}
