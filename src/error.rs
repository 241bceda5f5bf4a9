#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error ({reason})")] Config { reason: String },
    #[error("Port {port} is outside the configured range [{low}, {high})")] PortOutOfRange { port: u16, low: u16, high: u16 },
    #[error("Port range [{low}, {high}) is wider than the {max} available buffers", max = crate::shmem::MAX_UDP_PORTS)] PortRangeTooWide { low: u16, high: u16 },
    #[error("Register access failure (offset = {offset:#x})")] RegisterAccess { offset: u32 },
    #[error("Register map failure (error = {error})")] RegisterMapFailure { error: std::io::Error },
    #[error("Memory map failure (error = {error})")] MemoryMapFailure { error: std::io::Error },
    #[error("Shared memory access out of bounds (offset = {offset}, len = {len}, size = {size})")] MemoryOutOfBounds { offset: usize, len: usize, size: usize },
    #[error("Device open failure (path = {path}, error = {error})")] DeviceOpenFailure { path: String, error: std::io::Error },
    #[error("Wake source failure (error = {error})")] WakeFailure { error: std::io::Error },
    #[error("TX ring is full")] Busy,
    #[error("Unsupported packet ({0})")] UnsupportedPacket(#[from] Unsupported),
}

/// Reasons for which the packet codec refuses a frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Unsupported {
    #[error("not IPv4 (ether type = {ether_type:#06x})")] NotIpv4 { ether_type: u16 },
    #[error("not UDP (protocol = {protocol})")] NotUdp { protocol: u8 },
    #[error("destination {address} has no hardware support")] ExcludedDestination { address: std::net::Ipv4Addr },
    #[error("payload of {payload_len} bytes needs fragmentation")] Oversized { payload_len: usize },
    #[error("malformed frame ({reason})")] Malformed { reason: &'static str },
}

impl Error {
    /// Whether this error belongs to the configuration family
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::PortOutOfRange { .. } | Self::PortRangeTooWide { .. })
    }

    /// Whether this error comes from register or memory mapping access
    pub const fn is_io(&self) -> bool {
        matches!(
            self,
            Self::RegisterAccess { .. } | Self::RegisterMapFailure { .. } | Self::MemoryMapFailure { .. }
                | Self::MemoryOutOfBounds { .. } | Self::DeviceOpenFailure { .. } | Self::WakeFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families() {
        assert!(Error::PortOutOfRange { port: 1, low: 2, high: 3 }.is_config());
        assert!(!Error::Busy.is_config());
        assert!(Error::RegisterAccess { offset: 0x08 }.is_io());
        assert!(!Error::from(Unsupported::NotUdp { protocol: 6 }).is_io());
    }

    #[test]
    fn messages() {
        let error = Error::PortRangeTooWide { low: 0, high: 2000 };
        assert_eq!(error.to_string(), "Port range [0, 2000) is wider than the 1024 available buffers");
        let error = Error::from(Unsupported::NotIpv4 { ether_type: 0x86DD });
        assert_eq!(error.to_string(), "Unsupported packet (not IPv4 (ether type = 0x86dd))");
    }
}
