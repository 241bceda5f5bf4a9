use std::net::Ipv4Addr;

use crate::shmem::MAX_UDP_PORTS;

pub const DEFAULT_LOCAL_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x00];
pub const DEFAULT_GATEWAY_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
pub const DEFAULT_LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 128);
pub const DEFAULT_SUBNET_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
pub const DEFAULT_GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);
pub const DEFAULT_PORT_MIN: u16 = 7400;
pub const DEFAULT_PORT_MAX: u16 = 7500;
/// Same weight as the NAPI default
pub const DEFAULT_BUDGET: usize = 64;

pub const DEFAULT_MEMORY_DEVICE: &str = "/dev/mem";
pub const DEFAULT_WAKE_DEVICE: &str = "/dev/udp-core-irq";
pub const DEFAULT_DEVICE_ADDRESS: u64 = 0xA001_0000;
pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;

/// How the poll-mode driver waits between drain passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakeMode {
    /// Free-run the drain loop
    #[default]
    Spin,
    /// Block on the interrupt timestamp device before every drain pass
    Blocking,
}

/// How received packets are noticed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxMode {
    /// Device interrupts schedule drains, the global interrupt enable is re-armed after a complete drain
    Interrupt,
    /// Device interrupts stay disabled, the caller drives the drain loop
    Poll(WakeMode),
}

/// Runtime configuration of an offload device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub local_mac: [u8; 6],
    pub local_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub gateway_mac: [u8; 6],

    /// First port served by the device
    pub port_min: u16,
    /// One past the last port served by the device
    pub port_max: u16,
    /// Ports opened at bring-up
    pub open_ports: Vec<u16>,

    pub rx_mode: RxMode,
    /// Maximum packets handled by a single drain pass
    pub budget: usize,
}
impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            local_mac: DEFAULT_LOCAL_MAC,
            local_ip: DEFAULT_LOCAL_IP,
            subnet_mask: DEFAULT_SUBNET_MASK,
            gateway_ip: DEFAULT_GATEWAY_IP,
            gateway_mac: DEFAULT_GATEWAY_MAC,
            port_min: DEFAULT_PORT_MIN,
            port_max: DEFAULT_PORT_MAX,
            open_ports: vec![7400, 7401, 7410, 7411],
            rx_mode: RxMode::Interrupt,
            budget: DEFAULT_BUDGET,
        }
    }
}
impl DeviceConfig {
    /// Check the port range and opened ports against the buffer layout
    pub fn validate(&self) -> Result<(), crate::Error> {
        validate_port_range(self.port_min, self.port_max)?;
        if let Some(port) = self.open_ports.iter().find(|port| !(self.port_min..self.port_max).contains(*port)) {
            return Err(crate::Error::PortOutOfRange { port: *port, low: self.port_min, high: self.port_max });
        }
        if self.budget == 0 {
            return Err(crate::Error::Config { reason: "drain budget must be positive".into() });
        }
        if !crate::utils::is_valid_unicast_mac(self.local_mac) {
            return Err(crate::Error::Config { reason: format!("invalid local MAC {}", crate::utils::format_mac(self.local_mac)) });
        }
        Ok(())
    }

    /// Template of the frames synthesized on receive: addressed to us, coming from the gateway
    pub fn frame_template(&self) -> crate::FrameTemplate {
        crate::FrameTemplate {
            destination_mac: self.local_mac,
            source_mac: self.gateway_mac,
            ..Default::default()
        }
    }
}

/// Check that `[port_min, port_max)` fits the available RX buffers
pub fn validate_port_range(port_min: u16, port_max: u16) -> Result<(), crate::Error> {
    if port_max < port_min {
        return Err(crate::Error::Config { reason: format!("port range [{port_min}, {port_max}) is reversed") });
    }
    if (port_max - port_min) as usize >= MAX_UDP_PORTS {
        return Err(crate::Error::PortRangeTooWide { low: port_min, high: port_max });
    }
    Ok(())
}

/// Parse a list of ports separated by commas and/or whitespace, e.g. `"7400,7401 7410"`
pub fn parse_port_list(list: &str) -> Result<Vec<u16>, crate::Error> {
    list.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(|token| token.parse::<u16>()
            .map_err(|_| crate::Error::Config { reason: format!("invalid port {token:?}") }))
        .collect()
}

/// Where the userspace driver finds the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingConfig {
    /// Memory device exposing physical memory
    pub memory_device: std::path::PathBuf,
    /// Physical address of the register file
    pub device_address: u64,
    /// Size of the mapped register page
    pub page_size: usize,
    /// Physical address of the DMA region reserved for the rings, below 4 GiB
    pub shmem_address: Option<u64>,
    /// Character device delivering interrupt timestamps
    pub wake_device: std::path::PathBuf,
}
impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            memory_device: DEFAULT_MEMORY_DEVICE.into(),
            device_address: DEFAULT_DEVICE_ADDRESS,
            page_size: DEFAULT_PAGE_SIZE,
            shmem_address: None,
            wake_device: DEFAULT_WAKE_DEVICE.into(),
        }
    }
}
