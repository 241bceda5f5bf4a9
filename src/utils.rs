use std::net::Ipv4Addr;

pub(crate) fn open_device(path: &std::path::Path, flags: libc::c_int) -> Result<libc::c_int, crate::Error> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| crate::Error::Config { reason: format!("device path {} contains a nul byte", path.display()) })?;
    let fd = unsafe { libc::open(c_path.as_ptr(), flags) };
    if fd < 0 {
        return Err(crate::Error::DeviceOpenFailure { path: path.display().to_string(), error: std::io::Error::last_os_error() });
    }
    Ok(fd)
}

pub(crate) fn read_device(fd: libc::c_int, buffer: &mut [u8]) -> Result<usize, std::io::Error> {
    let result = unsafe { libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len()) };
    if result < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(result as usize)
    }
}

/// Converts an IPv4 address into the host-order word expected by the device registers
///
/// `192.168.1.100` becomes `0xC0A80164`
pub fn ipv4_to_register(address: Ipv4Addr) -> u32 {
    u32::from(address)
}

/// Converts a host-order register word back into an IPv4 address
pub fn register_to_ipv4(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value)
}

/// Splits a MAC address into the `(high, low)` register pair
///
/// The high register holds the first two octets, zero padded, the low register the remaining four.
pub fn mac_to_registers(mac: [u8; 6]) -> (u32, u32) {
    let high = u32::from_be_bytes([0, 0, mac[0], mac[1]]);
    let low = u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]]);
    (high, low)
}

/// Whether `mac` can be assigned to the device (unicast and not all zeroes)
pub fn is_valid_unicast_mac(mac: [u8; 6]) -> bool {
    mac[0] & 0x01 == 0 && mac != [0; 6]
}

/// Formats a MAC address as `xx:xx:xx:xx:xx:xx`
pub fn format_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|octet| format!("{octet:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
