use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::Unsupported;

//
// constants
//

pub const ETH_HEADER_SIZE: usize = 14;
pub const IPV4_HEADER_SIZE: usize = 20;
pub const UDP_HEADER_SIZE: usize = 8;
/// Ethernet + IPv4 + UDP headers as synthesized on receive
pub const FRAME_HEADER_SIZE: usize = ETH_HEADER_SIZE + IPV4_HEADER_SIZE + UDP_HEADER_SIZE;

pub const ETH_MTU: usize = 1500;
/// Largest payload that fits a single unfragmented datagram
pub const MAX_PAYLOAD_SIZE: usize = ETH_MTU - IPV4_HEADER_SIZE - UDP_HEADER_SIZE;

pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const IP_PROTOCOL_UDP: u8 = 17;

const RAW_WORD_SIZE: usize = 8;
const RAW_HEADER_WORDS: usize = 5;
/// Size of the hardware packet header
pub const RAW_HEADER_SIZE: usize = RAW_WORD_SIZE * RAW_HEADER_WORDS;

/// Limited broadcast, used by DHCP
pub const BROADCAST_ADDRESS_WORD: u32 = 0xFFFF_FFFF;
/// mDNS group, as the word loaded from a network-order address field on a little-endian host
pub const MDNS_ADDRESS_WORD: u32 = 0xFB00_00E0;

const EXCLUDED_DESTINATIONS: [u32; 2] = [BROADCAST_ADDRESS_WORD, MDNS_ADDRESS_WORD];

//
// hardware header
//

/// Packet header as produced and consumed by the offload core
///
/// Five 8-byte words in host order. Network order only exists at the frame boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawPacketHeader {
    pub payload_size: u64,
    pub source_ip: u64,
    pub source_port: u64,
    pub dest_ip: u64,
    pub dest_port: u64,
}
impl RawPacketHeader {
    /// Build a header for a datagram of `payload_size` bytes
    pub fn new(source: SocketAddrV4, destination: SocketAddrV4, payload_size: usize) -> Self {
        Self {
            payload_size: payload_size as u64,
            source_ip: u32::from(*source.ip()) as u64,
            source_port: source.port() as u64,
            dest_ip: u32::from(*destination.ip()) as u64,
            dest_port: destination.port() as u64,
        }
    }

    /// Serialize as the 40 bytes written into a slot
    pub fn to_bytes(&self) -> [u8; RAW_HEADER_SIZE] {
        let mut bytes = [0_u8; RAW_HEADER_SIZE];
        let words = [self.payload_size, self.source_ip, self.source_port, self.dest_ip, self.dest_port];
        for (chunk, word) in bytes.chunks_exact_mut(RAW_WORD_SIZE).zip(words) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        bytes
    }

    /// Deserialize the 40 bytes read out of a slot
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Unsupported> {
        if bytes.len() < RAW_HEADER_SIZE {
            return Err(Unsupported::Malformed { reason: "truncated hardware header" });
        }
        let mut words = [0_u64; RAW_HEADER_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(RAW_WORD_SIZE)) {
            let mut raw = [0_u8; RAW_WORD_SIZE];
            raw.copy_from_slice(chunk);
            *word = u64::from_ne_bytes(raw);
        }
        let [payload_size, source_ip, source_port, dest_ip, dest_port] = words;
        Ok(Self { payload_size, source_ip, source_port, dest_ip, dest_port })
    }

    pub fn source(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.source_ip as u32), self.source_port as u16)
    }

    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.dest_ip as u32), self.dest_port as u16)
    }
}

/// A header ready for the TX ring, along with the payload still living inside the originating frame
#[derive(Debug, Clone, Copy)]
pub struct Composed<'a> {
    pub header: RawPacketHeader,
    pub payload: &'a [u8],
}

//
// compose
//

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn is_excluded_destination(address: [u8; 4]) -> bool {
    // matched against the address word as loaded from the frame
    let wire_word = u32::from_ne_bytes(address);
    EXCLUDED_DESTINATIONS.contains(&wire_word)
}

/// Extract a hardware header out of an Ethernet frame carrying UDP over IPv4
///
/// The payload is not copied, the returned slice borrows from `frame`.
pub fn compose(frame: &[u8]) -> Result<Composed<'_>, Unsupported> {
    // ethernet
    if frame.len() < ETH_HEADER_SIZE {
        return Err(Unsupported::Malformed { reason: "truncated ethernet header" });
    }
    let ether_type = read_u16(frame, 12);
    if ether_type != ETHER_TYPE_IPV4 {
        return Err(Unsupported::NotIpv4 { ether_type });
    }

    // ipv4
    let ip = &frame[ETH_HEADER_SIZE..];
    if ip.len() < IPV4_HEADER_SIZE {
        return Err(Unsupported::Malformed { reason: "truncated IPv4 header" });
    }
    if ip[0] >> 4 != 4 {
        return Err(Unsupported::NotIpv4 { ether_type });
    }
    let ihl = (ip[0] & 0x0F) as usize * 4;
    if ihl < IPV4_HEADER_SIZE || ip.len() < ihl {
        return Err(Unsupported::Malformed { reason: "bad IPv4 header length" });
    }
    let protocol = ip[9];
    if protocol != IP_PROTOCOL_UDP {
        return Err(Unsupported::NotUdp { protocol });
    }
    let source_address = [ip[12], ip[13], ip[14], ip[15]];
    let dest_address = [ip[16], ip[17], ip[18], ip[19]];
    if is_excluded_destination(dest_address) {
        return Err(Unsupported::ExcludedDestination { address: Ipv4Addr::from(dest_address) });
    }

    // udp
    let udp = &ip[ihl..];
    if udp.len() < UDP_HEADER_SIZE {
        return Err(Unsupported::Malformed { reason: "truncated UDP header" });
    }
    let udp_len = read_u16(udp, 4) as usize;
    if udp_len < UDP_HEADER_SIZE {
        return Err(Unsupported::Malformed { reason: "bad UDP length" });
    }
    let payload_len = udp_len - UDP_HEADER_SIZE;
    if payload_len > MAX_PAYLOAD_SIZE {
        tracing::warn!(payload_len, "datagram needs fragmentation");
        return Err(Unsupported::Oversized { payload_len });
    }
    if udp.len() < udp_len {
        return Err(Unsupported::Malformed { reason: "truncated UDP payload" });
    }

    Ok(Composed {
        header: RawPacketHeader {
            payload_size: payload_len as u64,
            source_ip: u32::from_be_bytes(source_address) as u64,
            source_port: read_u16(udp, 0) as u64,
            dest_ip: u32::from_be_bytes(dest_address) as u64,
            dest_port: read_u16(udp, 2) as u64,
        },
        payload: &udp[UDP_HEADER_SIZE..udp_len],
    })
}

//
// decompose
//

/// Whether the consumer should verify the transport checksum of a received frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumStatus {
    /// The core already validated the datagram, the UDP checksum field is left at zero
    Unnecessary,
}

/// Fixed fields of the frames synthesized on receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTemplate {
    pub destination_mac: [u8; 6],
    pub source_mac: [u8; 6],
    pub identification: u16,
    pub ttl: u8,
}
impl Default for FrameTemplate {
    fn default() -> Self {
        Self {
            destination_mac: crate::config::DEFAULT_LOCAL_MAC,
            source_mac: crate::config::DEFAULT_GATEWAY_MAC,
            identification: 1,
            ttl: 64,
        }
    }
}

/// A full Ethernet/IPv4/UDP frame rebuilt out of an RX slot
///
/// Only built by [`decompose_with`], so the headers are always complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxFrame {
    data: Vec<u8>,
    checksum: ChecksumStatus,
}
impl RxFrame {
    /// The whole frame, starting at the Ethernet header
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub const fn checksum(&self) -> ChecksumStatus {
        self.checksum
    }

    pub fn ip_header(&self) -> &[u8] {
        &self.data[ETH_HEADER_SIZE..ETH_HEADER_SIZE + IPV4_HEADER_SIZE]
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[FRAME_HEADER_SIZE..]
    }

    pub fn source(&self) -> SocketAddrV4 {
        let ip = self.ip_header();
        let udp = &self.data[ETH_HEADER_SIZE + IPV4_HEADER_SIZE..];
        SocketAddrV4::new(Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]), read_u16(udp, 0))
    }

    pub fn destination(&self) -> SocketAddrV4 {
        let ip = self.ip_header();
        let udp = &self.data[ETH_HEADER_SIZE + IPV4_HEADER_SIZE..];
        SocketAddrV4::new(Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]), read_u16(udp, 2))
    }
}

/// Rebuild a frame with the default template
pub fn decompose(header: &RawPacketHeader, payload: &[u8]) -> RxFrame {
    decompose_with(&FrameTemplate::default(), header, payload)
}

/// Rebuild a frame out of a hardware header and its payload
///
/// The IPv4 checksum is computed here since the core strips it on receive.
pub fn decompose_with(template: &FrameTemplate, header: &RawPacketHeader, payload: &[u8]) -> RxFrame {
    let mut data = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());

    // ethernet
    data.extend_from_slice(&template.destination_mac);
    data.extend_from_slice(&template.source_mac);
    data.extend_from_slice(&ETHER_TYPE_IPV4.to_be_bytes());

    // ipv4
    let total_len = (IPV4_HEADER_SIZE + UDP_HEADER_SIZE + payload.len()) as u16;
    let ip_start = data.len();
    data.extend_from_slice(&[0x45, 0x00]);
    data.extend_from_slice(&total_len.to_be_bytes());
    data.extend_from_slice(&template.identification.to_be_bytes());
    data.extend_from_slice(&[0x00, 0x00, template.ttl, IP_PROTOCOL_UDP, 0x00, 0x00]);
    data.extend_from_slice(&(header.source_ip as u32).to_be_bytes());
    data.extend_from_slice(&(header.dest_ip as u32).to_be_bytes());
    let checksum = ipv4_checksum(&data[ip_start..ip_start + IPV4_HEADER_SIZE]);
    data[ip_start + 10..ip_start + 12].copy_from_slice(&checksum.to_be_bytes());

    // udp
    data.extend_from_slice(&(header.source_port as u16).to_be_bytes());
    data.extend_from_slice(&(header.dest_port as u16).to_be_bytes());
    data.extend_from_slice(&((UDP_HEADER_SIZE + payload.len()) as u16).to_be_bytes());
    data.extend_from_slice(&[0x00, 0x00]);
    data.extend_from_slice(payload);

    RxFrame { data, checksum: ChecksumStatus::Unnecessary }
}

/// Internet checksum (RFC 1071) over `header`
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum = header.chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], *pair.get(1).unwrap_or(&0)]) as u32)
        .fold(0_u32, |acc, word| acc.wrapping_add(word));
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
