//! Packet movement engine for the nveth Ethernet controllers.
//!
//! Descriptor rings, their buffer bookkeeping, interrupt/poll driven
//! completion reclaim, transmit segmentation and the NVGRO receive
//! reassembly layer. Register programming, PHY management and the PTP
//! clock live outside this module and are reached through [`hw::DmaEngine`].
//!
//! The protocol helpers below are the minimum the reassembly layer needs to
//! recognise and rewrite IPv4/UDP frames.

pub mod channel;
pub mod config;
pub mod hw;
pub mod napi;
pub mod nvgro;
pub mod ring;
pub mod rx;
pub mod segmenter;
pub mod stats;
pub mod tstamp;
pub mod tx;
pub mod types;
pub mod upstream;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use channel::{EtherContext, EtherDeps, PollOutcome};
pub use config::{EtherConfig, PtpMode, config_from_cmdline};
pub use types::{EtherError, EtherResult};

// =============================================================================
// Ethernet
// =============================================================================

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETH_HEADER_LEN: usize = 14;

// =============================================================================
// IPv4 / UDP
// =============================================================================

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPPROTO_UDP: u8 = 17;
pub const UDP_HEADER_LEN: usize = 8;

/// Addressing and reassembly fields of an Ethernet/IPv4/UDP frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4UdpFrame {
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    pub src_port: u16,
    pub dst_port: u16,
    /// IPv4 identification field.
    pub ip_id: u16,
    pub ttl: u8,
    /// IPv4 header length in bytes.
    pub ihl: usize,
    /// UDP header plus payload, from the UDP length field.
    pub udp_len: usize,
}

impl Ipv4UdpFrame {
    /// Offset of the UDP payload from the start of the frame.
    #[inline]
    pub fn payload_offset(&self) -> usize {
        ETH_HEADER_LEN + self.ihl + UDP_HEADER_LEN
    }

    /// End of the UDP payload; anything after it is link padding.
    #[inline]
    pub fn payload_end(&self) -> usize {
        ETH_HEADER_LEN + self.ihl + self.udp_len
    }
}

/// Parse an untagged Ethernet frame carrying IPv4/UDP.
///
/// Returns `None` for any other ethertype or protocol, or a truncated frame.
pub fn parse_ipv4_udp(frame: &[u8]) -> Option<Ipv4UdpFrame> {
    if frame.len() < ETH_HEADER_LEN + IPV4_HEADER_LEN {
        return None;
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype != ETHERTYPE_IPV4 {
        return None;
    }
    let ip = &frame[ETH_HEADER_LEN..];
    if ip[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((ip[0] & 0x0f) as usize) * 4;
    if ihl < IPV4_HEADER_LEN || ip.len() < ihl + UDP_HEADER_LEN {
        return None;
    }
    if ip[9] != IPPROTO_UDP {
        return None;
    }
    let (src_port, dst_port, payload) = parse_udp_header(&ip[ihl..])?;
    Some(Ipv4UdpFrame {
        src_ip: [ip[12], ip[13], ip[14], ip[15]],
        dst_ip: [ip[16], ip[17], ip[18], ip[19]],
        src_port,
        dst_port,
        ip_id: u16::from_be_bytes([ip[4], ip[5]]),
        ttl: ip[8],
        ihl,
        udp_len: UDP_HEADER_LEN + payload.len(),
    })
}

pub fn parse_udp_header(payload: &[u8]) -> Option<(u16, u16, &[u8])> {
    if payload.len() < UDP_HEADER_LEN {
        return None;
    }

    let src_port = u16::from_be_bytes([payload[0], payload[1]]);
    let dst_port = u16::from_be_bytes([payload[2], payload[3]]);
    let udp_len = u16::from_be_bytes([payload[4], payload[5]]) as usize;

    if udp_len < UDP_HEADER_LEN || udp_len > payload.len() {
        return None;
    }

    Some((src_port, dst_port, &payload[UDP_HEADER_LEN..udp_len]))
}

/// Compute the one's-complement checksum for an IPv4 header.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut i = 0usize;
    while i + 1 < header.len() {
        let word = u16::from_be_bytes([header[i], header[i + 1]]) as u32;
        sum = sum.wrapping_add(word);
        i += 2;
    }

    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}
