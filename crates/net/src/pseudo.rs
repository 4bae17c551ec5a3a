//! Pseudo-headers covered by the TCP, UDP and ICMPv6 checksums.

use crate::checksum;
use buddy_core::IpAddress;
use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4PseudoHeader {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub length: u16,
}

impl Ipv4PseudoHeader {
    pub const LEN: usize = 12;

    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, length: u16) -> Self {
        Self {
            src,
            dst,
            protocol,
            length,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..4].copy_from_slice(&self.src.octets());
        buf[4..8].copy_from_slice(&self.dst.octets());
        buf[9] = self.protocol;
        buf[10..12].copy_from_slice(&self.length.to_be_bytes());
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6PseudoHeader {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub length: u32,
    pub next_header: u8,
}

impl Ipv6PseudoHeader {
    pub const LEN: usize = 40;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..16].copy_from_slice(&self.src.octets());
        buf[16..32].copy_from_slice(&self.dst.octets());
        buf[32..36].copy_from_slice(&self.length.to_be_bytes());
        buf[39] = self.next_header;
        buf
    }
}

/// Pseudo-header of either address family, built per send or verify call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoHeader {
    V4(Ipv4PseudoHeader),
    V6(Ipv6PseudoHeader),
}

impl PseudoHeader {
    pub fn src(&self) -> IpAddress {
        match self {
            PseudoHeader::V4(h) => h.src.into(),
            PseudoHeader::V6(h) => h.src.into(),
        }
    }

    pub fn dst(&self) -> IpAddress {
        match self {
            PseudoHeader::V4(h) => h.dst.into(),
            PseudoHeader::V6(h) => h.dst.into(),
        }
    }

    /// Upper-layer checksum over this pseudo-header and a contiguous payload.
    pub fn checksum(&self, data: &[u8]) -> u16 {
        match self {
            PseudoHeader::V4(h) => checksum::upper_layer_checksum(&h.to_bytes(), data),
            PseudoHeader::V6(h) => checksum::upper_layer_checksum(&h.to_bytes(), data),
        }
    }

    /// Upper-layer checksum over this pseudo-header and a scattered payload.
    pub fn checksum_scattered<B: AsRef<[u8]>>(
        &self,
        chunks: &[B],
        offset: usize,
        length: usize,
    ) -> u16 {
        match self {
            PseudoHeader::V4(h) => {
                checksum::upper_layer_checksum_scattered(&h.to_bytes(), chunks, offset, length)
            }
            PseudoHeader::V6(h) => {
                checksum::upper_layer_checksum_scattered(&h.to_bytes(), chunks, offset, length)
            }
        }
    }
}

impl From<Ipv4PseudoHeader> for PseudoHeader {
    fn from(header: Ipv4PseudoHeader) -> Self {
        PseudoHeader::V4(header)
    }
}
