use crate::checksum;
use crate::error::{NetError, Result};
use std::net::Ipv4Addr;

pub const IPV4_VERSION: u8 = 4;

/// Header size without options.
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// Don't Fragment flag in the flags/fragment-offset field.
pub const IPV4_FLAG_DF: u16 = 0x4000;
/// More Fragments flag in the flags/fragment-offset field.
pub const IPV4_FLAG_MF: u16 = 0x2000;
/// Fragment offset, in units of 8 bytes.
pub const IPV4_OFFSET_MASK: u16 = 0x1FFF;

const TOTAL_LENGTH: usize = 2;
const FRAGMENT: usize = 6;
const CHECKSUM: usize = 10;

/// Protocol numbers the demultiplexer knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    Icmp,
    Igmp,
    Tcp,
    Udp,
    Other(u8),
}

impl From<u8> for IpProtocol {
    fn from(value: u8) -> Self {
        match value {
            1 => IpProtocol::Icmp,
            2 => IpProtocol::Igmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            other => IpProtocol::Other(other),
        }
    }
}

impl From<IpProtocol> for u8 {
    fn from(value: IpProtocol) -> Self {
        match value {
            IpProtocol::Icmp => 1,
            IpProtocol::Igmp => 2,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// Header length in 32-bit words.
    pub ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    /// Flags and fragment offset, as on the wire.
    pub fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Decode the fixed part of a header.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < IPV4_MIN_HEADER_LEN {
            return Err(NetError::InvalidLength);
        }
        Ok(Self {
            version: buf[0] >> 4,
            ihl: buf[0] & 0x0F,
            tos: buf[1],
            total_length: u16::from_be_bytes([buf[2], buf[3]]),
            identification: u16::from_be_bytes([buf[4], buf[5]]),
            fragment: u16::from_be_bytes([buf[6], buf[7]]),
            ttl: buf[8],
            protocol: buf[9],
            checksum: u16::from_be_bytes([buf[10], buf[11]]),
            src: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
            dst: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
        })
    }

    /// Encode the fixed part into `buf[..20]`, checksum field included as is.
    pub fn emit(&self, buf: &mut [u8]) {
        buf[0] = (self.version << 4) | (self.ihl & 0x0F);
        buf[1] = self.tos;
        buf[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        buf[4..6].copy_from_slice(&self.identification.to_be_bytes());
        buf[6..8].copy_from_slice(&self.fragment.to_be_bytes());
        buf[8] = self.ttl;
        buf[9] = self.protocol;
        buf[10..12].copy_from_slice(&self.checksum.to_be_bytes());
        buf[12..16].copy_from_slice(&self.src.octets());
        buf[16..20].copy_from_slice(&self.dst.octets());
    }

    pub fn header_len(&self) -> usize {
        usize::from(self.ihl) * 4
    }

    pub fn more_fragments(&self) -> bool {
        self.fragment & IPV4_FLAG_MF != 0
    }

    /// Fragment offset in 8-byte units.
    pub fn fragment_offset(&self) -> u16 {
        self.fragment & IPV4_OFFSET_MASK
    }

    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }

    pub fn protocol(&self) -> IpProtocol {
        self.protocol.into()
    }

    /// Rewrite total length in an encoded header.
    pub fn set_total_length(buf: &mut [u8], length: u16) {
        buf[TOTAL_LENGTH..TOTAL_LENGTH + 2].copy_from_slice(&length.to_be_bytes());
    }

    /// Rewrite the flags/fragment-offset field in an encoded header.
    pub fn set_fragment(buf: &mut [u8], fragment: u16) {
        buf[FRAGMENT..FRAGMENT + 2].copy_from_slice(&fragment.to_be_bytes());
    }

    /// Recompute the header checksum of the first `header_len` bytes.
    pub fn fill_checksum(buf: &mut [u8], header_len: usize) {
        buf[CHECKSUM..CHECKSUM + 2].copy_from_slice(&[0, 0]);
        let sum = checksum::checksum(&buf[..header_len]);
        buf[CHECKSUM..CHECKSUM + 2].copy_from_slice(&sum.to_be_bytes());
    }

    /// Zero the checksum field without recomputing it.
    pub fn clear_checksum(buf: &mut [u8]) {
        buf[CHECKSUM..CHECKSUM + 2].copy_from_slice(&[0, 0]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::{IpProtocol as SmolProtocol, Ipv4Packet};

    fn header() -> Ipv4Header {
        Ipv4Header {
            version: IPV4_VERSION,
            ihl: 5,
            tos: 0,
            total_length: 48,
            identification: 0x1234,
            fragment: IPV4_FLAG_MF | 3,
            ttl: 64,
            protocol: 6,
            checksum: 0,
            src: Ipv4Addr::new(192, 0, 2, 50),
            dst: Ipv4Addr::new(192, 0, 2, 1),
        }
    }

    #[test]
    fn emit_then_parse() {
        let mut buf = [0u8; 20];
        header().emit(&mut buf);
        let parsed = Ipv4Header::parse(&buf).unwrap();
        assert_eq!(parsed, header());
        assert!(parsed.more_fragments());
        assert_eq!(parsed.fragment_offset(), 3);
        assert!(parsed.is_fragment());
        assert_eq!(parsed.protocol(), IpProtocol::Tcp);
    }

    #[test]
    fn short_buffer_is_invalid_length() {
        assert!(matches!(
            Ipv4Header::parse(&[0x45; 19]),
            Err(NetError::InvalidLength)
        ));
    }

    #[test]
    fn filled_checksum_verifies_with_smoltcp() {
        let mut buf = vec![0u8; 48];
        header().emit(&mut buf);
        Ipv4Header::fill_checksum(&mut buf, 20);
        assert_eq!(checksum::checksum(&buf[..20]), 0);

        let packet = Ipv4Packet::new_checked(&buf[..]).unwrap();
        assert!(packet.verify_checksum());
        assert_eq!(packet.next_header(), SmolProtocol::Tcp);
        assert_eq!(packet.ident(), 0x1234);
        assert!(packet.more_frags());
    }

    #[test]
    fn protocol_numbers() {
        for value in [1u8, 2, 6, 17, 89] {
            assert_eq!(u8::from(IpProtocol::from(value)), value);
        }
        assert_eq!(IpProtocol::from(89), IpProtocol::Other(89));
    }

    #[test]
    fn field_rewrites() {
        let mut buf = [0u8; 20];
        header().emit(&mut buf);
        Ipv4Header::set_total_length(&mut buf, 1500);
        Ipv4Header::set_fragment(&mut buf, 0);
        let parsed = Ipv4Header::parse(&buf).unwrap();
        assert_eq!(parsed.total_length, 1500);
        assert!(!parsed.is_fragment());
    }
}
