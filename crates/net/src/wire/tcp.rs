use crate::error::{NetError, Result};
use bitflags::bitflags;

/// Header size without options.
pub const TCP_MIN_HEADER_LEN: usize = 20;

pub const TCP_OPTION_END: u8 = 0;
pub const TCP_OPTION_NOP: u8 = 1;
pub const TCP_OPTION_MSS: u8 = 2;

bitflags! {
    /// TCP control bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in 32-bit words.
    pub data_offset: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
}

impl TcpHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < TCP_MIN_HEADER_LEN {
            return Err(NetError::InvalidLength);
        }
        Ok(Self {
            src_port: u16::from_be_bytes([buf[0], buf[1]]),
            dst_port: u16::from_be_bytes([buf[2], buf[3]]),
            seq: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ack: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            data_offset: buf[12] >> 4,
            flags: TcpFlags::from_bits_truncate(buf[13]),
            window: u16::from_be_bytes([buf[14], buf[15]]),
            checksum: u16::from_be_bytes([buf[16], buf[17]]),
            urgent: u16::from_be_bytes([buf[18], buf[19]]),
        })
    }

    /// Encode the fixed part into `buf[..20]`.
    pub fn emit(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        buf[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        buf[4..8].copy_from_slice(&self.seq.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ack.to_be_bytes());
        buf[12] = self.data_offset << 4;
        buf[13] = self.flags.bits();
        buf[14..16].copy_from_slice(&self.window.to_be_bytes());
        buf[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        buf[18..20].copy_from_slice(&self.urgent.to_be_bytes());
    }

    pub fn header_len(&self) -> usize {
        usize::from(self.data_offset) * 4
    }

    pub fn set_checksum(buf: &mut [u8], checksum: u16) {
        buf[16..18].copy_from_slice(&checksum.to_be_bytes());
    }
}

/// Walk the option area of a segment looking for Maximum Segment Size.
pub fn find_mss_option(options: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            TCP_OPTION_END => break,
            TCP_OPTION_NOP => i += 1,
            kind => {
                let len = usize::from(*options.get(i + 1)?);
                if len < 2 || i + len > options.len() {
                    return None;
                }
                if kind == TCP_OPTION_MSS && len == 4 {
                    return Some(u16::from_be_bytes([options[i + 2], options[i + 3]]));
                }
                i += len;
            }
        }
    }
    None
}

/// Write a 4-byte MSS option into `buf`.
pub fn emit_mss_option(buf: &mut [u8], mss: u16) {
    buf[0] = TCP_OPTION_MSS;
    buf[1] = 4;
    buf[2..4].copy_from_slice(&mss.to_be_bytes());
}

/// Compare sequence numbers modulo 2^32: negative when `a` precedes `b`.
pub fn seq_cmp(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_then_parse() {
        let header = TcpHeader {
            src_port: 4000,
            dst_port: 80,
            seq: 0xDEAD_BEEF,
            ack: 7,
            data_offset: 5,
            flags: TcpFlags::SYN | TcpFlags::ACK,
            window: 2860,
            checksum: 0xABCD,
            urgent: 0,
        };
        let mut buf = [0u8; 20];
        header.emit(&mut buf);
        assert_eq!(TcpHeader::parse(&buf).unwrap(), header);
        assert_eq!(header.header_len(), 20);
    }

    #[test]
    fn reserved_bits_are_ignored() {
        let mut buf = [0u8; 20];
        buf[12] = 0x50;
        buf[13] = 0xC2;
        assert_eq!(TcpHeader::parse(&buf).unwrap().flags, TcpFlags::SYN);
    }

    #[test]
    fn mss_option_found_after_padding() {
        let options = [1, 1, 3, 3, 7, 2, 4, 0x05, 0xB4, 0];
        assert_eq!(find_mss_option(&options), Some(1460));
    }

    #[test]
    fn malformed_options_yield_none() {
        assert_eq!(find_mss_option(&[2]), None);
        assert_eq!(find_mss_option(&[2, 4, 0x05]), None);
        assert_eq!(find_mss_option(&[8, 0, 2, 4, 1, 0]), None);
        assert_eq!(find_mss_option(&[0, 2, 4, 1, 0]), None);
    }

    #[test]
    fn emitted_mss_option_is_found() {
        let mut buf = [0u8; 4];
        emit_mss_option(&mut buf, 1430);
        assert_eq!(find_mss_option(&buf), Some(1430));
    }

    #[test]
    fn sequence_comparison_wraps() {
        assert!(seq_cmp(1, 0) > 0);
        assert!(seq_cmp(0, u32::MAX) > 0);
        assert!(seq_cmp(u32::MAX, 5) < 0);
        assert_eq!(seq_cmp(42, 42), 0);
    }
}
