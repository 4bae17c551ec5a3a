use crate::error::{NetError, Result};

/// Type, code, checksum and the 4-byte type-specific word.
pub const ICMP_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpHeader {
    pub kind: u8,
    pub code: u8,
    pub checksum: u16,
    /// Identifier and sequence number for echo messages, the parameter byte
    /// followed by zeros for error messages.
    pub rest: [u8; 4],
}

impl IcmpHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < ICMP_HEADER_LEN {
            return Err(NetError::InvalidLength);
        }
        Ok(Self {
            kind: buf[0],
            code: buf[1],
            checksum: u16::from_be_bytes([buf[2], buf[3]]),
            rest: [buf[4], buf[5], buf[6], buf[7]],
        })
    }

    pub fn emit(&self, buf: &mut [u8]) {
        buf[0] = self.kind;
        buf[1] = self.code;
        buf[2..4].copy_from_slice(&self.checksum.to_be_bytes());
        buf[4..8].copy_from_slice(&self.rest);
    }

    pub fn set_checksum(buf: &mut [u8], checksum: u16) {
        buf[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_echo_request() {
        let buf = [8, 0, 0xF7, 0xFD, 0x00, 0x01, 0x00, 0x01, b'x'];
        let header = IcmpHeader::parse(&buf).unwrap();
        assert_eq!(header.kind, 8);
        assert_eq!(header.checksum, 0xF7FD);
        assert_eq!(header.rest, [0, 1, 0, 1]);

        let mut out = [0u8; ICMP_HEADER_LEN];
        header.emit(&mut out);
        assert_eq!(&out, &buf[..ICMP_HEADER_LEN]);
        assert!(IcmpHeader::parse(&buf[..7]).is_err());
    }
}
