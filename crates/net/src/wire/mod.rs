//! Host-order views of the headers the engine reads and writes.
//!
//! Parsing only decodes fields; length and semantic validation belongs to the
//! layer that owns the header.

mod icmp;
mod ipv4;
mod tcp;
mod udp;

pub use icmp::{ICMP_HEADER_LEN, IcmpHeader};
pub use ipv4::{
    IPV4_FLAG_DF, IPV4_FLAG_MF, IPV4_MIN_HEADER_LEN, IPV4_OFFSET_MASK, IPV4_VERSION, IpProtocol,
    Ipv4Header,
};
pub use tcp::{
    TCP_MIN_HEADER_LEN, TCP_OPTION_END, TCP_OPTION_MSS, TCP_OPTION_NOP, TcpFlags, TcpHeader,
    emit_mss_option, find_mss_option, seq_cmp,
};
pub use udp::{UDP_HEADER_LEN, UdpHeader};
