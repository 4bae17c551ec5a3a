//! Observational counters. Owned by the network task, so plain integers.

use crate::error::NetError;

/// Per-interface IPv4 counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpStats {
    pub in_receives: u64,
    pub in_hdr_errors: u64,
    pub in_addr_errors: u64,
    pub in_truncated_pkts: u64,
    pub in_unknown_protos: u64,
    pub in_discards: u64,
    pub in_delivers: u64,
    pub out_requests: u64,
    pub out_no_routes: u64,
    pub out_discards: u64,
    pub reasm_reqds: u64,
    pub reasm_oks: u64,
    pub reasm_fails: u64,
    pub frag_oks: u64,
    pub frag_fails: u64,
    pub frag_creates: u64,
}

impl IpStats {
    /// Count an inbound packet dropped by the admission pipeline or the
    /// demultiplexer, keyed by the error that rejected it.
    pub fn record_drop(&mut self, err: &NetError) {
        match err {
            NetError::InvalidHeader => self.in_hdr_errors += 1,
            NetError::InvalidAddress => self.in_addr_errors += 1,
            NetError::ProtocolUnreachable => self.in_unknown_protos += 1,
            NetError::InvalidLength => self.in_truncated_pkts += 1,
            _ => self.in_discards += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpStats {
    pub active_opens: u64,
    pub passive_opens: u64,
    pub attempt_fails: u64,
    pub estab_resets: u64,
    pub in_segs: u64,
    pub out_segs: u64,
    pub retrans_segs: u64,
    pub in_errs: u64,
    pub out_rsts: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UdpStats {
    pub in_datagrams: u64,
    pub no_ports: u64,
    pub in_errors: u64,
    pub out_datagrams: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IcmpStats {
    pub in_msgs: u64,
    pub in_errors: u64,
    pub out_msgs: u64,
    pub out_dest_unreachs: u64,
    pub out_time_excds: u64,
    pub out_echo_reps: u64,
}

/// Copy of every counter, taken on request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetStats {
    /// Interface name and its IP counters, in interface order.
    pub interfaces: Vec<(String, IpStats)>,
    pub tcp: TcpStats,
    pub udp: UdpStats,
    pub icmp: IcmpStats,
}
