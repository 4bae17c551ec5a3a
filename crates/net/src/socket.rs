//! Fixed-size connection table and the inbound lookups over it.

use crate::error::{NetError, Result};
use crate::tcp::{TcpControlBlock, TcpState};

use buddy_core::{IpAddress, SocketConfig, TcpConfig};

use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;

/// Index of a record in the socket table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(usize);

impl SocketId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketType {
    #[default]
    Unused,
    Stream,
    Dgram,
    Raw,
}

/// A datagram queued on a UDP or raw socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub src: Ipv4Addr,
    /// Zero for raw sockets.
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub ttl: u8,
    pub data: Vec<u8>,
}

/// One connection record.
#[derive(Debug, Default)]
pub struct Socket {
    pub(crate) kind: SocketType,
    /// IP protocol number for raw sockets.
    pub(crate) protocol: u8,
    /// Interface the socket is bound to, if any.
    pub(crate) interface: Option<usize>,
    pub(crate) local_addr: IpAddress,
    pub(crate) local_port: u16,
    pub(crate) remote_addr: IpAddress,
    pub(crate) remote_port: u16,
    /// 0 selects the interface default.
    pub(crate) ttl: u8,
    pub(crate) tcp: TcpControlBlock,
    pub(crate) rx_queue: VecDeque<Datagram>,
    pub(crate) rx_queue_len: usize,
}

impl Socket {
    fn open(kind: SocketType, protocol: u8, tcp: &TcpConfig, rx_queue_len: usize) -> Self {
        Self {
            kind,
            protocol,
            tcp: TcpControlBlock::new(tcp),
            rx_queue_len,
            ..Default::default()
        }
    }

    pub fn kind(&self) -> SocketType {
        self.kind
    }

    pub fn is_unused(&self) -> bool {
        self.kind == SocketType::Unused
    }

    pub fn local(&self) -> (IpAddress, u16) {
        (self.local_addr, self.local_port)
    }

    pub fn remote(&self) -> (IpAddress, u16) {
        (self.remote_addr, self.remote_port)
    }

    pub fn tcp(&self) -> &TcpControlBlock {
        &self.tcp
    }

    /// Release the record back to the table.
    pub(crate) fn release(&mut self) {
        *self = Socket::default();
    }

    /// Queue an inbound datagram, dropping it when the queue is full.
    pub(crate) fn enqueue(&mut self, datagram: Datagram) -> bool {
        if self.rx_queue.len() >= self.rx_queue_len {
            return false;
        }
        self.rx_queue.push_back(datagram);
        true
    }

    fn matches_interface(&self, iface: usize) -> bool {
        self.interface.is_none_or(|bound| bound == iface)
    }
}

pub struct SocketTable {
    sockets: Box<[Socket]>,
    config: SocketConfig,
}

impl SocketTable {
    pub fn new(config: &SocketConfig) -> Self {
        Self {
            sockets: (0..config.max_sockets).map(|_| Socket::default()).collect(),
            config: config.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.sockets.len()
    }

    pub fn in_use(&self) -> usize {
        self.sockets.iter().filter(|s| !s.is_unused()).count()
    }

    pub fn get(&self, id: SocketId) -> Result<&Socket> {
        self.sockets
            .get(id.0)
            .filter(|s| !s.is_unused())
            .ok_or(NetError::InvalidSocket)
    }

    pub fn get_mut(&mut self, id: SocketId) -> Result<&mut Socket> {
        self.sockets
            .get_mut(id.0)
            .filter(|s| !s.is_unused())
            .ok_or(NetError::InvalidSocket)
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut Socket {
        &mut self.sockets[index]
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Socket> {
        self.sockets.iter_mut()
    }

    /// Claim a free record. Stream sockets may evict the oldest connection
    /// lingering in TIME-WAIT when the table is full.
    pub fn allocate(&mut self, kind: SocketType, protocol: u8, tcp: &TcpConfig) -> Result<SocketId> {
        let index = match self.sockets.iter().position(Socket::is_unused) {
            Some(index) => index,
            None if kind == SocketType::Stream => {
                self.kill_oldest_connection().ok_or(NetError::OutOfResources)?
            }
            None => {
                tracing::debug!("socket table full ({} records)", self.sockets.len());
                return Err(NetError::OutOfResources);
            }
        };

        self.sockets[index] = Socket::open(kind, protocol, tcp, self.config.rx_queue_len);
        Ok(SocketId(index))
    }

    /// Close the TIME-WAIT connection that entered the state first and free
    /// its record. Returns the freed index.
    pub fn kill_oldest_connection(&mut self) -> Option<usize> {
        let index = self
            .sockets
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind == SocketType::Stream && s.tcp.state == TcpState::TimeWait)
            .filter_map(|(i, s)| s.tcp.time_wait_timer.started_at().map(|t| (i, t)))
            .min_by_key(|&(_, started)| started)
            .map(|(i, _)| i)?;

        tracing::debug!(
            "evicting TIME-WAIT connection {} to free a socket",
            SocketId(index)
        );
        let socket = &mut self.sockets[index];
        socket.tcp.change_state(TcpState::Closed);
        socket.release();
        Some(index)
    }

    /// Pick an unused local port from the ephemeral range: random start,
    /// then sequential with wrap-around.
    pub fn dynamic_port(&self, kind: SocketType) -> Result<u16> {
        let min = self.config.ephemeral_port_min;
        let max = self.config.ephemeral_port_max;
        let span = u32::from(max - min) + 1;
        let start = rand::random::<u32>() % span;

        (0..span)
            .map(|i| min + ((start + i) % span) as u16)
            .find(|&port| {
                !self
                    .sockets
                    .iter()
                    .any(|s| s.kind == kind && s.local_port == port)
            })
            .ok_or(NetError::OutOfResources)
    }

    /// Route an inbound TCP segment to its connection.
    ///
    /// An entry matching the full 4-tuple wins outright; otherwise the first
    /// LISTEN entry matching addresses and local port is used.
    pub fn find_tcp(
        &self,
        iface: usize,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
    ) -> Option<usize> {
        let mut listener = None;
        for (i, socket) in self.sockets.iter().enumerate() {
            if socket.kind != SocketType::Stream || !socket.matches_interface(iface) {
                continue;
            }
            if socket.local_port == 0 || socket.local_port != dst_port {
                continue;
            }
            if !socket.local_addr.matches_v4(dst) || !socket.remote_addr.matches_v4(src) {
                continue;
            }
            if socket.tcp.state == TcpState::Listen && listener.is_none() {
                listener = Some(i);
            }
            if socket.remote_port == src_port {
                return Some(i);
            }
        }
        listener
    }

    /// Route an inbound UDP datagram. Address filters left unspecified and a
    /// zero remote port act as wildcards.
    pub fn find_udp(
        &self,
        iface: usize,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
    ) -> Option<usize> {
        self.sockets.iter().position(|socket| {
            socket.kind == SocketType::Dgram
                && socket.matches_interface(iface)
                && socket.local_port != 0
                && socket.local_port == dst_port
                && socket.local_addr.matches_v4(dst)
                && socket.remote_addr.matches_v4(src)
                && (socket.remote_port == 0 || socket.remote_port == src_port)
        })
    }

    /// Every raw socket opened for `protocol` that accepts the datagram.
    pub(crate) fn find_raw(
        &self,
        iface: usize,
        protocol: u8,
        src: Ipv4Addr,
        dst: Ipv4Addr,
    ) -> Vec<usize> {
        self.sockets
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.kind == SocketType::Raw
                    && s.protocol == protocol
                    && s.matches_interface(iface)
                    && s.local_addr.matches_v4(dst)
                    && s.remote_addr.matches_v4(src)
            })
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const PEER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 50);

    fn table(max: usize) -> SocketTable {
        SocketTable::new(&SocketConfig {
            max_sockets: max,
            ..Default::default()
        })
    }

    fn stream(table: &mut SocketTable, port: u16, state: TcpState) -> SocketId {
        let id = table
            .allocate(SocketType::Stream, 6, &TcpConfig::default())
            .unwrap();
        let socket = table.get_mut(id).unwrap();
        socket.local_port = port;
        socket.tcp.state = state;
        id
    }

    #[test]
    fn exact_match_beats_listener() {
        let mut table = table(4);
        let listener = stream(&mut table, 80, TcpState::Listen);
        let conn = stream(&mut table, 80, TcpState::Established);
        {
            let socket = table.get_mut(conn).unwrap();
            socket.remote_addr = PEER.into();
            socket.remote_port = 4000;
        }

        assert_eq!(table.find_tcp(0, PEER, LOCAL, 4000, 80), Some(conn.index()));
        assert_eq!(
            table.find_tcp(0, PEER, LOCAL, 4001, 80),
            Some(listener.index())
        );
        assert_eq!(table.find_tcp(0, PEER, LOCAL, 4000, 81), None);
    }

    #[test]
    fn first_listener_is_the_fallback() {
        let mut table = table(4);
        let first = stream(&mut table, 80, TcpState::Listen);
        let _second = stream(&mut table, 80, TcpState::Listen);
        assert_eq!(table.find_tcp(0, PEER, LOCAL, 1234, 80), Some(first.index()));
    }

    #[test]
    fn address_and_interface_filters() {
        let mut table = table(4);
        let id = stream(&mut table, 80, TcpState::Listen);
        {
            let socket = table.get_mut(id).unwrap();
            socket.local_addr = Ipv4Addr::new(192, 0, 2, 9).into();
        }
        assert_eq!(table.find_tcp(0, PEER, LOCAL, 1234, 80), None);

        let socket = table.get_mut(id).unwrap();
        socket.local_addr = LOCAL.into();
        socket.interface = Some(1);
        assert_eq!(table.find_tcp(0, PEER, LOCAL, 1234, 80), None);
        assert_eq!(table.find_tcp(1, PEER, LOCAL, 1234, 80), Some(id.index()));
    }

    #[test]
    fn port_zero_never_matches() {
        let mut table = table(2);
        stream(&mut table, 0, TcpState::Listen);
        assert_eq!(table.find_tcp(0, PEER, LOCAL, 1234, 0), None);
    }

    #[test]
    fn udp_lookup_has_no_listen_fallback() {
        let mut table = table(4);
        let id = table
            .allocate(SocketType::Dgram, 17, &TcpConfig::default())
            .unwrap();
        {
            let socket = table.get_mut(id).unwrap();
            socket.local_port = 53;
            socket.remote_port = 5353;
        }
        assert_eq!(table.find_udp(0, PEER, LOCAL, 5353, 53), Some(id.index()));
        assert_eq!(table.find_udp(0, PEER, LOCAL, 9999, 53), None);

        table.get_mut(id).unwrap().remote_port = 0;
        assert_eq!(table.find_udp(0, PEER, LOCAL, 9999, 53), Some(id.index()));
    }

    #[test]
    fn full_table_evicts_oldest_time_wait() {
        let mut table = table(3);
        let now = Instant::now();
        let a = stream(&mut table, 1000, TcpState::TimeWait);
        let b = stream(&mut table, 1001, TcpState::TimeWait);
        let _c = stream(&mut table, 1002, TcpState::Established);
        table
            .get_mut(a)
            .unwrap()
            .tcp
            .time_wait_timer
            .start(now + Duration::from_millis(5), Duration::from_secs(4));
        table
            .get_mut(b)
            .unwrap()
            .tcp
            .time_wait_timer
            .start(now, Duration::from_secs(4));

        let id = table
            .allocate(SocketType::Stream, 6, &TcpConfig::default())
            .unwrap();
        assert_eq!(id, b);
        assert_eq!(table.get(id).unwrap().tcp.state, TcpState::Closed);
        assert_eq!(table.get(a).unwrap().tcp.state, TcpState::TimeWait);
    }

    #[test]
    fn full_table_without_time_wait_is_out_of_resources() {
        let mut table = table(1);
        stream(&mut table, 1000, TcpState::Established);
        assert!(matches!(
            table.allocate(SocketType::Stream, 6, &TcpConfig::default()),
            Err(NetError::OutOfResources)
        ));
        assert!(matches!(
            table.allocate(SocketType::Dgram, 17, &TcpConfig::default()),
            Err(NetError::OutOfResources)
        ));
    }

    #[test]
    fn dynamic_ports_skip_used_ones() {
        let mut table = SocketTable::new(&SocketConfig {
            max_sockets: 4,
            ephemeral_port_min: 50000,
            ephemeral_port_max: 50001,
            ..Default::default()
        });
        stream(&mut table, 50000, TcpState::Established);
        for _ in 0..8 {
            assert_eq!(table.dynamic_port(SocketType::Stream).unwrap(), 50001);
        }
        stream(&mut table, 50001, TcpState::Established);
        assert!(table.dynamic_port(SocketType::Stream).is_err());
        assert!(table.dynamic_port(SocketType::Dgram).is_ok());
    }

    #[test]
    fn released_records_are_invalid() {
        let mut table = table(2);
        let id = stream(&mut table, 80, TcpState::Closed);
        table.get_mut(id).unwrap().release();
        assert!(matches!(table.get(id), Err(NetError::InvalidSocket)));
        assert!(matches!(
            table.get(SocketId::new(7)),
            Err(NetError::InvalidSocket)
        ));
    }

    #[test]
    fn datagram_queue_is_bounded() {
        let mut table = table(1);
        let id = table
            .allocate(SocketType::Dgram, 17, &TcpConfig::default())
            .unwrap();
        let socket = table.get_mut(id).unwrap();
        let datagram = Datagram {
            src: PEER,
            src_port: 1,
            dst: LOCAL,
            ttl: 64,
            data: vec![1],
        };
        for _ in 0..4 {
            assert!(socket.enqueue(datagram.clone()));
        }
        assert!(!socket.enqueue(datagram));
    }
}
