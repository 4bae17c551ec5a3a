//! The network context: interfaces, the socket table and every counter,
//! owned by one value and borrowed by each protocol for the length of a
//! call.
//!
//! All operations here are non-blocking. A call that has to wait returns
//! [`NetError::WouldBlock`]; [`NetStack`](crate::NetStack) builds blocking
//! semantics with deadlines on top.

use crate::error::{NetError, Result};
use crate::iface::Interface;
use crate::igmp;
use crate::ipv4;
use crate::link::PacketLink;
use crate::raw;
use crate::socket::{Datagram, Socket, SocketId, SocketTable, SocketType};
use crate::stats::{IcmpStats, NetStats, TcpStats, UdpStats};
use crate::tcp::{
    self, CongestionControl, NoCongestionControl, SendFlags, Shutdown, SocketEvents, TcpEnv,
    TcpState,
};
use crate::udp;
use crate::wire::IpProtocol;

use buddy_core::{IpAddress, NetConfig};

use std::net::Ipv4Addr;
use std::task::Context;
use std::time::Instant;

/// Packets read from one link per poll before moving on to the next.
const MAX_RX_BURST: usize = 64;

pub struct NetContext {
    pub(crate) config: NetConfig,
    pub(crate) interfaces: Vec<Interface>,
    pub(crate) sockets: SocketTable,
    pub(crate) tcp_stats: TcpStats,
    pub(crate) udp_stats: UdpStats,
    pub(crate) icmp_stats: IcmpStats,
    pub(crate) congestion: Box<dyn CongestionControl>,
    last_tcp_tick: Instant,
    last_frag_tick: Instant,
    rx_buffer: Vec<u8>,
}

impl NetContext {
    /// Build the context from a validated configuration and one link per
    /// configured interface, in the same order.
    pub fn new(config: NetConfig, links: Vec<Box<dyn PacketLink>>) -> Result<Self> {
        config.validate()?;
        if links.len() != config.interfaces.len() {
            return Err(buddy_core::Error::InvalidConfig(format!(
                "{} interfaces configured but {} links supplied",
                config.interfaces.len(),
                links.len()
            ))
            .into());
        }

        let interfaces = config
            .interfaces
            .iter()
            .zip(links)
            .enumerate()
            .map(|(index, (iface, link))| Interface::new(index, iface, &config.ipv4, link))
            .collect::<Result<Vec<_>>>()?;
        for iface in &interfaces {
            tracing::debug!(
                "{}: up, mtu {}, {} address(es)",
                iface.name(),
                iface.mtu(),
                iface.addresses().len()
            );
        }

        let now = Instant::now();
        Ok(Self {
            sockets: SocketTable::new(&config.sockets),
            config,
            interfaces,
            tcp_stats: TcpStats::default(),
            udp_stats: UdpStats::default(),
            icmp_stats: IcmpStats::default(),
            congestion: Box::new(NoCongestionControl),
            last_tcp_tick: now,
            last_frag_tick: now,
            rx_buffer: vec![0; usize::from(u16::MAX)],
        })
    }

    /// Replace the congestion control applied to every connection.
    pub fn with_congestion_control(mut self, cc: impl CongestionControl + 'static) -> Self {
        self.congestion = Box::new(cc);
        self
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn sockets(&self) -> &SocketTable {
        &self.sockets
    }

    pub fn socket(&self, id: SocketId) -> Result<&Socket> {
        self.sockets.get(id)
    }

    pub fn stats(&self) -> NetStats {
        NetStats {
            interfaces: self
                .interfaces
                .iter()
                .map(|iface| (iface.name().to_string(), iface.stats().clone()))
                .collect(),
            tcp: self.tcp_stats.clone(),
            udp: self.udp_stats.clone(),
            icmp: self.icmp_stats.clone(),
        }
    }

    pub(crate) fn tcp_env(&mut self, now: Instant) -> (TcpEnv<'_>, &mut SocketTable) {
        (
            TcpEnv {
                ifaces: &mut self.interfaces,
                config: &self.config.tcp,
                stats: &mut self.tcp_stats,
                cc: self.congestion.as_mut(),
                now,
            },
            &mut self.sockets,
        )
    }

    /// Run one inbound packet through the IP layer.
    pub fn receive_packet(&mut self, index: usize, packet: &[u8], now: Instant) {
        ipv4::process_packet(self, index, packet, now);
    }

    /// Read whatever the links have ready. Returns the number of packets
    /// processed.
    pub fn poll_links(&mut self, cx: &mut Context<'_>, now: Instant) -> usize {
        let mut buf = std::mem::take(&mut self.rx_buffer);
        let mut count = 0;
        for index in 0..self.interfaces.len() {
            for _ in 0..MAX_RX_BURST {
                let Some(len) = self.interfaces[index].poll_link(cx, &mut buf) else {
                    break;
                };
                ipv4::process_packet(self, index, &buf[..len], now);
                count += 1;
            }
        }
        self.rx_buffer = buf;
        count
    }

    /// Drive the TCP timers and the reassembly sweep when their intervals
    /// have elapsed.
    pub fn poll_timers(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_tcp_tick) >= self.config.tcp.tick_interval() {
            self.last_tcp_tick = now;
            let (mut env, sockets) = self.tcp_env(now);
            tcp::timer::tick(&mut env, sockets);
        }
        if now.saturating_duration_since(self.last_frag_tick) >= self.config.ipv4.frag_tick() {
            self.last_frag_tick = now;
            ipv4::expire_fragments(self, now);
        }
    }

    /// Allocate a socket. `protocol` only matters for raw sockets.
    pub fn open(&mut self, kind: SocketType, protocol: u8) -> Result<SocketId> {
        let protocol = match kind {
            SocketType::Stream => IpProtocol::Tcp.into(),
            SocketType::Dgram => IpProtocol::Udp.into(),
            SocketType::Raw => protocol,
            SocketType::Unused => return Err(NetError::InvalidSocket),
        };
        let id = self.sockets.allocate(kind, protocol, &self.config.tcp)?;
        tracing::trace!("opened {} ({:?}, protocol {})", id, kind, protocol);
        Ok(id)
    }

    /// Set the local address and port. An unspecified address accepts
    /// traffic for any local address.
    pub fn bind(&mut self, id: SocketId, addr: IpAddress, port: u16) -> Result<()> {
        let sock = self.sockets.get_mut(id)?;
        if sock.kind == SocketType::Stream && sock.tcp.state != TcpState::Closed {
            return Err(NetError::InvalidState);
        }
        sock.local_addr = if addr.is_unspecified() {
            IpAddress::Unspecified
        } else {
            addr
        };
        sock.local_port = port;
        Ok(())
    }

    /// Restrict the socket to one interface, or lift the restriction.
    pub fn bind_to_interface(&mut self, id: SocketId, index: Option<usize>) -> Result<()> {
        if index.is_some_and(|index| index >= self.interfaces.len()) {
            return Err(NetError::NotConfigured);
        }
        self.sockets.get_mut(id)?.interface = index;
        Ok(())
    }

    /// Time-to-live for outgoing packets; 0 restores the interface default.
    pub fn set_ttl(&mut self, id: SocketId, ttl: u8) -> Result<()> {
        self.sockets.get_mut(id)?.ttl = ttl;
        Ok(())
    }

    pub fn listen(&mut self, id: SocketId, backlog: usize, now: Instant) -> Result<()> {
        let (env, sockets) = self.tcp_env(now);
        let sock = tcp::api::stream(sockets, id)?;
        tcp::api::listen(&env, sock, backlog)
    }

    /// Stream sockets start the three-way handshake; datagram and raw
    /// sockets only record the remote end as their default destination and
    /// source filter.
    pub fn connect(&mut self, id: SocketId, remote: Ipv4Addr, port: u16, now: Instant) -> Result<()> {
        if self.sockets.get(id)?.kind == SocketType::Stream {
            let (mut env, sockets) = self.tcp_env(now);
            return tcp::api::connect(&mut env, sockets, id, remote, port);
        }
        let sock = self.sockets.get_mut(id)?;
        sock.remote_addr = remote.into();
        sock.remote_port = port;
        Ok(())
    }

    pub fn connect_status(&self, id: SocketId) -> Result<()> {
        let sock = self.sockets.get(id)?;
        if sock.kind != SocketType::Stream {
            return Err(NetError::InvalidSocket);
        }
        tcp::api::connect_status(sock)
    }

    pub fn accept(&mut self, id: SocketId, now: Instant) -> Result<(SocketId, IpAddress, u16)> {
        let (mut env, sockets) = self.tcp_env(now);
        tcp::api::accept(&mut env, sockets, id)
    }

    /// Queue data on a connection, or send one datagram to the connected
    /// destination.
    pub fn send(&mut self, id: SocketId, data: &[u8], flags: SendFlags, now: Instant) -> Result<usize> {
        let sock = self.sockets.get(id)?;
        match sock.kind {
            SocketType::Stream => {
                let (mut env, sockets) = self.tcp_env(now);
                let sock = tcp::api::stream(sockets, id)?;
                tcp::api::send(&mut env, sock, data, flags)
            }
            SocketType::Dgram | SocketType::Raw => {
                let (remote, port) = sock.remote();
                let dst = remote.as_v4().ok_or(NetError::NotConnected)?;
                self.send_to(id, dst, port, data)
            }
            SocketType::Unused => Err(NetError::InvalidSocket),
        }
    }

    pub fn send_acked(&self, id: SocketId) -> Result<()> {
        let sock = self.sockets.get(id)?;
        if sock.kind != SocketType::Stream {
            return Err(NetError::InvalidSocket);
        }
        tcp::api::send_acked(sock)
    }

    /// Read stream data, or the payload of the next datagram (truncated to
    /// `buf`).
    pub fn receive(&mut self, id: SocketId, buf: &mut [u8], now: Instant) -> Result<usize> {
        if self.sockets.get(id)?.kind == SocketType::Stream {
            let (mut env, sockets) = self.tcp_env(now);
            let sock = tcp::api::stream(sockets, id)?;
            return tcp::api::receive(&mut env, sock, buf);
        }
        let datagram = self.receive_from(id)?;
        let n = datagram.data.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram.data[..n]);
        Ok(n)
    }

    pub fn send_to(&mut self, id: SocketId, dst: Ipv4Addr, port: u16, data: &[u8]) -> Result<usize> {
        match self.sockets.get(id)?.kind {
            SocketType::Dgram => udp::send_to(
                &mut self.interfaces,
                &mut self.sockets,
                &mut self.udp_stats,
                id,
                dst,
                port,
                data,
            ),
            SocketType::Raw => raw::send_to(&mut self.interfaces, &mut self.sockets, id, dst, data),
            _ => Err(NetError::InvalidSocket),
        }
    }

    pub fn receive_from(&mut self, id: SocketId) -> Result<Datagram> {
        match self.sockets.get(id)?.kind {
            SocketType::Dgram => udp::receive_from(&mut self.sockets, id),
            SocketType::Raw => raw::receive_from(&mut self.sockets, id),
            _ => Err(NetError::InvalidSocket),
        }
    }

    pub fn shutdown(&mut self, id: SocketId, how: Shutdown, now: Instant) -> Result<()> {
        let (mut env, sockets) = self.tcp_env(now);
        let sock = tcp::api::stream(sockets, id)?;
        tcp::api::shutdown(&mut env, sock, how)
    }

    /// Drop a connection at once, resetting a synchronized peer.
    pub fn abort(&mut self, id: SocketId, now: Instant) -> Result<()> {
        let (mut env, sockets) = self.tcp_env(now);
        let sock = tcp::api::stream(sockets, id)?;
        tcp::api::abort(&mut env, sock)
    }

    /// Give the socket back. Connections are aborted; a connection in
    /// TIME-WAIT is recycled when its timer expires.
    pub fn close(&mut self, id: SocketId, now: Instant) -> Result<()> {
        if self.sockets.get(id)?.kind == SocketType::Stream {
            return self.abort(id, now);
        }
        self.sockets.get_mut(id)?.release();
        Ok(())
    }

    pub fn state(&self, id: SocketId) -> Result<TcpState> {
        let sock = self.sockets.get(id)?;
        if sock.kind != SocketType::Stream {
            return Err(NetError::InvalidSocket);
        }
        Ok(sock.tcp.state)
    }

    pub fn events(&self, id: SocketId) -> Result<SocketEvents> {
        let sock = self.sockets.get(id)?;
        Ok(match sock.kind {
            SocketType::Stream => sock.tcp.events,
            _ if sock.rx_queue.is_empty() => SocketEvents::TX_READY,
            _ => SocketEvents::TX_READY | SocketEvents::RX_READY,
        })
    }

    pub fn join_multicast(&mut self, index: usize, group: Ipv4Addr) -> Result<()> {
        let iface = self
            .interfaces
            .get_mut(index)
            .ok_or(NetError::NotConfigured)?;
        if iface.join_multicast(group)? {
            igmp::report_join(iface.name(), group);
        }
        Ok(())
    }

    pub fn leave_multicast(&mut self, index: usize, group: Ipv4Addr) -> Result<()> {
        let iface = self
            .interfaces
            .get_mut(index)
            .ok_or(NetError::NotConfigured)?;
        if iface.leave_multicast(group)? {
            igmp::report_leave(iface.name(), group);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::channel_link;

    fn context() -> NetContext {
        let config = NetConfig::builder()
            .interface("eth0", "192.0.2.1/24")
            .build()
            .unwrap();
        let (link, _peer) = channel_link(1500, 8);
        NetContext::new(config, vec![Box::new(link)]).unwrap()
    }

    #[test]
    fn link_count_must_match_interfaces() {
        let config = NetConfig::builder()
            .interface("eth0", "192.0.2.1/24")
            .build()
            .unwrap();
        assert!(matches!(
            NetContext::new(config, Vec::new()),
            Err(NetError::Config(_))
        ));
    }

    #[test]
    fn open_assigns_protocol_by_kind() {
        let mut ctx = context();
        let stream = ctx.open(SocketType::Stream, 0).unwrap();
        let raw = ctx.open(SocketType::Raw, 89).unwrap();
        assert_eq!(ctx.socket(stream).unwrap().protocol, 6);
        assert_eq!(ctx.socket(raw).unwrap().protocol, 89);
        assert!(ctx.open(SocketType::Unused, 0).is_err());
    }

    #[test]
    fn stream_operations_reject_datagram_sockets() {
        let mut ctx = context();
        let now = Instant::now();
        let id = ctx.open(SocketType::Dgram, 0).unwrap();
        assert!(matches!(ctx.listen(id, 0, now), Err(NetError::InvalidSocket)));
        assert!(matches!(ctx.state(id), Err(NetError::InvalidSocket)));
        assert!(matches!(ctx.receive_from(id), Err(NetError::WouldBlock)));
        assert_eq!(ctx.events(id).unwrap(), SocketEvents::TX_READY);
    }

    #[test]
    fn unconnected_datagram_send_fails() {
        let mut ctx = context();
        let id = ctx.open(SocketType::Dgram, 0).unwrap();
        assert!(matches!(
            ctx.send(id, b"x", SendFlags::empty(), Instant::now()),
            Err(NetError::NotConnected)
        ));
    }

    #[test]
    fn close_releases_the_record() {
        let mut ctx = context();
        let now = Instant::now();
        let id = ctx.open(SocketType::Stream, 0).unwrap();
        ctx.bind(id, IpAddress::Unspecified, 80).unwrap();
        ctx.listen(id, 2, now).unwrap();
        assert_eq!(ctx.state(id).unwrap(), TcpState::Listen);
        assert!(matches!(
            ctx.bind(id, IpAddress::Unspecified, 81),
            Err(NetError::InvalidState)
        ));

        ctx.close(id, now).unwrap();
        assert!(matches!(ctx.socket(id), Err(NetError::InvalidSocket)));
        assert_eq!(ctx.sockets().in_use(), 0);
    }

    #[test]
    fn multicast_membership_is_counted() {
        let mut ctx = context();
        let group = Ipv4Addr::new(239, 1, 2, 3);
        ctx.join_multicast(0, group).unwrap();
        ctx.join_multicast(0, group).unwrap();
        ctx.leave_multicast(0, group).unwrap();
        assert!(ctx.interfaces()[0].is_member(group));
        ctx.leave_multicast(0, group).unwrap();
        assert!(!ctx.interfaces()[0].is_member(group));
        assert!(ctx.join_multicast(3, group).is_err());
    }

    #[test]
    fn timers_wait_for_their_interval() {
        let mut ctx = context();
        let start = ctx.last_tcp_tick;
        ctx.poll_timers(start);
        assert_eq!(ctx.last_tcp_tick, start);
        let later = start + ctx.config.tcp.tick_interval();
        ctx.poll_timers(later);
        assert_eq!(ctx.last_tcp_tick, later);
    }
}
