//! Per-interface IPv4 state.

use crate::error::{NetError, Result};
use crate::frag::Reassembler;
use crate::link::{PacketLink, TxAncillary};
use crate::stats::IpStats;

use buddy_core::{InterfaceConfig, Ipv4Config};

use std::io;
use std::net::Ipv4Addr;
use std::task::{Context, Poll};

/// Addresses an interface may carry.
pub const MAX_ADDRESSES: usize = 4;

/// All-systems group every IPv4 host belongs to.
pub const ALL_SYSTEMS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrState {
    /// Duplicate detection still running; traffic to the address is dropped.
    Tentative,
    Valid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrEntry {
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub state: AddrState,
}

impl AddrEntry {
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(self.addr) & mask == u32::from(addr) & mask
    }

    fn directed_broadcast(&self) -> Option<Ipv4Addr> {
        let mask = u32::from(self.netmask);
        (mask != u32::MAX).then(|| Ipv4Addr::from(u32::from(self.addr) | !mask))
    }
}

#[derive(Debug, Clone, Copy)]
struct MulticastEntry {
    group: Ipv4Addr,
    refs: u32,
}

pub struct Interface {
    name: String,
    index: usize,
    mtu: usize,
    addresses: heapless::Vec<AddrEntry, MAX_ADDRESSES>,
    gateway: Option<Ipv4Addr>,
    multicast: Vec<MulticastEntry>,
    multicast_capacity: usize,
    identification: u16,
    pub(crate) default_ttl: u8,
    pub(crate) reassembler: Reassembler,
    link: Box<dyn PacketLink>,
    link_up: bool,
    pub(crate) stats: IpStats,
}

impl Interface {
    pub fn new(
        index: usize,
        config: &InterfaceConfig,
        ipv4: &Ipv4Config,
        link: Box<dyn PacketLink>,
    ) -> Result<Self> {
        let mut addresses = heapless::Vec::new();
        for entry in &config.addresses {
            addresses
                .push(AddrEntry {
                    addr: entry.addr,
                    netmask: entry.netmask(),
                    state: if entry.tentative {
                        AddrState::Tentative
                    } else {
                        AddrState::Valid
                    },
                })
                .map_err(|_| {
                    buddy_core::Error::InvalidConfig(format!(
                        "interface {} has more than {} addresses",
                        config.name, MAX_ADDRESSES
                    ))
                })?;
        }

        Ok(Self {
            name: config.name.clone(),
            index,
            mtu: config.mtu.min(link.mtu()),
            addresses,
            gateway: config.gateway,
            multicast: Vec::with_capacity(config.multicast_filter_size),
            multicast_capacity: config.multicast_filter_size,
            identification: rand::random(),
            default_ttl: ipv4.default_ttl,
            reassembler: Reassembler::new(
                ipv4.max_frag_datagrams,
                ipv4.max_frag_datagram_size,
                ipv4.frag_ttl(),
            ),
            link,
            link_up: true,
            stats: IpStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.gateway
    }

    pub fn addresses(&self) -> &[AddrEntry] {
        &self.addresses
    }

    pub fn stats(&self) -> &IpStats {
        &self.stats
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up
    }

    /// Promote a tentative address once duplicate detection has passed, or
    /// demote it again.
    pub fn set_address_state(&mut self, addr: Ipv4Addr, state: AddrState) -> Result<()> {
        let entry = self
            .addresses
            .iter_mut()
            .find(|e| e.addr == addr)
            .ok_or(NetError::InvalidAddress)?;
        entry.state = state;
        Ok(())
    }

    /// Limited broadcast, or the directed broadcast of a configured subnet.
    pub fn is_broadcast(&self, addr: Ipv4Addr) -> bool {
        addr.is_broadcast()
            || self
                .addresses
                .iter()
                .any(|e| e.contains(addr) && e.directed_broadcast() == Some(addr))
    }

    /// A valid unicast address owned by this interface.
    pub fn has_address(&self, addr: Ipv4Addr) -> bool {
        self.addresses
            .iter()
            .any(|e| e.state == AddrState::Valid && e.addr == addr)
    }

    pub fn is_tentative(&self, addr: Ipv4Addr) -> bool {
        self.addresses
            .iter()
            .any(|e| e.state == AddrState::Tentative && e.addr == addr)
    }

    pub fn is_member(&self, group: Ipv4Addr) -> bool {
        group == ALL_SYSTEMS || self.multicast.iter().any(|e| e.group == group)
    }

    /// Broadcast and multicast addresses never appear as a source.
    pub fn check_source(&self, addr: Ipv4Addr) -> Result<()> {
        if self.is_broadcast(addr) || addr.is_multicast() {
            return Err(NetError::InvalidAddress);
        }
        Ok(())
    }

    /// Accept broadcast, joined groups and any assigned unicast address,
    /// tentative ones included. Tentative addresses are filtered separately.
    pub fn check_destination(&self, addr: Ipv4Addr) -> Result<()> {
        let accepted = if self.is_broadcast(addr) {
            true
        } else if addr.is_multicast() {
            self.is_member(addr)
        } else {
            self.addresses.iter().any(|e| e.addr == addr)
        };
        if accepted {
            Ok(())
        } else {
            Err(NetError::InvalidAddress)
        }
    }

    /// Add a reference to `group`. Returns true on the first join, when the
    /// group membership should be reported.
    pub fn join_multicast(&mut self, group: Ipv4Addr) -> Result<bool> {
        if !group.is_multicast() {
            return Err(NetError::InvalidAddress);
        }
        if let Some(entry) = self.multicast.iter_mut().find(|e| e.group == group) {
            entry.refs += 1;
            return Ok(false);
        }
        if self.multicast.len() >= self.multicast_capacity {
            return Err(NetError::OutOfResources);
        }
        self.multicast.push(MulticastEntry { group, refs: 1 });
        Ok(true)
    }

    /// Drop a reference to `group`. Returns true when the last reference
    /// went away.
    pub fn leave_multicast(&mut self, group: Ipv4Addr) -> Result<bool> {
        let pos = self
            .multicast
            .iter()
            .position(|e| e.group == group)
            .ok_or(NetError::InvalidAddress)?;
        self.multicast[pos].refs -= 1;
        if self.multicast[pos].refs == 0 {
            self.multicast.swap_remove(pos);
            return Ok(true);
        }
        Ok(false)
    }

    /// Pick a source address for `dst`: one on the destination's subnet,
    /// else the first valid address when a gateway can carry the packet.
    pub fn select_source(&self, dst: Ipv4Addr) -> Option<Ipv4Addr> {
        let mut valid = self
            .addresses
            .iter()
            .filter(|e| e.state == AddrState::Valid);

        if dst.is_broadcast() || dst.is_multicast() {
            return valid.next().map(|e| e.addr);
        }
        if let Some(entry) = valid.clone().find(|e| e.contains(dst)) {
            return Some(entry.addr);
        }
        self.gateway.and(valid.next().map(|e| e.addr))
    }

    pub(crate) fn next_identification(&mut self) -> u16 {
        let id = self.identification;
        self.identification = self.identification.wrapping_add(1);
        id
    }

    pub(crate) fn transmit(&mut self, packet: &[u8], ancillary: &TxAncillary) -> Result<()> {
        self.link.send(packet, ancillary).map_err(|e| {
            tracing::warn!("{}: failed to send packet: {}", self.name, e);
            NetError::Io(e)
        })
    }

    /// Non-blocking read of one inbound packet. A closed link is reported
    /// once and never polled again.
    pub(crate) fn poll_link(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Option<usize> {
        if !self.link_up {
            return None;
        }
        match self.link.poll_recv(cx, buf) {
            Poll::Ready(Ok(len)) => Some(len),
            Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => None,
            Poll::Ready(Err(e)) => {
                tracing::warn!("{}: link closed: {}", self.name, e);
                self.link_up = false;
                None
            }
            Poll::Pending => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::channel_link;
    use buddy_core::InterfaceAddress;

    fn iface(addresses: Vec<InterfaceAddress>, gateway: Option<Ipv4Addr>) -> Interface {
        let (link, _peer) = channel_link(1500, 4);
        let mut config = InterfaceConfig::new("eth0");
        config.addresses = addresses;
        config.gateway = gateway;
        Interface::new(0, &config, &Ipv4Config::default(), Box::new(link)).unwrap()
    }

    fn addr(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(a, b, c, d)
    }

    #[test]
    fn broadcast_forms() {
        let iface = iface(vec![InterfaceAddress::new(addr(192, 0, 2, 1), 24)], None);
        assert!(iface.is_broadcast(Ipv4Addr::BROADCAST));
        assert!(iface.is_broadcast(addr(192, 0, 2, 255)));
        assert!(!iface.is_broadcast(addr(192, 0, 2, 254)));
        assert!(!iface.is_broadcast(addr(198, 51, 100, 255)));
    }

    #[test]
    fn host_route_has_no_directed_broadcast() {
        let iface = iface(vec![InterfaceAddress::new(addr(10, 0, 0, 1), 32)], None);
        assert!(!iface.is_broadcast(addr(10, 0, 0, 1)));
    }

    #[test]
    fn source_filtering() {
        let iface = iface(vec![InterfaceAddress::new(addr(192, 0, 2, 1), 24)], None);
        assert!(iface.check_source(addr(192, 0, 2, 50)).is_ok());
        assert!(matches!(
            iface.check_source(addr(192, 0, 2, 255)),
            Err(NetError::InvalidAddress)
        ));
        assert!(iface.check_source(addr(224, 0, 0, 9)).is_err());
    }

    #[test]
    fn destination_filtering() {
        let mut tentative = InterfaceAddress::new(addr(192, 0, 2, 7), 24);
        tentative.tentative = true;
        let mut iface = iface(
            vec![InterfaceAddress::new(addr(192, 0, 2, 1), 24), tentative],
            None,
        );
        assert!(iface.check_destination(addr(192, 0, 2, 1)).is_ok());
        assert!(iface.check_destination(addr(192, 0, 2, 255)).is_ok());
        assert!(iface.check_destination(ALL_SYSTEMS).is_ok());
        assert!(iface.check_destination(addr(192, 0, 2, 2)).is_err());
        assert!(iface.check_destination(addr(239, 1, 2, 3)).is_err());
        assert!(iface.check_destination(addr(192, 0, 2, 7)).is_ok());
        assert!(iface.is_tentative(addr(192, 0, 2, 7)));

        iface
            .set_address_state(addr(192, 0, 2, 7), AddrState::Valid)
            .unwrap();
        assert!(!iface.is_tentative(addr(192, 0, 2, 7)));
    }

    #[test]
    fn multicast_refcounting() {
        let mut iface = iface(vec![], None);
        let group = addr(239, 1, 2, 3);
        assert!(iface.join_multicast(group).unwrap());
        assert!(!iface.join_multicast(group).unwrap());
        assert!(iface.check_destination(group).is_ok());
        assert!(!iface.leave_multicast(group).unwrap());
        assert!(iface.check_destination(group).is_ok());
        assert!(iface.leave_multicast(group).unwrap());
        assert!(iface.check_destination(group).is_err());
        assert!(matches!(
            iface.leave_multicast(group),
            Err(NetError::InvalidAddress)
        ));
        assert!(iface.join_multicast(addr(10, 0, 0, 1)).is_err());
    }

    #[test]
    fn multicast_filter_is_bounded() {
        let mut iface = iface(vec![], None);
        for i in 0..4 {
            iface.join_multicast(addr(239, 0, 0, i)).unwrap();
        }
        assert!(matches!(
            iface.join_multicast(addr(239, 0, 0, 9)),
            Err(NetError::OutOfResources)
        ));
    }

    #[test]
    fn source_selection() {
        let iface_no_gw = iface(
            vec![
                InterfaceAddress::new(addr(192, 0, 2, 1), 24),
                InterfaceAddress::new(addr(198, 51, 100, 1), 24),
            ],
            None,
        );
        assert_eq!(
            iface_no_gw.select_source(addr(198, 51, 100, 9)),
            Some(addr(198, 51, 100, 1))
        );
        assert_eq!(iface_no_gw.select_source(addr(203, 0, 113, 1)), None);

        let with_gw = iface(
            vec![InterfaceAddress::new(addr(192, 0, 2, 1), 24)],
            Some(addr(192, 0, 2, 254)),
        );
        assert_eq!(
            with_gw.select_source(addr(203, 0, 113, 1)),
            Some(addr(192, 0, 2, 1))
        );
    }

    #[test]
    fn too_many_addresses_is_config_error() {
        let (link, _peer) = channel_link(1500, 4);
        let mut config = InterfaceConfig::new("eth0");
        config.addresses = (1..=5)
            .map(|i| InterfaceAddress::new(addr(10, 0, i, 1), 24))
            .collect();
        let err = Interface::new(0, &config, &Ipv4Config::default(), Box::new(link))
            .err()
            .unwrap();
        assert!(matches!(err, NetError::Config(_)));
    }

    #[test]
    fn identification_increments() {
        let mut iface = iface(vec![], None);
        let first = iface.next_identification();
        assert_eq!(iface.next_identification(), first.wrapping_add(1));
    }
}
