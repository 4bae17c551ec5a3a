//! IPv4/TCP protocol engine.
//!
//! Packets arrive from a [`PacketLink`], pass the IPv4 admission checks,
//! are reassembled when fragmented and then handed to ICMP, IGMP, TCP, UDP
//! or raw sockets. All state lives in a [`NetContext`] owned by one task;
//! applications talk to it through a cloneable [`NetHandle`].

mod checksum;
mod context;
mod demux;
mod error;
mod frag;
mod icmp;
mod iface;
mod igmp;
mod ipv4;
mod link;
mod pseudo;
mod raw;
mod socket;
mod stack;
mod stats;
pub mod tcp;
mod udp;
pub mod wire;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use checksum::{checksum, checksum_scattered, upper_layer_checksum};
pub use context::NetContext;
pub use error::{NetError, Result};
pub use frag::{Reassembler, fragment_datagram};
pub use iface::{AddrEntry, AddrState, Interface};
pub use ipv4::{admit, select_route};
pub use link::{ChannelLink, LinkPeer, PacketLink, TxAncillary, channel_link};
pub use pseudo::{Ipv4PseudoHeader, Ipv6PseudoHeader, PseudoHeader};
pub use socket::{Datagram, Socket, SocketId, SocketTable, SocketType};
pub use stack::{NetHandle, NetStack};
pub use stats::{IcmpStats, IpStats, NetStats, TcpStats, UdpStats};
pub use tcp::{
    CongestionControl, NoCongestionControl, Reno, SendFlags, Shutdown, SocketEvents, TcpState,
};
