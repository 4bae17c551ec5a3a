//! UDP: checksum verification, socket lookup and the datagram queue.

use crate::error::{NetError, Result};
use crate::iface::Interface;
use crate::ipv4;
use crate::link::TxAncillary;
use crate::pseudo::{Ipv4PseudoHeader, PseudoHeader};
use crate::socket::{Datagram, Socket, SocketId, SocketTable, SocketType};
use crate::stats::UdpStats;
use crate::wire::{IpProtocol, Ipv4Header, UDP_HEADER_LEN, UdpHeader};

use std::net::Ipv4Addr;

/// Deliver a datagram received on interface `index`. A datagram no socket
/// accepts is reported as [`NetError::PortUnreachable`].
pub(crate) fn process_datagram(
    sockets: &mut SocketTable,
    stats: &mut UdpStats,
    index: usize,
    header: &Ipv4Header,
    payload: &[u8],
) -> Result<()> {
    let udp = match UdpHeader::parse(payload) {
        Ok(udp) => udp,
        Err(e) => {
            stats.in_errors += 1;
            return Err(e);
        }
    };
    let length = usize::from(udp.length);
    if length < UDP_HEADER_LEN || length > payload.len() {
        tracing::debug!("UDP: bad length {} from {}", udp.length, header.src);
        stats.in_errors += 1;
        return Err(NetError::InvalidHeader);
    }
    let payload = &payload[..length];

    // A zero checksum means the sender did not compute one.
    if udp.checksum != 0 {
        let pseudo = Ipv4PseudoHeader::new(
            header.src,
            header.dst,
            IpProtocol::Udp.into(),
            length as u16,
        );
        if PseudoHeader::from(pseudo).checksum(payload) != 0 {
            tracing::debug!("UDP: checksum error from {}:{}", header.src, udp.src_port);
            stats.in_errors += 1;
            return Err(NetError::InvalidHeader);
        }
    }

    let Some(slot) = sockets.find_udp(index, header.src, header.dst, udp.src_port, udp.dst_port)
    else {
        tracing::trace!(
            "UDP: no socket for {}:{} -> port {}",
            header.src,
            udp.src_port,
            udp.dst_port
        );
        stats.no_ports += 1;
        return Err(NetError::PortUnreachable);
    };

    let datagram = Datagram {
        src: header.src,
        src_port: udp.src_port,
        dst: header.dst,
        ttl: header.ttl,
        data: payload[UDP_HEADER_LEN..].to_vec(),
    };
    if sockets.slot_mut(slot).enqueue(datagram) {
        stats.in_datagrams += 1;
    } else {
        tracing::debug!("UDP: receive queue full on port {}, dropping", udp.dst_port);
    }
    Ok(())
}

fn dgram(sockets: &mut SocketTable, id: SocketId) -> Result<&mut Socket> {
    let sock = sockets.get_mut(id)?;
    if sock.kind != SocketType::Dgram {
        return Err(NetError::InvalidSocket);
    }
    Ok(sock)
}

/// Send `data` to `dst:port`, binding an ephemeral local port first when
/// the socket has none.
pub(crate) fn send_to(
    ifaces: &mut [Interface],
    sockets: &mut SocketTable,
    stats: &mut UdpStats,
    id: SocketId,
    dst: Ipv4Addr,
    port: u16,
    data: &[u8],
) -> Result<usize> {
    if dgram(sockets, id)?.local_port == 0 {
        let local_port = sockets.dynamic_port(SocketType::Dgram)?;
        dgram(sockets, id)?.local_port = local_port;
    }
    let sock = dgram(sockets, id)?;

    let (index, selected) = ipv4::select_route(ifaces, sock.interface, dst)?;
    let src = sock
        .local_addr
        .as_v4()
        .filter(|addr| !addr.is_unspecified())
        .unwrap_or(selected);
    let length = UDP_HEADER_LEN + data.len();
    if length > usize::from(u16::MAX) {
        return Err(NetError::MessageTooLong);
    }

    let mut header = [0u8; UDP_HEADER_LEN];
    UdpHeader {
        src_port: sock.local_port,
        dst_port: port,
        length: length as u16,
        checksum: 0,
    }
    .emit(&mut header);
    let pseudo = Ipv4PseudoHeader::new(src, dst, IpProtocol::Udp.into(), length as u16);
    let sum = match PseudoHeader::from(pseudo).checksum_scattered(&[&header[..], data], 0, length) {
        // Zero on the wire means "no checksum".
        0 => 0xFFFF,
        sum => sum,
    };
    header[6..8].copy_from_slice(&sum.to_be_bytes());

    let ancillary = TxAncillary {
        ttl: sock.ttl,
        dscp: 0,
    };
    ipv4::send_datagram(ifaces, index, &pseudo, &[&header[..], data], &ancillary)?;
    stats.out_datagrams += 1;
    Ok(data.len())
}

/// Pop the oldest queued datagram.
pub(crate) fn receive_from(sockets: &mut SocketTable, id: SocketId) -> Result<Datagram> {
    dgram(sockets, id)?
        .rx_queue
        .pop_front()
        .ok_or(NetError::WouldBlock)
}
