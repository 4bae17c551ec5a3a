//! Raw IP sockets: whole upper-layer payloads for a chosen protocol number.

use crate::error::{NetError, Result};
use crate::iface::Interface;
use crate::ipv4;
use crate::link::TxAncillary;
use crate::pseudo::Ipv4PseudoHeader;
use crate::socket::{Datagram, SocketId, SocketTable, SocketType};
use crate::wire::Ipv4Header;

use std::net::Ipv4Addr;

/// Hand a datagram's payload to every raw socket opened for its protocol.
/// Returns [`NetError::ProtocolUnreachable`] when none accepted it.
pub(crate) fn process_datagram(
    sockets: &mut SocketTable,
    index: usize,
    header: &Ipv4Header,
    payload: &[u8],
) -> Result<()> {
    let matches = sockets.find_raw(index, header.protocol, header.src, header.dst);
    if matches.is_empty() {
        return Err(NetError::ProtocolUnreachable);
    }
    for slot in matches {
        let queued = sockets.slot_mut(slot).enqueue(Datagram {
            src: header.src,
            src_port: 0,
            dst: header.dst,
            ttl: header.ttl,
            data: payload.to_vec(),
        });
        if !queued {
            tracing::debug!(
                "raw: receive queue full for protocol {}, dropping",
                header.protocol
            );
        }
    }
    Ok(())
}

/// Send `data` as the payload of an IPv4 datagram carrying the socket's
/// protocol number.
pub(crate) fn send_to(
    ifaces: &mut [Interface],
    sockets: &mut SocketTable,
    id: SocketId,
    dst: Ipv4Addr,
    data: &[u8],
) -> Result<usize> {
    let sock = sockets.get_mut(id)?;
    if sock.kind != SocketType::Raw {
        return Err(NetError::InvalidSocket);
    }
    let (index, selected) = ipv4::select_route(ifaces, sock.interface, dst)?;
    let src = sock
        .local_addr
        .as_v4()
        .filter(|addr| !addr.is_unspecified())
        .unwrap_or(selected);
    let length = u16::try_from(data.len()).map_err(|_| NetError::MessageTooLong)?;

    let pseudo = Ipv4PseudoHeader::new(src, dst, sock.protocol, length);
    let ancillary = TxAncillary {
        ttl: sock.ttl,
        dscp: 0,
    };
    ipv4::send_datagram(ifaces, index, &pseudo, &[data], &ancillary)?;
    Ok(data.len())
}

pub(crate) fn receive_from(sockets: &mut SocketTable, id: SocketId) -> Result<Datagram> {
    let sock = sockets.get_mut(id)?;
    if sock.kind != SocketType::Raw {
        return Err(NetError::InvalidSocket);
    }
    sock.rx_queue.pop_front().ok_or(NetError::WouldBlock)
}
