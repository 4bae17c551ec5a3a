//! Protocol demultiplexer for complete datagrams.

use crate::context::NetContext;
use crate::error::NetError;
use crate::icmp;
use crate::igmp;
use crate::raw;
use crate::tcp;
use crate::udp;
use crate::wire::{IpProtocol, Ipv4Header};

use std::time::Instant;

/// Route a complete datagram received on interface `index` to the handler
/// for its protocol, answering unreachable protocols and ports with ICMP.
pub(crate) fn process_datagram(ctx: &mut NetContext, index: usize, datagram: &[u8], now: Instant) {
    let Ok(header) = Ipv4Header::parse(datagram) else {
        return;
    };
    let payload = &datagram[header.header_len()..];

    let result = match header.protocol() {
        IpProtocol::Icmp => {
            icmp::process_message(
                &mut ctx.interfaces,
                index,
                &mut ctx.icmp_stats,
                &header,
                payload,
            );
            // Raw sockets see ICMP too; nobody listening is not an error.
            deliver_raw_copy(ctx, index, &header, payload);
            Ok(())
        }
        IpProtocol::Igmp => {
            igmp::process_message(ctx.interfaces[index].name(), &header, payload);
            deliver_raw_copy(ctx, index, &header, payload);
            Ok(())
        }
        IpProtocol::Tcp => {
            let (mut env, sockets) = ctx.tcp_env(now);
            tcp::fsm::process_segment(&mut env, sockets, index, header.src, header.dst, payload);
            Ok(())
        }
        IpProtocol::Udp => udp::process_datagram(
            &mut ctx.sockets,
            &mut ctx.udp_stats,
            index,
            &header,
            payload,
        ),
        IpProtocol::Other(_) => raw::process_datagram(&mut ctx.sockets, index, &header, payload),
    };

    let reply = match result {
        Err(NetError::ProtocolUnreachable) => {
            tracing::debug!(
                "IPv4: no handler for protocol {} from {}",
                header.protocol,
                header.src
            );
            ctx.interfaces[index]
                .stats
                .record_drop(&NetError::ProtocolUnreachable);
            Some(icmp::CODE_PROTOCOL_UNREACHABLE)
        }
        Err(NetError::PortUnreachable) => {
            ctx.interfaces[index].stats.in_delivers += 1;
            Some(icmp::CODE_PORT_UNREACHABLE)
        }
        _ => {
            ctx.interfaces[index].stats.in_delivers += 1;
            None
        }
    };

    if let Some(code) = reply
        && let Err(e) = icmp::send_error(
            &mut ctx.interfaces,
            index,
            &mut ctx.icmp_stats,
            icmp::DEST_UNREACHABLE,
            code,
            0,
            datagram,
        )
    {
        tracing::trace!("IPv4: no destination unreachable sent to {}: {}", header.src, e);
    }
}

/// Hand a copy of a datagram the stack consumed itself to any raw sockets
/// bound to its protocol.
fn deliver_raw_copy(ctx: &mut NetContext, index: usize, header: &Ipv4Header, payload: &[u8]) {
    match raw::process_datagram(&mut ctx.sockets, index, header, payload) {
        Ok(()) | Err(NetError::ProtocolUnreachable) => {}
        Err(e) => tracing::trace!(
            "IPv4: raw delivery of protocol {} from {} failed: {}",
            header.protocol,
            header.src,
            e
        ),
    }
}
