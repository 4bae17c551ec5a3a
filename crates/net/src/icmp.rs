//! ICMP: echo replies and the error-reporting contract IP relies on.

use crate::checksum;
use crate::error::{NetError, Result};
use crate::iface::Interface;
use crate::ipv4;
use crate::link::TxAncillary;
use crate::pseudo::Ipv4PseudoHeader;
use crate::stats::IcmpStats;
use crate::wire::{ICMP_HEADER_LEN, IcmpHeader, IpProtocol, Ipv4Header};

pub const ECHO_REPLY: u8 = 0;
pub const DEST_UNREACHABLE: u8 = 3;
pub const ECHO_REQUEST: u8 = 8;
pub const TIME_EXCEEDED: u8 = 11;
pub const PARAM_PROBLEM: u8 = 12;

pub const CODE_PROTOCOL_UNREACHABLE: u8 = 2;
pub const CODE_PORT_UNREACHABLE: u8 = 3;
pub const CODE_REASSEMBLY_TIME_EXCEEDED: u8 = 1;

/// Payload bytes of the offending datagram quoted after its header.
const QUOTED_PAYLOAD_LEN: usize = 8;

/// Handle an inbound ICMP message carried in the datagram described by
/// `header`.
pub(crate) fn process_message(
    ifaces: &mut [Interface],
    index: usize,
    stats: &mut IcmpStats,
    header: &Ipv4Header,
    message: &[u8],
) {
    stats.in_msgs += 1;
    let icmp = match IcmpHeader::parse(message) {
        Ok(icmp) => icmp,
        Err(_) => {
            stats.in_errors += 1;
            return;
        }
    };
    if checksum::checksum(message) != 0 {
        tracing::debug!("ICMP: checksum error from {}", header.src);
        stats.in_errors += 1;
        return;
    }

    match icmp.kind {
        ECHO_REQUEST => {
            if let Err(e) = send_echo_reply(ifaces, index, stats, header, message) {
                tracing::debug!("ICMP: failed to answer echo request from {}: {}", header.src, e);
            }
        }
        kind => tracing::trace!("ICMP: ignoring type {} from {}", kind, header.src),
    }
}

fn send_echo_reply(
    ifaces: &mut [Interface],
    index: usize,
    stats: &mut IcmpStats,
    request: &Ipv4Header,
    message: &[u8],
) -> Result<()> {
    let iface = ifaces.get(index).ok_or(NetError::NotConfigured)?;
    if iface.is_broadcast(request.dst) || request.dst.is_multicast() {
        tracing::trace!("ICMP: not answering echo request sent to {}", request.dst);
        return Ok(());
    }

    let mut reply = message.to_vec();
    reply[0] = ECHO_REPLY;
    reply[1] = 0;
    IcmpHeader::set_checksum(&mut reply, 0);
    let sum = checksum::checksum(&reply);
    IcmpHeader::set_checksum(&mut reply, sum);

    stats.out_msgs += 1;
    stats.out_echo_reps += 1;
    let pseudo = Ipv4PseudoHeader::new(
        request.dst,
        request.src,
        IpProtocol::Icmp.into(),
        reply.len() as u16,
    );
    ipv4::send_datagram(ifaces, index, &pseudo, &[reply.as_slice()], &TxAncillary::default())
}

/// Report a problem with `packet` (an IPv4 datagram received on `index`) to
/// its sender. The message quotes the offending header and the first eight
/// payload bytes.
pub(crate) fn send_error(
    ifaces: &mut [Interface],
    index: usize,
    stats: &mut IcmpStats,
    kind: u8,
    code: u8,
    parameter: u8,
    packet: &[u8],
) -> Result<()> {
    let offending = Ipv4Header::parse(packet)?;
    let iface = ifaces.get(index).ok_or(NetError::NotConfigured)?;
    if iface.is_broadcast(offending.dst) || offending.dst.is_multicast() {
        return Err(NetError::InvalidAddress);
    }

    let quoted = &packet[..packet.len().min(offending.header_len() + QUOTED_PAYLOAD_LEN)];
    let mut header = [0u8; ICMP_HEADER_LEN];
    IcmpHeader {
        kind,
        code,
        checksum: 0,
        rest: [parameter, 0, 0, 0],
    }
    .emit(&mut header);
    let length = ICMP_HEADER_LEN + quoted.len();
    let sum = checksum::checksum_scattered(&[&header[..], quoted], 0, length);
    IcmpHeader::set_checksum(&mut header, sum);

    stats.out_msgs += 1;
    match kind {
        DEST_UNREACHABLE => stats.out_dest_unreachs += 1,
        TIME_EXCEEDED => stats.out_time_excds += 1,
        _ => {}
    }
    tracing::debug!(
        "ICMP: sending type {} code {} to {}",
        kind,
        code,
        offending.src
    );

    let pseudo = Ipv4PseudoHeader::new(
        offending.dst,
        offending.src,
        IpProtocol::Icmp.into(),
        length as u16,
    );
    ipv4::send_datagram(ifaces, index, &pseudo, &[&header[..], quoted], &TxAncillary::default())
}
