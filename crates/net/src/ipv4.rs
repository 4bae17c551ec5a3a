//! IPv4 admission pipeline and send path.

use crate::checksum;
use crate::context::NetContext;
use crate::demux;
use crate::error::{NetError, Result};
use crate::frag::fragment_datagram;
use crate::icmp;
use crate::iface::Interface;
use crate::link::TxAncillary;
use crate::pseudo::Ipv4PseudoHeader;
use crate::wire::{IPV4_MIN_HEADER_LEN, IPV4_VERSION, Ipv4Header};

use std::net::Ipv4Addr;
use std::time::Instant;

/// Largest payload a 16-bit total length can describe behind a bare header.
const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - IPV4_MIN_HEADER_LEN;

/// Validate an inbound packet against the interface that received it.
///
/// Checks run in a fixed order and the first failure decides the error,
/// which in turn decides the counter [`IpStats::record_drop`] bumps.
///
/// [`IpStats::record_drop`]: crate::stats::IpStats::record_drop
pub fn admit(iface: &Interface, packet: &[u8]) -> Result<Ipv4Header> {
    let header = Ipv4Header::parse(packet)?;

    if header.version != IPV4_VERSION || header.ihl < 5 {
        return Err(NetError::InvalidHeader);
    }
    let total_length = usize::from(header.total_length);
    if total_length < header.header_len() {
        return Err(NetError::InvalidHeader);
    }
    if packet.len() < total_length {
        return Err(NetError::InvalidLength);
    }
    if iface.check_source(header.src).is_err() {
        return Err(NetError::InvalidHeader);
    }
    iface.check_destination(header.dst)?;
    if iface.is_tentative(header.dst) {
        return Err(NetError::InvalidAddress);
    }
    if checksum::checksum(&packet[..header.header_len()]) != 0 {
        tracing::debug!("IPv4: header checksum error from {}", header.src);
        return Err(NetError::InvalidHeader);
    }
    Ok(header)
}

/// Entry point for one packet read from interface `index`.
pub(crate) fn process_packet(ctx: &mut NetContext, index: usize, packet: &[u8], now: Instant) {
    let Some(iface) = ctx.interfaces.get_mut(index) else {
        return;
    };
    iface.stats.in_receives += 1;

    let header = match admit(iface, packet) {
        Ok(header) => header,
        Err(e) => {
            tracing::trace!("IPv4: {} dropped packet of {} bytes: {}", iface.name(), packet.len(), e);
            iface.stats.record_drop(&e);
            return;
        }
    };
    // Link padding past the declared length is not part of the datagram.
    let packet = &packet[..usize::from(header.total_length)];

    if header.is_fragment() {
        let rebuilt = iface
            .reassembler
            .process(&header, packet, now, &mut iface.stats);
        if let Some(datagram) = rebuilt {
            tracing::trace!(
                "IPv4: reassembled id {} from {} ({} bytes)",
                header.identification,
                header.src,
                datagram.len()
            );
            demux::process_datagram(ctx, index, &datagram, now);
        }
    } else {
        demux::process_datagram(ctx, index, packet, now);
    }
}

/// Sweep every interface's reassembly pool, reporting each expired datagram
/// whose first fragment had arrived with ICMP Time Exceeded.
pub(crate) fn expire_fragments(ctx: &mut NetContext, now: Instant) {
    for index in 0..ctx.interfaces.len() {
        let iface = &mut ctx.interfaces[index];
        let partials = iface.reassembler.expire(now, &mut iface.stats);
        for partial in partials {
            if let Err(e) = icmp::send_error(
                &mut ctx.interfaces,
                index,
                &mut ctx.icmp_stats,
                icmp::TIME_EXCEEDED,
                icmp::CODE_REASSEMBLY_TIME_EXCEEDED,
                0,
                &partial,
            ) {
                tracing::debug!("IPv4: failed to report reassembly timeout: {}", e);
            }
        }
    }
}

/// Pick the interface and source address used to reach `dst`. `hint`
/// restricts the choice to one interface.
pub fn select_route(
    ifaces: &[Interface],
    hint: Option<usize>,
    dst: Ipv4Addr,
) -> Result<(usize, Ipv4Addr)> {
    if dst.is_unspecified() {
        return Err(NetError::InvalidAddress);
    }
    if dst.is_loopback() {
        return Err(NetError::NoRoute);
    }

    let candidates: &[Interface] = match hint {
        Some(index) => ifaces
            .get(index..=index)
            .ok_or(NetError::NotConfigured)?,
        None => ifaces,
    };
    if candidates.iter().all(|iface| iface.addresses().is_empty()) {
        return Err(NetError::NotConfigured);
    }
    candidates
        .iter()
        .find_map(|iface| iface.select_source(dst).map(|src| (iface.index(), src)))
        .ok_or(NetError::NoRoute)
}

/// Send an upper-layer payload, given as consecutive chunks, to
/// `pseudo.dst`. Payloads larger than the interface MTU are fragmented.
pub(crate) fn send_datagram(
    ifaces: &mut [Interface],
    index: usize,
    pseudo: &Ipv4PseudoHeader,
    payload: &[&[u8]],
    ancillary: &TxAncillary,
) -> Result<()> {
    let iface = ifaces.get_mut(index).ok_or(NetError::NotConfigured)?;
    iface.stats.out_requests += 1;

    let result = send_on(iface, pseudo, payload, ancillary);
    match &result {
        Err(NetError::NoRoute) => iface.stats.out_no_routes += 1,
        Err(_) => iface.stats.out_discards += 1,
        Ok(()) => {}
    }
    result
}

fn send_on(
    iface: &mut Interface,
    pseudo: &Ipv4PseudoHeader,
    payload: &[&[u8]],
    ancillary: &TxAncillary,
) -> Result<()> {
    let dst = pseudo.dst;
    if dst.is_unspecified() {
        return Err(NetError::InvalidAddress);
    }
    if dst.is_loopback() || iface.has_address(dst) {
        return Err(NetError::NoRoute);
    }
    iface.check_source(pseudo.src)?;

    let length: usize = payload.iter().map(|chunk| chunk.len()).sum();
    if length > MAX_PAYLOAD_LEN {
        return Err(NetError::MessageTooLong);
    }

    let mut header = Ipv4Header {
        version: IPV4_VERSION,
        ihl: 5,
        tos: (ancillary.dscp << 2) & 0xFC,
        total_length: 0,
        identification: iface.next_identification(),
        fragment: 0,
        ttl: match ancillary.ttl {
            0 => iface.default_ttl,
            ttl => ttl,
        },
        protocol: pseudo.protocol,
        checksum: 0,
        src: pseudo.src,
        dst,
    };

    if IPV4_MIN_HEADER_LEN + length <= iface.mtu() {
        let packet = build_packet(&mut header, payload, length);
        return iface.transmit(&packet, ancillary);
    }

    // Fragmentation works on one contiguous copy of the payload.
    let data = payload.concat();
    let mtu = iface.mtu();
    let result = fragment_datagram(&data, mtu, |fragment, chunk| {
        header.fragment = fragment;
        let packet = build_packet(&mut header, &[chunk], chunk.len());
        iface.stats.frag_creates += 1;
        iface.transmit(&packet, ancillary)
    });
    match result {
        Ok(count) => {
            tracing::trace!(
                "IPv4: sent {} bytes to {} in {} fragments",
                length,
                dst,
                count
            );
            iface.stats.frag_oks += 1;
            Ok(())
        }
        Err(e) => {
            iface.stats.frag_fails += 1;
            Err(e)
        }
    }
}

fn build_packet(header: &mut Ipv4Header, payload: &[&[u8]], length: usize) -> Vec<u8> {
    header.total_length = (IPV4_MIN_HEADER_LEN + length) as u16;
    let mut packet = vec![0u8; IPV4_MIN_HEADER_LEN];
    header.emit(&mut packet);
    Ipv4Header::fill_checksum(&mut packet, IPV4_MIN_HEADER_LEN);
    for chunk in payload {
        packet.extend_from_slice(chunk);
    }
    packet
}
