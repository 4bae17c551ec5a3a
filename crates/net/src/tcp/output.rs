//! Segment construction and transmission.

use super::{RetransmitItem, SendFlags, TcpEnv, TcpState};
use crate::error::{NetError, Result};
use crate::ipv4;
use crate::link::TxAncillary;
use crate::pseudo::{Ipv4PseudoHeader, PseudoHeader};
use crate::socket::Socket;
use crate::wire::{IpProtocol, TCP_MIN_HEADER_LEN, TcpFlags, TcpHeader, emit_mss_option};

use std::net::Ipv4Addr;

/// Header plus the MSS option carried on SYN segments.
const MAX_HEADER_LEN: usize = TCP_MIN_HEADER_LEN + 4;

const NO_PAYLOAD: (&[u8], &[u8]) = (&[], &[]);

fn build_header(sock: &Socket, flags: TcpFlags, seq: u32, ack: u32) -> ([u8; MAX_HEADER_LEN], usize) {
    let tcb = &sock.tcp;
    let header_len = if flags.contains(TcpFlags::SYN) {
        MAX_HEADER_LEN
    } else {
        TCP_MIN_HEADER_LEN
    };

    let mut buf = [0u8; MAX_HEADER_LEN];
    TcpHeader {
        src_port: sock.local_port,
        dst_port: sock.remote_port,
        seq,
        ack: if flags.contains(TcpFlags::ACK) { ack } else { 0 },
        data_offset: (header_len / 4) as u8,
        flags,
        window: tcb.rcv_wnd.min(u32::from(u16::MAX)) as u16,
        checksum: 0,
        urgent: 0,
    }
    .emit(&mut buf);

    if flags.contains(TcpFlags::SYN) {
        emit_mss_option(&mut buf[TCP_MIN_HEADER_LEN..], tcb.rmss.min(u32::from(u16::MAX)) as u16);
    }
    (buf, header_len)
}

fn endpoints(sock: &Socket) -> Result<(usize, Ipv4Addr, Ipv4Addr)> {
    let iface = sock.interface.ok_or(NetError::NotConnected)?;
    let src = sock.local_addr.as_v4().ok_or(NetError::InvalidAddress)?;
    let dst = sock.remote_addr.as_v4().ok_or(NetError::InvalidAddress)?;
    Ok((iface, src, dst))
}

/// Checksum `header` over the pseudo-header and payload chunks, then hand
/// the segment to IP.
fn transmit(
    env: &mut TcpEnv<'_>,
    iface: usize,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    header: &mut [u8],
    payload: (&[u8], &[u8]),
    ttl: u8,
) -> Result<()> {
    let (a, b) = payload;
    let total = header.len() + a.len() + b.len();
    let pseudo = Ipv4PseudoHeader::new(src, dst, IpProtocol::Tcp.into(), total as u16);
    let sum = PseudoHeader::from(pseudo).checksum_scattered(&[&*header, a, b], 0, total);
    TcpHeader::set_checksum(header, sum);

    ipv4::send_datagram(
        env.ifaces,
        iface,
        &pseudo,
        &[&*header, a, b],
        &TxAncillary { ttl, dscp: 0 },
    )
}

/// Send one segment on a connection. `length` payload bytes are read from
/// the send buffer starting at `seq`. Segments added to the retransmission
/// queue arm the RTO timer and may start a round-trip measurement.
pub(crate) fn send_segment(
    env: &mut TcpEnv<'_>,
    sock: &mut Socket,
    flags: TcpFlags,
    seq: u32,
    ack: u32,
    length: usize,
    add_to_queue: bool,
) -> Result<()> {
    let (iface, src, dst) = endpoints(sock)?;
    let (mut header, header_len) = build_header(sock, flags, seq, ack);

    let tcb = &mut sock.tcp;
    if add_to_queue {
        tcb.retransmit_queue.push_back(RetransmitItem {
            seq,
            ack,
            flags,
            length,
        });
        if !tcb.rtt_busy {
            tcb.rtt_start = Some(env.now);
            tcb.rtt_seq = seq;
            tcb.rtt_busy = true;
        }
        if !tcb.retransmit_timer.is_running() {
            tcb.retransmit_timer.start(env.now, tcb.rto);
            tcb.retransmit_count = 0;
        }
    }

    env.stats.out_segs += 1;
    if flags.contains(TcpFlags::RST) {
        env.stats.out_rsts += 1;
    }
    tracing::trace!(
        "TCP: {}:{} -> {}:{} {:?} seq={} ack={} win={} len={}",
        src,
        sock.local_port,
        dst,
        sock.remote_port,
        flags,
        seq,
        ack,
        sock.tcp.rcv_wnd,
        length
    );

    let payload = sock.tcp.tx_slices(seq, length);
    transmit(env, iface, src, dst, &mut header[..header_len], payload, sock.ttl)
}

/// Acknowledge everything received so far. Failures are only logged: the
/// peer retransmits and the ACK is regenerated.
pub(crate) fn send_ack(env: &mut TcpEnv<'_>, sock: &mut Socket) {
    let (seq, ack) = (sock.tcp.snd_nxt, sock.tcp.rcv_nxt);
    if let Err(e) = send_segment(env, sock, TcpFlags::ACK, seq, ack, 0, false) {
        tracing::debug!("TCP: failed to send ACK: {}", e);
    }
}

/// Reset a connection that is synchronized.
pub(crate) fn send_reset(env: &mut TcpEnv<'_>, sock: &mut Socket, seq: u32) -> Result<()> {
    match sock.tcp.state {
        TcpState::SynReceived
        | TcpState::Established
        | TcpState::FinWait1
        | TcpState::FinWait2
        | TcpState::CloseWait => send_segment(env, sock, TcpFlags::RST, seq, 0, 0, false),
        _ => Ok(()),
    }
}

/// Answer a segment that belongs to no connection with a RST (RFC 793,
/// "If the connection does not exist").
pub(crate) fn reject_segment(
    env: &mut TcpEnv<'_>,
    iface: usize,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    segment: &TcpHeader,
    length: usize,
) -> Result<()> {
    let (flags, seq, ack) = if segment.flags.contains(TcpFlags::ACK) {
        (TcpFlags::RST, segment.ack, 0)
    } else {
        let mut ack = segment.seq.wrapping_add(length as u32);
        if segment.flags.contains(TcpFlags::SYN) {
            ack = ack.wrapping_add(1);
        }
        if segment.flags.contains(TcpFlags::FIN) {
            ack = ack.wrapping_add(1);
        }
        (TcpFlags::RST | TcpFlags::ACK, 0, ack)
    };

    let mut header = [0u8; TCP_MIN_HEADER_LEN];
    TcpHeader {
        src_port: segment.dst_port,
        dst_port: segment.src_port,
        seq,
        ack,
        data_offset: (TCP_MIN_HEADER_LEN / 4) as u8,
        flags,
        window: 0,
        checksum: 0,
        urgent: 0,
    }
    .emit(&mut header);

    env.stats.out_segs += 1;
    env.stats.out_rsts += 1;
    tracing::debug!(
        "TCP: rejecting segment {}:{} -> {}:{}",
        src,
        segment.src_port,
        dst,
        segment.dst_port
    );
    transmit(env, iface, dst, src, &mut header, NO_PAYLOAD, 0)
}

/// Resend queued segments from the head, up to one SMSS of payload.
pub(crate) fn retransmit_segment(env: &mut TcpEnv<'_>, sock: &mut Socket) -> Result<()> {
    let (iface, src, dst) = endpoints(sock)?;
    let mut total = 0;
    for index in 0..sock.tcp.retransmit_queue.len() {
        let item = sock.tcp.retransmit_queue[index];
        total += item.length;
        if total > sock.tcp.smss as usize {
            break;
        }

        let (mut header, header_len) = build_header(sock, item.flags, item.seq, item.ack);
        env.stats.retrans_segs += 1;
        tracing::debug!(
            "TCP: retransmitting seq={} len={} to {}:{}",
            item.seq,
            item.length,
            dst,
            sock.remote_port
        );
        let payload = sock.tcp.tx_slices(item.seq, item.length);
        transmit(env, iface, src, dst, &mut header[..header_len], payload, sock.ttl)?;
    }
    Ok(())
}

/// Nagle's algorithm (RFC 896, RFC 1122 4.2.3.4): push unsent data when a
/// full segment is available, when nothing is in flight, or when at least
/// half the peer's largest window can be filled.
pub(crate) fn nagle(env: &mut TcpEnv<'_>, sock: &mut Socket, flags: SendFlags) -> Result<()> {
    let tcb = &sock.tcp;
    let mut window = tcb.snd_wnd.min(tcb.tx_buffer_size as u32);
    if let Some(limit) = env.cc.send_window_limit(tcb) {
        window = window.min(limit);
    }
    let mut usable = i64::from(window) - i64::from(tcb.flight_size());

    while sock.tcp.snd_user > 0 && usable > 0 {
        let tcb = &sock.tcp;
        let available = tcb.snd_user.min(usable as usize);
        let n = available.min(tcb.smss as usize);
        if n == 0 {
            break;
        }

        let full_segment = available >= tcb.smss as usize;
        let send = if flags.contains(SendFlags::NO_DELAY) {
            true
        } else if flags.contains(SendFlags::DELAY) {
            full_segment
        } else {
            full_segment
                || (tcb.snd_nxt == tcb.snd_una && tcb.snd_user <= usable as usize)
                || available >= (tcb.max_snd_wnd / 2) as usize
        };
        if !send {
            break;
        }

        let (seq, ack) = (tcb.snd_nxt, tcb.rcv_nxt);
        send_segment(env, sock, TcpFlags::PSH | TcpFlags::ACK, seq, ack, n, true)?;
        sock.tcp.snd_nxt = seq.wrapping_add(n as u32);
        sock.tcp.snd_user -= n;
        usable -= n as i64;
    }

    sock.tcp.update_events();
    Ok(())
}
