//! Inbound segment processing: validation, connection lookup and the
//! per-state transition rules of RFC 793 section 3.9.

use super::misc::{
    adopt_window, check_ack, check_seq_num, check_syn, compute_rto, is_duplicate_syn,
    process_data, update_retransmit_queue,
};
use super::output::{nagle, reject_segment, send_ack, send_reset, send_segment};
use super::{SendFlags, SynQueueItem, TcpEnv, TcpState};
use crate::pseudo::{Ipv4PseudoHeader, PseudoHeader};
use crate::socket::{Socket, SocketTable};
use crate::wire::{
    IpProtocol, TCP_MIN_HEADER_LEN, TcpFlags, TcpHeader, find_mss_option, seq_cmp,
};

use std::net::Ipv4Addr;

/// A validated inbound segment.
#[derive(Debug)]
pub(crate) struct Segment<'a> {
    pub iface: usize,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub header: TcpHeader,
    pub options: &'a [u8],
    pub data: &'a [u8],
}

impl Segment<'_> {
    fn has(&self, flag: TcpFlags) -> bool {
        self.header.flags.contains(flag)
    }

    /// Sequence number just past the payload.
    fn end(&self) -> u32 {
        self.header.seq.wrapping_add(self.data.len() as u32)
    }
}

/// Entry point for a TCP segment carried in an admitted IPv4 datagram.
pub(crate) fn process_segment(
    env: &mut TcpEnv<'_>,
    sockets: &mut SocketTable,
    iface: usize,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    bytes: &[u8],
) {
    env.stats.in_segs += 1;

    let Some(interface) = env.ifaces.get(iface) else {
        return;
    };
    if interface.is_broadcast(dst) || dst.is_multicast() {
        tracing::trace!("TCP: dropping segment sent to {}", dst);
        return;
    }

    let header = match TcpHeader::parse(bytes) {
        Ok(header) => header,
        Err(_) => {
            tracing::debug!("TCP: truncated segment ({} bytes) from {}", bytes.len(), src);
            env.stats.in_errs += 1;
            return;
        }
    };
    let header_len = header.header_len();
    if header_len < TCP_MIN_HEADER_LEN || header_len > bytes.len() {
        tracing::debug!("TCP: bad data offset {} from {}", header.data_offset, src);
        env.stats.in_errs += 1;
        return;
    }

    let pseudo = Ipv4PseudoHeader::new(src, dst, IpProtocol::Tcp.into(), bytes.len() as u16);
    if PseudoHeader::from(pseudo).checksum(bytes) != 0 {
        tracing::debug!("TCP: checksum error from {}:{}", src, header.src_port);
        env.stats.in_errs += 1;
        return;
    }

    let seg = Segment {
        iface,
        src,
        dst,
        header,
        options: &bytes[TCP_MIN_HEADER_LEN..header_len],
        data: &bytes[header_len..],
    };

    let Some(index) = sockets.find_tcp(iface, src, dst, seg.header.src_port, seg.header.dst_port)
    else {
        if !seg.has(TcpFlags::RST)
            && let Err(e) = reject_segment(env, iface, src, dst, &seg.header, seg.data.len())
        {
            tracing::debug!("TCP: failed to send RST: {}", e);
        }
        return;
    };

    let sock = sockets.slot_mut(index);
    match sock.tcp.state {
        TcpState::Closed => on_closed(env, &seg),
        TcpState::Listen => on_listen(env, sock, &seg),
        TcpState::SynSent => on_syn_sent(env, sock, &seg),
        TcpState::SynReceived => on_syn_received(env, sock, &seg),
        TcpState::Established => on_established(env, sock, &seg),
        TcpState::CloseWait => on_close_wait(env, sock, &seg),
        TcpState::LastAck => on_last_ack(env, sock, &seg),
        TcpState::FinWait1 => on_fin_wait_1(env, sock, &seg),
        TcpState::FinWait2 => on_fin_wait_2(env, sock, &seg),
        TcpState::Closing => on_closing(env, sock, &seg),
        TcpState::TimeWait => on_time_wait(env, sock, &seg),
    }
}

fn on_closed(env: &mut TcpEnv<'_>, seg: &Segment<'_>) {
    if seg.has(TcpFlags::RST) {
        return;
    }
    if let Err(e) = reject_segment(env, seg.iface, seg.src, seg.dst, &seg.header, seg.data.len()) {
        tracing::debug!("TCP: failed to send RST: {}", e);
    }
}

fn on_listen(env: &mut TcpEnv<'_>, sock: &mut Socket, seg: &Segment<'_>) {
    if seg.has(TcpFlags::RST) {
        return;
    }
    if seg.has(TcpFlags::ACK) {
        on_closed(env, seg);
        return;
    }
    if !seg.has(TcpFlags::SYN) || is_duplicate_syn(&sock.tcp, seg) {
        return;
    }

    let tcb = &mut sock.tcp;
    while tcb.syn_queue.len() >= tcb.syn_queue_size.max(1) {
        if let Some(evicted) = tcb.syn_queue.pop_front() {
            tracing::debug!(
                "TCP: SYN backlog full on port {}, dropping request from {}:{}",
                sock.local_port,
                evicted.src,
                evicted.src_port
            );
        }
    }

    let mss = find_mss_option(seg.options)
        .map(|mss| env.config.clamp_mss(mss))
        .unwrap_or_else(|| env.config.effective_default_mss());
    tcb.syn_queue.push_back(SynQueueItem {
        iface: seg.iface,
        src: seg.src.into(),
        dst: seg.dst.into(),
        src_port: seg.header.src_port,
        isn: seg.header.seq,
        mss,
    });
    tracing::debug!(
        "TCP: connection request from {}:{} queued on port {}",
        seg.src,
        seg.header.src_port,
        sock.local_port
    );
    sock.tcp.update_events();
}

fn on_syn_sent(env: &mut TcpEnv<'_>, sock: &mut Socket, seg: &Segment<'_>) {
    if seg.has(TcpFlags::ACK) && seg.header.ack != sock.tcp.snd_nxt {
        if !seg.has(TcpFlags::RST)
            && let Err(e) = send_segment(env, sock, TcpFlags::RST, seg.header.ack, 0, 0, false)
        {
            tracing::debug!("TCP: failed to send RST: {}", e);
        }
        return;
    }

    if seg.has(TcpFlags::RST) {
        if seg.has(TcpFlags::ACK) {
            tracing::debug!("TCP: connection to {} refused", seg.src);
            sock.tcp.change_state(TcpState::Closed);
            env.stats.attempt_fails += 1;
        }
        return;
    }
    if !seg.has(TcpFlags::SYN) {
        return;
    }

    let tcb = &mut sock.tcp;
    tcb.irs = seg.header.seq;
    tcb.rcv_nxt = seg.header.seq.wrapping_add(1);
    if seg.has(TcpFlags::ACK) {
        tcb.snd_una = seg.header.ack;
    }
    compute_rto(env.config, env.now, tcb);
    update_retransmit_queue(env.now, tcb);
    if let Some(mss) = find_mss_option(seg.options) {
        tcb.smss = u32::from(env.config.clamp_mss(mss));
    }

    if seq_cmp(tcb.snd_una, tcb.iss) > 0 {
        adopt_window(tcb, seg.header.seq, seg.header.ack, u32::from(seg.header.window));
        send_ack(env, sock);
        sock.tcp.change_state(TcpState::Established);
    } else {
        // Simultaneous open.
        sock.tcp.change_state(TcpState::SynReceived);
        let (iss, rcv_nxt) = (sock.tcp.iss, sock.tcp.rcv_nxt);
        if let Err(e) = send_segment(env, sock, TcpFlags::SYN | TcpFlags::ACK, iss, rcv_nxt, 0, true) {
            tracing::debug!("TCP: failed to send SYN-ACK: {}", e);
        }
    }
}

fn on_syn_received(env: &mut TcpEnv<'_>, sock: &mut Socket, seg: &Segment<'_>) {
    if !check_seq_num(env, sock, seg) {
        return;
    }
    if seg.has(TcpFlags::RST) {
        sock.tcp.change_state(TcpState::Closed);
        env.stats.attempt_fails += 1;
        return;
    }
    if !check_syn(env, sock, seg) || !seg.has(TcpFlags::ACK) {
        return;
    }
    if seg.header.ack != sock.tcp.snd_nxt {
        if let Err(e) = send_reset(env, sock, seg.header.ack) {
            tracing::debug!("TCP: failed to send RST: {}", e);
        }
        return;
    }

    adopt_window(
        &mut sock.tcp,
        seg.header.seq,
        seg.header.ack,
        u32::from(seg.header.window),
    );
    sock.tcp.change_state(TcpState::Established);
    tracing::debug!(
        "TCP: connection with {}:{} established",
        seg.src,
        seg.header.src_port
    );
    on_established(env, sock, seg);
}

/// Sequence, RST and SYN checks followed by ACK processing. Returns false
/// when the segment was consumed.
fn synchronized_checks(env: &mut TcpEnv<'_>, sock: &mut Socket, seg: &Segment<'_>) -> bool {
    if !check_seq_num(env, sock, seg) {
        return false;
    }
    if seg.has(TcpFlags::RST) {
        if matches!(sock.tcp.state, TcpState::Established | TcpState::CloseWait) {
            env.stats.estab_resets += 1;
        }
        tracing::debug!("TCP: connection reset by {}:{}", seg.src, seg.header.src_port);
        sock.tcp.change_state(TcpState::Closed);
        return false;
    }
    check_syn(env, sock, seg) && check_ack(env, sock, seg)
}

fn push_pending(env: &mut TcpEnv<'_>, sock: &mut Socket) {
    let flags = if sock.tcp.dup_ack_count > 0 {
        SendFlags::NO_DELAY
    } else {
        SendFlags::empty()
    };
    if let Err(e) = nagle(env, sock, flags) {
        tracing::debug!("TCP: failed to send pending data: {}", e);
    }
}

/// The peer's FIN is in order once every byte before it was received.
fn fin_in_order(sock: &Socket, seg: &Segment<'_>) -> bool {
    seg.has(TcpFlags::FIN) && sock.tcp.rcv_nxt == seg.end()
}

fn accept_fin(env: &mut TcpEnv<'_>, sock: &mut Socket) {
    sock.tcp.rcv_nxt = sock.tcp.rcv_nxt.wrapping_add(1);
    send_ack(env, sock);
}

fn enter_time_wait(env: &mut TcpEnv<'_>, sock: &mut Socket) {
    sock.tcp.delete_control_block();
    sock.tcp.time_wait_timer.start(env.now, env.config.msl2_timeout());
    sock.tcp.change_state(TcpState::TimeWait);
}

fn on_established(env: &mut TcpEnv<'_>, sock: &mut Socket, seg: &Segment<'_>) {
    if !synchronized_checks(env, sock, seg) {
        return;
    }
    if !seg.data.is_empty() {
        process_data(env, sock, seg);
    }
    if fin_in_order(sock, seg) {
        accept_fin(env, sock);
        sock.tcp.change_state(TcpState::CloseWait);
    }
    push_pending(env, sock);
}

fn on_close_wait(env: &mut TcpEnv<'_>, sock: &mut Socket, seg: &Segment<'_>) {
    if !synchronized_checks(env, sock, seg) {
        return;
    }
    push_pending(env, sock);
}

fn on_last_ack(env: &mut TcpEnv<'_>, sock: &mut Socket, seg: &Segment<'_>) {
    if !check_seq_num(env, sock, seg) {
        return;
    }
    if seg.has(TcpFlags::RST) {
        sock.tcp.change_state(TcpState::Closed);
        return;
    }
    if !check_syn(env, sock, seg) || !seg.has(TcpFlags::ACK) {
        return;
    }
    if seg.header.ack == sock.tcp.snd_nxt {
        sock.tcp.change_state(TcpState::Closed);
    }
}

fn on_fin_wait_1(env: &mut TcpEnv<'_>, sock: &mut Socket, seg: &Segment<'_>) {
    if !synchronized_checks(env, sock, seg) {
        return;
    }
    if seg.header.ack == sock.tcp.snd_nxt {
        sock.tcp
            .fin_wait2_timer
            .start(env.now, env.config.fin_wait2_timeout());
        sock.tcp.change_state(TcpState::FinWait2);
    }
    if !seg.data.is_empty() {
        process_data(env, sock, seg);
    }
    if fin_in_order(sock, seg) {
        accept_fin(env, sock);
        if seg.header.ack == sock.tcp.snd_nxt {
            enter_time_wait(env, sock);
        } else {
            sock.tcp.change_state(TcpState::Closing);
        }
    }
}

fn on_fin_wait_2(env: &mut TcpEnv<'_>, sock: &mut Socket, seg: &Segment<'_>) {
    if !synchronized_checks(env, sock, seg) {
        return;
    }
    if !seg.data.is_empty() {
        process_data(env, sock, seg);
    }
    if fin_in_order(sock, seg) {
        accept_fin(env, sock);
        enter_time_wait(env, sock);
    }
}

fn on_closing(env: &mut TcpEnv<'_>, sock: &mut Socket, seg: &Segment<'_>) {
    if !synchronized_checks(env, sock, seg) {
        return;
    }
    if seg.header.ack == sock.tcp.snd_nxt {
        enter_time_wait(env, sock);
    }
}

fn on_time_wait(env: &mut TcpEnv<'_>, sock: &mut Socket, seg: &Segment<'_>) {
    // A retransmitted FIN sits one below rcv_nxt and fails the window check.
    if seg.has(TcpFlags::FIN)
        && !seg.has(TcpFlags::RST)
        && seg.data.is_empty()
        && seg.header.seq == sock.tcp.rcv_nxt.wrapping_sub(1)
    {
        send_ack(env, sock);
        sock.tcp
            .time_wait_timer
            .start(env.now, env.config.msl2_timeout());
        return;
    }
    if !check_seq_num(env, sock, seg) {
        return;
    }
    if seg.has(TcpFlags::RST) {
        sock.tcp.change_state(TcpState::Closed);
        if !sock.tcp.owned {
            sock.tcp.delete_control_block();
            sock.release();
        }
        return;
    }
    if !check_syn(env, sock, seg) || !seg.has(TcpFlags::ACK) {
        return;
    }
    if seg.has(TcpFlags::FIN) {
        send_ack(env, sock);
        sock.tcp
            .time_wait_timer
            .start(env.now, env.config.msl2_timeout());
    }
}
