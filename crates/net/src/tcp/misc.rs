//! Checks and bookkeeping shared by the per-state handlers.
//!
//! The `check_*` functions return `true` when processing of the segment
//! should continue; a `false` return means the segment was consumed, with any
//! reply already sent.

use super::fsm::Segment;
use super::output::{retransmit_segment, send_ack, send_reset, send_segment};
use super::{SackBlock, TcpControlBlock, TcpEnv};
use crate::socket::Socket;
use crate::wire::{TcpFlags, seq_cmp};

use buddy_core::{IpAddress, TcpConfig};

use std::time::{Duration, Instant};

/// Segment acceptability test (RFC 793 3.3).
pub(crate) fn check_seq_num(env: &mut TcpEnv<'_>, sock: &mut Socket, seg: &Segment<'_>) -> bool {
    let tcb = &sock.tcp;
    let seq = seg.header.seq;
    let length = seg.data.len() as u32;
    let rcv_nxt = tcb.rcv_nxt;
    let window_end = rcv_nxt.wrapping_add(tcb.rcv_wnd);
    let in_window = |n: u32| seq_cmp(n, rcv_nxt) >= 0 && seq_cmp(n, window_end) < 0;

    let acceptable = match (length, tcb.rcv_wnd) {
        (0, 0) => seq == rcv_nxt,
        (0, _) => in_window(seq),
        (_, 0) => false,
        (_, _) => in_window(seq) || in_window(seq.wrapping_add(length - 1)),
    };
    if acceptable {
        return true;
    }

    tracing::trace!(
        "TCP: unacceptable seq={} len={} (rcv_nxt={} rcv_wnd={})",
        seq,
        length,
        rcv_nxt,
        tcb.rcv_wnd
    );
    if !seg.header.flags.contains(TcpFlags::RST) {
        send_ack(env, sock);
    }
    false
}

/// A SYN inside the window is an error: reset the connection's peer.
pub(crate) fn check_syn(env: &mut TcpEnv<'_>, sock: &mut Socket, seg: &Segment<'_>) -> bool {
    if !seg.header.flags.contains(TcpFlags::SYN) {
        return true;
    }

    let result = if seg.header.flags.contains(TcpFlags::ACK) {
        send_reset(env, sock, seg.header.ack)
    } else {
        let ack = seg
            .header
            .seq
            .wrapping_add(seg.data.len() as u32)
            .wrapping_add(1);
        send_segment(env, sock, TcpFlags::RST | TcpFlags::ACK, 0, ack, 0, false)
    };
    if let Err(e) = result {
        tracing::debug!("TCP: failed to reset after unexpected SYN: {}", e);
    }
    false
}

/// Process the acknowledgment field: advance SND.UNA, update the send
/// window and retransmission queue, and feed the congestion controller.
pub(crate) fn check_ack(env: &mut TcpEnv<'_>, sock: &mut Socket, seg: &Segment<'_>) -> bool {
    let header = &seg.header;
    if !header.flags.contains(TcpFlags::ACK) {
        return false;
    }

    let tcb = &sock.tcp;
    if seq_cmp(header.ack, tcb.snd_una) < 0 {
        return true;
    }
    if seq_cmp(header.ack, tcb.snd_nxt) > 0 {
        tracing::trace!(
            "TCP: ACK {} acknowledges unsent data (snd_nxt={})",
            header.ack,
            tcb.snd_nxt
        );
        send_ack(env, sock);
        return false;
    }

    let duplicate = is_duplicate_ack(tcb, seg);
    update_send_window(env.config, env.now, &mut sock.tcp, seg);

    let tcb = &mut sock.tcp;
    if seq_cmp(header.ack, tcb.snd_una) > 0 {
        let mut acked = header.ack.wrapping_sub(tcb.snd_una);
        if tcb.snd_una == tcb.iss {
            acked -= 1;
        }
        tcb.snd_una = header.ack;
        let sampled = compute_rto(env.config, env.now, tcb);
        update_retransmit_queue(env.now, tcb);
        tcb.dup_ack_count = 0;
        env.cc.on_ack(tcb, acked, sampled);
    } else {
        if duplicate {
            tcb.dup_ack_count += 1;
        } else {
            tcb.dup_ack_count = 0;
        }
        if env.cc.on_duplicate_ack(tcb)
            && let Err(e) = retransmit_segment(env, sock)
        {
            tracing::debug!("TCP: fast retransmit failed: {}", e);
        }
    }

    sock.tcp.update_events();
    true
}

/// A SYN from the same peer endpoint is already waiting in the backlog.
pub(crate) fn is_duplicate_syn(tcb: &TcpControlBlock, seg: &Segment<'_>) -> bool {
    tcb.syn_queue.iter().any(|item| {
        item.iface == seg.iface
            && item.src == IpAddress::V4(seg.src)
            && item.dst == IpAddress::V4(seg.dst)
            && item.src_port == seg.header.src_port
    })
}

/// RFC 5681 definition: no payload, no SYN/FIN, same ACK, same window, with
/// data outstanding.
pub(crate) fn is_duplicate_ack(tcb: &TcpControlBlock, seg: &Segment<'_>) -> bool {
    !tcb.retransmit_queue.is_empty()
        && seg.data.is_empty()
        && !seg.header.flags.intersects(TcpFlags::SYN | TcpFlags::FIN)
        && seg.header.ack == tcb.snd_una
        && u32::from(seg.header.window) == tcb.snd_wnd
}

/// Copy in-window payload into the receive buffer and acknowledge it.
pub(crate) fn process_data(env: &mut TcpEnv<'_>, sock: &mut Socket, seg: &Segment<'_>) {
    let tcb = &mut sock.tcp;
    let mut left = seg.header.seq;
    let mut right = left.wrapping_add(seg.data.len() as u32);
    let mut offset = 0usize;

    if seq_cmp(left, tcb.rcv_nxt) < 0 {
        offset = tcb.rcv_nxt.wrapping_sub(left) as usize;
        left = tcb.rcv_nxt;
    }
    let window_end = tcb.rcv_nxt.wrapping_add(tcb.rcv_wnd);
    if seq_cmp(right, window_end) > 0 {
        right = window_end;
    }
    if seq_cmp(right, left) <= 0 {
        send_ack(env, sock);
        return;
    }

    let length = right.wrapping_sub(left) as usize;
    tcb.write_rx(left, &seg.data[offset..offset + length]);

    let (left, right) = update_sack_blocks(tcb, left, right);
    if seq_cmp(left, tcb.rcv_nxt) > 0 {
        // Out of order: the duplicate ACK tells the peer where the gap is.
        send_ack(env, sock);
        return;
    }

    let length = right.wrapping_sub(left);
    tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(length);
    tcb.rcv_user += length as usize;
    tcb.rcv_wnd = tcb.rcv_wnd.saturating_sub(length);
    send_ack(env, sock);
    sock.tcp.update_events();
}

/// Merge `[left, right)` with every overlapping out-of-order block. The
/// merged range is recorded as the most recent block when it is still
/// ahead of RCV.NXT.
pub(crate) fn update_sack_blocks(tcb: &mut TcpControlBlock, left: u32, right: u32) -> (u32, u32) {
    let (mut left, mut right) = (left, right);
    let mut i = 0;
    while i < tcb.sack_blocks.len() {
        let block = tcb.sack_blocks[i];
        if seq_cmp(right, block.left) >= 0 && seq_cmp(left, block.right) <= 0 {
            if seq_cmp(block.left, left) < 0 {
                left = block.left;
            }
            if seq_cmp(block.right, right) > 0 {
                right = block.right;
            }
            tcb.sack_blocks.remove(i);
        } else {
            i += 1;
        }
    }

    if seq_cmp(left, tcb.rcv_nxt) > 0 {
        if tcb.sack_blocks.is_full() {
            tcb.sack_blocks.pop();
        }
        // Capacity was just ensured.
        let _ = tcb.sack_blocks.insert(0, SackBlock { left, right });
    }
    (left, right)
}

/// Window update rules of RFC 1122 4.2.2.20 with SND.WL1/SND.WL2. A window
/// closing to zero arms the persist timer.
pub(crate) fn update_send_window(
    config: &TcpConfig,
    now: Instant,
    tcb: &mut TcpControlBlock,
    seg: &Segment<'_>,
) {
    let (seq, ack) = (seg.header.seq, seg.header.ack);
    let window = u32::from(seg.header.window);

    if seq == tcb.snd_wl1 && ack == tcb.snd_wl2 {
        if window > tcb.snd_wnd {
            adopt_window(tcb, seq, ack, window);
        }
    } else if seq_cmp(seq, tcb.snd_wl1) >= 0 && seq_cmp(ack, tcb.snd_wl2) >= 0 {
        if window == 0 && tcb.snd_wnd != 0 {
            tcb.wnd_probe_count = 0;
            tcb.wnd_probe_interval = config.probe_interval();
            tcb.persist_timer.start(now, tcb.wnd_probe_interval);
        }
        adopt_window(tcb, seq, ack, window);
    }
}

pub(crate) fn adopt_window(tcb: &mut TcpControlBlock, seq: u32, ack: u32, window: u32) {
    tcb.snd_wnd = window;
    tcb.snd_wl1 = seq;
    tcb.snd_wl2 = ack;
    tcb.max_snd_wnd = tcb.max_snd_wnd.max(window);
}

/// Reopen the receive window after the application consumed data, without
/// advertising small increments (receiver-side SWS avoidance).
pub(crate) fn update_receive_window(env: &mut TcpEnv<'_>, sock: &mut Socket) {
    let tcb = &mut sock.tcp;
    let reduction = (tcb.rx_buffer_size as u32)
        .saturating_sub(tcb.rcv_user as u32)
        .saturating_sub(tcb.rcv_wnd);
    let threshold = tcb.rmss.min(tcb.rx_buffer_size as u32 / 2);

    if tcb.rcv_wnd + reduction < threshold {
        return;
    }
    let was_small = tcb.rcv_wnd < threshold;
    tcb.rcv_wnd += reduction;
    if was_small {
        tracing::trace!("TCP: receive window update to {}", tcb.rcv_wnd);
        send_ack(env, sock);
    }
}

/// RFC 6298 estimator. Returns true when a round-trip sample was taken.
pub(crate) fn compute_rto(config: &TcpConfig, now: Instant, tcb: &mut TcpControlBlock) -> bool {
    if !tcb.rtt_busy || seq_cmp(tcb.snd_una, tcb.rtt_seq) <= 0 {
        return false;
    }
    let Some(start) = tcb.rtt_start else {
        return false;
    };

    let r = now.saturating_duration_since(start);
    if tcb.srtt.is_zero() && tcb.rttvar.is_zero() {
        tcb.srtt = r;
        tcb.rttvar = r / 2;
    } else {
        let delta = if r > tcb.srtt { r - tcb.srtt } else { tcb.srtt - r };
        tcb.rttvar = (tcb.rttvar * 3 + delta) / 4;
        tcb.srtt = (tcb.srtt * 7 + r) / 8;
    }
    tcb.rto = (tcb.srtt + tcb.rttvar * 4).clamp(config.min_rto(), config.max_rto());
    tcb.rtt_busy = false;

    tracing::trace!(
        "TCP: RTT sample {:?}, srtt {:?} rttvar {:?} rto {:?}",
        r,
        tcb.srtt,
        tcb.rttvar,
        tcb.rto
    );
    true
}

/// Drop fully acknowledged segments from the retransmission queue. Every
/// removal restarts the RTO timer; an empty queue stops it.
pub(crate) fn update_retransmit_queue(now: Instant, tcb: &mut TcpControlBlock) {
    let snd_una = tcb.snd_una;
    let before = tcb.retransmit_queue.len();
    tcb.retransmit_queue.retain(|item| {
        let consumed = if item.flags.contains(TcpFlags::SYN) {
            1
        } else if item.flags.contains(TcpFlags::FIN) {
            item.length as u32 + 1
        } else {
            item.length as u32
        };
        seq_cmp(snd_una, item.seq.wrapping_add(consumed)) < 0
    });

    if tcb.retransmit_queue.len() != before {
        tcb.retransmit_timer.start(now, tcb.rto);
        tcb.retransmit_count = 0;
    }
    if tcb.retransmit_queue.is_empty() {
        tcb.retransmit_timer.stop();
    }
}

/// Double `value`, saturating at `max`.
pub(crate) fn backoff(value: Duration, max: Duration) -> Duration {
    value.saturating_mul(2).min(max)
}
