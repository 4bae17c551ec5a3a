//! Periodic TCP timer processing.

use super::misc::backoff;
use super::output::{nagle, retransmit_segment, send_segment};
use super::{SendFlags, TcpEnv, TcpState};
use crate::socket::{Socket, SocketTable, SocketType};
use crate::wire::TcpFlags;

/// Run every stream socket's timers against `env.now`.
pub(crate) fn tick(env: &mut TcpEnv<'_>, sockets: &mut SocketTable) {
    for sock in sockets.iter_mut() {
        if sock.kind != SocketType::Stream {
            continue;
        }
        retransmission(env, sock);
        persist(env, sock);
        override_timer(env, sock);
        fin_wait_2(env, sock);
        time_wait(env, sock);
    }
}

fn close_expired(sock: &mut Socket) {
    sock.tcp.change_state(TcpState::Closed);
    if !sock.tcp.owned {
        sock.tcp.delete_control_block();
        sock.release();
    }
}

fn retransmission(env: &mut TcpEnv<'_>, sock: &mut Socket) {
    if !sock.tcp.retransmit_timer.expired(env.now) {
        return;
    }

    if sock.tcp.retransmit_count >= env.config.max_retries {
        tracing::debug!(
            "TCP: connection to {}:{} timed out after {} retransmissions",
            sock.remote_addr,
            sock.remote_port,
            sock.tcp.retransmit_count
        );
        if matches!(sock.tcp.state, TcpState::SynSent | TcpState::SynReceived) {
            env.stats.attempt_fails += 1;
        }
        sock.tcp.retransmit_timer.stop();
        close_expired(sock);
        return;
    }

    if let Err(e) = retransmit_segment(env, sock) {
        tracing::debug!("TCP: retransmission failed: {}", e);
    }
    let tcb = &mut sock.tcp;
    tcb.rto = backoff(tcb.rto, env.config.max_rto());
    tcb.retransmit_timer.start(env.now, tcb.rto);
    tcb.retransmit_count += 1;
    env.cc.on_retransmit_timeout(tcb);
    // Karn's algorithm: no RTT sample from a retransmitted segment.
    tcb.rtt_busy = false;
}

fn persist(env: &mut TcpEnv<'_>, sock: &mut Socket) {
    if !sock.tcp.persist_timer.expired(env.now) {
        return;
    }
    if sock.tcp.snd_wnd != 0 {
        sock.tcp.persist_timer.stop();
        return;
    }

    // Zero window probe: an ACK one below SND.NXT forces the peer to
    // advertise its current window.
    let (seq, ack) = (sock.tcp.snd_nxt.wrapping_sub(1), sock.tcp.rcv_nxt);
    if let Err(e) = send_segment(env, sock, TcpFlags::ACK, seq, ack, 0, false) {
        tracing::debug!("TCP: window probe failed: {}", e);
    }
    let tcb = &mut sock.tcp;
    tcb.wnd_probe_count += 1;
    tcb.wnd_probe_interval = backoff(tcb.wnd_probe_interval, env.config.max_probe_interval());
    tcb.persist_timer.start(env.now, tcb.wnd_probe_interval);
}

fn override_timer(env: &mut TcpEnv<'_>, sock: &mut Socket) {
    if !sock.tcp.override_timer.expired(env.now) {
        return;
    }
    sock.tcp.override_timer.stop();
    if matches!(sock.tcp.state, TcpState::Established | TcpState::CloseWait)
        && let Err(e) = nagle(env, sock, SendFlags::NO_DELAY)
    {
        tracing::debug!("TCP: failed to flush send buffer: {}", e);
    }
}

fn fin_wait_2(env: &mut TcpEnv<'_>, sock: &mut Socket) {
    if !sock.tcp.fin_wait2_timer.expired(env.now) {
        return;
    }
    sock.tcp.fin_wait2_timer.stop();
    if sock.tcp.state == TcpState::FinWait2 {
        tracing::debug!("TCP: FIN-WAIT-2 timeout on port {}", sock.local_port);
        close_expired(sock);
    }
}

fn time_wait(env: &mut TcpEnv<'_>, sock: &mut Socket) {
    if !sock.tcp.time_wait_timer.expired(env.now) {
        return;
    }
    sock.tcp.time_wait_timer.stop();
    if sock.tcp.state == TcpState::TimeWait {
        sock.tcp.change_state(TcpState::Closed);
        sock.tcp.delete_control_block();
        if !sock.tcp.owned {
            sock.release();
        }
    }
}
