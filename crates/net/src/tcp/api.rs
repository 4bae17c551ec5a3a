//! Connection control operations.
//!
//! Each function performs one non-blocking step. A condition the caller has
//! to wait for is reported as [`NetError::WouldBlock`]; the network task
//! parks the request and calls the same function again after the next
//! packet or tick.

use super::misc::update_receive_window;
use super::output::{nagle, send_reset, send_segment};
use super::{SendFlags, Shutdown, SocketEvents, TcpEnv, TcpState};
use crate::error::{NetError, Result};
use crate::ipv4;
use crate::socket::{Socket, SocketId, SocketTable, SocketType};
use crate::wire::{IpProtocol, TcpFlags};

use buddy_core::IpAddress;

use std::net::Ipv4Addr;

pub(crate) fn stream(sockets: &mut SocketTable, id: SocketId) -> Result<&mut Socket> {
    let sock = sockets.get_mut(id)?;
    if sock.kind != SocketType::Stream {
        return Err(NetError::InvalidSocket);
    }
    Ok(sock)
}

/// Initial values shared by both ends of a new connection.
fn open_control_block(env: &mut TcpEnv<'_>, sock: &mut Socket, smss: u16) {
    let rx_buffer_size = sock.tcp.rx_buffer_size;
    let tcb = &mut sock.tcp;
    tcb.owned = true;
    tcb.allocate_buffers();
    tcb.smss = u32::from(smss);
    tcb.rmss = (rx_buffer_size as u32).min(u32::from(env.config.max_mss));
    tcb.iss = rand::random();
    tcb.snd_una = tcb.iss;
    tcb.snd_nxt = tcb.iss.wrapping_add(1);
    tcb.rcv_user = 0;
    tcb.rcv_wnd = rx_buffer_size as u32;
    tcb.rto = env.config.initial_rto();
    env.cc.on_open(tcb);
}

/// Active open. The first call sends the SYN; later calls report progress.
pub(crate) fn connect(
    env: &mut TcpEnv<'_>,
    sockets: &mut SocketTable,
    id: SocketId,
    remote: Ipv4Addr,
    port: u16,
) -> Result<()> {
    let sock = stream(sockets, id)?;
    match sock.tcp.state {
        TcpState::Closed => {}
        TcpState::Listen => return Err(NetError::AlreadyConnected),
        _ => return connect_status(sock),
    }

    if sock.local_port == 0 {
        let port = sockets.dynamic_port(SocketType::Stream)?;
        stream(sockets, id)?.local_port = port;
    }
    let sock = stream(sockets, id)?;

    let (iface, src) = ipv4::select_route(env.ifaces, sock.interface, remote)?;
    sock.interface = Some(iface);
    if sock.local_addr.is_unspecified() {
        sock.local_addr = src.into();
    }
    sock.remote_addr = remote.into();
    sock.remote_port = port;
    sock.tcp.reset_flag = false;
    sock.tcp.closed_flag = false;

    let mss = env.config.effective_default_mss();
    open_control_block(env, sock, mss);
    let iss = sock.tcp.iss;
    if let Err(e) = send_segment(env, sock, TcpFlags::SYN, iss, 0, 0, true) {
        sock.tcp.delete_control_block();
        return Err(e);
    }
    sock.tcp.change_state(TcpState::SynSent);
    env.stats.active_opens += 1;
    tracing::debug!(
        "TCP: connecting {}:{} -> {}:{}",
        sock.local_addr,
        sock.local_port,
        remote,
        port
    );

    connect_status(sock)
}

pub(crate) fn connect_status(sock: &Socket) -> Result<()> {
    let events = sock.tcp.events;
    if events.contains(SocketEvents::CONNECTED) {
        Ok(())
    } else if events.contains(SocketEvents::CLOSED) {
        Err(NetError::ConnectionFailed)
    } else {
        Err(NetError::WouldBlock)
    }
}

/// Passive open. A zero `backlog` selects the configured default.
pub(crate) fn listen(env: &TcpEnv<'_>, sock: &mut Socket, backlog: usize) -> Result<()> {
    if sock.tcp.state != TcpState::Closed {
        return Err(NetError::AlreadyConnected);
    }
    let size = match backlog {
        0 => env.config.default_syn_queue_size,
        n => n,
    };
    sock.tcp.syn_queue_size = size.min(env.config.max_syn_queue_size);
    sock.tcp.reset_flag = false;
    sock.tcp.closed_flag = false;
    sock.tcp.change_state(TcpState::Listen);
    tracing::debug!(
        "TCP: listening on port {} (backlog {})",
        sock.local_port,
        sock.tcp.syn_queue_size
    );
    Ok(())
}

/// Take the oldest pending request off a listener and answer it with a
/// SYN-ACK from a freshly allocated socket.
pub(crate) fn accept(
    env: &mut TcpEnv<'_>,
    sockets: &mut SocketTable,
    id: SocketId,
) -> Result<(SocketId, IpAddress, u16)> {
    loop {
        let listener = stream(sockets, id)?;
        if listener.tcp.state != TcpState::Listen {
            return Err(NetError::NotConnected);
        }
        let Some(item) = listener.tcp.syn_queue.pop_front() else {
            return Err(NetError::WouldBlock);
        };
        listener.tcp.update_events();
        let local_port = listener.local_port;
        let (tx_size, rx_size) = (listener.tcp.tx_buffer_size, listener.tcp.rx_buffer_size);

        let new_id = match sockets.allocate(SocketType::Stream, IpProtocol::Tcp.into(), env.config) {
            Ok(new_id) => new_id,
            Err(e) => {
                tracing::debug!(
                    "TCP: dropping connection request from {}:{}: {}",
                    item.src,
                    item.src_port,
                    e
                );
                continue;
            }
        };

        let sock = sockets.slot_mut(new_id.index());
        sock.tcp.tx_buffer_size = tx_size;
        sock.tcp.rx_buffer_size = rx_size;
        sock.interface = Some(item.iface);
        sock.local_addr = item.dst;
        sock.local_port = local_port;
        sock.remote_addr = item.src;
        sock.remote_port = item.src_port;
        open_control_block(env, sock, item.mss);
        sock.tcp.irs = item.isn;
        sock.tcp.rcv_nxt = item.isn.wrapping_add(1);
        sock.tcp.change_state(TcpState::SynReceived);
        env.stats.passive_opens += 1;

        let (iss, rcv_nxt) = (sock.tcp.iss, sock.tcp.rcv_nxt);
        match send_segment(env, sock, TcpFlags::SYN | TcpFlags::ACK, iss, rcv_nxt, 0, true) {
            Ok(()) => {
                tracing::debug!(
                    "TCP: accepted {}:{} on port {} as {}",
                    item.src,
                    item.src_port,
                    local_port,
                    new_id
                );
                return Ok((new_id, item.src, item.src_port));
            }
            Err(e) => {
                tracing::debug!("TCP: failed to send SYN-ACK: {}", e);
                // The socket is fresh and owns nothing the caller could see.
                let _ = abort(env, sock);
            }
        }
    }
}

/// Copy as much of `data` as fits into the send buffer and let Nagle decide
/// what goes out now. Returns the number of bytes taken.
pub(crate) fn send(
    env: &mut TcpEnv<'_>,
    sock: &mut Socket,
    data: &[u8],
    flags: SendFlags,
) -> Result<usize> {
    if sock.tcp.state == TcpState::Listen {
        return Err(NetError::NotConnected);
    }
    if !sock.tcp.events.contains(SocketEvents::TX_READY) {
        return Err(NetError::WouldBlock);
    }
    match sock.tcp.state {
        TcpState::Established | TcpState::CloseWait => {}
        TcpState::LastAck
        | TcpState::FinWait1
        | TcpState::FinWait2
        | TcpState::Closing
        | TcpState::TimeWait => return Err(NetError::ConnectionClosing),
        _ if sock.tcp.reset_flag => return Err(NetError::ConnectionReset),
        _ => return Err(NetError::NotConnected),
    }

    let tcb = &mut sock.tcp;
    let used = tcb.snd_user + tcb.flight_size() as usize;
    if used >= tcb.tx_buffer_size {
        return Err(NetError::WouldBlock);
    }
    let n = (tcb.tx_buffer_size - used).min(data.len());
    if n > 0 {
        let seq = tcb.snd_nxt.wrapping_add(tcb.snd_user as u32);
        tcb.write_tx(seq, &data[..n]);
        tcb.snd_user += n;
        tcb.update_events();
        if tcb.snd_user == n {
            tcb.override_timer.start(env.now, env.config.override_timeout());
        }
    }
    nagle(env, sock, flags)?;
    Ok(n)
}

/// Completion check for a send that waits for the peer's acknowledgment.
pub(crate) fn send_acked(sock: &Socket) -> Result<()> {
    if !sock.tcp.events.contains(SocketEvents::TX_ACKED) {
        return Err(NetError::WouldBlock);
    }
    match sock.tcp.state {
        TcpState::Established | TcpState::CloseWait => Ok(()),
        _ => Err(NetError::NotConnected),
    }
}

/// Read buffered data. Once the peer's FIN was consumed this reports
/// [`NetError::EndOfStream`].
pub(crate) fn receive(env: &mut TcpEnv<'_>, sock: &mut Socket, buf: &mut [u8]) -> Result<usize> {
    let tcb = &sock.tcp;
    if tcb.state == TcpState::Listen {
        return Err(NetError::NotConnected);
    }
    if !tcb.events.contains(SocketEvents::RX_READY) {
        return Err(NetError::WouldBlock);
    }

    let unread = tcb.rcv_user as u32;
    // Past the FIN, RCV.NXT counts one more than the data.
    let seq = match tcb.state {
        TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {
            tcb.rcv_nxt.wrapping_sub(unread)
        }
        TcpState::CloseWait | TcpState::LastAck | TcpState::Closing | TcpState::TimeWait => {
            if unread == 0 {
                return Err(NetError::EndOfStream);
            }
            tcb.rcv_nxt.wrapping_sub(1).wrapping_sub(unread)
        }
        _ => {
            if tcb.reset_flag {
                return Err(NetError::ConnectionReset);
            }
            if !tcb.closed_flag {
                return Err(NetError::NotConnected);
            }
            if unread == 0 {
                return Err(NetError::EndOfStream);
            }
            tcb.rcv_nxt.wrapping_sub(1).wrapping_sub(unread)
        }
    };
    if unread == 0 {
        return Err(NetError::WouldBlock);
    }

    let n = tcb.rcv_user.min(buf.len());
    tcb.read_rx(seq, &mut buf[..n]);
    sock.tcp.rcv_user -= n;
    update_receive_window(env, sock);
    sock.tcp.update_events();
    Ok(n)
}

/// Close one or both directions. The send side flushes pending data, sends
/// a FIN and completes once the FIN is acknowledged; the receive side
/// completes once the peer's FIN arrived.
pub(crate) fn shutdown(env: &mut TcpEnv<'_>, sock: &mut Socket, how: Shutdown) -> Result<()> {
    if matches!(how, Shutdown::Send | Shutdown::Both) {
        shutdown_send(env, sock)?;
    }
    if matches!(how, Shutdown::Receive | Shutdown::Both) {
        match sock.tcp.state {
            TcpState::Listen => return Err(NetError::NotConnected),
            TcpState::SynSent
            | TcpState::SynReceived
            | TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2 => {
                if !sock.tcp.events.contains(SocketEvents::RX_SHUTDOWN) {
                    return Err(NetError::WouldBlock);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn shutdown_send(env: &mut TcpEnv<'_>, sock: &mut Socket) -> Result<()> {
    let next = match sock.tcp.state {
        TcpState::Closed | TcpState::Listen | TcpState::SynSent => {
            return Err(NetError::NotConnected);
        }
        // Not connected yet: the SYN-ACK exchange has to finish first.
        TcpState::SynReceived => return Err(NetError::WouldBlock),
        TcpState::Established => TcpState::FinWait1,
        TcpState::CloseWait => TcpState::LastAck,
        TcpState::FinWait1 | TcpState::Closing | TcpState::LastAck => {
            return tx_shutdown_status(sock);
        }
        TcpState::FinWait2 | TcpState::TimeWait => return Ok(()),
    };

    nagle(env, sock, SendFlags::NO_DELAY)?;
    if sock.tcp.snd_user > 0 {
        return Err(NetError::WouldBlock);
    }

    let (seq, ack) = (sock.tcp.snd_nxt, sock.tcp.rcv_nxt);
    send_segment(env, sock, TcpFlags::FIN | TcpFlags::ACK, seq, ack, 0, true)?;
    sock.tcp.snd_nxt = seq.wrapping_add(1);
    sock.tcp.change_state(next);
    tracing::debug!(
        "TCP: FIN sent to {}:{}, now {}",
        sock.remote_addr,
        sock.remote_port,
        next
    );
    tx_shutdown_status(sock)
}

fn tx_shutdown_status(sock: &Socket) -> Result<()> {
    if sock.tcp.events.contains(SocketEvents::TX_SHUTDOWN) {
        Ok(())
    } else {
        Err(NetError::WouldBlock)
    }
}

/// Drop the connection at once, resetting the peer when synchronized, and
/// free the record. A connection in TIME-WAIT lingers until its timer
/// expires and is recycled then.
pub(crate) fn abort(env: &mut TcpEnv<'_>, sock: &mut Socket) -> Result<()> {
    match sock.tcp.state {
        TcpState::SynReceived
        | TcpState::Established
        | TcpState::FinWait1
        | TcpState::FinWait2
        | TcpState::CloseWait => {
            let snd_nxt = sock.tcp.snd_nxt;
            let result = send_reset(env, sock, snd_nxt);
            sock.tcp.change_state(TcpState::Closed);
            sock.release();
            result
        }
        TcpState::TimeWait => {
            sock.tcp.owned = false;
            Ok(())
        }
        _ => {
            sock.tcp.change_state(TcpState::Closed);
            sock.release();
            Ok(())
        }
    }
}
