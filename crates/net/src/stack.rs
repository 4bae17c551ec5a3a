//! The network task.
//!
//! [`NetStack`] owns the [`NetContext`] and is the only code that touches
//! it. Applications talk to it through cloneable [`NetHandle`]s: each call
//! becomes a command on a bounded channel and is answered on a oneshot.
//! Calls that have to wait (connect, accept, send, receive, shutdown) are
//! parked and retried after every packet, tick or command until they
//! complete or their deadline passes.

use crate::context::NetContext;
use crate::error::{NetError, Result};
use crate::link::PacketLink;
use crate::socket::{Datagram, SocketId, SocketType};
use crate::stats::NetStats;
use crate::tcp::{SendFlags, Shutdown, SocketEvents, TcpState};

use buddy_core::{IpAddress, NetConfig};

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// Commands buffered between the handles and the task.
const COMMAND_QUEUE_LEN: usize = 64;

/// How often links are polled.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

type Reply<T> = oneshot::Sender<Result<T>>;
type Call = Box<dyn FnOnce(&mut NetContext, Instant) + Send>;

enum Command {
    /// Runs once and answers immediately.
    Call(Call),
    /// May have to wait.
    Wait(Operation, Duration),
}

/// A request that completes once the connection reaches the right state.
enum Operation {
    Connect {
        id: SocketId,
        remote: Ipv4Addr,
        port: u16,
        started: bool,
        reply: Reply<()>,
    },
    Accept {
        id: SocketId,
        reply: Reply<(SocketId, IpAddress, u16)>,
    },
    Send {
        id: SocketId,
        data: Vec<u8>,
        written: usize,
        flags: SendFlags,
        reply: Reply<usize>,
    },
    Receive {
        id: SocketId,
        max: usize,
        reply: Reply<Vec<u8>>,
    },
    ReceiveFrom {
        id: SocketId,
        reply: Reply<Datagram>,
    },
    Shutdown {
        id: SocketId,
        how: Shutdown,
        reply: Reply<()>,
    },
}

/// Answer `reply` unless the result says to keep waiting.
fn settle<T>(result: Result<T>, reply: Reply<T>) -> Option<Reply<T>> {
    match result {
        Err(NetError::WouldBlock) => Some(reply),
        result => {
            // The caller may have given up; nothing to do then.
            let _ = reply.send(result);
            None
        }
    }
}

impl Operation {
    /// Make progress. Returns the operation back when it still has to wait.
    fn attempt(self, ctx: &mut NetContext, now: Instant) -> Option<Self> {
        match self {
            Operation::Connect {
                id,
                remote,
                port,
                started,
                reply,
            } => {
                let result = if started {
                    ctx.connect_status(id)
                } else {
                    ctx.connect(id, remote, port, now)
                };
                settle(result, reply).map(|reply| Operation::Connect {
                    id,
                    remote,
                    port,
                    started: true,
                    reply,
                })
            }
            Operation::Accept { id, reply } => {
                settle(ctx.accept(id, now), reply).map(|reply| Operation::Accept { id, reply })
            }
            Operation::Send {
                id,
                data,
                mut written,
                flags,
                reply,
            } => {
                while written < data.len() {
                    match ctx.send(id, &data[written..], flags, now) {
                        Ok(0) | Err(NetError::WouldBlock) => {
                            return Some(Operation::Send {
                                id,
                                data,
                                written,
                                flags,
                                reply,
                            });
                        }
                        Ok(n) => written += n,
                        Err(e) => {
                            let _ = reply.send(Err(e));
                            return None;
                        }
                    }
                }
                let result = if flags.contains(SendFlags::WAIT_ACK) {
                    ctx.send_acked(id).map(|()| written)
                } else {
                    Ok(written)
                };
                settle(result, reply).map(|reply| Operation::Send {
                    id,
                    data,
                    written,
                    flags,
                    reply,
                })
            }
            Operation::Receive { id, max, reply } => {
                let mut buf = vec![0u8; max];
                let result = ctx.receive(id, &mut buf, now).map(|n| {
                    buf.truncate(n);
                    buf
                });
                settle(result, reply).map(|reply| Operation::Receive { id, max, reply })
            }
            Operation::ReceiveFrom { id, reply } => settle(ctx.receive_from(id), reply)
                .map(|reply| Operation::ReceiveFrom { id, reply }),
            Operation::Shutdown { id, how, reply } => settle(ctx.shutdown(id, how, now), reply)
                .map(|reply| Operation::Shutdown { id, how, reply }),
        }
    }

    /// The waiting side went away.
    fn is_abandoned(&self) -> bool {
        match self {
            Operation::Connect { reply, .. } | Operation::Shutdown { reply, .. } => {
                reply.is_closed()
            }
            Operation::Accept { reply, .. } => reply.is_closed(),
            Operation::Send { reply, .. } => reply.is_closed(),
            Operation::Receive { reply, .. } => reply.is_closed(),
            Operation::ReceiveFrom { reply, .. } => reply.is_closed(),
        }
    }

    fn time_out(self) {
        match self {
            Operation::Connect { reply, .. } | Operation::Shutdown { reply, .. } => {
                reply_timeout(reply)
            }
            Operation::Accept { reply, .. } => reply_timeout(reply),
            Operation::Send { reply, .. } => reply_timeout(reply),
            Operation::Receive { reply, .. } => reply_timeout(reply),
            Operation::ReceiveFrom { reply, .. } => reply_timeout(reply),
        }
    }
}

fn reply_timeout<T>(reply: Reply<T>) {
    let _ = reply.send(Err(NetError::Timeout));
}

struct Pending {
    operation: Operation,
    deadline: Instant,
}

/// Clock shared with tokio so paused test time drives the stack too.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// The single owner of all protocol state.
pub struct NetStack {
    ctx: NetContext,
    commands: mpsc::Receiver<Command>,
    pending: Vec<Pending>,
}

impl NetStack {
    /// Build the stack and the first handle to it.
    pub fn new(config: NetConfig, links: Vec<Box<dyn PacketLink>>) -> Result<(Self, NetHandle)> {
        Ok(Self::from_context(NetContext::new(config, links)?))
    }

    pub fn from_context(ctx: NetContext) -> (Self, NetHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_LEN);
        let handle = NetHandle {
            tx,
            timeout: ctx.config().sockets.timeout(),
        };
        let stack = Self {
            ctx,
            commands: rx,
            pending: Vec::new(),
        };
        (stack, handle)
    }

    /// Run until every handle has been dropped.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = interval.tick() => {
                    let now = now();
                    let waker = futures::task::noop_waker();
                    let mut cx = std::task::Context::from_waker(&waker);
                    self.ctx.poll_links(&mut cx, now);
                    self.ctx.poll_timers(now);
                }
            }
            self.retry_pending();
        }

        tracing::debug!(
            "network task stopping, {} request(s) still pending",
            self.pending.len()
        );
    }

    fn handle(&mut self, command: Command) {
        let now = now();
        match command {
            Command::Call(call) => call(&mut self.ctx, now),
            Command::Wait(operation, timeout) => {
                if let Some(operation) = operation.attempt(&mut self.ctx, now) {
                    self.pending.push(Pending {
                        operation,
                        deadline: now + timeout,
                    });
                }
            }
        }
    }

    fn retry_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let now = now();
        for pending in std::mem::take(&mut self.pending) {
            if pending.operation.is_abandoned() {
                continue;
            }
            if now >= pending.deadline {
                pending.operation.time_out();
                continue;
            }
            if let Some(operation) = pending.operation.attempt(&mut self.ctx, now) {
                self.pending.push(Pending {
                    operation,
                    deadline: pending.deadline,
                });
            }
        }
    }
}

/// Cloneable access to a running [`NetStack`].
#[derive(Clone)]
pub struct NetHandle {
    tx: mpsc::Sender<Command>,
    timeout: Duration,
}

impl NetHandle {
    /// Use `timeout` for the waiting calls made through this handle.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut NetContext, Instant) -> Result<T> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let call: Call = Box::new(move |ctx: &mut NetContext, now: Instant| {
            let _ = reply.send(f(ctx, now));
        });
        self.tx
            .send(Command::Call(call))
            .await
            .map_err(|_| NetError::StackClosed)?;
        rx.await.map_err(|_| NetError::StackClosed)?
    }

    async fn wait<T>(&self, operation: Operation, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        self.tx
            .send(Command::Wait(operation, self.timeout))
            .await
            .map_err(|_| NetError::StackClosed)?;
        rx.await.map_err(|_| NetError::StackClosed)?
    }

    pub async fn open(&self, kind: SocketType, protocol: u8) -> Result<SocketId> {
        self.call(move |ctx, _| ctx.open(kind, protocol)).await
    }

    pub async fn bind(&self, id: SocketId, addr: IpAddress, port: u16) -> Result<()> {
        self.call(move |ctx, _| ctx.bind(id, addr, port)).await
    }

    pub async fn bind_to_interface(&self, id: SocketId, index: Option<usize>) -> Result<()> {
        self.call(move |ctx, _| ctx.bind_to_interface(id, index)).await
    }

    pub async fn set_ttl(&self, id: SocketId, ttl: u8) -> Result<()> {
        self.call(move |ctx, _| ctx.set_ttl(id, ttl)).await
    }

    pub async fn listen(&self, id: SocketId, backlog: usize) -> Result<()> {
        self.call(move |ctx, now| ctx.listen(id, backlog, now)).await
    }

    /// Connect and wait for the handshake to finish.
    pub async fn connect(&self, id: SocketId, remote: Ipv4Addr, port: u16) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let operation = Operation::Connect {
            id,
            remote,
            port,
            started: false,
            reply,
        };
        self.wait(operation, rx).await
    }

    /// Wait for a connection request and accept it.
    pub async fn accept(&self, id: SocketId) -> Result<(SocketId, IpAddress, u16)> {
        let (reply, rx) = oneshot::channel();
        self.wait(Operation::Accept { id, reply }, rx).await
    }

    /// Send all of `data`, waiting for buffer space as needed. With
    /// [`SendFlags::WAIT_ACK`] this also waits for the peer's
    /// acknowledgment.
    pub async fn send(&self, id: SocketId, data: &[u8], flags: SendFlags) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        let operation = Operation::Send {
            id,
            data: data.to_vec(),
            written: 0,
            flags,
            reply,
        };
        self.wait(operation, rx).await
    }

    /// Wait for data and return up to `max` bytes of it.
    pub async fn receive(&self, id: SocketId, max: usize) -> Result<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.wait(Operation::Receive { id, max, reply }, rx).await
    }

    pub async fn send_to(
        &self,
        id: SocketId,
        dst: Ipv4Addr,
        port: u16,
        data: &[u8],
    ) -> Result<usize> {
        let data = data.to_vec();
        self.call(move |ctx, _| ctx.send_to(id, dst, port, &data))
            .await
    }

    /// Wait for the next datagram.
    pub async fn receive_from(&self, id: SocketId) -> Result<Datagram> {
        let (reply, rx) = oneshot::channel();
        self.wait(Operation::ReceiveFrom { id, reply }, rx).await
    }

    pub async fn shutdown(&self, id: SocketId, how: Shutdown) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.wait(Operation::Shutdown { id, how, reply }, rx).await
    }

    pub async fn abort(&self, id: SocketId) -> Result<()> {
        self.call(move |ctx, now| ctx.abort(id, now)).await
    }

    pub async fn close(&self, id: SocketId) -> Result<()> {
        self.call(move |ctx, now| ctx.close(id, now)).await
    }

    pub async fn state(&self, id: SocketId) -> Result<TcpState> {
        self.call(move |ctx, _| ctx.state(id)).await
    }

    pub async fn events(&self, id: SocketId) -> Result<SocketEvents> {
        self.call(move |ctx, _| ctx.events(id)).await
    }

    pub async fn join_multicast(&self, index: usize, group: Ipv4Addr) -> Result<()> {
        self.call(move |ctx, _| ctx.join_multicast(index, group))
            .await
    }

    pub async fn leave_multicast(&self, index: usize, group: Ipv4Addr) -> Result<()> {
        self.call(move |ctx, _| ctx.leave_multicast(index, group))
            .await
    }

    pub async fn stats(&self) -> Result<NetStats> {
        self.call(|ctx, _| Ok(ctx.stats())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{LinkPeer, channel_link};

    fn stack() -> (NetStack, NetHandle, LinkPeer) {
        let config = NetConfig::builder()
            .interface("eth0", "192.0.2.1/24")
            .build()
            .unwrap();
        let (link, peer) = channel_link(1500, 16);
        let (stack, handle) = NetStack::new(config, vec![Box::new(link)]).unwrap();
        (stack, handle, peer)
    }

    #[tokio::test]
    async fn dropping_handles_stops_the_task() {
        let (stack, handle, _peer) = stack();
        let task = tokio::spawn(stack.run());
        let id = handle.open(SocketType::Stream, 0).await.unwrap();
        assert_eq!(handle.state(id).await.unwrap(), TcpState::Closed);
        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stopped_task_reports_closed() {
        let (stack, handle, _peer) = stack();
        drop(stack);
        assert!(matches!(
            handle.open(SocketType::Dgram, 0).await,
            Err(NetError::StackClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn accept_times_out() {
        let (stack, handle, _peer) = stack();
        tokio::spawn(stack.run());
        let handle = handle.with_timeout(Duration::from_millis(50));

        let id = handle.open(SocketType::Stream, 0).await.unwrap();
        handle.bind(id, IpAddress::Unspecified, 80).await.unwrap();
        handle.listen(id, 0).await.unwrap();
        assert!(matches!(handle.accept(id).await, Err(NetError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn receive_from_wakes_on_datagram() {
        let (stack, handle, peer) = stack();
        tokio::spawn(stack.run());

        let id = handle.open(SocketType::Dgram, 0).await.unwrap();
        handle.bind(id, IpAddress::Unspecified, 5000).await.unwrap();

        let packet = crate::test_utils::udp_packet(
            "192.0.2.50:4000".parse().unwrap(),
            "192.0.2.1:5000".parse().unwrap(),
            b"hi",
        );
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.receive_from(id).await })
        };
        peer.tx.send(packet).await.unwrap();

        let datagram = waiter.await.unwrap().unwrap();
        assert_eq!(datagram.data, b"hi");
        assert_eq!(datagram.src_port, 4000);
    }
}
