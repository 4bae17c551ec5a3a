//! Transmission Control Protocol.
//!
//! The control block lives inside each stream [`Socket`](crate::socket::Socket).
//! Inbound segments enter through [`fsm::process_segment`], timers through
//! [`timer::tick`] and application requests through the functions in
//! [`api`]. Everything that needs to reach the network goes through a
//! [`TcpEnv`], which borrows the interfaces and counters from the owning
//! context for the duration of one call.

pub mod api;
pub mod congestion;
pub mod fsm;
mod misc;
mod output;
pub mod timer;

pub use congestion::{CongestionControl, NoCongestionControl, Reno};

use crate::iface::Interface;
use crate::stats::TcpStats;
use crate::wire::TcpFlags;

use bitflags::bitflags;
use buddy_core::{IpAddress, TcpConfig};

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Out-of-order blocks remembered by the receiver.
pub const MAX_SACK_BLOCKS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TcpState {
    #[default]
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN-SENT",
            TcpState::SynReceived => "SYN-RECEIVED",
            TcpState::Established => "ESTABLISHED",
            TcpState::CloseWait => "CLOSE-WAIT",
            TcpState::LastAck => "LAST-ACK",
            TcpState::FinWait1 => "FIN-WAIT-1",
            TcpState::FinWait2 => "FIN-WAIT-2",
            TcpState::Closing => "CLOSING",
            TcpState::TimeWait => "TIME-WAIT",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Conditions an application may wait on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SocketEvents: u16 {
        const CONNECTED = 0x0001;
        const CLOSED = 0x0002;
        const TX_READY = 0x0004;
        const TX_DONE = 0x0008;
        const TX_ACKED = 0x0010;
        const TX_SHUTDOWN = 0x0020;
        const RX_READY = 0x0040;
        const RX_SHUTDOWN = 0x0080;
        const ACCEPT = 0x0100;
    }
}

bitflags! {
    /// Per-call send options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SendFlags: u8 {
        /// Push everything the windows allow, bypassing Nagle.
        const NO_DELAY = 0x01;
        /// Only ever send full-sized segments.
        const DELAY = 0x02;
        /// Complete only once the peer acknowledged all the data.
        const WAIT_ACK = 0x04;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Send,
    Receive,
    Both,
}

/// A one-shot timer driven by the periodic tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetTimer {
    started: Option<Instant>,
    interval: Duration,
}

impl NetTimer {
    pub fn start(&mut self, now: Instant, interval: Duration) {
        self.started = Some(now);
        self.interval = interval;
    }

    pub fn stop(&mut self) {
        self.started = None;
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.started
            .is_some_and(|start| now.saturating_duration_since(start) >= self.interval)
    }
}

/// Circular byte store indexed by sequence-number offsets.
#[derive(Debug, Default)]
pub(crate) struct RingBuffer {
    data: Vec<u8>,
}

impl RingBuffer {
    pub(crate) fn allocate(&mut self, size: usize) {
        self.data = vec![0; size];
    }

    pub(crate) fn release(&mut self) {
        self.data = Vec::new();
    }

    pub(crate) fn capacity(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn write(&mut self, offset: usize, src: &[u8]) {
        let size = self.data.len();
        if size == 0 {
            return;
        }
        let first = src.len().min(size - offset);
        self.data[offset..offset + first].copy_from_slice(&src[..first]);
        let rest = src.len() - first;
        self.data[..rest].copy_from_slice(&src[first..]);
    }

    pub(crate) fn read(&self, offset: usize, dst: &mut [u8]) {
        let (a, b) = self.slices(offset, dst.len());
        dst[..a.len()].copy_from_slice(a);
        dst[a.len()..a.len() + b.len()].copy_from_slice(b);
    }

    /// The `len` bytes at `offset` as at most two contiguous pieces.
    pub(crate) fn slices(&self, offset: usize, len: usize) -> (&[u8], &[u8]) {
        let size = self.data.len();
        if size == 0 || len == 0 {
            return (&[], &[]);
        }
        let len = len.min(size);
        let first = len.min(size - offset);
        (&self.data[offset..offset + first], &self.data[..len - first])
    }
}

/// A connection request waiting in a listener's backlog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynQueueItem {
    pub iface: usize,
    pub src: IpAddress,
    pub dst: IpAddress,
    pub src_port: u16,
    pub isn: u32,
    pub mss: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SackBlock {
    pub left: u32,
    pub right: u32,
}

/// An unacknowledged segment; its payload stays in the send buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetransmitItem {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub length: usize,
}

/// Per-connection TCP state.
#[derive(Debug, Default)]
pub struct TcpControlBlock {
    pub(crate) state: TcpState,
    /// The application still holds the socket.
    pub(crate) owned: bool,
    pub(crate) reset_flag: bool,
    pub(crate) closed_flag: bool,

    pub(crate) iss: u32,
    pub(crate) irs: u32,
    pub(crate) snd_una: u32,
    pub(crate) snd_nxt: u32,
    /// Bytes written by the application but not yet sent.
    pub(crate) snd_user: usize,
    pub(crate) snd_wnd: u32,
    pub(crate) max_snd_wnd: u32,
    pub(crate) snd_wl1: u32,
    pub(crate) snd_wl2: u32,
    pub(crate) rcv_nxt: u32,
    /// Bytes received but not yet read by the application.
    pub(crate) rcv_user: usize,
    pub(crate) rcv_wnd: u32,
    pub(crate) smss: u32,
    pub(crate) rmss: u32,

    pub(crate) rto: Duration,
    pub(crate) srtt: Duration,
    pub(crate) rttvar: Duration,
    pub(crate) rtt_busy: bool,
    pub(crate) rtt_start: Option<Instant>,
    pub(crate) rtt_seq: u32,

    pub(crate) retransmit_queue: VecDeque<RetransmitItem>,
    pub(crate) retransmit_timer: NetTimer,
    pub(crate) retransmit_count: u32,
    pub(crate) persist_timer: NetTimer,
    pub(crate) wnd_probe_count: u32,
    pub(crate) wnd_probe_interval: Duration,
    pub(crate) override_timer: NetTimer,
    pub(crate) fin_wait2_timer: NetTimer,
    pub(crate) time_wait_timer: NetTimer,

    pub(crate) tx_buffer_size: usize,
    pub(crate) rx_buffer_size: usize,
    pub(crate) tx: RingBuffer,
    pub(crate) rx: RingBuffer,
    pub(crate) sack_blocks: heapless::Vec<SackBlock, MAX_SACK_BLOCKS>,

    pub(crate) syn_queue: VecDeque<SynQueueItem>,
    pub(crate) syn_queue_size: usize,

    pub(crate) events: SocketEvents,

    /// Congestion window, maintained by the [`CongestionControl`] in use.
    pub cwnd: u32,
    pub ssthresh: u32,
    pub dup_ack_count: u32,
}

impl TcpControlBlock {
    pub(crate) fn new(config: &TcpConfig) -> Self {
        Self {
            owned: true,
            tx_buffer_size: config.tx_buffer_size,
            rx_buffer_size: config.rx_buffer_size,
            rto: config.initial_rto(),
            syn_queue_size: config.default_syn_queue_size,
            ..Default::default()
        }
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn events(&self) -> SocketEvents {
        self.events
    }

    pub fn smss(&self) -> u32 {
        self.smss
    }

    pub fn snd_una(&self) -> u32 {
        self.snd_una
    }

    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt
    }

    pub fn rcv_wnd(&self) -> u32 {
        self.rcv_wnd
    }

    pub fn snd_wnd(&self) -> u32 {
        self.snd_wnd
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn syn_queue(&self) -> impl Iterator<Item = &SynQueueItem> {
        self.syn_queue.iter()
    }

    /// Bytes sent but not yet acknowledged.
    pub fn flight_size(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    pub fn is_time_wait_armed(&self) -> bool {
        self.time_wait_timer.is_running()
    }

    pub fn is_fin_wait2_armed(&self) -> bool {
        self.fin_wait2_timer.is_running()
    }

    pub(crate) fn allocate_buffers(&mut self) {
        self.tx.allocate(self.tx_buffer_size);
        self.rx.allocate(self.rx_buffer_size);
    }

    fn tx_offset(&self, seq: u32) -> usize {
        match self.tx.capacity() {
            0 => 0,
            size => seq.wrapping_sub(self.iss).wrapping_sub(1) as usize % size,
        }
    }

    fn rx_offset(&self, seq: u32) -> usize {
        match self.rx.capacity() {
            0 => 0,
            size => seq.wrapping_sub(self.irs).wrapping_sub(1) as usize % size,
        }
    }

    pub(crate) fn write_tx(&mut self, seq: u32, data: &[u8]) {
        let offset = self.tx_offset(seq);
        self.tx.write(offset, data);
    }

    pub(crate) fn tx_slices(&self, seq: u32, len: usize) -> (&[u8], &[u8]) {
        self.tx.slices(self.tx_offset(seq), len)
    }

    pub(crate) fn write_rx(&mut self, seq: u32, data: &[u8]) {
        let offset = self.rx_offset(seq);
        self.rx.write(offset, data);
    }

    pub(crate) fn read_rx(&self, seq: u32, dst: &mut [u8]) {
        self.rx.read(self.rx_offset(seq), dst);
    }

    /// Drop everything tied to the connection except its addressing. Data
    /// the application has not read yet stays available.
    pub(crate) fn delete_control_block(&mut self) {
        self.retransmit_queue.clear();
        self.retransmit_timer.stop();
        self.persist_timer.stop();
        self.override_timer.stop();
        self.syn_queue.clear();
        self.sack_blocks.clear();
        self.tx.release();
        if self.rcv_user == 0 {
            self.rx.release();
        }
    }

    pub(crate) fn change_state(&mut self, new_state: TcpState) {
        if new_state == TcpState::Closed {
            if matches!(self.state, TcpState::LastAck | TcpState::TimeWait) {
                self.closed_flag = true;
            } else {
                self.reset_flag = true;
            }
        }
        tracing::trace!("TCP: {} -> {}", self.state, new_state);
        self.state = new_state;
        self.update_events();
    }

    /// Recompute the event flags from the current state and counters.
    pub(crate) fn update_events(&mut self) {
        use TcpState::*;

        let mut events = match self.state {
            Established | FinWait1 => SocketEvents::CONNECTED,
            FinWait2 => SocketEvents::CONNECTED | SocketEvents::TX_SHUTDOWN,
            CloseWait | LastAck | Closing => SocketEvents::CONNECTED | SocketEvents::RX_SHUTDOWN,
            TimeWait | Closed => {
                SocketEvents::CLOSED | SocketEvents::TX_SHUTDOWN | SocketEvents::RX_SHUTDOWN
            }
            Listen | SynSent | SynReceived => SocketEvents::empty(),
        };

        match self.state {
            SynSent | SynReceived => {
                events |= SocketEvents::TX_DONE | SocketEvents::TX_ACKED;
            }
            Established | CloseWait => {
                if self.snd_user + (self.flight_size() as usize) < self.tx_buffer_size {
                    events |= SocketEvents::TX_READY;
                }
                if self.snd_user == 0 {
                    events |= SocketEvents::TX_DONE;
                    if crate::wire::seq_cmp(self.snd_una, self.snd_nxt) >= 0 {
                        events |= SocketEvents::TX_ACKED;
                    }
                }
            }
            Listen => {}
            _ => {
                events |= SocketEvents::TX_READY | SocketEvents::TX_DONE | SocketEvents::TX_ACKED;
            }
        }

        match self.state {
            Established | FinWait1 | FinWait2 => {
                if self.rcv_user > 0 {
                    events |= SocketEvents::RX_READY;
                }
            }
            Listen => {
                if !self.syn_queue.is_empty() {
                    events |= SocketEvents::ACCEPT | SocketEvents::RX_READY;
                }
            }
            SynSent | SynReceived => {}
            _ => events |= SocketEvents::RX_READY,
        }

        self.events = events;
    }
}

/// What TCP borrows from the network context while it runs.
pub(crate) struct TcpEnv<'a> {
    pub ifaces: &'a mut [Interface],
    pub config: &'a TcpConfig,
    pub stats: &'a mut TcpStats,
    pub cc: &'a mut dyn CongestionControl,
    pub now: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_wraps() {
        let mut ring = RingBuffer::default();
        ring.allocate(8);
        ring.write(6, &[1, 2, 3, 4]);
        let (a, b) = ring.slices(6, 4);
        assert_eq!(a, &[1, 2]);
        assert_eq!(b, &[3, 4]);

        let mut out = [0u8; 4];
        ring.read(6, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn released_ring_is_empty() {
        let mut ring = RingBuffer::default();
        ring.allocate(4);
        ring.release();
        assert_eq!(ring.capacity(), 0);
        assert_eq!(ring.slices(0, 3), (&[][..], &[][..]));
    }

    #[test]
    fn sequence_offsets_follow_initial_numbers() {
        let mut tcb = TcpControlBlock::new(&TcpConfig {
            tx_buffer_size: 16,
            rx_buffer_size: 16,
            ..Default::default()
        });
        tcb.allocate_buffers();
        tcb.iss = u32::MAX - 2;
        tcb.write_tx(u32::MAX - 1, b"abc");
        let (a, b) = tcb.tx_slices(u32::MAX - 1, 3);
        assert_eq!([a, b].concat(), b"abc");
        assert_eq!(a.len(), 3);

        tcb.irs = 100;
        tcb.write_rx(101 + 14, b"wxyz");
        let mut out = [0u8; 4];
        tcb.read_rx(101 + 14, &mut out);
        assert_eq!(&out, b"wxyz");
    }

    #[test]
    fn closing_from_last_ack_is_graceful() {
        let mut tcb = TcpControlBlock::new(&TcpConfig::default());
        tcb.state = TcpState::LastAck;
        tcb.change_state(TcpState::Closed);
        assert!(tcb.closed_flag);
        assert!(!tcb.reset_flag);

        let mut tcb = TcpControlBlock::new(&TcpConfig::default());
        tcb.state = TcpState::Established;
        tcb.change_state(TcpState::Closed);
        assert!(tcb.reset_flag);
        assert!(tcb.events.contains(SocketEvents::CLOSED | SocketEvents::RX_SHUTDOWN));
    }

    #[test]
    fn established_events_track_buffers() {
        let mut tcb = TcpControlBlock::new(&TcpConfig::default());
        tcb.state = TcpState::Established;
        tcb.snd_una = 10;
        tcb.snd_nxt = 10;
        tcb.update_events();
        assert!(tcb.events.contains(
            SocketEvents::CONNECTED
                | SocketEvents::TX_READY
                | SocketEvents::TX_DONE
                | SocketEvents::TX_ACKED
        ));
        assert!(!tcb.events.contains(SocketEvents::RX_READY));

        tcb.snd_nxt = 20;
        tcb.rcv_user = 5;
        tcb.update_events();
        assert!(tcb.events.contains(SocketEvents::TX_DONE | SocketEvents::RX_READY));
        assert!(!tcb.events.contains(SocketEvents::TX_ACKED));

        tcb.snd_user = tcb.tx_buffer_size;
        tcb.update_events();
        assert!(!tcb.events.contains(SocketEvents::TX_READY));
    }

    #[test]
    fn listener_signals_pending_connections() {
        let mut tcb = TcpControlBlock::new(&TcpConfig::default());
        tcb.state = TcpState::Listen;
        tcb.update_events();
        assert!(tcb.events.is_empty());

        tcb.syn_queue.push_back(SynQueueItem {
            iface: 0,
            src: IpAddress::Unspecified,
            dst: IpAddress::Unspecified,
            src_port: 1,
            isn: 0,
            mss: 536,
        });
        tcb.update_events();
        assert_eq!(tcb.events, SocketEvents::ACCEPT | SocketEvents::RX_READY);
    }

    #[test]
    fn timer_expiry() {
        let now = Instant::now();
        let mut timer = NetTimer::default();
        assert!(!timer.expired(now));
        timer.start(now, Duration::from_millis(100));
        assert!(!timer.expired(now + Duration::from_millis(99)));
        assert!(timer.expired(now + Duration::from_millis(100)));
        timer.stop();
        assert!(!timer.is_running());
    }
}
