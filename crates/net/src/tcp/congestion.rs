//! Congestion control hooks.
//!
//! The state machine calls into a [`CongestionControl`] at the points where
//! RFC 5681 adjusts the congestion window. The window itself lives in the
//! control block (`cwnd`, `ssthresh`, `dup_ack_count`), so one instance
//! serves every connection of the stack.

use super::TcpControlBlock;

/// Duplicate ACKs that trigger a fast retransmit.
pub const FAST_RETRANSMIT_THRESHOLD: u32 = 3;

/// Segments in the initial congestion window.
pub const INITIAL_WINDOW: u32 = 3;

pub trait CongestionControl: Send {
    /// A connection is about to send its SYN or SYN-ACK.
    fn on_open(&mut self, _tcb: &mut TcpControlBlock) {}

    /// `acked` new bytes were acknowledged. `rtt_sampled` is true when the
    /// acknowledgment completed a round-trip measurement.
    fn on_ack(&mut self, _tcb: &mut TcpControlBlock, _acked: u32, _rtt_sampled: bool) {}

    /// A duplicate ACK was counted in `tcb.dup_ack_count`. Returning true
    /// retransmits the head of the queue.
    fn on_duplicate_ack(&mut self, _tcb: &mut TcpControlBlock) -> bool {
        false
    }

    fn on_retransmit_timeout(&mut self, _tcb: &mut TcpControlBlock) {}

    /// Upper bound on unacknowledged data, on top of the peer's window.
    fn send_window_limit(&self, _tcb: &TcpControlBlock) -> Option<u32> {
        None
    }
}

/// Sends whatever the peer's window allows.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCongestionControl;

impl CongestionControl for NoCongestionControl {}

/// Slow start, congestion avoidance and fast retransmit (RFC 5681).
#[derive(Debug, Default, Clone, Copy)]
pub struct Reno;

impl CongestionControl for Reno {
    fn on_open(&mut self, tcb: &mut TcpControlBlock) {
        tcb.cwnd = (INITIAL_WINDOW * tcb.smss).min(tcb.tx_buffer_size as u32);
        tcb.ssthresh = u32::from(u16::MAX);
        tcb.dup_ack_count = 0;
    }

    fn on_ack(&mut self, tcb: &mut TcpControlBlock, acked: u32, rtt_sampled: bool) {
        if tcb.cwnd < tcb.ssthresh {
            tcb.cwnd += acked.min(tcb.smss);
        } else if rtt_sampled {
            tcb.cwnd += tcb.smss;
        }
        tcb.cwnd = tcb.cwnd.min(tcb.tx_buffer_size as u32);
    }

    fn on_duplicate_ack(&mut self, tcb: &mut TcpControlBlock) -> bool {
        if tcb.dup_ack_count != FAST_RETRANSMIT_THRESHOLD {
            return false;
        }
        tcb.ssthresh = (tcb.flight_size() / 2).max(2 * tcb.smss);
        tcb.cwnd = tcb.ssthresh;
        tracing::debug!(
            "TCP: fast retransmit, ssthresh {} cwnd {}",
            tcb.ssthresh,
            tcb.cwnd
        );
        true
    }

    fn on_retransmit_timeout(&mut self, tcb: &mut TcpControlBlock) {
        tcb.ssthresh = (tcb.flight_size() / 2).max(2 * tcb.smss);
        tcb.cwnd = tcb.smss;
        tcb.dup_ack_count = 0;
    }

    fn send_window_limit(&self, tcb: &TcpControlBlock) -> Option<u32> {
        Some(tcb.cwnd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buddy_core::TcpConfig;

    fn tcb() -> TcpControlBlock {
        let mut tcb = TcpControlBlock::new(&TcpConfig::default());
        tcb.smss = 536;
        tcb
    }

    #[test]
    fn slow_start_then_avoidance() {
        let mut cc = Reno;
        let mut tcb = tcb();
        cc.on_open(&mut tcb);
        assert_eq!(tcb.cwnd, 1608);

        cc.on_ack(&mut tcb, 1000, false);
        assert_eq!(tcb.cwnd, 2144);

        tcb.ssthresh = 2000;
        cc.on_ack(&mut tcb, 536, false);
        assert_eq!(tcb.cwnd, 2144);
        cc.on_ack(&mut tcb, 536, true);
        assert_eq!(tcb.cwnd, 2680);

        cc.on_ack(&mut tcb, 536, true);
        assert_eq!(tcb.cwnd, 2860, "clamped to the send buffer");
    }

    #[test]
    fn third_duplicate_triggers_retransmit() {
        let mut cc = Reno;
        let mut tcb = tcb();
        cc.on_open(&mut tcb);
        tcb.snd_una = 1000;
        tcb.snd_nxt = 5000;

        for count in 1..=2 {
            tcb.dup_ack_count = count;
            assert!(!cc.on_duplicate_ack(&mut tcb));
        }
        tcb.dup_ack_count = 3;
        assert!(cc.on_duplicate_ack(&mut tcb));
        assert_eq!(tcb.ssthresh, 2000);
        assert_eq!(tcb.cwnd, 2000);
    }

    #[test]
    fn timeout_collapses_window() {
        let mut cc = Reno;
        let mut tcb = tcb();
        cc.on_open(&mut tcb);
        cc.on_retransmit_timeout(&mut tcb);
        assert_eq!(tcb.cwnd, 536);
        assert_eq!(tcb.ssthresh, 1072);
    }

    #[test]
    fn default_hooks_do_nothing() {
        let mut cc = NoCongestionControl;
        let mut tcb = tcb();
        cc.on_open(&mut tcb);
        assert!(!cc.on_duplicate_ack(&mut tcb));
        assert_eq!(cc.send_window_limit(&tcb), None);
        assert_eq!(tcb.cwnd, 0);
    }
}
