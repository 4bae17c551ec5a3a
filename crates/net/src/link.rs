use std::io;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Per-packet metadata handed to the link layer with an outbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxAncillary {
    /// Time-to-live; 0 selects the stack default.
    pub ttl: u8,
    /// Differentiated services code point.
    pub dscp: u8,
}

/// Abstraction for IP packet transport below the stack.
///
/// Implementations carry whole IPv4 packets: link framing and address
/// resolution happen on the far side of this trait.
pub trait PacketLink: Send + 'static {
    /// Maximum transmission unit (typically 1500 for ethernet).
    fn mtu(&self) -> usize {
        1500
    }

    /// Poll for an incoming packet.
    ///
    /// Returns the number of bytes read into `buf` when a packet is available.
    fn poll_recv(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>>;

    /// Send an IP packet.
    fn send(&mut self, packet: &[u8], ancillary: &TxAncillary) -> io::Result<()>;
}

/// The far end of a [`ChannelLink`]: inject packets into the stack through
/// `tx` and collect what the stack transmits from `rx`.
pub struct LinkPeer {
    pub tx: mpsc::Sender<Vec<u8>>,
    pub rx: mpsc::Receiver<Vec<u8>>,
}

/// A link backed by a pair of tokio channels.
pub struct ChannelLink {
    mtu: usize,
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

/// Create a channel-backed link and its peer.
pub fn channel_link(mtu: usize, buffer: usize) -> (ChannelLink, LinkPeer) {
    let (to_stack_tx, to_stack_rx) = mpsc::channel(buffer);
    let (from_stack_tx, from_stack_rx) = mpsc::channel(buffer);
    (
        ChannelLink {
            mtu,
            tx: from_stack_tx,
            rx: to_stack_rx,
        },
        LinkPeer {
            tx: to_stack_tx,
            rx: from_stack_rx,
        },
    )
}

impl PacketLink for ChannelLink {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(packet)) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Poll::Ready(Ok(len))
            }
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "link peer closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn send(&mut self, packet: &[u8], _ancillary: &TxAncillary) -> io::Result<()> {
        self.tx
            .try_send(packet.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::WouldBlock, e.to_string()))
    }
}
