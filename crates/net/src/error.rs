use std::io;

/// Status codes surfaced by the protocol engine.
///
/// The admission variants (`InvalidLength`, `InvalidHeader`,
/// `InvalidAddress`, `ProtocolUnreachable`, `PortUnreachable`) classify why a
/// packet was dropped; the IP layer keys its counters and ICMP replies off
/// them. The socket variants are what connection-control calls report.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] buddy_core::Error),

    #[error("invalid length")]
    InvalidLength,

    #[error("invalid header")]
    InvalidHeader,

    #[error("invalid address")]
    InvalidAddress,

    #[error("protocol unreachable")]
    ProtocolUnreachable,

    #[error("port unreachable")]
    PortUnreachable,

    #[error("out of resources")]
    OutOfResources,

    #[error("message too long")]
    MessageTooLong,

    #[error("no route to host")]
    NoRoute,

    #[error("no source address configured")]
    NotConfigured,

    #[error("invalid socket")]
    InvalidSocket,

    #[error("operation not valid in current state")]
    InvalidState,

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("connection failed")]
    ConnectionFailed,

    #[error("connection reset")]
    ConnectionReset,

    #[error("connection closing")]
    ConnectionClosing,

    #[error("end of stream")]
    EndOfStream,

    #[error("operation would block")]
    WouldBlock,

    #[error("operation timed out")]
    Timeout,

    #[error("network stack is not running")]
    StackClosed,
}

pub type Result<T> = std::result::Result<T, NetError>;
