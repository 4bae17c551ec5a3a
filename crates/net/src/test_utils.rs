//! Helpers for driving the engine from tests: a link that records what the
//! stack transmits and builders for the packets a peer would send.

use crate::checksum;
use crate::link::{PacketLink, TxAncillary};
use crate::pseudo::{Ipv4PseudoHeader, PseudoHeader};
use crate::wire::{
    IPV4_FLAG_MF, IPV4_MIN_HEADER_LEN, IpProtocol, Ipv4Header, TCP_MIN_HEADER_LEN, TcpFlags,
    TcpHeader, UDP_HEADER_LEN, UdpHeader, emit_mss_option, find_mss_option,
};

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

/// Shared view of the packets a [`RecordingLink`] was asked to send.
#[derive(Clone, Default)]
pub struct Recorder {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Recorder {
    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A link that never receives and records every transmitted packet. Tests
/// feed inbound packets straight into
/// [`NetContext::receive_packet`](crate::NetContext::receive_packet).
pub struct RecordingLink {
    mtu: usize,
    recorder: Recorder,
}

impl RecordingLink {
    pub fn new(mtu: usize) -> (Self, Recorder) {
        let recorder = Recorder::default();
        (
            Self {
                mtu,
                recorder: recorder.clone(),
            },
            recorder,
        )
    }
}

impl PacketLink for RecordingLink {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn poll_recv(&mut self, _cx: &mut Context<'_>, _buf: &mut [u8]) -> Poll<io::Result<usize>> {
        Poll::Pending
    }

    fn send(&mut self, packet: &[u8], _ancillary: &TxAncillary) -> io::Result<()> {
        self.recorder.sent.lock().unwrap().push(packet.to_vec());
        Ok(())
    }
}

/// Wrap `payload` in an IPv4 header with a valid checksum.
pub fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
    ipv4_fragment(src, dst, protocol, 1, 0, false, payload)
}

/// One fragment of datagram `id`; `offset` is in bytes and must be a
/// multiple of 8.
pub fn ipv4_fragment(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    id: u16,
    offset: usize,
    more: bool,
    data: &[u8],
) -> Vec<u8> {
    let mut fragment = (offset / 8) as u16;
    if more {
        fragment |= IPV4_FLAG_MF;
    }
    let mut packet = vec![0u8; IPV4_MIN_HEADER_LEN];
    Ipv4Header {
        version: 4,
        ihl: 5,
        tos: 0,
        total_length: (IPV4_MIN_HEADER_LEN + data.len()) as u16,
        identification: id,
        fragment,
        ttl: 64,
        protocol,
        checksum: 0,
        src,
        dst,
    }
    .emit(&mut packet);
    Ipv4Header::fill_checksum(&mut packet, IPV4_MIN_HEADER_LEN);
    packet.extend_from_slice(data);
    packet
}

/// A UDP datagram inside an IPv4 packet.
pub fn udp_packet(src: SocketAddrV4, dst: SocketAddrV4, data: &[u8]) -> Vec<u8> {
    let length = UDP_HEADER_LEN + data.len();
    let mut datagram = vec![0u8; length];
    UdpHeader {
        src_port: src.port(),
        dst_port: dst.port(),
        length: length as u16,
        checksum: 0,
    }
    .emit(&mut datagram);
    datagram[UDP_HEADER_LEN..].copy_from_slice(data);
    let pseudo = Ipv4PseudoHeader::new(*src.ip(), *dst.ip(), IpProtocol::Udp.into(), length as u16);
    let sum = PseudoHeader::from(pseudo).checksum(&datagram);
    datagram[6..8].copy_from_slice(&sum.to_be_bytes());
    ipv4_packet(*src.ip(), *dst.ip(), IpProtocol::Udp.into(), &datagram)
}

/// Builder for the TCP segments a remote peer sends.
#[derive(Debug, Clone)]
pub struct SegmentBuilder {
    src: SocketAddrV4,
    dst: SocketAddrV4,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    mss: Option<u16>,
    payload: Vec<u8>,
}

impl SegmentBuilder {
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self {
            src,
            dst,
            seq: 0,
            ack: 0,
            flags: TcpFlags::empty(),
            window: 8192,
            mss: None,
            payload: Vec::new(),
        }
    }

    pub fn seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub fn ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self
    }

    pub fn flags(mut self, flags: TcpFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn window(mut self, window: u16) -> Self {
        self.window = window;
        self
    }

    pub fn mss(mut self, mss: u16) -> Self {
        self.mss = Some(mss);
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    /// The TCP segment alone, checksummed against the pseudo-header.
    pub fn segment(&self) -> Vec<u8> {
        let header_len = TCP_MIN_HEADER_LEN + if self.mss.is_some() { 4 } else { 0 };
        let mut segment = vec![0u8; header_len];
        TcpHeader {
            src_port: self.src.port(),
            dst_port: self.dst.port(),
            seq: self.seq,
            ack: self.ack,
            data_offset: (header_len / 4) as u8,
            flags: self.flags,
            window: self.window,
            checksum: 0,
            urgent: 0,
        }
        .emit(&mut segment);
        if let Some(mss) = self.mss {
            emit_mss_option(&mut segment[TCP_MIN_HEADER_LEN..], mss);
        }
        segment.extend_from_slice(&self.payload);

        let pseudo = Ipv4PseudoHeader::new(
            *self.src.ip(),
            *self.dst.ip(),
            IpProtocol::Tcp.into(),
            segment.len() as u16,
        );
        let sum = PseudoHeader::from(pseudo).checksum(&segment);
        TcpHeader::set_checksum(&mut segment, sum);
        segment
    }

    /// The segment wrapped in an IPv4 packet.
    pub fn build(&self) -> Vec<u8> {
        ipv4_packet(
            *self.src.ip(),
            *self.dst.ip(),
            IpProtocol::Tcp.into(),
            &self.segment(),
        )
    }
}

/// A TCP segment the stack transmitted, decoded.
#[derive(Debug, Clone)]
pub struct SentSegment {
    pub ip: Ipv4Header,
    pub tcp: TcpHeader,
    pub mss: Option<u16>,
    pub payload: Vec<u8>,
}

impl SentSegment {
    pub fn has(&self, flags: TcpFlags) -> bool {
        self.tcp.flags.contains(flags)
    }
}

/// Decode a transmitted packet as TCP, verifying both checksums. Returns
/// `None` for anything else.
pub fn parse_segment(packet: &[u8]) -> Option<SentSegment> {
    let ip = Ipv4Header::parse(packet).ok()?;
    let header_len = ip.header_len();
    if ip.protocol() != IpProtocol::Tcp || checksum::checksum(&packet[..header_len]) != 0 {
        return None;
    }
    let segment = packet.get(header_len..usize::from(ip.total_length))?;
    let pseudo = Ipv4PseudoHeader::new(ip.src, ip.dst, IpProtocol::Tcp.into(), segment.len() as u16);
    if PseudoHeader::from(pseudo).checksum(segment) != 0 {
        return None;
    }
    let tcp = TcpHeader::parse(segment).ok()?;
    let data_start = tcp.header_len();
    Some(SentSegment {
        mss: find_mss_option(segment.get(TCP_MIN_HEADER_LEN..data_start)?),
        payload: segment.get(data_start..)?.to_vec(),
        ip,
        tcp,
    })
}
