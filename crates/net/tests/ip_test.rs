//! IP layer tests: admission, reassembly and the ICMP errors the
//! demultiplexer generates. ICMP replies are decoded with smoltcp.

use buddy_core::{IpAddress, NetConfig};
use buddy_net::test_utils::{Recorder, RecordingLink, ipv4_fragment, ipv4_packet, udp_packet};
use buddy_net::{NetContext, SocketType};
use smoltcp::wire::{Icmpv4Message, Icmpv4Packet, IpProtocol, Ipv4Packet};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
const PEER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 50);

fn context() -> (NetContext, Recorder) {
    let config = NetConfig::builder()
        .interface("eth0", "192.0.2.1/24")
        .build()
        .expect("valid config");
    let (link, recorder) = RecordingLink::new(1500);
    let ctx = NetContext::new(config, vec![Box::new(link)]).expect("context");
    (ctx, recorder)
}

struct IcmpReply {
    dst: Ipv4Addr,
    kind: Icmpv4Message,
    code: u8,
    data: Vec<u8>,
}

fn icmp_reply(packet: &[u8]) -> IcmpReply {
    let ip = Ipv4Packet::new_checked(packet).expect("valid IPv4 packet");
    assert!(ip.verify_checksum());
    assert_eq!(ip.next_header(), IpProtocol::Icmp);
    assert_eq!(ip.src_addr(), LOCAL);
    let icmp = Icmpv4Packet::new_checked(ip.payload()).expect("valid ICMP message");
    assert!(icmp.verify_checksum());
    IcmpReply {
        dst: ip.dst_addr(),
        kind: icmp.msg_type(),
        code: icmp.msg_code(),
        data: icmp.data().to_vec(),
    }
}

/// UDP header plus payload for PEER:5000 -> LOCAL:9000.
fn udp_datagram(data: &[u8]) -> Vec<u8> {
    udp_packet(
        SocketAddrV4::new(PEER, 5000),
        SocketAddrV4::new(LOCAL, 9000),
        data,
    )[20..]
        .to_vec()
}

#[test]
fn test_unknown_protocol_is_unreachable() {
    let (mut ctx, sent) = context();
    let packet = ipv4_packet(PEER, LOCAL, 89, &[0xAA; 12]);
    ctx.receive_packet(0, &packet, Instant::now());

    let replies = sent.take();
    assert_eq!(replies.len(), 1);
    let reply = icmp_reply(&replies[0]);
    assert_eq!(reply.dst, PEER);
    assert_eq!(reply.kind, Icmpv4Message::DstUnreachable);
    assert_eq!(reply.code, 2);
    assert_eq!(reply.data, packet[..28].to_vec());

    let stats = ctx.stats();
    assert_eq!(stats.interfaces[0].1.in_unknown_protos, 1);
    assert_eq!(stats.icmp.out_dest_unreachs, 1);
}

#[test]
fn test_raw_socket_claims_protocol() {
    let (mut ctx, sent) = context();
    let id = ctx.open(SocketType::Raw, 89).unwrap();
    ctx.receive_packet(0, &ipv4_packet(PEER, LOCAL, 89, b"hello"), Instant::now());

    assert!(sent.is_empty());
    let datagram = ctx.receive_from(id).unwrap();
    assert_eq!(datagram.src, PEER);
    assert_eq!(datagram.data, b"hello");
    assert_eq!(ctx.stats().interfaces[0].1.in_delivers, 1);
}

#[test]
fn test_closed_udp_port_is_unreachable() {
    let (mut ctx, sent) = context();
    let packet = udp_packet(
        SocketAddrV4::new(PEER, 5000),
        SocketAddrV4::new(LOCAL, 9000),
        b"ping",
    );
    ctx.receive_packet(0, &packet, Instant::now());

    let replies = sent.take();
    assert_eq!(replies.len(), 1);
    let reply = icmp_reply(&replies[0]);
    assert_eq!(reply.kind, Icmpv4Message::DstUnreachable);
    assert_eq!(reply.code, 3);
    assert_eq!(reply.data, packet[..28].to_vec());
    assert_eq!(ctx.stats().udp.no_ports, 1);
}

#[test]
fn test_broadcast_to_closed_port_is_silent() {
    let (mut ctx, sent) = context();
    let packet = udp_packet(
        SocketAddrV4::new(PEER, 5000),
        SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 255), 9000),
        b"ping",
    );
    ctx.receive_packet(0, &packet, Instant::now());

    assert!(sent.is_empty());
    assert_eq!(ctx.stats().udp.no_ports, 1);
}

#[test]
fn test_echo_request_is_answered() {
    let (mut ctx, sent) = context();
    let mut message = vec![8, 0, 0, 0, 0x12, 0x34, 0x00, 0x01];
    message.extend_from_slice(b"payload");
    let sum = buddy_net::checksum(&message);
    message[2..4].copy_from_slice(&sum.to_be_bytes());
    ctx.receive_packet(0, &ipv4_packet(PEER, LOCAL, 1, &message), Instant::now());

    let replies = sent.take();
    assert_eq!(replies.len(), 1);
    let reply = icmp_reply(&replies[0]);
    assert_eq!(reply.dst, PEER);
    assert_eq!(reply.kind, Icmpv4Message::EchoReply);
    assert_eq!(reply.data, b"payload");
    assert_eq!(ctx.stats().icmp.out_echo_reps, 1);
}

#[test]
fn test_admission_failures_are_counted() {
    let (mut ctx, sent) = context();
    let now = Instant::now();

    let foreign = ipv4_packet(PEER, Ipv4Addr::new(198, 51, 100, 7), 17, &[0; 8]);
    ctx.receive_packet(0, &foreign, now);

    let mut corrupted = ipv4_packet(PEER, LOCAL, 17, &[0; 8]);
    corrupted[10] ^= 0xFF;
    ctx.receive_packet(0, &corrupted, now);

    let truncated = ipv4_packet(PEER, LOCAL, 17, &[0; 8]);
    ctx.receive_packet(0, &truncated[..24], now);

    assert!(sent.is_empty());
    let stats = ctx.stats();
    let stats = &stats.interfaces[0].1;
    assert_eq!(stats.in_receives, 3);
    assert_eq!(stats.in_addr_errors, 1);
    assert_eq!(stats.in_hdr_errors, 1);
    assert_eq!(stats.in_truncated_pkts, 1);
    assert_eq!(stats.in_delivers, 0);
}

#[test]
fn test_fragments_reassemble_in_any_order() {
    let (mut ctx, _sent) = context();
    let now = Instant::now();
    let id = ctx.open(SocketType::Dgram, 0).unwrap();
    ctx.bind(id, IpAddress::Unspecified, 9000).unwrap();

    let data: Vec<u8> = (0..32).collect();
    let datagram = udp_datagram(&data);
    assert_eq!(datagram.len(), 40);

    let fragments = [
        ipv4_fragment(PEER, LOCAL, 17, 77, 32, false, &datagram[32..]),
        ipv4_fragment(PEER, LOCAL, 17, 77, 0, true, &datagram[..16]),
        ipv4_fragment(PEER, LOCAL, 17, 77, 16, true, &datagram[16..32]),
    ];
    for (i, fragment) in fragments.iter().enumerate() {
        assert!(ctx.receive_from(id).is_err(), "delivered after {i} fragments");
        ctx.receive_packet(0, fragment, now);
    }

    let received = ctx.receive_from(id).unwrap();
    assert_eq!(received.src_port, 5000);
    assert_eq!(received.data, data);
    let stats = ctx.stats();
    let stats = &stats.interfaces[0].1;
    assert_eq!(stats.reasm_reqds, 3);
    assert_eq!(stats.reasm_oks, 1);
}

#[test]
fn test_incomplete_datagram_times_out() {
    let (mut ctx, sent) = context();
    let now = Instant::now();
    let datagram = udp_datagram(&[7; 32]);
    let first = ipv4_fragment(PEER, LOCAL, 17, 78, 0, true, &datagram[..16]);
    ctx.receive_packet(0, &first, now);

    ctx.poll_timers(now + Duration::from_secs(5));
    assert!(sent.is_empty());

    ctx.poll_timers(now + Duration::from_secs(16));
    let replies = sent.take();
    assert_eq!(replies.len(), 1);
    let reply = icmp_reply(&replies[0]);
    assert_eq!(reply.dst, PEER);
    assert_eq!(reply.kind, Icmpv4Message::TimeExceeded);
    assert_eq!(reply.code, 1);
    // The quoted header and the first eight bytes of the lost datagram.
    assert_eq!(&reply.data[20..28], &datagram[..8]);

    let stats = ctx.stats();
    assert_eq!(stats.interfaces[0].1.reasm_fails, 1);
    assert_eq!(stats.icmp.out_time_excds, 1);
}

#[test]
fn test_missing_first_fragment_expires_silently() {
    let (mut ctx, sent) = context();
    let now = Instant::now();
    let datagram = udp_datagram(&[7; 32]);
    let tail = ipv4_fragment(PEER, LOCAL, 17, 79, 16, true, &datagram[16..32]);
    ctx.receive_packet(0, &tail, now);

    ctx.poll_timers(now + Duration::from_secs(16));

    assert!(sent.is_empty());
    assert_eq!(ctx.stats().interfaces[0].1.reasm_fails, 1);
}

#[test]
fn test_udp_send_is_fragmented_to_mtu() {
    let config = NetConfig::builder()
        .interface("eth0", "192.0.2.1/24")
        .mtu(576)
        .build()
        .unwrap();
    let (link, sent) = RecordingLink::new(1500);
    let mut ctx = NetContext::new(config, vec![Box::new(link)]).unwrap();
    let id = ctx.open(SocketType::Dgram, 0).unwrap();

    ctx.send_to(id, PEER, 7, &[0x5A; 1200]).unwrap();

    let packets = sent.take();
    assert_eq!(packets.len(), 3);
    let mut total = 0;
    for packet in &packets {
        assert!(packet.len() <= 576);
        let ip = Ipv4Packet::new_checked(packet.as_slice()).unwrap();
        assert!(ip.verify_checksum());
        total += ip.payload().len();
    }
    assert_eq!(total, 1208);
    assert_eq!(ctx.stats().interfaces[0].1.frag_creates, 3);
}

#[test]
fn test_raw_icmp_socket_sees_answered_echo() {
    let (mut ctx, sent) = context();
    let id = ctx.open(SocketType::Raw, 1).unwrap();
    let mut message = vec![8, 0, 0, 0, 0x12, 0x34, 0x00, 0x02];
    message.extend_from_slice(b"copy");
    let sum = buddy_net::checksum(&message);
    message[2..4].copy_from_slice(&sum.to_be_bytes());
    ctx.receive_packet(0, &ipv4_packet(PEER, LOCAL, 1, &message), Instant::now());

    let replies = sent.take();
    assert_eq!(replies.len(), 1);
    assert_eq!(icmp_reply(&replies[0]).kind, Icmpv4Message::EchoReply);
    let copy = ctx.receive_from(id).unwrap();
    assert_eq!(copy.src, PEER);
    assert_eq!(copy.data, message);
    assert_eq!(ctx.stats().interfaces[0].1.in_delivers, 1);
}
