//! End-to-end tests of the network task: the test plays the remote host on
//! the far side of a channel link while the application uses a
//! [`NetHandle`].

use buddy_core::{IpAddress, NetConfig};
use buddy_net::test_utils::{SegmentBuilder, SentSegment, parse_segment, udp_packet};
use buddy_net::wire::TcpFlags;
use buddy_net::{LinkPeer, NetError, NetHandle, NetStack, SendFlags, SocketType, TcpState, channel_link};
use smoltcp::wire::{IpAddress as SmolAddress, Ipv4Address, Ipv4Packet, UdpPacket};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
const PEER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 50);

fn start() -> (NetHandle, LinkPeer) {
    let config = NetConfig::builder()
        .interface("eth0", "192.0.2.1/24")
        .build()
        .expect("valid config");
    let (link, peer) = channel_link(1500, 32);
    let (stack, handle) = NetStack::new(config, vec![Box::new(link)]).expect("stack");
    tokio::spawn(stack.run());
    (handle, peer)
}

async fn next_segment(peer: &mut LinkPeer) -> SentSegment {
    let packet = tokio::time::timeout(Duration::from_secs(5), peer.rx.recv())
        .await
        .expect("stack transmitted nothing")
        .expect("link open");
    parse_segment(&packet).expect("valid TCP segment")
}

#[tokio::test]
async fn test_accept_and_exchange_data() {
    let (handle, mut peer) = start();
    let remote = SocketAddrV4::new(PEER, 4000);
    let local = SocketAddrV4::new(LOCAL, 80);

    let listener = handle.open(SocketType::Stream, 0).await.unwrap();
    handle.bind(listener, IpAddress::Unspecified, 80).await.unwrap();
    handle.listen(listener, 0).await.unwrap();
    let accepting = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.accept(listener).await })
    };

    let syn = SegmentBuilder::new(remote, local)
        .seq(1000)
        .flags(TcpFlags::SYN)
        .mss(1460);
    peer.tx.send(syn.build()).await.unwrap();

    let syn_ack = next_segment(&mut peer).await;
    assert!(syn_ack.has(TcpFlags::SYN | TcpFlags::ACK));
    assert_eq!(syn_ack.tcp.ack, 1001);
    let iss = syn_ack.tcp.seq;

    let (conn, addr, port) = accepting.await.unwrap().unwrap();
    assert_eq!((addr, port), (IpAddress::from(PEER), 4000));

    let ack = SegmentBuilder::new(remote, local)
        .seq(1001)
        .ack(iss.wrapping_add(1))
        .flags(TcpFlags::ACK);
    peer.tx.send(ack.build()).await.unwrap();
    let ping = SegmentBuilder::new(remote, local)
        .seq(1001)
        .ack(iss.wrapping_add(1))
        .flags(TcpFlags::PSH | TcpFlags::ACK)
        .payload(b"ping");
    peer.tx.send(ping.build()).await.unwrap();

    assert_eq!(handle.receive(conn, 64).await.unwrap(), b"ping");
    assert_eq!(handle.state(conn).await.unwrap(), TcpState::Established);
    assert_eq!(next_segment(&mut peer).await.tcp.ack, 1005);

    assert_eq!(handle.send(conn, b"pong", SendFlags::empty()).await.unwrap(), 4);
    let pong = next_segment(&mut peer).await;
    assert_eq!(pong.payload, b"pong");
    assert_eq!(pong.tcp.seq, iss.wrapping_add(1));

    handle.close(conn).await.unwrap();
    assert!(next_segment(&mut peer).await.has(TcpFlags::RST));
}

#[tokio::test]
async fn test_connect_and_wait_for_acknowledgment() {
    let (handle, mut peer) = start();

    let id = handle.open(SocketType::Stream, 0).await.unwrap();
    let connecting = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.connect(id, PEER, 80).await })
    };

    let syn = next_segment(&mut peer).await;
    assert_eq!(syn.tcp.flags, TcpFlags::SYN);
    let iss = syn.tcp.seq;
    let remote = SocketAddrV4::new(PEER, 80);
    let local = SocketAddrV4::new(LOCAL, syn.tcp.src_port);
    let syn_ack = SegmentBuilder::new(remote, local)
        .seq(9000)
        .ack(iss.wrapping_add(1))
        .flags(TcpFlags::SYN | TcpFlags::ACK)
        .mss(1000);
    peer.tx.send(syn_ack.build()).await.unwrap();

    connecting.await.unwrap().unwrap();
    assert_eq!(next_segment(&mut peer).await.tcp.ack, 9001);

    let sending = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.send(id, b"request", SendFlags::WAIT_ACK).await })
    };
    let data = next_segment(&mut peer).await;
    assert_eq!(data.payload, b"request");
    assert!(!sending.is_finished());

    let ack = SegmentBuilder::new(remote, local)
        .seq(9001)
        .ack(iss.wrapping_add(8))
        .flags(TcpFlags::ACK);
    peer.tx.send(ack.build()).await.unwrap();
    assert_eq!(sending.await.unwrap().unwrap(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_connect_to_silent_peer_times_out() {
    let (handle, _peer) = start();
    let handle = handle.with_timeout(Duration::from_secs(3));

    let id = handle.open(SocketType::Stream, 0).await.unwrap();
    assert!(matches!(
        handle.connect(id, PEER, 80).await,
        Err(NetError::Timeout)
    ));
    assert!(handle.stats().await.unwrap().tcp.retrans_segs >= 1);
}

#[tokio::test]
async fn test_datagram_round_trip() {
    let (handle, mut peer) = start();

    let id = handle.open(SocketType::Dgram, 0).await.unwrap();
    handle.bind(id, IpAddress::Unspecified, 7).await.unwrap();

    let request = udp_packet(
        SocketAddrV4::new(PEER, 4000),
        SocketAddrV4::new(LOCAL, 7),
        b"echo me",
    );
    peer.tx.send(request).await.unwrap();

    let datagram = handle.receive_from(id).await.unwrap();
    assert_eq!(datagram.src, PEER);
    assert_eq!(datagram.data, b"echo me");

    handle
        .send_to(id, datagram.src, datagram.src_port, &datagram.data)
        .await
        .unwrap();
    let reply = peer.rx.recv().await.unwrap();
    let ip = Ipv4Packet::new_checked(reply.as_slice()).unwrap();
    let udp = UdpPacket::new_checked(ip.payload()).unwrap();
    assert!(udp.verify_checksum(
        &SmolAddress::Ipv4(Ipv4Address::from(LOCAL)),
        &SmolAddress::Ipv4(Ipv4Address::from(PEER)),
    ));
    assert_eq!((udp.src_port(), udp.dst_port()), (7, 4000));
    assert_eq!(udp.payload(), b"echo me");

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.udp.in_datagrams, 1);
    assert_eq!(stats.udp.out_datagrams, 1);
}
