//! Low-level header writers shared by the frame builder.
//!
//! Standard layers (Ethernet, IPv4/IPv6, UDP, TCP) go through `pnet` packet
//! views with computed checksums. MPLS shims, VXLAN headers, and 802.1ad/1Q
//! tag stacks have no pnet type and are encoded directly.

use std::net::{Ipv4Addr, Ipv6Addr};

use pnet::packet::ethernet::{EtherType, MutableEthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::{self, MutableIpv4Packet};
use pnet::packet::ipv6::MutableIpv6Packet;
use pnet::packet::tcp::{self, MutableTcpPacket};
use pnet::packet::udp::{self, MutableUdpPacket};
use pnet::util::MacAddr;

use crate::model::Mac;

pub const ETH_HLEN: usize = 14;
pub const VLAN_TAG_LEN: usize = 4;
pub const IPV4_HLEN: usize = 20;
pub const IPV6_HLEN: usize = 40;
pub const UDP_HLEN: usize = 8;
pub const TCP_HLEN: usize = 20;
pub const MPLS_SHIM_LEN: usize = 4;
pub const VXLAN_HLEN: usize = 8;

pub const ETHERTYPE_QINQ: u16 = 0x88a8;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_MPLS: u16 = 0x8847;
pub const VXLAN_DST_PORT: u16 = 4789;

pub(crate) fn pnet_mac(mac: Mac) -> MacAddr {
    let o = mac.octets();
    MacAddr(o[0], o[1], o[2], o[3], o[4], o[5])
}

/// Write a 14-byte Ethernet header at the start of `buf`.
pub(crate) fn write_ethernet(buf: &mut [u8], dst: Mac, src: Mac, ethertype: EtherType) {
    let mut eth = MutableEthernetPacket::new(buf).expect("ethernet slice");
    eth.set_destination(pnet_mac(dst));
    eth.set_source(pnet_mac(src));
    eth.set_ethertype(ethertype);
}

/// Parameters of one IPv4 header write.
pub(crate) struct Ipv4Params {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub dscp: u8,
    pub protocol: IpNextHeaderProtocol,
    /// Total length including this header.
    pub total_len: u16,
    pub identification: u16,
}

/// Write a 20-byte IPv4 header with computed checksum at the start of `buf`.
pub(crate) fn write_ipv4(buf: &mut [u8], p: &Ipv4Params) {
    let mut ip = MutableIpv4Packet::new(buf).expect("ipv4 slice");
    ip.set_version(4);
    ip.set_header_length(5);
    ip.set_dscp(p.dscp);
    ip.set_ecn(0);
    ip.set_total_length(p.total_len);
    ip.set_identification(p.identification);
    ip.set_flags(2); // DF
    ip.set_fragment_offset(0);
    ip.set_ttl(64);
    ip.set_next_level_protocol(p.protocol);
    ip.set_source(p.src);
    ip.set_destination(p.dst);
    ip.set_checksum(0);
    let checksum = ipv4::checksum(&ip.to_immutable());
    ip.set_checksum(checksum);
}

/// Write a 40-byte IPv6 header at the start of `buf`. DSCP lands in the
/// upper six bits of the traffic class.
pub(crate) fn write_ipv6(
    buf: &mut [u8],
    src: Ipv6Addr,
    dst: Ipv6Addr,
    dscp: u8,
    next_header: IpNextHeaderProtocol,
    payload_len: u16,
) {
    let mut ip = MutableIpv6Packet::new(buf).expect("ipv6 slice");
    ip.set_version(6);
    ip.set_traffic_class(dscp << 2);
    ip.set_flow_label(0);
    ip.set_payload_length(payload_len);
    ip.set_next_header(next_header);
    ip.set_hop_limit(64);
    ip.set_source(src);
    ip.set_destination(dst);
}

/// Fill the UDP header over `buf` (header + payload slice) and compute the
/// IPv4 pseudo-header checksum over the whole datagram.
pub(crate) fn finish_udp_v4(buf: &mut [u8], src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16) {
    let len = buf.len() as u16;
    let mut udp_pkt = MutableUdpPacket::new(buf).expect("udp slice");
    udp_pkt.set_source(sport);
    udp_pkt.set_destination(dport);
    udp_pkt.set_length(len);
    udp_pkt.set_checksum(0);
    let checksum = udp::ipv4_checksum(&udp_pkt.to_immutable(), &src, &dst);
    udp_pkt.set_checksum(checksum);
}

/// UDP finish for IPv6; the checksum is mandatory there.
pub(crate) fn finish_udp_v6(buf: &mut [u8], src: Ipv6Addr, dst: Ipv6Addr, sport: u16, dport: u16) {
    let len = buf.len() as u16;
    let mut udp_pkt = MutableUdpPacket::new(buf).expect("udp slice");
    udp_pkt.set_source(sport);
    udp_pkt.set_destination(dport);
    udp_pkt.set_length(len);
    udp_pkt.set_checksum(0);
    let checksum = udp::ipv6_checksum(&udp_pkt.to_immutable(), &src, &dst);
    udp_pkt.set_checksum(checksum);
}

/// Fill a 20-byte TCP header (no options) over `buf` (header + payload) and
/// compute the IPv4 pseudo-header checksum.
pub(crate) fn finish_tcp_v4(
    buf: &mut [u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    sequence: u32,
    flags: u8,
) {
    let mut tcp_pkt = MutableTcpPacket::new(buf).expect("tcp slice");
    tcp_pkt.set_source(sport);
    tcp_pkt.set_destination(dport);
    tcp_pkt.set_sequence(sequence);
    tcp_pkt.set_acknowledgement(0);
    tcp_pkt.set_data_offset(5);
    tcp_pkt.set_reserved(0);
    tcp_pkt.set_flags(flags);
    tcp_pkt.set_window(65535);
    tcp_pkt.set_urgent_ptr(0);
    tcp_pkt.set_checksum(0);
    let checksum = tcp::ipv4_checksum(&tcp_pkt.to_immutable(), &src, &dst);
    tcp_pkt.set_checksum(checksum);
}

/// Write one MPLS label stack entry: label(20) | EXP(3) | S(1) | TTL(8).
pub(crate) fn write_mpls_shim(buf: &mut [u8], label: u32, exp: u8, bottom: bool, ttl: u8) {
    let entry: u32 = (label << 12)
        | (u32::from(exp & 0x7) << 9)
        | (u32::from(bottom) << 8)
        | u32::from(ttl);
    buf[..MPLS_SHIM_LEN].copy_from_slice(&entry.to_be_bytes());
}

/// Write an 8-byte VXLAN header: flags 0x08 (VNI valid), 24-bit VNI.
pub(crate) fn write_vxlan_header(buf: &mut [u8], vni: u32) {
    buf[0] = 0x08;
    buf[1] = 0;
    buf[2] = 0;
    buf[3] = 0;
    let vni_bytes = vni.to_be_bytes();
    buf[4] = vni_bytes[1];
    buf[5] = vni_bytes[2];
    buf[6] = vni_bytes[3];
    buf[7] = 0;
}

/// Write the 802.1ad + 802.1Q tag stack starting at the ethertype position
/// (byte 12 of the frame). Leaves the final ethertype set to IPv4.
///
/// Layout: 0x88a8, outer TCI, 0x8100, inner TCI, 0x0800.
pub(crate) fn write_qinq_tags(buf: &mut [u8], outer_vid: u16, inner_vid: u16, pcp: u8) {
    let outer_tci = (u16::from(pcp & 0x7) << 13) | (outer_vid & 0x0fff);
    let inner_tci = (u16::from(pcp & 0x7) << 13) | (inner_vid & 0x0fff);
    buf[0..2].copy_from_slice(&ETHERTYPE_QINQ.to_be_bytes());
    buf[2..4].copy_from_slice(&outer_tci.to_be_bytes());
    buf[4..6].copy_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
    buf[6..8].copy_from_slice(&inner_tci.to_be_bytes());
    buf[8..10].copy_from_slice(&0x0800u16.to_be_bytes());
}

/// Minimal valid DNS query: header (RD set), one ANY question for
/// `example.com`. The transaction id carries the low 16 bits of the frame
/// sequence number.
pub(crate) fn dns_query(seq: u32) -> Vec<u8> {
    let mut q = Vec::with_capacity(29);
    q.extend_from_slice(&(seq as u16).to_be_bytes()); // id
    q.extend_from_slice(&0x0100u16.to_be_bytes()); // flags: RD
    q.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    q.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // an/ns/ar counts
    q.extend_from_slice(b"\x07example\x03com\x00"); // qname
    q.extend_from_slice(&255u16.to_be_bytes()); // qtype ANY
    q.extend_from_slice(&1u16.to_be_bytes()); // qclass IN
    q
}

/// Minimal HTTP/1.1 GET request line against `host:port`.
pub(crate) fn http_get(host: &str, port: u16) -> Vec<u8> {
    format!("GET / HTTP/1.1\r\nHost: {host}:{port}\r\nConnection: keep-alive\r\n\r\n").into_bytes()
}
