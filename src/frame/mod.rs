//! Frame Builder: deterministic on-wire encoding of profile frames.
//!
//! `FrameBuilder::build` is a pure function of (descriptor, sequence
//! number, clock reading): the same inputs always produce bit-identical
//! frames. Randomized flood fields (SYN sequence numbers, ephemeral source
//! ports) are derived from a descriptor seed mixed with the frame sequence,
//! so they look random on the wire but stay reproducible.
//!
//! Signed encapsulations (ipv4, ipv6, mpls, vxlan, qinq) carry a 16-byte
//! little-endian payload prefix: magic, profile id (FNV-1a of the name),
//! sequence number, monotonic emit time in microseconds mod 2^32. Flood
//! encapsulations carry protocol-shaped payloads instead.

pub mod encap;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use pnet::packet::ethernet::{EtherType, EtherTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::tcp::TcpFlags;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config;
use crate::error::CoreError;
use crate::model::{fnv1a32, Encapsulation, Mac, ProfileConfig};

use encap::*;

/// "VEP1", little-endian, at the start of every signed payload.
pub const SIGNATURE_MAGIC: u32 = 0x5645_5031;
pub const SIGNATURE_LEN: usize = 16;

/// Decoded payload signature of a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub profile_id: u32,
    pub seq: u32,
    pub emit_micros: u32,
}

/// Write the 16-byte signature at the start of `buf`.
pub fn write_signature(buf: &mut [u8], profile_id: u32, seq: u32, emit_micros: u32) {
    buf[0..4].copy_from_slice(&SIGNATURE_MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&profile_id.to_le_bytes());
    buf[8..12].copy_from_slice(&seq.to_le_bytes());
    buf[12..16].copy_from_slice(&emit_micros.to_le_bytes());
}

/// Byte offset of the (signed) payload for a given encapsulation.
pub fn payload_offset(encap: &Encapsulation) -> usize {
    match encap {
        Encapsulation::Ipv4 | Encapsulation::UdpFlood | Encapsulation::DnsAmp => {
            ETH_HLEN + IPV4_HLEN + UDP_HLEN
        }
        Encapsulation::Ipv6 => ETH_HLEN + IPV6_HLEN + UDP_HLEN,
        Encapsulation::Mpls { .. } => ETH_HLEN + MPLS_SHIM_LEN + IPV4_HLEN + UDP_HLEN,
        Encapsulation::Vxlan { .. } => {
            ETH_HLEN + IPV4_HLEN + UDP_HLEN + VXLAN_HLEN + ETH_HLEN + IPV4_HLEN + UDP_HLEN
        }
        Encapsulation::Qinq { .. } => ETH_HLEN + 2 * VLAN_TAG_LEN + IPV4_HLEN + UDP_HLEN,
        Encapsulation::TcpSynFlood | Encapsulation::HttpFlood => ETH_HLEN + IPV4_HLEN + TCP_HLEN,
    }
}

/// Whether frames of this encapsulation carry the payload signature.
pub fn carries_signature(encap: &Encapsulation) -> bool {
    matches!(
        encap,
        Encapsulation::Ipv4
            | Encapsulation::Ipv6
            | Encapsulation::Mpls { .. }
            | Encapsulation::Vxlan { .. }
            | Encapsulation::Qinq { .. }
    )
}

/// Smallest frame size a descriptor can be encoded into. Never below the
/// Ethernet minimum.
pub fn min_frame_size(cfg: &ProfileConfig) -> Result<usize, CoreError> {
    let encap = cfg.encapsulation()?;
    let payload_min = match encap {
        Encapsulation::HttpFlood => http_get(&cfg.dst_addr.to_string(), cfg.l4_dst_port).len(),
        Encapsulation::DnsAmp => dns_query(0).len(),
        _ if carries_signature(&encap) => SIGNATURE_LEN,
        _ => 0,
    };
    Ok((payload_offset(&encap) + payload_min).max(config::MIN_FRAME_SIZE))
}

/// Decode the payload signature of a captured frame, if present.
pub fn extract_signature(frame: &[u8], encap: &Encapsulation) -> Option<Signature> {
    if !carries_signature(encap) {
        return None;
    }
    let off = payload_offset(encap);
    if frame.len() < off + SIGNATURE_LEN {
        return None;
    }
    let word = |i: usize| {
        u32::from_le_bytes([frame[off + i], frame[off + i + 1], frame[off + i + 2], frame[off + i + 3]])
    };
    if word(0) != SIGNATURE_MAGIC {
        return None;
    }
    Some(Signature { profile_id: word(4), seq: word(8), emit_micros: word(12) })
}

/// Resolves the destination MAC for outgoing frames. `Dynamic` consults the
/// source port's neighbor cache on every build and falls back to broadcast
/// without blocking.
#[derive(Clone)]
pub enum MacResolver {
    Static(Mac),
    Dynamic(Arc<dyn Fn(&IpAddr) -> Option<Mac> + Send + Sync>),
}

impl MacResolver {
    fn resolve(&self, ip: &IpAddr) -> Mac {
        match self {
            MacResolver::Static(mac) => *mac,
            MacResolver::Dynamic(lookup) => lookup(ip).unwrap_or(Mac::BROADCAST),
        }
    }
}

impl std::fmt::Debug for MacResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MacResolver::Static(mac) => write!(f, "MacResolver::Static({mac})"),
            MacResolver::Dynamic(_) => write!(f, "MacResolver::Dynamic"),
        }
    }
}

/// Per-profile frame encoder. Immutable for the lifetime of a run except
/// for the frame size, which the runner passes per call (hot-updatable).
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    profile_id: u32,
    encap: Encapsulation,
    src_mac: Mac,
    resolver: MacResolver,
    src_ipv4: Ipv4Addr,
    src_ipv6: Ipv6Addr,
    dst_addr: IpAddr,
    l4_src: Option<u16>,
    l4_dst: u16,
    dscp: u8,
    seed: u64,
}

impl FrameBuilder {
    pub fn new(
        cfg: &ProfileConfig,
        encap: Encapsulation,
        src_mac: Mac,
        src_ipv4: Option<Ipv4Addr>,
        src_ipv6: Option<Ipv6Addr>,
        resolver: MacResolver,
    ) -> Self {
        let profile_id = fnv1a32(cfg.name.as_bytes());
        FrameBuilder {
            profile_id,
            encap,
            src_mac,
            resolver,
            src_ipv4: src_ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED),
            src_ipv6: src_ipv6.unwrap_or(Ipv6Addr::UNSPECIFIED),
            dst_addr: cfg.dst_addr,
            l4_src: cfg.l4_src_port,
            l4_dst: cfg.l4_dst_port,
            dscp: cfg.dscp,
            seed: (u64::from(profile_id) << 32) | u64::from(fnv1a32(cfg.src_port.as_bytes())),
        }
    }

    pub fn profile_id(&self) -> u32 {
        self.profile_id
    }

    pub fn encap(&self) -> Encapsulation {
        self.encap
    }

    /// Encode frame `seq` into exactly `frame_size` bytes (FCS excluded;
    /// the kernel appends it).
    pub fn build(&self, seq: u32, frame_size: usize, emit_micros: u32) -> Result<Vec<u8>, CoreError> {
        let min = self.min_size();
        if frame_size < min {
            return Err(CoreError::Unencodable(format!(
                "frame_size {frame_size} below {} minimum {min}",
                self.encap.tag()
            )));
        }

        let mut rng = self.frame_rng(seq);
        let mut buf = vec![0u8; frame_size];
        match self.encap {
            Encapsulation::Ipv4 => self.build_ipv4_udp(&mut buf, seq, emit_micros, &mut rng, true)?,
            Encapsulation::UdpFlood => {
                self.build_ipv4_udp(&mut buf, seq, emit_micros, &mut rng, false)?
            }
            Encapsulation::Ipv6 => self.build_ipv6_udp(&mut buf, seq, emit_micros, &mut rng)?,
            Encapsulation::Mpls { label } => {
                self.build_mpls(&mut buf, label, seq, emit_micros, &mut rng)?
            }
            Encapsulation::Vxlan { vni } => {
                self.build_vxlan(&mut buf, vni, seq, emit_micros, &mut rng)?
            }
            Encapsulation::Qinq { outer_vid, inner_vid } => {
                self.build_qinq(&mut buf, outer_vid, inner_vid, seq, emit_micros, &mut rng)?
            }
            Encapsulation::DnsAmp => self.build_dns_amp(&mut buf, seq, &mut rng)?,
            Encapsulation::TcpSynFlood => self.build_syn_flood(&mut buf, seq, &mut rng)?,
            Encapsulation::HttpFlood => self.build_http_flood(&mut buf, &mut rng)?,
        }
        Ok(buf)
    }

    /// Smallest frame size this builder can encode.
    pub fn min_size(&self) -> usize {
        let payload_min = match self.encap {
            Encapsulation::HttpFlood => {
                http_get(&self.dst_addr.to_string(), self.l4_dst).len()
            }
            Encapsulation::DnsAmp => dns_query(0).len(),
            _ if carries_signature(&self.encap) => SIGNATURE_LEN,
            _ => 0,
        };
        (payload_offset(&self.encap) + payload_min).max(config::MIN_FRAME_SIZE)
    }

    /// Per-frame deterministic PRNG: same (descriptor, seq) → same draws.
    fn frame_rng(&self, seq: u32) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ u64::from(seq).wrapping_mul(0x9e37_79b9_7f4a_7c15))
    }

    fn source_port(&self, rng: &mut StdRng) -> u16 {
        self.l4_src.unwrap_or_else(|| 49152 + rng.gen_range(0..16384))
    }

    fn dst_v4(&self) -> Result<Ipv4Addr, CoreError> {
        match self.dst_addr {
            IpAddr::V4(a) => Ok(a),
            IpAddr::V6(a) => Err(CoreError::Unencodable(format!(
                "{} requires an IPv4 destination, got {a}",
                self.encap.tag()
            ))),
        }
    }

    fn dst_v6(&self) -> Result<Ipv6Addr, CoreError> {
        match self.dst_addr {
            IpAddr::V6(a) => Ok(a),
            IpAddr::V4(a) => Err(CoreError::Unencodable(format!(
                "ipv6 requires an IPv6 destination, got {a}"
            ))),
        }
    }

    fn dst_mac(&self) -> Mac {
        self.resolver.resolve(&self.dst_addr)
    }

    fn build_ipv4_udp(
        &self,
        buf: &mut [u8],
        seq: u32,
        emit_micros: u32,
        rng: &mut StdRng,
        signed: bool,
    ) -> Result<(), CoreError> {
        let dst = self.dst_v4()?;
        let fs = buf.len();
        let l3_off = ETH_HLEN;
        let l4_off = l3_off + IPV4_HLEN;
        let payload_off = l4_off + UDP_HLEN;

        if signed {
            write_signature(&mut buf[payload_off..], self.profile_id, seq, emit_micros);
        }
        write_ethernet(buf, self.dst_mac(), self.src_mac, EtherTypes::Ipv4);
        write_ipv4(
            &mut buf[l3_off..],
            &Ipv4Params {
                src: self.src_ipv4,
                dst,
                dscp: self.dscp,
                protocol: IpNextHeaderProtocols::Udp,
                total_len: (fs - l3_off) as u16,
                identification: seq as u16,
            },
        );
        let sport = self.source_port(rng);
        finish_udp_v4(&mut buf[l4_off..], self.src_ipv4, dst, sport, self.l4_dst);
        Ok(())
    }

    fn build_ipv6_udp(
        &self,
        buf: &mut [u8],
        seq: u32,
        emit_micros: u32,
        rng: &mut StdRng,
    ) -> Result<(), CoreError> {
        let dst = self.dst_v6()?;
        let fs = buf.len();
        let l3_off = ETH_HLEN;
        let l4_off = l3_off + IPV6_HLEN;
        let payload_off = l4_off + UDP_HLEN;

        write_signature(&mut buf[payload_off..], self.profile_id, seq, emit_micros);
        write_ethernet(buf, self.dst_mac(), self.src_mac, EtherTypes::Ipv6);
        write_ipv6(
            &mut buf[l3_off..],
            self.src_ipv6,
            dst,
            self.dscp,
            IpNextHeaderProtocols::Udp,
            (fs - l4_off) as u16,
        );
        let sport = self.source_port(rng);
        finish_udp_v6(&mut buf[l4_off..], self.src_ipv6, dst, sport, self.l4_dst);
        Ok(())
    }

    fn build_mpls(
        &self,
        buf: &mut [u8],
        label: u32,
        seq: u32,
        emit_micros: u32,
        rng: &mut StdRng,
    ) -> Result<(), CoreError> {
        let dst = self.dst_v4()?;
        let fs = buf.len();
        let shim_off = ETH_HLEN;
        let l3_off = shim_off + MPLS_SHIM_LEN;
        let l4_off = l3_off + IPV4_HLEN;
        let payload_off = l4_off + UDP_HLEN;

        write_signature(&mut buf[payload_off..], self.profile_id, seq, emit_micros);
        write_ethernet(buf, self.dst_mac(), self.src_mac, EtherType(ETHERTYPE_MPLS));
        write_mpls_shim(&mut buf[shim_off..], label, self.dscp >> 3, true, 64);
        write_ipv4(
            &mut buf[l3_off..],
            &Ipv4Params {
                src: self.src_ipv4,
                dst,
                dscp: self.dscp,
                protocol: IpNextHeaderProtocols::Udp,
                total_len: (fs - l3_off) as u16,
                identification: seq as u16,
            },
        );
        let sport = self.source_port(rng);
        finish_udp_v4(&mut buf[l4_off..], self.src_ipv4, dst, sport, self.l4_dst);
        Ok(())
    }

    fn build_vxlan(
        &self,
        buf: &mut [u8],
        vni: u32,
        seq: u32,
        emit_micros: u32,
        rng: &mut StdRng,
    ) -> Result<(), CoreError> {
        let dst = self.dst_v4()?;
        let fs = buf.len();
        let outer_l3 = ETH_HLEN;
        let outer_l4 = outer_l3 + IPV4_HLEN;
        let vxlan_off = outer_l4 + UDP_HLEN;
        let inner_eth = vxlan_off + VXLAN_HLEN;
        let inner_l3 = inner_eth + ETH_HLEN;
        let inner_l4 = inner_l3 + IPV4_HLEN;
        let payload_off = inner_l4 + UDP_HLEN;

        // Inner addresses are synthetic: a locally administered MAC pair
        // derived from the profile id and a fixed tenant subnet.
        let idb = self.profile_id.to_be_bytes();
        let inner_src_mac = Mac([0x02, idb[0], idb[1], idb[2], idb[3], 0x01]);
        let inner_dst_mac = Mac([0x02, idb[0], idb[1], idb[2], idb[3], 0x02]);
        let inner_src_ip = Ipv4Addr::new(10, 200, idb[2], 1);
        let inner_dst_ip = Ipv4Addr::new(10, 200, idb[2], 2);

        write_signature(&mut buf[payload_off..], self.profile_id, seq, emit_micros);

        write_ethernet(&mut buf[inner_eth..], inner_dst_mac, inner_src_mac, EtherTypes::Ipv4);
        write_ipv4(
            &mut buf[inner_l3..],
            &Ipv4Params {
                src: inner_src_ip,
                dst: inner_dst_ip,
                dscp: self.dscp,
                protocol: IpNextHeaderProtocols::Udp,
                total_len: (fs - inner_l3) as u16,
                identification: seq as u16,
            },
        );
        let inner_sport = self.source_port(rng);
        finish_udp_v4(&mut buf[inner_l4..], inner_src_ip, inner_dst_ip, inner_sport, self.l4_dst);

        write_vxlan_header(&mut buf[vxlan_off..], vni);
        write_ethernet(buf, self.dst_mac(), self.src_mac, EtherTypes::Ipv4);
        write_ipv4(
            &mut buf[outer_l3..],
            &Ipv4Params {
                src: self.src_ipv4,
                dst,
                dscp: self.dscp,
                protocol: IpNextHeaderProtocols::Udp,
                total_len: (fs - outer_l3) as u16,
                identification: seq as u16,
            },
        );
        // Outer source port varies per flow hash in real VTEPs; derive it
        // from the profile so a flow stays on one ECMP path.
        let outer_sport = 49152 + (self.profile_id % 16384) as u16;
        finish_udp_v4(&mut buf[outer_l4..], self.src_ipv4, dst, outer_sport, VXLAN_DST_PORT);
        Ok(())
    }

    fn build_qinq(
        &self,
        buf: &mut [u8],
        outer_vid: u16,
        inner_vid: u16,
        seq: u32,
        emit_micros: u32,
        rng: &mut StdRng,
    ) -> Result<(), CoreError> {
        let dst = self.dst_v4()?;
        let fs = buf.len();
        let l3_off = ETH_HLEN + 2 * VLAN_TAG_LEN;
        let l4_off = l3_off + IPV4_HLEN;
        let payload_off = l4_off + UDP_HLEN;

        write_signature(&mut buf[payload_off..], self.profile_id, seq, emit_micros);
        write_ethernet(buf, self.dst_mac(), self.src_mac, EtherTypes::Ipv4);
        write_qinq_tags(&mut buf[12..], outer_vid, inner_vid, self.dscp >> 3);
        write_ipv4(
            &mut buf[l3_off..],
            &Ipv4Params {
                src: self.src_ipv4,
                dst,
                dscp: self.dscp,
                protocol: IpNextHeaderProtocols::Udp,
                total_len: (fs - l3_off) as u16,
                identification: seq as u16,
            },
        );
        let sport = self.source_port(rng);
        finish_udp_v4(&mut buf[l4_off..], self.src_ipv4, dst, sport, self.l4_dst);
        Ok(())
    }

    fn build_dns_amp(&self, buf: &mut [u8], seq: u32, rng: &mut StdRng) -> Result<(), CoreError> {
        let dst = self.dst_v4()?;
        let l3_off = ETH_HLEN;
        let l4_off = l3_off + IPV4_HLEN;
        let query = dns_query(seq);
        let datagram_len = UDP_HLEN + query.len();

        // The datagram is a real DNS query; anything past it is Ethernet
        // trailer padding outside the IP total length.
        buf[l4_off + UDP_HLEN..l4_off + datagram_len].copy_from_slice(&query);
        write_ethernet(buf, self.dst_mac(), self.src_mac, EtherTypes::Ipv4);
        write_ipv4(
            &mut buf[l3_off..],
            &Ipv4Params {
                src: self.src_ipv4,
                dst,
                dscp: self.dscp,
                protocol: IpNextHeaderProtocols::Udp,
                total_len: (IPV4_HLEN + datagram_len) as u16,
                identification: seq as u16,
            },
        );
        let sport = self.source_port(rng);
        finish_udp_v4(&mut buf[l4_off..l4_off + datagram_len], self.src_ipv4, dst, sport, 53);
        Ok(())
    }

    fn build_syn_flood(&self, buf: &mut [u8], seq: u32, rng: &mut StdRng) -> Result<(), CoreError> {
        let dst = self.dst_v4()?;
        let l3_off = ETH_HLEN;
        let l4_off = l3_off + IPV4_HLEN;

        write_ethernet(buf, self.dst_mac(), self.src_mac, EtherTypes::Ipv4);
        write_ipv4(
            &mut buf[l3_off..],
            &Ipv4Params {
                src: self.src_ipv4,
                dst,
                dscp: self.dscp,
                protocol: IpNextHeaderProtocols::Tcp,
                total_len: (IPV4_HLEN + TCP_HLEN) as u16,
                identification: seq as u16,
            },
        );
        let sport = 1024 + rng.gen_range(0..64511);
        let tcp_seq: u32 = rng.gen();
        finish_tcp_v4(
            &mut buf[l4_off..l4_off + TCP_HLEN],
            self.src_ipv4,
            dst,
            sport,
            self.l4_dst,
            tcp_seq,
            TcpFlags::SYN,
        );
        Ok(())
    }

    fn build_http_flood(&self, buf: &mut [u8], rng: &mut StdRng) -> Result<(), CoreError> {
        let dst = self.dst_v4()?;
        let l3_off = ETH_HLEN;
        let l4_off = l3_off + IPV4_HLEN;
        let request = http_get(&self.dst_addr.to_string(), self.l4_dst);
        let segment_len = TCP_HLEN + request.len();

        // Flooding, not conversation: a bare data segment with no handshake.
        buf[l4_off + TCP_HLEN..l4_off + segment_len].copy_from_slice(&request);
        write_ethernet(buf, self.dst_mac(), self.src_mac, EtherTypes::Ipv4);
        write_ipv4(
            &mut buf[l3_off..],
            &Ipv4Params {
                src: self.src_ipv4,
                dst,
                dscp: self.dscp,
                protocol: IpNextHeaderProtocols::Tcp,
                total_len: (IPV4_HLEN + segment_len) as u16,
                identification: rng.gen(),
            },
        );
        let sport = self.source_port(rng);
        let tcp_seq: u32 = rng.gen();
        finish_tcp_v4(
            &mut buf[l4_off..l4_off + segment_len],
            self.src_ipv4,
            dst,
            sport,
            self.l4_dst,
            tcp_seq,
            TcpFlags::PSH | TcpFlags::ACK,
        );
        Ok(())
    }
}
