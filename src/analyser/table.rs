//! Per-packet tables: a plain header dump and an ASN-annotated view.
use serde::Serialize;
use std::net::IpAddr;
use std::path::Path;

use super::containers::{Network, PacketRecord};
use super::trace::{self, Backend};
use crate::asn::cellular::CellularAsns;
use crate::asn::index::AsnRangeIndex;
use crate::asn::Asn;
use crate::error::Result;

/// Header fields of one packet; absent numeric fields are written as zero.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DumpRow {
    pub timestamp: f64,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub packet_size: u32,
    pub protocol: u8,
    pub ttl: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_no: u32,
}

impl From<&PacketRecord> for DumpRow {
    fn from(packet: &PacketRecord) -> Self {
        let ip = packet.ip();
        let tcp = packet.tcp.as_ref();
        DumpRow {
            timestamp: packet.timestamp,
            src_ip: ip.map(|ip| ip.src),
            dst_ip: ip.map(|ip| ip.dst),
            packet_size: packet_size(packet),
            protocol: ip.map_or(0, |ip| ip.protocol),
            ttl: ip.map_or(0, |ip| ip.ttl),
            src_port: tcp.map_or(0, |tcp| tcp.src_port),
            dst_port: tcp.map_or(0, |tcp| tcp.dst_port),
            seq_no: tcp.map_or(0, |tcp| tcp.seq),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnnotatedRow {
    pub timestamp: f64,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub ip_version: Option<u8>,
    pub packet_size: u32,
    pub protocol: Option<u8>,
    pub ttl: Option<u8>,
    pub src_asn: Option<Asn>,
    pub dst_asn: Option<Asn>,
    /// 1 when the source ASN is a cellular carrier.
    pub is_cellular: u8,
    /// `ip`, or the kind of frame that carried no IP header.
    pub frame: String,
}

/// IP length for IP packets, the frame length otherwise.
fn packet_size(packet: &PacketRecord) -> u32 {
    packet.ip().map_or(packet.frame_len, |ip| ip.total_len)
}

pub fn annotate_packet(packet: &PacketRecord, index: &AsnRangeIndex, cellular: &CellularAsns) -> AnnotatedRow {
    let ip = packet.ip();
    let src_asn = ip.and_then(|ip| index.lookup(ip.src));

    AnnotatedRow {
        timestamp: packet.timestamp,
        src_ip: ip.map(|ip| ip.src),
        dst_ip: ip.map(|ip| ip.dst),
        ip_version: packet.ip_version(),
        packet_size: packet_size(packet),
        protocol: ip.map(|ip| ip.protocol),
        ttl: ip.map(|ip| ip.ttl),
        src_asn,
        dst_asn: ip.and_then(|ip| index.lookup(ip.dst)),
        is_cellular: u8::from(src_asn.is_some_and(|asn| cellular.contains(asn))),
        frame: match &packet.network {
            Network::Ip(_) => "ip".to_string(),
            Network::Other(kind) => kind.to_string(),
        },
    }
}

pub fn dump(path: &Path, backend: Backend) -> Result<Vec<DumpRow>> {
    trace::open(path, backend)?
        .map(|record| record.map(|packet| DumpRow::from(&packet)))
        .collect()
}

pub fn annotate(
    path: &Path,
    backend: Backend,
    index: &AsnRangeIndex,
    cellular: &CellularAsns,
) -> Result<Vec<AnnotatedRow>> {
    trace::open(path, backend)?
        .map(|record| record.map(|packet| annotate_packet(&packet, index, cellular)))
        .collect()
}
