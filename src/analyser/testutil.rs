//! Synthetic captures for tests.
use etherparse::PacketBuilder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::Path;

pub const LINKTYPE_ETHERNET: u32 = 1;

const SRC_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
const DST_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x02];

pub fn tcp_v4(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16, seq: u32, payload: usize) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
        .ipv4(src, dst, 64)
        .tcp(src_port, dst_port, seq, 64240);
    build(builder, payload)
}

pub fn tcp_v6(src: [u8; 16], dst: [u8; 16], src_port: u16, dst_port: u16, seq: u32, payload: usize) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
        .ipv6(src, dst, 32)
        .tcp(src_port, dst_port, seq, 64240);
    build(builder, payload)
}

pub fn udp_v4(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
        .ipv4(src, dst, 64)
        .udp(src_port, dst_port);
    let mut frame = Vec::with_capacity(builder.size(0));
    builder.write(&mut frame, &[]).unwrap();
    frame
}

fn build(builder: etherparse::PacketBuilderStep<etherparse::TcpHeader>, payload: usize) -> Vec<u8> {
    let payload = vec![0u8; payload];
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, &payload).unwrap();
    frame
}

/// Broadcast ARP request, 42 bytes on the wire.
pub fn arp_frame() -> Vec<u8> {
    let mut frame = Vec::with_capacity(42);
    frame.extend_from_slice(&[0xff; 6]);
    frame.extend_from_slice(&SRC_MAC);
    frame.extend_from_slice(&[0x08, 0x06]);
    frame.extend_from_slice(&[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x01]);
    frame.extend_from_slice(&SRC_MAC);
    frame.extend_from_slice(&[10, 0, 0, 1]);
    frame.extend_from_slice(&[0; 6]);
    frame.extend_from_slice(&[10, 0, 0, 2]);
    frame
}

/// Legacy little-endian pcap with microsecond timestamps.
pub fn pcap_bytes(linktype: u32, frames: &[(f64, Vec<u8>)]) -> Vec<u8> {
    legacy_pcap(0xa1b2_c3d4, 1e6, linktype, frames)
}

/// Legacy little-endian pcap with nanosecond timestamps.
pub fn pcap_nanos_bytes(linktype: u32, frames: &[(f64, Vec<u8>)]) -> Vec<u8> {
    legacy_pcap(0xa1b2_3c4d, 1e9, linktype, frames)
}

fn legacy_pcap(magic: u32, units: f64, linktype: u32, frames: &[(f64, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&magic.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&65535u32.to_le_bytes());
    out.extend_from_slice(&linktype.to_le_bytes());

    for (timestamp, data) in frames {
        let secs = timestamp.floor();
        let fraction = ((timestamp - secs) * units).round() as u32;
        out.extend_from_slice(&(secs as u32).to_le_bytes());
        out.extend_from_slice(&fraction.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
    }
    out
}

/// Little-endian pcapng: one section, one interface, one enhanced packet block per frame.
/// Frames carry raw timestamps in the interface's units; `tsresol` of `None` leaves the
/// default microsecond resolution.
pub fn pcapng_bytes(linktype: u16, tsresol: Option<u8>, frames: &[(u64, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();

    let mut shb = Vec::new();
    shb.extend_from_slice(&0x1a2b_3c4du32.to_le_bytes());
    shb.extend_from_slice(&1u16.to_le_bytes());
    shb.extend_from_slice(&0u16.to_le_bytes());
    shb.extend_from_slice(&(-1i64).to_le_bytes());
    push_block(&mut out, 0x0a0d_0d0a, &shb);

    let mut idb = Vec::new();
    idb.extend_from_slice(&linktype.to_le_bytes());
    idb.extend_from_slice(&0u16.to_le_bytes());
    idb.extend_from_slice(&65535u32.to_le_bytes());
    if let Some(resolution) = tsresol {
        idb.extend_from_slice(&9u16.to_le_bytes());
        idb.extend_from_slice(&1u16.to_le_bytes());
        idb.extend_from_slice(&[resolution, 0, 0, 0]);
        idb.extend_from_slice(&[0; 4]);
    }
    push_block(&mut out, 1, &idb);

    for (raw, data) in frames {
        let mut epb = Vec::new();
        epb.extend_from_slice(&0u32.to_le_bytes());
        epb.extend_from_slice(&((raw >> 32) as u32).to_le_bytes());
        epb.extend_from_slice(&(*raw as u32).to_le_bytes());
        epb.extend_from_slice(&(data.len() as u32).to_le_bytes());
        epb.extend_from_slice(&(data.len() as u32).to_le_bytes());
        epb.extend_from_slice(data);
        epb.resize((epb.len() + 3) & !3, 0);
        push_block(&mut out, 6, &epb);
    }
    out
}

fn push_block(out: &mut Vec<u8>, block_type: u32, body: &[u8]) {
    let total = (body.len() + 12) as u32;
    out.extend_from_slice(&block_type.to_le_bytes());
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(&total.to_le_bytes());
}

/// Linux cooked (SLL) header in front of the IP packet of an Ethernet frame.
pub fn sll_frame(ethernet: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ethernet.len() + 2);
    frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x00, 0x06]);
    frame.extend_from_slice(&SRC_MAC);
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&ethernet[12..]);
    frame
}

/// BSD loopback header (host-order address family) in front of the IP packet.
pub fn null_frame(family: u32, ethernet: &[u8]) -> Vec<u8> {
    let mut frame = family.to_le_bytes().to_vec();
    frame.extend_from_slice(&ethernet[14..]);
    frame
}

pub fn write_pcap(path: &Path, linktype: u32, frames: &[(f64, Vec<u8>)]) {
    std::fs::write(path, pcap_bytes(linktype, frames)).unwrap();
}

pub fn write_gzip(path: &Path, data: &[u8]) {
    let mut encoder = GzEncoder::new(std::fs::File::create(path).unwrap(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap();
}

/// Two-packet client/server exchange, client first.
pub fn exchange(client: [u8; 4], server: [u8; 4]) -> Vec<(f64, Vec<u8>)> {
    vec![
        (10.0, tcp_v4(client, server, 51234, 443, 1, 0)),
        (10.5, tcp_v4(server, client, 443, 51234, 900, 100)),
    ]
}
