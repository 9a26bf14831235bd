//! Capture decoding: pcap / pcapng framing via pcap-parser, headers via etherparse.
//!
//! A [TraceReader] is a finite, non-restartable stream of [PacketRecord]s in on-disk order.
//! Framing corruption ends the stream with [Error::CaptureParse]; an undecodable frame inside
//! intact framing only produces a tagged non-IP record.
use etherparse::{LaxNetSlice, LaxSlicedPacket, TransportSlice};
use flate2::read::GzDecoder;
use pcap_parser::traits::{PcapNGPacketBlock, PcapReaderIterator};
use pcap_parser::{create_reader, Block, PcapBlockOwned, PcapError};
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use super::containers::{FrameKind, IpFields, Network, PacketRecord, TcpFields};
use crate::error::{Error, Result};

const READER_CAPACITY: usize = 1 << 18;

/// Consecutive refills without a parsed block before the file is declared truncated.
const MAX_STALLED_REFILLS: usize = 8;

const LINKTYPE_NULL: i32 = 0;
const LINKTYPE_ETHERNET: i32 = 1;
const LINKTYPE_RAW_OPENBSD: i32 = 12;
const LINKTYPE_RAW: i32 = 101;
const LINKTYPE_LINUX_SLL: i32 = 113;
const LINKTYPE_IPV4: i32 = 228;
const LINKTYPE_IPV6: i32 = 229;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;

/// Which decoder turns a capture file into packet records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
pub enum Backend {
    #[default]
    Native,
    /// Requires the `tshark` cargo feature and a tshark binary on PATH.
    Tshark,
}

pub type PacketStream = Box<dyn Iterator<Item = Result<PacketRecord>>>;

/// Opens a capture with the requested backend.
pub fn open(path: &Path, backend: Backend) -> Result<PacketStream> {
    match backend {
        Backend::Native => Ok(Box::new(TraceReader::open(path)?)),
        #[cfg(feature = "tshark")]
        Backend::Tshark => Ok(Box::new(super::tshark::TsharkTrace::open(path)?)),
        #[cfg(not(feature = "tshark"))]
        Backend::Tshark => Err(Error::capture(path, "built without the `tshark` feature")),
    }
}

/// Reads only the first packet of a capture.
pub fn read_first_packet(path: &Path, backend: Backend) -> Result<Option<PacketRecord>> {
    open(path, backend)?.next().transpose()
}

pub fn is_gzip(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext.eq_ignore_ascii_case("gz"))
}

#[derive(Clone, Copy, Debug)]
struct LegacyLink {
    linktype: i32,
    nanos: bool,
}

#[derive(Clone, Copy, Debug)]
struct Interface {
    linktype: i32,
    units_per_sec: u64,
}

/// Link-layer state announced by header blocks, needed to decode the packet blocks after them.
#[derive(Debug, Default)]
struct LinkState {
    legacy: Option<LegacyLink>,
    interfaces: Vec<Interface>,
}

pub struct TraceReader {
    path: PathBuf,
    reader: Box<dyn PcapReaderIterator>,
    links: LinkState,
    stalled: usize,
    finished: bool,
}

impl TraceReader {
    /// Opens a pcap or pcapng file; `.gz` files are decompressed on the fly.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::capture(path, e))?;
        let input: Box<dyn Read + Send> = if is_gzip(path) {
            Box::new(GzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        let reader = create_reader(READER_CAPACITY, input)
            .map_err(|e| Error::capture(path, format!("unrecognised capture header: {e:?}")))?;

        log::debug!("Reading from {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            links: LinkState::default(),
            stalled: 0,
            finished: false,
        })
    }

    fn next_record(&mut self) -> Result<Option<PacketRecord>> {
        loop {
            let decoded = match self.reader.next() {
                Ok((offset, block)) => {
                    self.stalled = 0;
                    let decoded = decode_block(&mut self.links, block)
                        .map_err(|reason| Error::capture(&self.path, reason))?;
                    self.reader.consume(offset);
                    decoded
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete(_)) => {
                    self.stalled += 1;
                    if self.stalled > MAX_STALLED_REFILLS {
                        return Err(Error::capture(&self.path, "truncated capture"));
                    }
                    self.reader.refill()
                        .map_err(|e| Error::capture(&self.path, format!("{e:?}")))?;
                    continue;
                }
                Err(e) => return Err(Error::capture(&self.path, format!("{e:?}"))),
            };

            if decoded.is_some() {
                return Ok(decoded);
            }
        }
    }
}

impl Iterator for TraceReader {
    type Item = Result<PacketRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

fn decode_block(links: &mut LinkState, block: PcapBlockOwned) -> std::result::Result<Option<PacketRecord>, String> {
    match block {
        PcapBlockOwned::LegacyHeader(header) => {
            links.legacy = Some(LegacyLink {
                linktype: header.network.0,
                nanos: matches!(header.magic_number, 0xa1b2_3c4d | 0x4d3c_b2a1),
            });
            Ok(None)
        }
        PcapBlockOwned::Legacy(packet) => {
            let link = links.legacy.ok_or("packet record before file header")?;
            let divisor = if link.nanos { 1e9 } else { 1e6 };
            let timestamp = f64::from(packet.ts_sec) + f64::from(packet.ts_usec) / divisor;
            Ok(Some(decode_frame(link.linktype, packet.data, timestamp, packet.origlen)))
        }
        PcapBlockOwned::NG(Block::SectionHeader(_)) => {
            links.interfaces.clear();
            Ok(None)
        }
        PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
            links.interfaces.push(Interface {
                linktype: idb.linktype.0,
                units_per_sec: ts_units_per_sec(idb.if_tsresol),
            });
            Ok(None)
        }
        PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
            let iface = links.interfaces
                .get(epb.if_id as usize)
                .copied()
                .ok_or_else(|| format!("packet references unknown interface {}", epb.if_id))?;
            let raw = (u64::from(epb.ts_high) << 32) | u64::from(epb.ts_low);
            let timestamp = (raw / iface.units_per_sec) as f64
                + (raw % iface.units_per_sec) as f64 / iface.units_per_sec as f64;
            Ok(Some(decode_frame(iface.linktype, epb.packet_data(), timestamp, epb.origlen)))
        }
        PcapBlockOwned::NG(Block::SimplePacket(_)) => {
            log::debug!("Skipping simple packet block without timestamp");
            Ok(None)
        }
        // Statistics, name resolution, custom blocks
        PcapBlockOwned::NG(_) => Ok(None),
    }
}

/// `if_tsresol`: high bit clear means 10^-n seconds, set means 2^-n.
fn ts_units_per_sec(tsresol: u8) -> u64 {
    let exponent = u32::from(tsresol & 0x7f);
    let units = if tsresol & 0x80 == 0 {
        10u64.checked_pow(exponent)
    } else {
        1u64.checked_shl(exponent)
    };
    units.filter(|&u| u > 0).unwrap_or(1_000_000)
}

/// Decodes a single frame. Never fails: anything undecodable becomes a tagged non-IP record.
pub fn decode_frame(linktype: i32, data: &[u8], timestamp: f64, frame_len: u32) -> PacketRecord {
    let sliced = match linktype {
        LINKTYPE_ETHERNET => match LaxSlicedPacket::from_ethernet(data) {
            Ok(sliced) => Some(sliced),
            Err(_) => return other(timestamp, frame_len, FrameKind::Malformed),
        },
        LINKTYPE_RAW | LINKTYPE_RAW_OPENBSD | LINKTYPE_IPV4 | LINKTYPE_IPV6 => {
            match LaxSlicedPacket::from_ip(data) {
                Ok(sliced) => Some(sliced),
                Err(_) => return other(timestamp, frame_len, FrameKind::Malformed),
            }
        }
        LINKTYPE_LINUX_SLL => {
            let ethertype = data.get(14..16).map(|b| u16::from_be_bytes([b[0], b[1]]));
            match ethertype {
                Some(ETHERTYPE_IPV4) | Some(ETHERTYPE_IPV6) => {
                    data.get(16..).and_then(|ip| LaxSlicedPacket::from_ip(ip).ok())
                }
                _ => return other(timestamp, frame_len, FrameKind::NonIp),
            }
        }
        // 4-byte host-order address family, then the IP header
        LINKTYPE_NULL => data.get(4..).and_then(|ip| LaxSlicedPacket::from_ip(ip).ok()),
        unsupported => return other(timestamp, frame_len, FrameKind::UnsupportedLink(unsupported)),
    };

    let Some(sliced) = sliced else {
        return other(timestamp, frame_len, FrameKind::NonIp);
    };

    let ip = match &sliced.net {
        Some(LaxNetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            IpFields {
                src: IpAddr::V4(header.source_addr()),
                dst: IpAddr::V4(header.destination_addr()),
                protocol: header.protocol().0,
                ttl: header.ttl(),
                total_len: u32::from(header.total_len()),
            }
        }
        Some(LaxNetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            IpFields {
                src: IpAddr::V6(header.source_addr()),
                dst: IpAddr::V6(header.destination_addr()),
                protocol: header.next_header().0,
                ttl: header.hop_limit(),
                total_len: u32::from(header.payload_length()) + 40,
            }
        }
        _ => {
            let kind = if linktype == LINKTYPE_ETHERNET && carries_ip(data) {
                FrameKind::Malformed
            } else {
                FrameKind::NonIp
            };
            return other(timestamp, frame_len, kind);
        }
    };

    let tcp = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => Some(TcpFields {
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
            seq: tcp.sequence_number(),
        }),
        _ => None,
    };

    PacketRecord { timestamp, frame_len, network: Network::Ip(ip), tcp }
}

/// Untagged Ethernet frame announcing an IP payload.
fn carries_ip(frame: &[u8]) -> bool {
    let ethertype = frame.get(12..14).map(|b| u16::from_be_bytes([b[0], b[1]]));
    matches!(ethertype, Some(ETHERTYPE_IPV4) | Some(ETHERTYPE_IPV6))
}

fn other(timestamp: f64, frame_len: u32, kind: FrameKind) -> PacketRecord {
    PacketRecord { timestamp, frame_len, network: Network::Other(kind), tcp: None }
}
