//! Alternative capture backend driven by tshark's dissectors (via rtshark).
//!
//! Produces the same [PacketRecord] stream as the native reader. Useful for link types or
//! encapsulations the native slicer does not understand.
use rtshark::{Packet, RTShark};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use super::containers::{FrameKind, IpFields, Network, PacketRecord, TcpFields};
use crate::error::{Error, Result};

pub struct TsharkTrace {
    path: PathBuf,
    rtshark: RTShark,
    finished: bool,
}

impl TsharkTrace {
    pub fn open(path: &Path) -> Result<Self> {
        let input = path.to_string_lossy().to_string();
        let builder = rtshark::RTSharkBuilder::builder().input_path(&input);

        let rtshark = builder.spawn().map_err(|err| {
            log::error!("Error spawning tshark: {err}");
            Error::capture(path, err)
        })?;
        log::debug!("Reading from {input} through tshark");

        Ok(Self { path: path.to_path_buf(), rtshark, finished: false })
    }
}

impl Iterator for TsharkTrace {
    type Item = Result<PacketRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.rtshark.read() {
            Ok(Some(packet)) => Some(to_record(&packet).map_err(|reason| Error::capture(&self.path, reason))),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(Error::capture(&self.path, e)))
            }
        }
    }
}

impl Drop for TsharkTrace {
    fn drop(&mut self) {
        self.rtshark.kill();
    }
}

/// Reads a metadata field of a layer and parses it.
fn field<T: std::str::FromStr>(packet: &Packet, layer: &str, name: &str) -> Option<T> {
    packet.layer_name(layer)?.metadata(name)?.value().parse().ok()
}

fn to_record(packet: &Packet) -> std::result::Result<PacketRecord, String> {
    let micros = packet.timestamp_micros().ok_or("packet without timestamp")?;
    let timestamp = micros as f64 / 1e6;
    let frame_len = field::<u32>(packet, "frame", "frame.len").unwrap_or(0);

    let ip = if packet.layer_name("ip").is_some() {
        Some(IpFields {
            src: field::<IpAddr>(packet, "ip", "ip.src").ok_or("ip.src missing")?,
            dst: field::<IpAddr>(packet, "ip", "ip.dst").ok_or("ip.dst missing")?,
            protocol: field(packet, "ip", "ip.proto").unwrap_or(0),
            ttl: field(packet, "ip", "ip.ttl").unwrap_or(0),
            total_len: field(packet, "ip", "ip.len").unwrap_or(0),
        })
    } else if packet.layer_name("ipv6").is_some() {
        Some(IpFields {
            src: field::<IpAddr>(packet, "ipv6", "ipv6.src").ok_or("ipv6.src missing")?,
            dst: field::<IpAddr>(packet, "ipv6", "ipv6.dst").ok_or("ipv6.dst missing")?,
            protocol: field(packet, "ipv6", "ipv6.nxt").unwrap_or(0),
            ttl: field(packet, "ipv6", "ipv6.hlim").unwrap_or(0),
            total_len: field::<u32>(packet, "ipv6", "ipv6.plen").unwrap_or(0) + 40,
        })
    } else {
        None
    };

    let Some(ip) = ip else {
        return Ok(PacketRecord {
            timestamp,
            frame_len,
            network: Network::Other(FrameKind::NonIp),
            tcp: None,
        });
    };

    // tcp.seq is relative by default; tcp.seq_raw carries the wire value
    let tcp = match packet.layer_name("tcp") {
        Some(_) => Some(TcpFields {
            src_port: field(packet, "tcp", "tcp.srcport").ok_or("tcp.srcport missing")?,
            dst_port: field(packet, "tcp", "tcp.dstport").ok_or("tcp.dstport missing")?,
            seq: field(packet, "tcp", "tcp.seq_raw")
                .or_else(|| field(packet, "tcp", "tcp.seq"))
                .unwrap_or(0),
        }),
        None => None,
    };

    Ok(PacketRecord { timestamp, frame_len, network: Network::Ip(ip), tcp })
}
