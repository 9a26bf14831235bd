use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

/// Ports that identify the service side of a TCP conversation.
pub const SERVICE_PORTS: [u16; 2] = [443, 80];

/// The port whose *source* occurrence marks a packet as coming from the service.
pub const SERVICE_SOURCE_PORT: u16 = 443;

/// One decoded packet, in capture order.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PacketRecord {
    /// Capture time in seconds since the epoch.
    pub timestamp: f64,
    /// Original on-wire frame length.
    pub frame_len: u32,
    pub network: Network,
    /// Present only when the transport layer is TCP.
    pub tcp: Option<TcpFields>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Network {
    Ip(IpFields),
    Other(FrameKind),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IpFields {
    pub src: IpAddr,
    pub dst: IpAddr,
    /// IPv4 protocol, IPv6 next header.
    pub protocol: u8,
    /// IPv4 TTL, IPv6 hop limit.
    pub ttl: u8,
    /// IPv4 total length, IPv6 payload length plus the fixed header.
    pub total_len: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TcpFields {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
}

/// Tag for frames that carry no decodable IP header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FrameKind {
    /// Valid link layer, but not IPv4/IPv6 (ARP, LLDP, ...).
    NonIp,
    /// Capture link type we do not decode.
    UnsupportedLink(i32),
    /// The network header did not survive slicing.
    Malformed,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameKind::NonIp => write!(f, "non-ip"),
            FrameKind::UnsupportedLink(linktype) => write!(f, "linktype-{linktype}"),
            FrameKind::Malformed => write!(f, "malformed"),
        }
    }
}

impl PacketRecord {
    pub fn ip(&self) -> Option<&IpFields> {
        match &self.network {
            Network::Ip(ip) => Some(ip),
            Network::Other(_) => None,
        }
    }

    pub fn ip_version(&self) -> Option<u8> {
        self.ip().map(|ip| if ip.src.is_ipv4() { 4 } else { 6 })
    }
}

/// Traffic direction relative to the service port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Direction {
    ToService,
    FromService,
}

impl Direction {
    /// Decided once per packet and never revised.
    ///
    /// "To" accepts either service port as destination, "from" only checks the source against
    /// 443. The asymmetry is kept on purpose: port-80 responses land in neither direction.
    pub fn classify(tcp: &TcpFields) -> Option<Direction> {
        if SERVICE_PORTS.contains(&tcp.dst_port) {
            Some(Direction::ToService)
        } else if tcp.src_port == SERVICE_SOURCE_PORT {
            Some(Direction::FromService)
        } else {
            None
        }
    }
}

/// Column names of the feature table, in output order.
pub const FEATURE_HEADER: [&str; 15] = [
    "burst_ratio_to_443",
    "burst_ratio_from_443",
    "throughput_to_443",
    "throughput_from_443",
    "latency_mean_to_443",
    "latency_mean_from_443",
    "latency_variance_to_443",
    "latency_variance_from_443",
    "IAT_mean_to_443",
    "IAT_mean_from_443",
    "IAT_variance_to_443",
    "IAT_variance_from_443",
    "packet_count_to_443",
    "packet_count_from_443",
    "label",
];

/// One output record per trace. Field order is the CSV column order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FeatureRow {
    pub burst_ratio_to_443: f64,
    pub burst_ratio_from_443: f64,
    pub throughput_to_443: f64,
    pub throughput_from_443: f64,
    pub latency_mean_to_443: f64,
    pub latency_mean_from_443: f64,
    pub latency_variance_to_443: f64,
    pub latency_variance_from_443: f64,
    #[serde(rename = "IAT_mean_to_443")]
    pub iat_mean_to_443: f64,
    #[serde(rename = "IAT_mean_from_443")]
    pub iat_mean_from_443: f64,
    #[serde(rename = "IAT_variance_to_443")]
    pub iat_variance_to_443: f64,
    #[serde(rename = "IAT_variance_from_443")]
    pub iat_variance_from_443: f64,
    pub packet_count_to_443: u64,
    pub packet_count_from_443: u64,
    /// Attached by the caller, never computed here.
    pub label: String,
}

/// What a single trace produced.
#[derive(Clone, Debug, PartialEq)]
pub enum TraceOutcome {
    Row(FeatureRow),
    /// The capture holds no packets at all.
    NoData,
    /// Fewer than two timestamped packets; not an error, the trace is just skipped.
    Insufficient { observed: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_prefers_destination_service_port() {
        let to = TcpFields { src_port: 443, dst_port: 80, seq: 0 };
        assert_eq!(Direction::classify(&to), Some(Direction::ToService));

        let from = TcpFields { src_port: 443, dst_port: 50000, seq: 0 };
        assert_eq!(Direction::classify(&from), Some(Direction::FromService));
    }

    #[test]
    fn port_80_source_has_no_direction() {
        let tcp = TcpFields { src_port: 80, dst_port: 50000, seq: 0 };
        assert_eq!(Direction::classify(&tcp), None);
    }

    #[test]
    fn serialized_header_matches_declared_order() {
        let mut writer = csv::Writer::from_writer(vec![]);
        writer.serialize(FeatureRow::default()).unwrap();
        let data = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let header = data.lines().next().unwrap();
        assert_eq!(header, FEATURE_HEADER.join(","));
    }
}
