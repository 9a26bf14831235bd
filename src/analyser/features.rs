//! Streaming per-trace feature aggregation.
//!
//! Packets must be observed in capture order; every statistic below depends on it.
use super::containers::{Direction, FeatureRow, PacketRecord};
use super::stats;

/// Minimum number of TCP packets needed for interval statistics.
pub const MIN_TIMESTAMPED_PACKETS: usize = 2;

#[derive(Clone, Debug, Default)]
struct DirectionStats {
    last_timestamp: Option<f64>,
    iats: Vec<f64>,
    // Same gaps as `iats`: there is no request/response pairing to derive a round trip from.
    latencies: Vec<f64>,
    bytes: u64,
    packets: u64,
}

impl DirectionStats {
    fn push(&mut self, timestamp: f64, size: u32) {
        if let Some(previous) = self.last_timestamp {
            let gap = timestamp - previous;
            self.iats.push(gap);
            self.latencies.push(gap);
        }
        self.last_timestamp = Some(timestamp);
        self.bytes += u64::from(size);
        self.packets += 1;
    }

    /// A negative duration (timestamps running backwards) yields 0.
    fn throughput(&self, duration: f64) -> f64 {
        if duration < 0.0 {
            0.0
        } else {
            self.bytes as f64 / duration
        }
    }
}

/// Transient per-trace state, consumed into a [FeatureRow] by [FlowAccumulator::finish].
#[derive(Clone, Debug, Default)]
pub struct FlowAccumulator {
    first_timestamp: Option<f64>,
    last_tcp_timestamp: Option<f64>,
    timestamped: usize,
    to_service: DirectionStats,
    from_service: DirectionStats,
}

impl FlowAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, packet: &PacketRecord) {
        if self.first_timestamp.is_none() {
            self.first_timestamp = Some(packet.timestamp);
        }

        let Some(tcp) = packet.tcp.as_ref() else {
            return;
        };
        self.timestamped += 1;
        self.last_tcp_timestamp = Some(packet.timestamp);

        match Direction::classify(tcp) {
            Some(Direction::ToService) => self.to_service.push(packet.timestamp, packet.frame_len),
            Some(Direction::FromService) => self.from_service.push(packet.timestamp, packet.frame_len),
            None => {}
        }
    }

    /// Number of TCP packets seen so far.
    pub fn timestamped(&self) -> usize {
        self.timestamped
    }

    /// Trace duration used as the throughput denominator; zero becomes 1.
    fn duration(&self) -> f64 {
        let duration = match (self.first_timestamp, self.last_tcp_timestamp) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        };
        if duration == 0.0 { 1.0 } else { duration }
    }

    /// Returns None when fewer than [MIN_TIMESTAMPED_PACKETS] were observed.
    pub fn finish(self, label: &str) -> Option<FeatureRow> {
        if self.timestamped < MIN_TIMESTAMPED_PACKETS {
            return None;
        }
        let duration = self.duration();
        let to = &self.to_service;
        let from = &self.from_service;

        Some(FeatureRow {
            burst_ratio_to_443: stats::burst_ratio(&to.iats),
            burst_ratio_from_443: stats::burst_ratio(&from.iats),
            throughput_to_443: to.throughput(duration),
            throughput_from_443: from.throughput(duration),
            latency_mean_to_443: stats::mean(&to.latencies),
            latency_mean_from_443: stats::mean(&from.latencies),
            latency_variance_to_443: stats::variance(&to.latencies),
            latency_variance_from_443: stats::variance(&from.latencies),
            iat_mean_to_443: stats::mean(&to.iats),
            iat_mean_from_443: stats::mean(&from.iats),
            iat_variance_to_443: stats::variance(&to.iats),
            iat_variance_from_443: stats::variance(&from.iats),
            packet_count_to_443: to.packets,
            packet_count_from_443: from.packets,
            label: label.to_string(),
        })
    }
}
