//! IP-to-ASN range index.
//!
//! One table per address family, keyed by the integer form of the address (`u32` for IPv4,
//! `u128` for IPv6). Construction flattens the source ranges into sorted, disjoint segments,
//! each carrying the ASN of the earliest source range that covers it, so a lookup is a single
//! binary search however deeply the source ranges nest.
use serde::Deserialize;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::IpAddr;
use std::path::Path;

use super::Asn;
use crate::error::{Error, Result};

/// `start ..= end` belongs to `asn`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressRange {
    pub start: IpAddr,
    pub end: IpAddr,
    pub asn: Asn,
}

/// Integer key of one address family.
pub trait FamilyKey: Copy + Ord + std::fmt::Debug {
    const FAMILY: &'static str;
    fn from_ip(ip: IpAddr) -> Option<Self>;
    fn succ(self) -> Option<Self>;
    fn pred(self) -> Option<Self>;
}

impl FamilyKey for u32 {
    const FAMILY: &'static str = "IPv4";

    fn from_ip(ip: IpAddr) -> Option<Self> {
        match ip {
            IpAddr::V4(addr) => Some(u32::from(addr)),
            IpAddr::V6(_) => None,
        }
    }

    fn succ(self) -> Option<Self> {
        self.checked_add(1)
    }

    fn pred(self) -> Option<Self> {
        self.checked_sub(1)
    }
}

impl FamilyKey for u128 {
    const FAMILY: &'static str = "IPv6";

    fn from_ip(ip: IpAddr) -> Option<Self> {
        match ip {
            IpAddr::V6(addr) => Some(u128::from(addr)),
            IpAddr::V4(_) => None,
        }
    }

    fn succ(self) -> Option<Self> {
        self.checked_add(1)
    }

    fn pred(self) -> Option<Self> {
        self.checked_sub(1)
    }
}

#[derive(Clone, Debug)]
struct Interval<K> {
    start: K,
    end: K,
    asn: Asn,
    /// Position in the source, to honour "first matching range" on overlaps.
    ordinal: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Segment<K> {
    start: K,
    end: K,
    asn: Asn,
}

/// Disjoint segment table for a single address family.
#[derive(Clone, Debug)]
pub struct RangeTable<K> {
    segments: Vec<Segment<K>>,
    /// Source ranges kept after validation.
    sources: usize,
}

impl<K: FamilyKey> Default for RangeTable<K> {
    fn default() -> Self {
        Self { segments: Vec::new(), sources: 0 }
    }
}

impl<K: FamilyKey> RangeTable<K> {
    /// Rejects ranges of the other family; skips inverted ranges with a warning.
    pub fn build(ranges: impl IntoIterator<Item = AddressRange>) -> Result<Self> {
        let mut intervals = Vec::new();

        for (ordinal, range) in ranges.into_iter().enumerate() {
            let (Some(start), Some(end)) = (K::from_ip(range.start), K::from_ip(range.end)) else {
                return Err(Error::MixedAddressFamilies {
                    start: range.start,
                    end: range.end,
                    family: K::FAMILY,
                });
            };
            if start > end {
                log::warn!("Skipping inverted range {}-{} (AS{})", range.start, range.end, range.asn);
                continue;
            }
            intervals.push(Interval { start, end, asn: range.asn, ordinal });
        }

        let sources = intervals.len();
        intervals.sort_by(|a, b| a.start.cmp(&b.start));
        Ok(Self { segments: flatten(intervals), sources })
    }

    pub fn lookup(&self, key: K) -> Option<Asn> {
        let after = self.segments.partition_point(|segment| segment.start <= key);
        let segment = self.segments.get(after.checked_sub(1)?)?;
        (segment.end >= key).then_some(segment.asn)
    }

    pub fn len(&self) -> usize {
        self.sources
    }
}

/// Sweeps intervals sorted by start. The active set is a min-heap on source position, so its
/// top is the range that wins at the cursor; it holds until it ends or another range starts.
fn flatten<K: FamilyKey>(intervals: Vec<Interval<K>>) -> Vec<Segment<K>> {
    let mut segments: Vec<Segment<K>> = Vec::new();
    let mut active: BinaryHeap<Reverse<(usize, K, Asn)>> = BinaryHeap::new();
    let mut pending = intervals.into_iter().peekable();

    let Some(mut cursor) = pending.peek().map(|interval| interval.start) else {
        return segments;
    };

    loop {
        while let Some(interval) = pending.next_if(|interval| interval.start <= cursor) {
            active.push(Reverse((interval.ordinal, interval.end, interval.asn)));
        }
        while active.peek().is_some_and(|Reverse((_, end, _))| *end < cursor) {
            active.pop();
        }

        let Some(&Reverse((_, end, asn))) = active.peek() else {
            match pending.peek() {
                Some(next) => {
                    cursor = next.start;
                    continue;
                }
                None => break,
            }
        };

        let stop = match pending.peek().and_then(|next| next.start.pred()) {
            Some(before_next) if before_next < end => before_next,
            _ => end,
        };

        match segments.last_mut() {
            Some(last) if last.asn == asn && last.end.succ() == Some(cursor) => last.end = stop,
            _ => segments.push(Segment { start: cursor, end: stop, asn }),
        }

        cursor = match stop.succ() {
            Some(next) => next,
            None => break,
        };
    }

    segments
}

/// Dual-stack index: ranges are partitioned by family at construction.
#[derive(Clone, Debug, Default)]
pub struct AsnRangeIndex {
    v4: RangeTable<u32>,
    v6: RangeTable<u128>,
}

impl AsnRangeIndex {
    pub fn from_ranges(ranges: impl IntoIterator<Item = AddressRange>) -> Self {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();

        for range in ranges {
            match (range.start, range.end) {
                (IpAddr::V4(_), IpAddr::V4(_)) => v4.push(range),
                (IpAddr::V6(_), IpAddr::V6(_)) => v6.push(range),
                _ => log::warn!("Skipping range {}-{} mixing address families", range.start, range.end),
            }
        }

        // Partitioning guarantees a single family per table
        Self {
            v4: RangeTable::build(v4).unwrap_or_default(),
            v6: RangeTable::build(v6).unwrap_or_default(),
        }
    }

    /// Loads one or more mapping CSVs (typically one per family) into a single index.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut ranges = Vec::new();
        for path in paths {
            ranges.extend(read_ranges(path.as_ref())?);
        }
        let index = Self::from_ranges(ranges);
        log::info!("Loaded {} IPv4 and {} IPv6 ASN ranges", index.v4.len(), index.v6.len());
        Ok(index)
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<Asn> {
        match ip {
            IpAddr::V4(addr) => self.v4.lookup(u32::from(addr)),
            IpAddr::V6(addr) => self.v6.lookup(u128::from(addr))
                .or_else(|| addr.to_ipv4_mapped().and_then(|v4| self.v4.lookup(u32::from(v4)))),
        }
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Deserialize)]
struct MappingRow {
    start_ip: String,
    end_ip: String,
    asn: String,
}

const REQUIRED_COLUMNS: [&str; 3] = ["start_ip", "end_ip", "asn"];

/// Reads `start_ip,end_ip,asn` rows. Extra columns are ignored, bad rows skipped with a warning.
pub fn read_ranges(path: &Path) -> Result<Vec<AddressRange>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|e| Error::mapping(path, e))?;

    let headers = reader.headers().map_err(|e| Error::mapping(path, e))?.clone();
    if let Some(missing) = REQUIRED_COLUMNS.iter().find(|column| !headers.iter().any(|h| h == **column)) {
        return Err(Error::mapping(path, format!("missing column `{missing}`")));
    }

    let mut ranges = Vec::new();
    for (index, row) in reader.deserialize::<MappingRow>().enumerate() {
        // header is line 1
        let line = index + 2;
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                log::warn!("{}:{line}: skipping unreadable row: {e}", path.display());
                continue;
            }
        };
        match parse_range(&row) {
            Ok(range) => ranges.push(range),
            Err(reason) => log::warn!("{}:{line}: skipping entry: {reason}", path.display()),
        }
    }

    Ok(ranges)
}

fn parse_range(row: &MappingRow) -> std::result::Result<AddressRange, String> {
    let start = row.start_ip.parse::<IpAddr>().map_err(|_| format!("invalid address `{}`", row.start_ip))?;
    let end = row.end_ip.parse::<IpAddr>().map_err(|_| format!("invalid address `{}`", row.end_ip))?;
    let asn = parse_asn(&row.asn).ok_or_else(|| format!("invalid ASN `{}`", row.asn))?;
    Ok(AddressRange { start, end, asn })
}

/// Accepts `15169`, `AS15169` and the `15169.0` form float-typed exports produce.
pub fn parse_asn(raw: &str) -> Option<Asn> {
    let raw = raw.trim();
    let digits = raw.strip_prefix("AS").or_else(|| raw.strip_prefix("as")).unwrap_or(raw);
    let digits = digits.strip_suffix(".0").unwrap_or(digits);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
