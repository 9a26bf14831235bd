use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use super::Asn;
use crate::error::{Error, Result};

/// Known cellular-carrier ASNs, loaded once and shared read-only.
#[derive(Clone, Debug, Default)]
pub struct CellularAsns {
    asns: HashSet<Asn>,
}

impl CellularAsns {
    /// Only a missing or unreadable file is fatal; bad lines are skipped with a warning.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::mapping(path, e))?;
        let set = Self::from_reader(BufReader::new(file)).map_err(|e| Error::mapping(path, e))?;
        log::info!("Loaded {} cellular ASNs from {}", set.len(), path.display());
        Ok(set)
    }

    pub fn from_reader<R: BufRead>(reader: R) -> io::Result<Self> {
        let mut asns = HashSet::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let entry = line.trim();
            let parsed = if !entry.is_empty() && entry.bytes().all(|b| b.is_ascii_digit()) {
                entry.parse::<Asn>().ok()
            } else {
                None
            };
            match parsed {
                Some(asn) => {
                    asns.insert(asn);
                }
                None => log::warn!("Skipping invalid ASN on line {}: {entry:?}", index + 1),
            }
        }
        Ok(Self { asns })
    }

    pub fn contains(&self, asn: Asn) -> bool {
        self.asns.contains(&asn)
    }

    pub fn len(&self) -> usize {
        self.asns.len()
    }
}

impl FromIterator<Asn> for CellularAsns {
    fn from_iter<I: IntoIterator<Item = Asn>>(iter: I) -> Self {
        Self { asns: iter.into_iter().collect() }
    }
}
