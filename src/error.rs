//! Error taxonomy shared by the capture reader, the ASN reference data and the intake pipeline.
//!
//! Only [Error::AsnMappingLoad] is fatal for a run. Everything else fails a single trace or
//! archive and is recorded in that unit's outcome.
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or truncated capture. Fails that single trace.
    #[error("cannot parse capture {path}: {reason}")]
    CaptureParse { path: PathBuf, reason: String },

    /// Missing or unreadable mapping / ASN list.
    #[error("cannot load ASN reference data from {path}: {reason}")]
    AsnMappingLoad { path: PathBuf, reason: String },

    /// Lookup service unreachable, timed out or cancelled. Resolves to "unknown ASN".
    #[error("ASN lookup for {ip} failed: {reason}")]
    AsnLookup { ip: IpAddr, reason: String },

    #[error("cannot extract archive {path}: {reason}")]
    ArchiveExtraction { path: PathBuf, reason: String },

    #[error("cannot locate a yyyy/mm/dd directory under {path}: {reason}")]
    InnermostDirNotFound { path: PathBuf, reason: String },

    /// A per-family range table was handed a range of the other family.
    #[error("range {start}-{end} does not belong to the {family} table")]
    MixedAddressFamilies { start: IpAddr, end: IpAddr, family: &'static str },

    #[error("cannot write {path}: {reason}")]
    Output { path: PathBuf, reason: String },
}

impl Error {
    pub fn capture(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::CaptureParse { path: path.into(), reason: reason.to_string() }
    }

    pub fn mapping(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::AsnMappingLoad { path: path.into(), reason: reason.to_string() }
    }

    pub fn extraction(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::ArchiveExtraction { path: path.into(), reason: reason.to_string() }
    }

    pub fn output(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Output { path: path.into(), reason: reason.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
