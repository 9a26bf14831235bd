//! Trace processing: decode captures into packet records and fold them into per-trace
//! features or per-packet tables.
pub mod containers;
pub mod core;
pub mod features;
pub mod stats;
pub mod table;
pub mod trace;
#[cfg(feature = "tshark")]
pub mod tshark;
#[cfg(test)]
pub mod testutil;
