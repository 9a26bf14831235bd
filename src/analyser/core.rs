//! Per-trace analysis and the featurize batch built on top of it.
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::containers::{FeatureRow, TraceOutcome};
use super::features::FlowAccumulator;
use super::trace::{self, Backend};
use crate::error::Result;
use crate::workers;

const TRACE_SUFFIXES: [&str; 3] = [".pcap", ".pcapng", ".pcap.gz"];

/// Decodes one trace in capture order and folds it into a feature row.
pub fn analyse(path: &Path, label: &str, backend: Backend) -> Result<TraceOutcome> {
    let mut acc = FlowAccumulator::new();
    let mut packets = 0usize;

    for record in trace::open(path, backend)? {
        acc.observe(&record?);
        packets += 1;
    }

    if packets == 0 {
        return Ok(TraceOutcome::NoData);
    }
    let observed = acc.timestamped();
    Ok(match acc.finish(label) {
        Some(row) => TraceOutcome::Row(row),
        None => TraceOutcome::Insufficient { observed },
    })
}

/// A subdirectory of the data directory and the label its traces get, written `name=label`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceClass {
    pub name: String,
    pub label: String,
}

impl FromStr for TraceClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((name, label)) if !name.trim().is_empty() && !label.trim().is_empty() => Ok(Self {
                name: name.trim().to_string(),
                label: label.trim().to_string(),
            }),
            _ => Err(format!("expected NAME=LABEL, got {s:?}")),
        }
    }
}

impl TraceClass {
    pub fn defaults() -> Vec<TraceClass> {
        vec![
            TraceClass { name: "cellular".into(), label: "1".into() },
            TraceClass { name: "wifi".into(), label: "0".into() },
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelledTrace {
    pub path: PathBuf,
    pub label: String,
}

fn is_trace(path: &Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy().to_ascii_lowercase()).unwrap_or_default();
    TRACE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// Collects the traces of every class, in class order and sorted by path within a class. A
/// missing class directory contributes nothing.
pub fn discover(data_dir: &Path, classes: &[TraceClass]) -> io::Result<Vec<LabelledTrace>> {
    let mut traces = Vec::new();

    for class in classes {
        let dir = data_dir.join(&class.name);
        if !dir.is_dir() {
            log::warn!("No {} directory under {}", class.name, data_dir.display());
            continue;
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() && is_trace(&entry.path()) {
                paths.push(entry.path());
            }
        }
        paths.sort();
        log::info!("Found {} {} traces", paths.len(), class.name);

        traces.extend(paths.into_iter().map(|path| LabelledTrace { path, label: class.label.clone() }));
    }
    Ok(traces)
}

/// Same seed, same order.
pub fn shuffle(traces: &mut [LabelledTrace], seed: u64) {
    traces.shuffle(&mut StdRng::seed_from_u64(seed));
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TraceFailure {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FeaturizeSummary {
    pub parsed: usize,
    /// Traces with fewer than two timestamped packets.
    pub skipped: usize,
    pub empty: usize,
    pub failed: usize,
    pub failures: Vec<TraceFailure>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FeaturizeReport {
    pub rows: Vec<FeatureRow>,
    pub summary: FeaturizeSummary,
}

/// Analyses every trace on `jobs` workers. Rows come out in input order; a failing trace
/// never stops the others.
pub fn featurize(traces: &[LabelledTrace], backend: Backend, jobs: usize) -> FeaturizeReport {
    let outcomes: Vec<Result<TraceOutcome>> = workers::run(jobs, || {
        traces.par_iter().map(|t| analyse(&t.path, &t.label, backend)).collect()
    });

    let mut report = FeaturizeReport::default();
    for (trace, outcome) in traces.iter().zip(outcomes) {
        match outcome {
            Ok(TraceOutcome::Row(row)) => {
                report.summary.parsed += 1;
                report.rows.push(row);
            }
            Ok(TraceOutcome::Insufficient { observed }) => {
                log::debug!("Skipping {}: {observed} timestamped packets", trace.path.display());
                report.summary.skipped += 1;
            }
            Ok(TraceOutcome::NoData) => {
                log::warn!("{} holds no packets", trace.path.display());
                report.summary.empty += 1;
            }
            Err(e) => {
                log::error!("{e}");
                report.summary.failed += 1;
                report.summary.failures.push(TraceFailure { path: trace.path.clone(), reason: e.to_string() });
            }
        }
    }
    log::info!(
        "Featurized {} traces: {} rows, {} skipped, {} empty, {} failed",
        traces.len(),
        report.summary.parsed,
        report.summary.skipped,
        report.summary.empty,
        report.summary.failed
    );
    report
}
