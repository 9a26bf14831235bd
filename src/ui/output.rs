use ansi_term::Colour;
use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::analyser::containers::{FeatureRow, FEATURE_HEADER};
use crate::analyser::core::FeaturizeSummary;
use crate::error::{Error, Result};
use crate::intake::pipeline::{ArchiveStatus, BatchReport};

pub fn print_featurize_summary(summary: &FeaturizeSummary, output: &Path) {
    println!("\n\u{250F}\u{2501}\u{2501}\u{2501}\u{2501} Features");
    println!("\u{2503}");
    println!("\u{2503} Rows written     : {}", Colour::Green.paint(summary.parsed.to_string()));
    println!("\u{2503} Skipped (< 2 TCP): {}", Colour::Fixed(226).paint(summary.skipped.to_string()));
    println!("\u{2503} Empty            : {}", Colour::Fixed(226).paint(summary.empty.to_string()));
    println!("\u{2503} Failed           : {}", Colour::Red.paint(summary.failed.to_string()));
    for failure in &summary.failures {
        println!("\u{2503}   {} {}", Colour::Red.paint("\u{2717}"), failure.reason);
    }
    println!("\u{2503} Output           : {}", output.display());
    println!("\u{2503} ");
}

pub fn print_batch_summary(report: &BatchReport) {
    let summary = &report.summary;
    println!("\n\u{250F}\u{2501}\u{2501}\u{2501}\u{2501} Archives");
    println!("\u{2503}");
    println!("\u{2503} Started          : {}", report.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("\u{2503} Finished         : {}", report.finished_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("\u{2503} Kept             : {}", Colour::Green.paint(summary.archives_kept.to_string()));
    println!("\u{2503} Discarded        : {}", Colour::Fixed(226).paint(summary.archives_discarded.to_string()));
    println!("\u{2503} Failed           : {}", Colour::Red.paint(summary.archives_failed.to_string()));
    println!("\u{2503} Captures kept    : {} of {}", summary.captures_kept, summary.captures_seen);
    println!("\u{2503}");

    for outcome in &report.outcomes {
        let status = match outcome.status {
            ArchiveStatus::Kept => Colour::Green.paint("KEPT     "),
            ArchiveStatus::Discarded => Colour::Fixed(226).paint("DISCARDED"),
            ArchiveStatus::Failed => Colour::Red.paint("FAILED   "),
        };
        let date = outcome.capture_date.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string());
        print!("\u{2503} {status} {} [{date}] {}/{}", outcome.archive, outcome.kept_captures(), outcome.captures.len());
        match &outcome.reason {
            Some(reason) => println!(" ({:?}: {reason})", outcome.stage),
            None => println!(),
        }
    }
    println!("\u{2503} ");
}

pub fn data_as_json<T: Serialize + ?Sized>(data: &T) -> serde_json::Result<String> {
    serde_json::to_string_pretty(data)
}

pub fn data_to_file(data: &str, path: &Path) -> Result<()> {
    fs::write(path, data).map_err(|e| Error::output(path, e))
}

/// Feature table; the header is written even when there are no rows.
pub fn write_features(path: &Path, rows: &[FeatureRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| Error::output(path, e))?;
    if rows.is_empty() {
        writer.write_record(FEATURE_HEADER).map_err(|e| Error::output(path, e))?;
    }
    for row in rows {
        writer.serialize(row).map_err(|e| Error::output(path, e))?;
    }
    writer.flush().map_err(|e| Error::output(path, e))
}

pub fn write_table<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| Error::output(path, e))?;
    for row in rows {
        writer.serialize(row).map_err(|e| Error::output(path, e))?;
    }
    writer.flush().map_err(|e| Error::output(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_feature_table_still_has_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.csv");
        write_features(&path, &[]).unwrap();

        let data = fs::read_to_string(&path).unwrap();
        assert_eq!(data.trim_end(), FEATURE_HEADER.join(","));
    }

    #[test]
    fn feature_rows_follow_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.csv");
        let row = FeatureRow { packet_count_to_443: 2, label: "1".into(), ..Default::default() };
        write_features(&path, &[row.clone(), row]).unwrap();

        let data = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = data.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], FEATURE_HEADER.join(","));
        assert!(lines[1].ends_with(",2,0,1"));
    }

    #[test]
    fn unwritable_output_is_an_output_error() {
        let result = write_table::<FeatureRow>(Path::new("/nonexistent/dir/out.csv"), &[]);
        assert!(matches!(result, Err(Error::Output { .. })));
    }
}
