//! Archive intake & filter pipeline.
//!
//! Each archive is an independent [ArchiveTask]: extracted into its own scoped staging
//! directory, searched for the dated capture directory, and every capture found there is kept
//! (moved to the filtered directory) when its client's ASN is a cellular carrier. Failures are
//! isolated per archive and recorded as [ArchiveOutcome]s; the batch always completes.
use chrono::{DateTime, NaiveDate, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use super::archive;
use crate::analyser::trace::{self, Backend};
use crate::asn::cellular::CellularAsns;
use crate::asn::lookup::{Resolution, ResolverChain};
use crate::error::{Error, Result};
use crate::workers;

#[derive(Clone, Debug)]
pub struct FilterConfig {
    pub archives_dir: PathBuf,
    pub work_dir: PathBuf,
    pub filtered_dir: PathBuf,
    pub jobs: usize,
    pub backend: Backend,
}

/// Last stage an archive reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Stage {
    Queued,
    Extracted,
    LocatedInnermostDir,
    PerCaptureEvaluated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ArchiveStatus {
    /// At least one capture was kept.
    Kept,
    Discarded,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CaptureVerdict {
    Kept,
    Discarded,
}

#[derive(Clone, Debug, Serialize)]
pub struct CaptureOutcome {
    pub capture: String,
    pub verdict: CaptureVerdict,
    pub client: Option<IpAddr>,
    pub resolution: Resolution,
    pub reason: Option<String>,
    pub moved_to: Option<PathBuf>,
}

impl CaptureOutcome {
    fn new(capture: &Path) -> Self {
        Self {
            capture: file_name(capture),
            verdict: CaptureVerdict::Discarded,
            client: None,
            resolution: Resolution::default(),
            reason: None,
            moved_to: None,
        }
    }

    fn discard(mut self, reason: impl ToString) -> Self {
        self.verdict = CaptureVerdict::Discarded;
        self.reason = Some(reason.to_string());
        self
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ArchiveOutcome {
    pub archive: String,
    pub status: ArchiveStatus,
    pub stage: Stage,
    pub reason: Option<String>,
    pub capture_date: Option<NaiveDate>,
    pub captures: Vec<CaptureOutcome>,
}

impl ArchiveOutcome {
    fn new(archive: &Path) -> Self {
        Self {
            archive: archive::archive_id(archive),
            status: ArchiveStatus::Discarded,
            stage: Stage::Queued,
            reason: None,
            capture_date: None,
            captures: Vec::new(),
        }
    }

    pub fn kept_captures(&self) -> usize {
        self.captures.iter().filter(|c| c.verdict == CaptureVerdict::Kept).count()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub archives_kept: usize,
    pub archives_discarded: usize,
    pub archives_failed: usize,
    pub captures_seen: usize,
    pub captures_kept: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: BatchSummary,
    pub outcomes: Vec<ArchiveOutcome>,
}

impl BatchReport {
    #[cfg(test)]
    pub fn outcome(&self, archive: &str) -> Option<&ArchiveOutcome> {
        self.outcomes.iter().find(|o| o.archive == archive)
    }
}

fn summarize(outcomes: &[ArchiveOutcome]) -> BatchSummary {
    let mut summary = BatchSummary::default();
    for outcome in outcomes {
        match outcome.status {
            ArchiveStatus::Kept => summary.archives_kept += 1,
            ArchiveStatus::Discarded => summary.archives_discarded += 1,
            ArchiveStatus::Failed => summary.archives_failed += 1,
        }
        summary.captures_seen += outcome.captures.len();
        summary.captures_kept += outcome.kept_captures();
    }
    summary
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
}

/// One unit of intake work. The staging directory is removed when the task is dropped, on
/// every exit path.
pub struct ArchiveTask {
    pub archive: PathBuf,
    staging: TempDir,
    pub innermost: Option<PathBuf>,
    pub captures: Vec<PathBuf>,
}

impl ArchiveTask {
    /// Stage: Extracted.
    pub fn extract(archive: &Path, work_dir: &Path) -> Result<Self> {
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}-", archive::archive_id(archive)))
            .tempdir_in(work_dir)
            .map_err(|e| Error::extraction(archive, format!("cannot create staging directory: {e}")))?;

        archive::extract_archive(archive, staging.path())?;
        Ok(Self { archive: archive.to_path_buf(), staging, innermost: None, captures: Vec::new() })
    }

    pub fn staging(&self) -> &Path {
        self.staging.path()
    }

    /// Stage: LocatedInnermostDir.
    pub fn locate(&mut self) -> Result<&Path> {
        let innermost = archive::find_innermost_dir(self.staging.path())?;
        self.captures = archive::list_files(&innermost, archive::is_capture)
            .map_err(|e| Error::extraction(&self.archive, format!("cannot list {}: {e}", innermost.display())))?;
        Ok(self.innermost.insert(innermost).as_path())
    }
}

pub struct Filter<'a> {
    config: FilterConfig,
    resolvers: &'a ResolverChain,
    cellular: &'a CellularAsns,
}

impl<'a> Filter<'a> {
    pub fn new(config: FilterConfig, resolvers: &'a ResolverChain, cellular: &'a CellularAsns) -> Self {
        Self { config, resolvers, cellular }
    }

    /// Runs the whole batch. Only an unusable directory setup is an error; per-archive
    /// failures end up in the report.
    pub fn run(&self) -> Result<BatchReport> {
        let started_at = Utc::now();
        for dir in [&self.config.work_dir, &self.config.filtered_dir] {
            fs::create_dir_all(dir).map_err(|e| Error::output(dir, e))?;
        }
        let archives = archive::list_files(&self.config.archives_dir, archive::is_archive)
            .map_err(|e| Error::extraction(&self.config.archives_dir, e))?;
        log::info!("Filtering {} archives from {}", archives.len(), self.config.archives_dir.display());

        let outcomes: Vec<ArchiveOutcome> = workers::run(self.config.jobs, || {
            archives.par_iter().map(|path| self.process(path)).collect()
        });

        Ok(BatchReport {
            started_at,
            finished_at: Utc::now(),
            summary: summarize(&outcomes),
            outcomes,
        })
    }

    /// Processes one archive; never fails, failures become a `Failed` outcome.
    pub fn process(&self, path: &Path) -> ArchiveOutcome {
        let mut outcome = ArchiveOutcome::new(path);

        match self.evaluate(path, &mut outcome) {
            Ok(()) => {
                outcome.status = if outcome.kept_captures() > 0 {
                    ArchiveStatus::Kept
                } else {
                    ArchiveStatus::Discarded
                };
                log::info!(
                    "{}: {:?} ({} of {} captures kept)",
                    outcome.archive,
                    outcome.status,
                    outcome.kept_captures(),
                    outcome.captures.len()
                );
            }
            Err(e) => {
                log::error!("{} failed after stage {:?}: {e}", outcome.archive, outcome.stage);
                outcome.status = ArchiveStatus::Failed;
                outcome.reason = Some(e.to_string());
            }
        }
        outcome
    }

    fn evaluate(&self, path: &Path, outcome: &mut ArchiveOutcome) -> Result<()> {
        let mut task = ArchiveTask::extract(path, &self.config.work_dir)?;
        outcome.stage = Stage::Extracted;

        let innermost = task.locate()?;
        outcome.capture_date = archive::capture_date(innermost);
        outcome.stage = Stage::LocatedInnermostDir;
        log::debug!("{}: found {} captures", outcome.archive, task.captures.len());

        for capture in &task.captures {
            outcome.captures.push(self.evaluate_capture(capture, task.staging(), &outcome.archive));
        }
        outcome.stage = Stage::PerCaptureEvaluated;
        Ok(())
    }

    fn evaluate_capture(&self, capture: &Path, staging: &Path, archive_id: &str) -> CaptureOutcome {
        let outcome = CaptureOutcome::new(capture);

        let staged = match archive::stage_capture(capture, staging) {
            Ok(staged) => staged,
            Err(e) => return outcome.discard(e),
        };
        let first = match trace::read_first_packet(&staged, self.config.backend) {
            Ok(Some(first)) => first,
            Ok(None) => return outcome.discard("empty capture"),
            Err(e) => return outcome.discard(e),
        };
        let Some(client) = archive::infer_client(&first) else {
            return outcome.discard("client address undetermined");
        };

        let resolution = self.resolvers.resolve(client);
        let mut outcome = CaptureOutcome { client: Some(client), resolution, ..outcome };

        let asn = match outcome.resolution.asn {
            Some(asn) => asn,
            None => return outcome.discard("unknown ASN"),
        };
        if !self.cellular.contains(asn) {
            return outcome.discard(format!("AS{asn} is not a cellular carrier"));
        }

        // Same-named captures from different archives get the archive id as a prefix
        let target = match archive::reserve_destination(&self.config.filtered_dir, &file_name(&staged), archive_id) {
            Ok(target) => target,
            Err(e) => return outcome.discard(format!("cannot keep capture: {e}")),
        };
        if let Err(e) = archive::move_file(&staged, &target) {
            let _ = fs::remove_file(&target);
            return outcome.discard(format!("cannot move to {}: {e}", target.display()));
        }
        log::debug!("Kept {} (client {client}, AS{asn})", target.display());

        outcome.verdict = CaptureVerdict::Kept;
        outcome.moved_to = Some(target);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::testutil::{self, LINKTYPE_ETHERNET};
    use crate::asn::index::{AddressRange, AsnRangeIndex};
    use flate2::write::GzEncoder;
    use flate2::Compression;

    const CELLULAR_AS: u32 = 21928;
    const WIRED_AS: u32 = 7922;

    struct Fixture {
        root: TempDir,
        resolvers: ResolverChain,
        cellular: CellularAsns,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            fs::create_dir_all(root.path().join("archives")).unwrap();

            let index = AsnRangeIndex::from_ranges([
                AddressRange { start: "172.56.0.0".parse().unwrap(), end: "172.63.255.255".parse().unwrap(), asn: CELLULAR_AS },
                AddressRange { start: "73.0.0.0".parse().unwrap(), end: "73.255.255.255".parse().unwrap(), asn: WIRED_AS },
            ]);
            Self {
                root,
                resolvers: ResolverChain::new().with(index),
                cellular: [CELLULAR_AS].into_iter().collect(),
            }
        }

        fn config(&self) -> FilterConfig {
            FilterConfig {
                archives_dir: self.root.path().join("archives"),
                work_dir: self.root.path().join("work"),
                filtered_dir: self.root.path().join("filtered"),
                jobs: 2,
                backend: Backend::Native,
            }
        }

        /// Writes `<name>.tgz` containing `ndt/pcap/2025/01/30/<capture>.pcap.gz` per client.
        fn archive(&self, name: &str, captures: &[(&str, [u8; 4])]) {
            let tree = tempfile::tempdir().unwrap();
            let dated = tree.path().join("ndt/pcap/2025/01/30");
            fs::create_dir_all(&dated).unwrap();
            for (capture, client) in captures {
                let frames = testutil::exchange(*client, [34, 120, 0, 1]);
                let pcap = testutil::pcap_bytes(LINKTYPE_ETHERNET, &frames);
                testutil::write_gzip(&dated.join(format!("{capture}.pcap.gz")), &pcap);
            }

            let file = fs::File::create(self.root.path().join("archives").join(format!("{name}.tgz"))).unwrap();
            let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
            builder.append_dir_all("ndt", tree.path().join("ndt")).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        fn raw_archive(&self, name: &str, bytes: &[u8]) {
            fs::write(self.root.path().join("archives").join(name), bytes).unwrap();
        }

        fn run(&self) -> BatchReport {
            Filter::new(self.config(), &self.resolvers, &self.cellular).run().unwrap()
        }
    }

    #[test]
    fn corrupt_archive_does_not_stop_siblings() {
        let fx = Fixture::new();
        fx.archive("cellular", &[("ndt-a", [172, 58, 1, 2])]);
        fx.archive("wired", &[("ndt-b", [73, 1, 2, 3])]);
        fx.raw_archive("corrupt.tgz", b"\x1f\x8bnot a tarball at all");

        let report = fx.run();

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.outcome("cellular").unwrap().status, ArchiveStatus::Kept);
        assert_eq!(report.outcome("wired").unwrap().status, ArchiveStatus::Discarded);

        let corrupt = report.outcome("corrupt").unwrap();
        assert_eq!(corrupt.status, ArchiveStatus::Failed);
        assert_eq!(corrupt.stage, Stage::Queued);
        assert!(corrupt.reason.is_some());

        assert_eq!(report.summary, BatchSummary {
            archives_kept: 1,
            archives_discarded: 1,
            archives_failed: 1,
            captures_seen: 2,
            captures_kept: 1,
        });
    }

    #[test]
    fn kept_captures_are_moved_and_staging_is_released() {
        let fx = Fixture::new();
        fx.archive("mixed", &[("ndt-cell", [172, 56, 0, 9]), ("ndt-home", [73, 9, 9, 9])]);

        let report = fx.run();
        let outcome = report.outcome("mixed").unwrap();

        assert_eq!(outcome.status, ArchiveStatus::Kept);
        assert_eq!(outcome.stage, Stage::PerCaptureEvaluated);
        assert_eq!(outcome.capture_date, NaiveDate::from_ymd_opt(2025, 1, 30));

        let kept = outcome.captures.iter().find(|c| c.capture == "ndt-cell.pcap.gz").unwrap();
        assert_eq!(kept.verdict, CaptureVerdict::Kept);
        assert_eq!(kept.client, Some("172.56.0.9".parse().unwrap()));
        assert_eq!(kept.resolution.asn, Some(CELLULAR_AS));
        assert_eq!(kept.resolution.resolver, Some("range-index"));

        let home = outcome.captures.iter().find(|c| c.capture == "ndt-home.pcap.gz").unwrap();
        assert_eq!(home.verdict, CaptureVerdict::Discarded);
        assert_eq!(home.resolution.asn, Some(WIRED_AS));

        let filtered = fx.config().filtered_dir;
        assert!(filtered.join("ndt-cell.pcap").is_file());
        assert!(!filtered.join("ndt-home.pcap").exists());

        let leftovers: Vec<_> = fs::read_dir(fx.config().work_dir).unwrap().collect();
        assert!(leftovers.is_empty(), "staging directories left behind: {leftovers:?}");
    }

    #[test]
    fn same_named_captures_from_two_archives_are_both_kept() {
        let fx = Fixture::new();
        fx.archive("first", &[("ndt-same", [172, 58, 1, 2])]);
        fx.archive("second", &[("ndt-same", [172, 59, 3, 4])]);

        let report = fx.run();
        assert_eq!(report.summary.captures_kept, 2);

        let filtered = fx.config().filtered_dir;
        let files: Vec<PathBuf> = fs::read_dir(&filtered).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(files.len(), 2, "{files:?}");

        let moved: Vec<&PathBuf> = report.outcomes.iter()
            .flat_map(|o| o.captures.iter())
            .filter_map(|c| c.moved_to.as_ref())
            .collect();
        assert_eq!(moved.len(), 2);
        assert_ne!(moved[0], moved[1]);
        for path in moved {
            assert!(fs::metadata(path).unwrap().len() > 0, "{} is empty", path.display());
        }
        assert!(filtered.join("ndt-same.pcap").is_file());
        assert!(filtered.join("first-ndt-same.pcap").is_file() || filtered.join("second-ndt-same.pcap").is_file());
    }

    #[test]
    fn capture_already_in_filtered_directory_is_not_overwritten() {
        let fx = Fixture::new();
        fx.archive("rerun", &[("ndt-old", [172, 58, 1, 2])]);
        let filtered = fx.config().filtered_dir;
        fs::create_dir_all(&filtered).unwrap();
        fs::write(filtered.join("ndt-old.pcap"), b"earlier run").unwrap();

        let report = fx.run();
        let capture = &report.outcome("rerun").unwrap().captures[0];

        assert_eq!(capture.verdict, CaptureVerdict::Kept);
        assert_eq!(capture.moved_to.as_deref(), Some(filtered.join("rerun-ndt-old.pcap").as_path()));
        assert_eq!(fs::read(filtered.join("ndt-old.pcap")).unwrap(), b"earlier run");
    }

    #[test]
    fn archive_without_dated_directory_fails() {
        let fx = Fixture::new();
        let tree = tempfile::tempdir().unwrap();
        fs::create_dir_all(tree.path().join("ndt/pcap/latest")).unwrap();
        fs::write(tree.path().join("ndt/pcap/latest/readme.txt"), b"nothing").unwrap();

        let file = fs::File::create(fx.root.path().join("archives/undated.tar")).unwrap();
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all("ndt", tree.path().join("ndt")).unwrap();
        builder.finish().unwrap();

        let report = fx.run();
        let outcome = report.outcome("undated").unwrap();

        assert_eq!(outcome.status, ArchiveStatus::Failed);
        assert_eq!(outcome.stage, Stage::Extracted);
        assert!(fs::read_dir(fx.config().work_dir).unwrap().next().is_none());
    }

    #[test]
    fn unresolvable_client_is_discarded_as_unknown() {
        let fx = Fixture::new();
        fx.archive("elsewhere", &[("ndt-x", [198, 51, 100, 4])]);

        let report = fx.run();
        let outcome = report.outcome("elsewhere").unwrap();

        assert_eq!(outcome.status, ArchiveStatus::Discarded);
        assert_eq!(outcome.captures[0].reason.as_deref(), Some("unknown ASN"));
    }

    #[test]
    fn non_archive_files_are_ignored() {
        let fx = Fixture::new();
        fx.raw_archive("notes.txt", b"not an archive");

        let report = fx.run();
        assert!(report.outcomes.is_empty());
    }
}
