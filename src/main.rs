mod analyser;
mod asn;
mod error;
mod intake;
mod ui;
mod workers;

use anyhow::{bail, Context};
use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand};
use log::LevelFilter;
use simple_logger::SimpleLogger;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use analyser::core::{self as featurizer, TraceClass};
use analyser::table;
use analyser::trace::Backend;
use asn::cellular::CellularAsns;
use asn::index::AsnRangeIndex;
use asn::lookup::{CancelToken, OnlineResolver, ResolverChain, RetryPolicy, RipeStat};
use intake::pipeline::{Filter, FilterConfig};
use ui::output;

/// Minimum spacing between two requests to the online lookup service.
const ONLINE_MIN_INTERVAL: Duration = Duration::from_millis(250);

/// cellsniff tells cellular from Wi-Fi access by looking at packet traces
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Display summaries as formatted JSON
    #[arg(short = 'j', long, global = true, action = ArgAction::SetTrue)]
    json: bool,

    /// Capture decoder
    #[arg(long, global = true, value_enum, default_value_t = Backend::Native)]
    backend: Backend,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute the per-trace feature table of labelled traces
    Featurize {
        /// Directory holding one subdirectory of traces per class
        #[arg(short = 'd', long, env = "CELLSNIFF_DATA_DIR")]
        data: PathBuf,

        /// Feature CSV to write
        #[arg(short = 'o', long, default_value = "features.csv")]
        output: PathBuf,

        /// Class subdirectory and its label, as NAME=LABEL (repeatable)
        #[arg(short = 'c', long = "class", value_name = "NAME=LABEL")]
        classes: Vec<TraceClass>,

        /// Shuffle the traces with this seed before analysis
        #[arg(long)]
        shuffle_seed: Option<u64>,

        /// Worker threads, 0 for one per core
        #[arg(long, default_value_t = 0)]
        jobs: usize,
    },

    /// Extract measurement archives and keep the captures of cellular clients
    Filter {
        /// Directory of .tgz archives
        #[arg(short = 'a', long, env = "CELLSNIFF_ARCHIVE_DIR")]
        archives: PathBuf,

        /// Scratch directory for extraction
        #[arg(short = 'w', long, env = "CELLSNIFF_WORK_DIR")]
        work_dir: PathBuf,

        /// Where kept captures are moved
        #[arg(short = 'f', long, env = "CELLSNIFF_FILTERED_DIR")]
        filtered_dir: PathBuf,

        #[command(flatten)]
        reference: ReferenceArgs,

        /// Ask the online lookup service when the mapping has no answer
        #[arg(long, action = ArgAction::SetTrue)]
        online: bool,

        /// Worker threads, 0 for one per core
        #[arg(long, default_value_t = 0)]
        jobs: usize,

        /// Seconds after which online lookups are abandoned
        #[arg(long, default_value_t = 3600)]
        batch_timeout: u64,

        /// Write the per-archive outcome log (JSON) here
        #[arg(long)]
        outcome_log: Option<PathBuf>,
    },

    /// Per-packet table with source/destination ASN and a cellular flag
    Annotate {
        /// pcap/pcapng file to annotate
        #[arg(short = 'f', long)]
        file: PathBuf,

        #[command(flatten)]
        reference: ReferenceArgs,

        /// CSV to write
        #[arg(short = 'o', long, default_value = "annotated.csv")]
        output: PathBuf,
    },

    /// Per-packet header table
    Dump {
        /// pcap/pcapng file to dump
        #[arg(short = 'f', long)]
        file: PathBuf,

        /// CSV to write
        #[arg(short = 'o', long, default_value = "packets.csv")]
        output: PathBuf,
    },
}

#[derive(ClapArgs, Debug)]
struct ReferenceArgs {
    /// Cellular ASN list, one ASN per line
    #[arg(long, env = "CELLSNIFF_ASN_LIST")]
    asn_list: PathBuf,

    /// IPv4 start_ip,end_ip,asn mapping
    #[arg(long, env = "CELLSNIFF_IPV4_MAP")]
    ipv4_map: Option<PathBuf>,

    /// IPv6 start_ip,end_ip,asn mapping
    #[arg(long, env = "CELLSNIFF_IPV6_MAP")]
    ipv6_map: Option<PathBuf>,
}

impl ReferenceArgs {
    /// Reference data is required; failing to load it ends the run.
    fn load(&self) -> anyhow::Result<(AsnRangeIndex, CellularAsns)> {
        let cellular = CellularAsns::load(&self.asn_list)?;
        let maps: Vec<&PathBuf> = self.ipv4_map.iter().chain(self.ipv6_map.iter()).collect();
        let index = AsnRangeIndex::load(&maps)?;
        if index.is_empty() {
            log::warn!("No ASN ranges loaded; every address resolves to an unknown ASN");
        }
        Ok((index, cellular))
    }
}

fn main() -> anyhow::Result<()> {
    SimpleLogger::new().with_level(LevelFilter::Info).env().init()?;

    let args = Args::parse();

    match args.command {
        Command::Featurize { data, output: out, classes, shuffle_seed, jobs } => {
            let classes = if classes.is_empty() { TraceClass::defaults() } else { classes };
            let mut traces = featurizer::discover(&data, &classes)
                .with_context(|| format!("cannot list traces under {}", data.display()))?;
            if let Some(seed) = shuffle_seed {
                featurizer::shuffle(&mut traces, seed);
            }

            let report = featurizer::featurize(&traces, args.backend, jobs);
            output::write_features(&out, &report.rows)?;

            if args.json {
                println!("{}", output::data_as_json(&report.summary)?);
            } else {
                output::print_featurize_summary(&report.summary, &out);
            }
        }

        Command::Filter {
            archives,
            work_dir,
            filtered_dir,
            reference,
            online,
            jobs,
            batch_timeout,
            outcome_log,
        } => {
            if !archives.is_dir() {
                bail!("archive directory {} does not exist", archives.display());
            }
            let (index, cellular) = reference.load()?;

            let mut resolvers = ResolverChain::new().with(index);
            if online {
                let cancel = CancelToken::with_timeout(Duration::from_secs(batch_timeout));
                resolvers = resolvers.with(OnlineResolver::new(
                    RipeStat::default(),
                    RetryPolicy::default(),
                    ONLINE_MIN_INTERVAL,
                    cancel,
                ));
            }

            let config = FilterConfig { archives_dir: archives, work_dir, filtered_dir, jobs, backend: args.backend };
            let report = Filter::new(config, &resolvers, &cellular).run()?;

            if let Some(path) = outcome_log.as_deref() {
                write_json(&report, path)?;
                log::info!("Outcome log written to {}", path.display());
            }
            if args.json {
                println!("{}", output::data_as_json(&report)?);
            } else {
                output::print_batch_summary(&report);
            }
        }

        Command::Annotate { file, reference, output: out } => {
            let (index, cellular) = reference.load()?;
            let rows = table::annotate(&file, args.backend, &index, &cellular)?;
            output::write_table(&out, &rows)?;
            log::info!("Annotated {} packets into {}", rows.len(), out.display());
        }

        Command::Dump { file, output: out } => {
            let rows = table::dump(&file, args.backend)?;
            output::write_table(&out, &rows)?;
            log::info!("Dumped {} packets into {}", rows.len(), out.display());
        }
    }

    Ok(())
}

fn write_json<T: serde::Serialize>(data: &T, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("cannot create {}", parent.display()))?;
    }
    output::data_to_file(&output::data_as_json(data)?, path)?;
    Ok(())
}
