use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, ValueEnum};

use gridseq::{
    dump, grid::COORDINATOR, share, DistributedIndex, LocalCluster, LocalComm, NameTable,
    Policy, ProcessGrid, ReadOptions, Result, SequenceStore,
};

#[derive(Parser)]
#[command(name = "gridseq")]
#[command(about = "Load a FASTA file into 2-bit stores replicated over a square worker grid", long_about = None)]
#[command(version)]
struct Cli {
    /// Input FASTA file
    #[arg(value_name = "FASTA")]
    fasta: PathBuf,

    /// Index of the FASTA file (default: <FASTA>.fai)
    #[arg(short = 'i', long, value_name = "FAI")]
    index: Option<PathBuf>,

    /// Number of workers, must be a perfect square (default: largest square <= CPUs)
    #[arg(short = 'n', long, value_name = "INT")]
    workers: Option<usize>,

    /// Handling of symbols outside of ACGT
    #[arg(short = 'p', long, value_enum, default_value_t = PolicyArg::Reject)]
    policy: PolicyArg,

    /// Seed for the random substitution policy
    #[arg(long, value_name = "INT")]
    seed: Option<u64>,

    /// Write per-worker index and sequence logs and a summary under this prefix
    #[arg(short = 'o', long, value_name = "PREFIX")]
    output_prefix: Option<PathBuf>,

    /// Capture sequence names from the index and use them in the logs
    #[arg(long)]
    names: bool,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    /// Fail on the first invalid symbol
    Reject,
    A,
    C,
    G,
    T,
    /// Substitute a random base
    Random,
}
impl From<PolicyArg> for Policy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Reject => Policy::BreakOnInvalid,
            PolicyArg::A => Policy::SetToA,
            PolicyArg::C => Policy::SetToC,
            PolicyArg::G => Policy::SetToG,
            PolicyArg::T => Policy::SetToT,
            PolicyArg::Random => Policy::RandomDraw,
        }
    }
}

fn default_index(fasta: &Path) -> PathBuf {
    let mut path = fasta.as_os_str().to_owned();
    path.push(".fai");
    PathBuf::from(path)
}

fn run_worker(
    cli: &Cli,
    index_path: &Path,
    options: &ReadOptions,
    grid: ProcessGrid<LocalComm>,
) -> Result<()> {
    let mut names = NameTable::new();
    let capture = (cli.names && grid.is_coordinator()).then_some(&mut names);
    let index = DistributedIndex::read(index_path, capture, &grid)?;
    if cli.names {
        names.broadcast(COORDINATOR, grid.world())?;
    }

    let local = SequenceStore::read(&cli.fasta, &index, &grid, options)?;
    if let Some(prefix) = &cli.output_prefix {
        let path = dump::write_index_log(&index, prefix)?;
        log::info!("[{}] wrote {:?}", grid.tag(), path);
    }
    drop(index);
    let (row, col) = share(&local, &grid)?;
    log::debug!(
        "[{}] {} local, {} row, {} column sequences",
        grid.tag(),
        local.num_seqs(),
        row.num_seqs(),
        col.num_seqs()
    );

    if let Some(prefix) = &cli.output_prefix {
        let table = cli.names.then_some(&names);
        let path = dump::write_log(&local, prefix, table, grid.rank())?;
        log::info!("[{}] wrote {:?}", grid.tag(), path);

        let mut summary = prefix.as_os_str().to_owned();
        summary.push(".summary.tsv");
        dump::write_summary(&local, Path::new(&summary), &grid)?;
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp(None)
        .format_target(false)
        .init();

    let index_path = cli.index.clone().unwrap_or_else(|| default_index(&cli.fasta));
    let mut options = ReadOptions::builder().policy(cli.policy.into());
    if let Some(seed) = cli.seed {
        options = options.seed(seed);
    }
    let options = options.build();

    let cluster = match cli.workers {
        Some(workers) => LocalCluster::new(workers),
        None => Ok(LocalCluster::with_available_cpus()),
    };
    let outcome = cluster.and_then(|cluster| {
        log::info!("running on {} workers", cluster.workers());
        cluster.run(|grid| run_worker(&cli, &index_path, &options, grid))
    });

    if let Err(e) = outcome {
        log::error!("{e}");
        // configuration errors end the run normally once reported
        if !e.is_graceful() {
            std::process::exit(1);
        }
    }
}
