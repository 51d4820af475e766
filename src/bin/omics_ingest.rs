use std::io::Write;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use omics_ingest::config::{ConfigLoader, ResolvedConfig};
use omics_ingest::domain::{RecordKind, SampleAccession};
use omics_ingest::error::IngestError;
use omics_ingest::layout::DataLayout;
use omics_ingest::loader::{LoadOptions, Loader};
use omics_ingest::output::{JsonOutput, OutputMode, TextOutput};
use omics_ingest::store::JsonStore;

#[derive(Parser)]
#[command(name = "omics-ingest")]
#[command(about = "Idempotent loader for per-sample metagenomic assembly outputs")]
#[command(version, author)]
struct Cli {
    /// Config file (default: ./omics-ingest.json)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Sync samples and run every pending stage")]
    Load(LoadArgs),
    #[command(about = "Register the samples of the sample list")]
    Sync(SyncArgs),
    #[command(about = "Show per-sample load status")]
    Status,
    #[command(about = "Print a stored sequence from its source file")]
    Sequence(SequenceArgs),
    #[command(about = "Lowest common ancestor lineage of taxids")]
    Lca(LcaArgs),
    #[command(about = "Delete the bins of a sample so binning can be re-run")]
    DeleteBins(DeleteBinsArgs),
}

#[derive(Args)]
struct LoadArgs {
    /// Override the configured sample list
    #[arg(long)]
    sample_list: Option<Utf8PathBuf>,

    /// Only process samples already in the store
    #[arg(long)]
    no_sync: bool,
}

#[derive(Args)]
struct SyncArgs {
    #[arg(long)]
    sample_list: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct SequenceArgs {
    sample: String,
    kind: RecordKind,
    identifier: String,

    /// Print header and sequence as FASTA
    #[arg(long, conflicts_with = "raw")]
    fasta: bool,

    /// Print the exact source bytes
    #[arg(long)]
    raw: bool,
}

#[derive(Args)]
struct LcaArgs {
    #[arg(required = true)]
    taxids: Vec<u32>,
}

#[derive(Args)]
struct DeleteBinsArgs {
    sample: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<IngestError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &IngestError) -> u8 {
    match error {
        IngestError::MissingConfig
        | IngestError::ConfigRead(_)
        | IngestError::SampleNotFound(_)
        | IngestError::RecordNotFound(_)
        | IngestError::UnknownTaxon(_) => 2,
        IngestError::HeaderParse { .. }
        | IngestError::SequenceCorrupt { .. }
        | IngestError::CoverageFormat { .. }
        | IngestError::OrderViolation { .. }
        | IngestError::BinFileName { .. }
        | IngestError::DuplicateBin { .. }
        | IngestError::StatsUnknownField { .. }
        | IngestError::StatsValue { .. }
        | IngestError::StatsFormat { .. }
        | IngestError::StatsSampleMismatch { .. }
        | IngestError::UnknownBin { .. }
        | IngestError::UnknownTaxName { .. }
        | IngestError::LineageTooDeep(_)
        | IngestError::TaxonomyFormat { .. } => 3,
        IngestError::MissingTool(_)
        | IngestError::Decompress(_)
        | IngestError::DecompressTimeout { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let mut loader = open_loader(&config)?;

    match cli.command {
        Commands::Load(args) => {
            let sample_list = if args.no_sync {
                None
            } else {
                Some(args.sample_list.unwrap_or_else(|| config.sample_list.clone()))
            };
            match mode {
                OutputMode::Json => {
                    let report = loader.load_all(sample_list.as_deref(), &JsonOutput)?;
                    JsonOutput::print_load(&report).into_diagnostic()?;
                }
                OutputMode::Text => {
                    let report = loader.load_all(sample_list.as_deref(), &TextOutput)?;
                    TextOutput::print_load(&report);
                }
            }
        }
        Commands::Sync(args) => {
            let sample_list = args.sample_list.unwrap_or_else(|| config.sample_list.clone());
            let report = loader.sync_samples(&sample_list)?;
            match mode {
                OutputMode::Json => JsonOutput::print_sync(&report).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_sync(&report),
            }
        }
        Commands::Status => {
            let report = loader.status();
            match mode {
                OutputMode::Json => JsonOutput::print_status(&report).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_status(&report),
            }
        }
        Commands::Sequence(args) => {
            let sample: SampleAccession = args.sample.parse()?;
            if args.raw {
                let bytes = loader.raw_sequence(&sample, args.kind, &args.identifier)?;
                std::io::stdout().write_all(&bytes).into_diagnostic()?;
                return Ok(());
            }
            let sequence = loader.sequence(&sample, args.kind, &args.identifier)?;
            match mode {
                OutputMode::Json => JsonOutput::print_sequence(&sequence).into_diagnostic()?,
                OutputMode::Text if args.fasta => println!("{}", sequence.to_fasta()),
                OutputMode::Text => println!("{}", sequence.sequence),
            }
        }
        Commands::Lca(args) => {
            let names = loader.lca(&args.taxids)?;
            match mode {
                OutputMode::Json => JsonOutput::print_lineage(&names).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_lineage(&names),
            }
        }
        Commands::DeleteBins(args) => {
            let sample: SampleAccession = args.sample.parse()?;
            let deleted = loader.delete_bins(&sample)?;
            match mode {
                OutputMode::Json => JsonOutput::print_deleted(sample.as_str(), deleted).into_diagnostic()?,
                OutputMode::Text => println!("deleted {deleted} bin(s) of {sample}"),
            }
        }
    }
    Ok(())
}

fn open_loader(config: &ResolvedConfig) -> Result<Loader<JsonStore>, IngestError> {
    let store = JsonStore::open(&config.store)?;
    let layout = DataLayout::new(config.data_root.clone());
    Ok(Loader::new(store, layout, LoadOptions::from_config(config)))
}
