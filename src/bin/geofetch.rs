use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use geofetch::app::{Geofetcher, GeofetchOptions};
use geofetch::error::GeofetchError;
use geofetch::ncbi::NcbiHttpClient;
use geofetch::sra::SystemSraTools;

#[derive(Parser)]
#[command(name = "geofetch")]
#[command(about = "Fetch GEO and SRA metadata and data, and build standard sample annotation sheets")]
#[command(version, author)]
struct Cli {
    /// GSE accession, or a file with one `GSE<TAB>GSM<TAB>name` row per line
    #[arg(short, long)]
    input: String,

    /// Project name; defaults to the input file name
    #[arg(short, long)]
    name: Option<String>,

    /// Parent folder for the metadata folder (a project subfolder is added)
    #[arg(short, long, default_value = ".")]
    metadata_root: Utf8PathBuf,

    /// Exact metadata folder, used as given
    #[arg(short = 'u', long)]
    metadata_folder: Option<Utf8PathBuf>,

    /// Only fetch and parse metadata, no data downloads
    #[arg(long)]
    just_metadata: bool,

    /// Re-download metadata even when a cached SOFT file exists
    #[arg(short = 'r', long)]
    refresh_metadata: bool,

    /// Also write per-accession annotation sheets
    #[arg(long)]
    acc_anno: bool,

    /// Restrict annotation columns to the standard key subset
    #[arg(long)]
    use_key_subset: bool,

    /// Give each run of a multi-run experiment its own sample entry
    #[arg(short = 'x', long)]
    split_experiments: bool,

    /// Project config template; a built-in template is used by default
    #[arg(long)]
    config_template: Option<std::path::PathBuf>,

    /// Fetch processed GEO supplementary files instead of raw SRA data
    #[arg(short = 'p', long)]
    processed: bool,

    /// Skip this many accessions before starting
    #[arg(short = 'k', long, default_value_t = 0)]
    skip: usize,

    /// Keep only processed files whose name matches this regex
    #[arg(long)]
    filter: Option<String>,

    /// Keep only processed files at most this big, e.g. `50mb`
    #[arg(long)]
    filter_size: Option<String>,

    /// Download folder for processed files
    #[arg(short = 'g', long)]
    geo_folder: Option<Utf8PathBuf>,

    /// Folder checked for existing `<run>.bam` outputs
    #[arg(short = 'b', long, default_value = "")]
    bam_folder: String,

    /// Folder checked for existing `<run>_1.fq` outputs
    #[arg(short = 'f', long, default_value = "")]
    fq_folder: String,

    /// `pipeline_interfaces` value written into the project config
    #[arg(short = 'P', long)]
    pipeline_interfaces: Option<String>,

    /// Do not keep the downloaded SOFT files
    #[arg(long)]
    clean: bool,

    /// Skip series whose family archive exceeds this size, e.g. `1gb`
    #[arg(long)]
    max_soft_size: Option<String>,

    /// Print a JSON summary when done
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<GeofetchError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &GeofetchError) -> u8 {
    match error {
        GeofetchError::UnknownAccessionType { .. }
        | GeofetchError::MalformedAccession { .. }
        | GeofetchError::InputRead(_)
        | GeofetchError::TemplateRead(_)
        | GeofetchError::SizeFormat(_)
        | GeofetchError::InvalidFilter(_) => 2,
        GeofetchError::Transport { .. }
        | GeofetchError::HttpStatus { .. }
        | GeofetchError::MissingTool(_)
        | GeofetchError::RunDownload(_) => 3,
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
    let options = GeofetchOptions {
        name: cli.name,
        metadata_root: cli.metadata_root,
        metadata_folder: cli.metadata_folder,
        just_metadata: cli.just_metadata,
        refresh_metadata: cli.refresh_metadata,
        acc_anno: cli.acc_anno,
        use_key_subset: cli.use_key_subset,
        split_experiments: cli.split_experiments,
        config_template: cli.config_template,
        processed: cli.processed,
        skip: cli.skip,
        filter: cli.filter,
        filter_size: cli.filter_size,
        geo_folder: cli.geo_folder,
        bam_folder: cli.bam_folder,
        fq_folder: cli.fq_folder,
        pipeline_interfaces: cli.pipeline_interfaces,
        clean: cli.clean,
        max_soft_size: cli.max_soft_size,
    };

    let client = NcbiHttpClient::new().into_diagnostic()?;
    let tools = SystemSraTools::new();
    let fetcher = Geofetcher::new(client, tools, options);
    let summary = fetcher.run(&cli.input).into_diagnostic()?;
    if cli.json {
        fetcher.print_summary(&summary).into_diagnostic()?;
    }
    Ok(())
}
