use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgAction, Parser};
use miette::IntoDiagnostic;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use kira_image_downloader::app::{
    CancelToken, ProgressEvent, ProgressSink, RunInputs, RunReport, Runner, TracingProgress,
};
use kira_image_downloader::atlas::{
    AtlasReader, DEFAULT_PROTEINATLAS_URL, IndexSampleQuery, LineSource, samples_from_index,
};
use kira_image_downloader::config::{
    ConfigLoader, DEFAULT_IMAGE_SUFFIX, DEFAULT_POOLSIZE, Provenance, RunOptions,
};
use kira_image_downloader::dataverse::{DataverseHttpClient, fetch_cm4ai_table};
use kira_image_downloader::domain::Sample;
use kira_image_downloader::download::{
    CopyFetcher, FakeDownloader, Fetcher, HttpFetcher, ImageDownloader, PoolDownloader,
    SkipExisting,
};
use kira_image_downloader::error::ImageDownloaderError;
use kira_image_downloader::gene::{AntibodyFilter, AttributeAggregator, MyGeneClient};
use kira_image_downloader::manifest::{
    Cm4aiTable, load_protein_list, load_samples, load_unique_list,
};
use kira_image_downloader::output::{JsonOutput, OutputMode};
use kira_image_downloader::provenance::LocalRoCrate;
use kira_image_downloader::resolver::{
    ImageSourceResolver, IndexScanResolver, LinkPrefixResolver, LocalCopyResolver,
};
use kira_image_downloader::retry::DEFAULT_MAX_RETRY;
use kira_image_downloader::store::OutputStore;
use kira_image_downloader::tui::Tui;

const EXIT_MISSING_PROVENANCE: u8 = 1;
const EXIT_FAILURE: u8 = 2;

#[derive(Parser, Serialize)]
#[command(name = "kira-imgdl")]
#[command(about = "Downloads Human Protein Atlas immunofluorescence images and writes a gene node attribute table")]
#[command(version)]
struct Cli {
    /// Output directory, must not exist yet
    outdir: PathBuf,

    /// Samples CSV: filename,if_plate_id,position,sample,status,locations,antibody,ensembl_ids,gene_names
    #[arg(long)]
    samples: Option<PathBuf>,

    /// Unique antibody CSV: antibody,ensembl_ids,gene_names,atlas_name,locations,n_location
    #[arg(long)]
    unique: Option<PathBuf>,

    /// TSV table inside a CM4AI RO-Crate directory; images are copied from it
    #[arg(long)]
    cm4ai_table: Option<PathBuf>,

    #[arg(long)]
    dataverse_doi: Option<String>,

    /// Zip file label within the dataverse DOI
    #[arg(long)]
    dataverse_dataset: Option<String>,

    /// Gene symbols or Ensembl ids, one per line; samples come from the image index
    #[arg(long)]
    protein_list: Option<PathBuf>,

    /// Cell line whose images are taken from the image index, U2OS when only
    /// a protein list is given
    #[arg(long)]
    cell_line: Option<String>,

    /// Provenance JSON file, run without it to see the expected format
    #[arg(long)]
    provenance: Option<PathBuf>,

    /// URL or path to proteinatlas.xml or proteinatlas.xml.gz
    #[arg(long, default_value = DEFAULT_PROTEINATLAS_URL)]
    proteinatlasxml: String,

    /// Download the first sample only and copy it for every other sample
    #[arg(long)]
    fake_images: bool,

    /// Parallel downloads; large values may overload the image server
    #[arg(long, default_value_t = DEFAULT_POOLSIZE)]
    poolsize: usize,

    #[arg(long, default_value = DEFAULT_IMAGE_SUFFIX)]
    imgsuffix: String,

    /// Skip images that already exist and are not empty
    #[arg(long)]
    skip_existing: bool,

    /// Finish successfully even if some images never downloaded
    #[arg(long)]
    skip_failed: bool,

    /// Do not write task start and finish markers
    #[arg(long)]
    skip_logging: bool,

    #[arg(long, default_value_t = DEFAULT_MAX_RETRY)]
    max_retry: usize,

    /// 1-indexed image picked when an antibody has several
    #[arg(long, default_value_t = 1)]
    fold: usize,

    /// Per request timeout for image downloads
    #[arg(long)]
    timeout_secs: Option<u64>,

    #[arg(long)]
    non_interactive: bool,

    #[arg(short, long, action = ArgAction::Count)]
    #[serde(skip)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let Some(provenance_path) = cli.provenance.clone() else {
        print_provenance_help();
        return ExitCode::from(EXIT_MISSING_PROVENANCE);
    };
    if let Err(report) = run(cli, provenance_path) {
        tracing::error!("caught error: {report}");
        eprintln!("{report:?}");
        return ExitCode::from(EXIT_FAILURE);
    }
    ExitCode::SUCCESS
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_provenance_help() {
    let with_ids = serde_json::to_string_pretty(&Provenance::example(true)).unwrap_or_default();
    let register = serde_json::to_string_pretty(&Provenance::example(false)).unwrap_or_default();
    eprintln!(
        "\n\n--provenance flag is required to run this tool. Please pass a path to a JSON file with the following data:\n\n\
         If datasets are already registered then the following is sufficient:\n\n{with_ids}\n\n\
         If datasets are NOT registered, then the following is required:\n\n{register}\n"
    );
}

fn run(cli: Cli, provenance_path: PathBuf) -> miette::Result<()> {
    let provenance = ConfigLoader::load_provenance(&provenance_path)?;
    if cli.samples.is_none()
        && cli.cm4ai_table.is_none()
        && cli.dataverse_doi.is_none()
        && cli.protein_list.is_none()
        && cli.cell_line.is_none()
    {
        return Err(ImageDownloaderError::MissingInputSelection.into());
    }
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match output_mode {
        OutputMode::NonInteractive => {
            let cancel = CancelToken::new();
            let report = if cli.verbose > 0 {
                execute(cli, provenance, &TracingProgress, &cancel)?
            } else {
                execute(cli, provenance, &JsonOutput, &cancel)?
            };
            JsonOutput::print_report(&report).into_diagnostic()?;
        }
        OutputMode::Interactive => {
            let mut tui = Tui::new();
            let cancel = CancelToken::new();
            let worker_cancel = cancel.clone();
            let report =
                tui.run(cancel, move |sink| execute(cli, provenance, sink, &worker_cancel))?;
            println!(
                "{} images in {} ({} failed, {} retry rounds, {} gene attributes)",
                report.tasks,
                report.outdir,
                report.failures_remaining,
                report.retry_rounds,
                report.attribute_rows
            );
        }
    }
    Ok(())
}

fn execute(
    cli: Cli,
    provenance: Provenance,
    sink: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<RunReport, ImageDownloaderError> {
    let commandline = serde_json::to_value(&cli).ok();
    let mut existing_outdir = false;
    let mut cm4ai_table = cli.cm4ai_table.clone();
    if cm4ai_table.is_none() {
        if let Some(doi) = &cli.dataverse_doi {
            let dataset = cli.dataverse_dataset.as_deref().ok_or_else(|| {
                ImageDownloaderError::DataverseResolution(
                    "Name of dataset within the DOI must be specified".to_string(),
                )
            })?;
            let client = DataverseHttpClient::new()?;
            cm4ai_table = Some(fetch_cm4ai_table(&client, doi, dataset, &cli.outdir, sink)?);
            existing_outdir = true;
        }
    }

    let fetcher: Box<dyn Fetcher> = if cm4ai_table.is_some() {
        Box::new(CopyFetcher)
    } else {
        Box::new(HttpFetcher::new(cli.timeout_secs.map(Duration::from_secs))?)
    };
    let fetcher: Box<dyn Fetcher> = if cli.skip_existing {
        Box::new(SkipExisting::new(fetcher))
    } else {
        fetcher
    };

    let (inputs, resolver): (RunInputs, Box<dyn ImageSourceResolver>) = match &cm4ai_table {
        Some(table) => {
            let table = Cm4aiTable::load(table)?;
            let inputs = RunInputs {
                samples: table.samples,
                unique: Some(table.unique),
            };
            (inputs, Box::new(LocalCopyResolver::new(cli.imgsuffix.clone())))
        }
        None => {
            let (samples, unique) = match cli.samples.as_deref() {
                Some(samples_path) => (
                    load_samples(samples_path)?,
                    cli.unique.as_deref().map(load_unique_list).transpose()?,
                ),
                None => {
                    existing_outdir = true;
                    (samples_from_atlas(&cli, sink)?, None)
                }
            };
            let has_links = samples
                .first()
                .map(|sample| sample.link_prefix().is_some())
                .unwrap_or(false);
            let resolver: Box<dyn ImageSourceResolver> = if has_links {
                Box::new(LinkPrefixResolver::new())
            } else {
                let reader = AtlasReader::new(cli.proteinatlasxml.clone(), cli.outdir.clone())?;
                Box::new(IndexScanResolver::new(Box::new(reader)))
            };
            (RunInputs { samples, unique }, resolver)
        }
    };

    let fake_images = use_fake_images(cli.fake_images, cm4ai_table.is_some());
    let downloader: Box<dyn ImageDownloader> = if fake_images {
        Box::new(FakeDownloader::new(fetcher).with_cancel(cancel.clone()))
    } else {
        if cli.poolsize > DEFAULT_POOLSIZE {
            tracing::warn!(
                "poolsize {} may overload the image server",
                cli.poolsize
            );
        }
        Box::new(PoolDownloader::new(fetcher, cli.poolsize).with_cancel(cancel.clone()))
    };

    let filter = if inputs.unique.is_some() {
        AntibodyFilter::UniqueList
    } else {
        AntibodyFilter::Unrestricted
    };
    let aggregator = AttributeAggregator::new(MyGeneClient::new()?, cli.fold, filter);

    let options = RunOptions {
        image_suffix: cli.imgsuffix.clone(),
        max_retry: cli.max_retry,
        skip_failed: cli.skip_failed,
        skip_logging: cli.skip_logging,
        existing_outdir,
        commandline,
        ..RunOptions::new(cli.outdir.clone())
    };
    let mut runner = Runner::new(
        options,
        provenance,
        inputs,
        resolver,
        downloader,
        aggregator,
        LocalRoCrate::new(),
    )?
    .with_cancel(cancel.clone());
    runner.run(sink)
}

/// Creates the output directory, fetches the image index into it and turns
/// the composite images of the requested proteins and cell line into samples.
fn samples_from_atlas(
    cli: &Cli,
    sink: &dyn ProgressSink,
) -> Result<Vec<Sample>, ImageDownloaderError> {
    let proteins = cli.protein_list.as_deref().map(load_protein_list).transpose()?;
    let query = IndexSampleQuery::new(proteins, cli.cell_line.as_deref());
    OutputStore::from_path(&cli.outdir)?.create(false)?;
    sink.event(ProgressEvent::message(format!(
        "phase=Prepare; selecting {} images from the image index",
        query.cell_line()
    )));
    let reader = AtlasReader::new(cli.proteinatlasxml.clone(), cli.outdir.clone())?;
    let samples = samples_from_index(reader.open(sink)?, &query)?;
    if samples.is_empty() {
        return Err(ImageDownloaderError::NoMatchingSamples(format!(
            "cell line {}",
            query.cell_line()
        )));
    }
    tracing::info!("{} samples selected from the image index", samples.len());
    Ok(samples)
}

/// Fake images only apply to remote downloads; CM4AI and Dataverse inputs
/// are copied as they are.
fn use_fake_images(requested: bool, copying_local_table: bool) -> bool {
    if requested && copying_local_table {
        tracing::warn!("--fake-images has no effect when images are copied from a CM4AI table");
        return false;
    }
    requested
}
