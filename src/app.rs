use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::{DatasetProvenance, Provenance, RunOptions};
use crate::domain::{Sample, UniqueEntry};
use crate::download::ImageDownloader;
use crate::error::ImageDownloaderError;
use crate::gene::{AttributeAggregator, GeneQuery};
use crate::manifest::write_csv;
use crate::provenance::{
    ComputationInfo, CrateInfo, DatasetInfo, ProvenanceRegistrar, SoftwareInfo, today,
};
use crate::resolver::{ImageSourceResolver, ImageTasks};
use crate::retry::RetryCoordinator;
use crate::store::{
    IMAGE_GENE_NODE_ATTR_FILE, OutputStore, SAMPLES_CSVFILE, TaskFinish, TaskStart,
    UNIQUE_CSVFILE,
};

const TOOL_NAME: &str = "kira-image-downloader";
/// Finish marker status of a run that did not complete.
const STATUS_INCOMPLETE: i32 = 99;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: None,
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Forwards progress to the log.
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => tracing::info!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => tracing::info!("{}", event.message),
        }
    }
}

/// Raised by whoever drives the run, checked between phases and between
/// download tasks. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), ImageDownloaderError> {
        if self.is_cancelled() {
            return Err(ImageDownloaderError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RunInputs {
    pub samples: Vec<Sample>,
    pub unique: Option<Vec<UniqueEntry>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outdir: String,
    pub tasks: usize,
    pub skipped_samples: usize,
    pub failures_remaining: usize,
    pub retry_rounds: usize,
    pub attribute_rows: usize,
    pub aggregation_errors: usize,
    pub elapsed_secs: f64,
}

/// Writes the finish marker when dropped, whichever way the run ends.
struct FinishGuard {
    store: OutputStore,
    start_time: i64,
    status: i32,
    enabled: bool,
}

impl FinishGuard {
    fn new(store: OutputStore, start_time: i64, enabled: bool) -> Self {
        Self {
            store,
            start_time,
            status: STATUS_INCOMPLETE,
            enabled,
        }
    }

    fn succeed(&mut self) {
        self.status = 0;
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let end_time = chrono::Utc::now().timestamp();
        let finish = TaskFinish {
            start_time: self.start_time,
            end_time,
            elapsed_time: end_time - self.start_time,
            status: self.status,
        };
        let path = self.store.task_finish_path(self.start_time);
        if let Err(err) = OutputStore::write_json_atomic(&path, &finish) {
            tracing::error!("failed to write {path}: {err}");
        }
    }
}

/// Sequences one run: output directory, markers, provenance, attribute
/// table, then download with retries.
pub struct Runner<Q: GeneQuery, P: ProvenanceRegistrar> {
    store: OutputStore,
    options: RunOptions,
    provenance: Provenance,
    inputs: RunInputs,
    resolver: Box<dyn ImageSourceResolver>,
    downloader: Box<dyn ImageDownloader>,
    aggregator: AttributeAggregator<Q>,
    registrar: P,
    cancel: CancelToken,
}

impl<Q: GeneQuery, P: ProvenanceRegistrar> Runner<Q, P> {
    /// Validates the configuration without touching the filesystem.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: RunOptions,
        provenance: Provenance,
        inputs: RunInputs,
        resolver: Box<dyn ImageSourceResolver>,
        downloader: Box<dyn ImageDownloader>,
        aggregator: AttributeAggregator<Q>,
        registrar: P,
    ) -> Result<Self, ImageDownloaderError> {
        provenance.validate(inputs.unique.is_some())?;
        let store = OutputStore::from_path(&options.outdir)?;
        Ok(Self {
            store,
            options,
            provenance,
            inputs,
            resolver,
            downloader,
            aggregator,
            registrar,
            cancel: CancelToken::new(),
        })
    }

    /// Stops the run at the next phase boundary once `cancel` is raised. The
    /// downloader needs the same token to stop between tasks.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &OutputStore {
        &self.store
    }

    pub fn run(&mut self, sink: &dyn ProgressSink) -> Result<RunReport, ImageDownloaderError> {
        let started = Instant::now();
        let start_time = chrono::Utc::now().timestamp();

        sink.event(ProgressEvent::message(format!(
            "phase=Prepare; creating {}",
            self.store.root()
        )));
        self.store.create(self.options.existing_outdir)?;
        let mut guard = FinishGuard::new(
            self.store.clone(),
            start_time,
            !self.options.skip_logging,
        );
        if !self.options.skip_logging {
            self.write_task_start(start_time)?;
        }
        self.cancel.check()?;

        sink.event(ProgressEvent::message("phase=Provenance; registering run"));
        let root = self.store.root().to_owned();
        self.registrar.register_rocrate(
            &root,
            &CrateInfo {
                name: TOOL_NAME.to_string(),
                organization_name: self.provenance.organization_name.clone(),
                project_name: self.provenance.project_name.clone(),
                description: "Immunofluorescence images and gene node attributes".to_string(),
            },
        )?;
        let input_ids = self.register_input_datasets()?;
        let software_id = self.registrar.register_software(
            &root,
            &SoftwareInfo {
                name: TOOL_NAME.to_string(),
                description: env!("CARGO_PKG_DESCRIPTION").to_string(),
                author: env!("CARGO_PKG_AUTHORS").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                file_format: "bin".to_string(),
                url: env!("CARGO_PKG_REPOSITORY").to_string(),
            },
        )?;

        self.cancel.check()?;
        sink.event(ProgressEvent::message("phase=Attributes; building gene node attributes"));
        let table = self
            .aggregator
            .aggregate(&self.inputs.samples, self.inputs.unique.as_deref())?;
        table.write_tsv(&self.store.attributes_path())?;
        table.write_errors(&self.store.errors_path())?;
        let attributes_id = self.registrar.register_dataset(
            &root,
            &DatasetInfo {
                name: format!("{TOOL_NAME} output file"),
                description: "Image gene node attributes file".to_string(),
                author: String::new(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                data_format: "tsv".to_string(),
                date_published: today(),
                location: IMAGE_GENE_NODE_ATTR_FILE.to_string(),
            },
        )?;
        self.registrar.register_computation(
            &root,
            &ComputationInfo {
                name: format!("{TOOL_NAME} computation"),
                run_by: run_by(),
                command: self
                    .options
                    .commandline
                    .as_ref()
                    .map(|value| value.to_string())
                    .unwrap_or_default(),
                description: format!("run of {TOOL_NAME}"),
                used_software: vec![software_id],
                used_dataset: input_ids,
                generated: vec![attributes_id],
            },
        )?;

        self.cancel.check()?;
        sink.event(ProgressEvent::message(format!(
            "phase=Resolve; {} samples via {}",
            self.inputs.samples.len(),
            self.resolver.name()
        )));
        self.resolver.prepare(&self.inputs.samples, sink)?;
        let mut generator = ImageTasks::new(
            self.resolver.as_ref(),
            &self.inputs.samples,
            &self.store,
            &self.options.image_suffix,
        );
        let tasks: Vec<_> = generator.by_ref().collect();
        let skipped_samples = generator.skipped();
        let task_count = tasks.len();
        self.cancel.check()?;

        sink.event(ProgressEvent::message(format!(
            "phase=Download; {task_count} images with {}",
            self.downloader.describe()
        )));
        let failures = self.downloader.download_images(tasks, sink)?;
        self.cancel.check()?;
        let outcome =
            RetryCoordinator::new(self.downloader.as_ref(), self.options.max_retry).run(failures, sink)?;
        if !outcome.failures.is_empty() {
            if !self.options.skip_failed {
                return Err(ImageDownloaderError::DownloadsFailed {
                    count: outcome.failures.len(),
                });
            }
            tracing::warn!(
                "{} images failed to download, continuing as requested",
                outcome.failures.len()
            );
        }

        guard.succeed();
        Ok(RunReport {
            outdir: self.store.root().to_string(),
            tasks: task_count,
            skipped_samples,
            failures_remaining: outcome.failures.len(),
            retry_rounds: outcome.rounds,
            attribute_rows: table.attributes.len(),
            aggregation_errors: table.errors.len(),
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }

    fn write_task_start(&self, start_time: i64) -> Result<(), ImageDownloaderError> {
        let start = TaskStart {
            start_time,
            version: env!("CARGO_PKG_VERSION").to_string(),
            outdir: self.store.root().to_string(),
            image_downloader: self.downloader.describe(),
            image_suffix: self.options.image_suffix.clone(),
            commandlineargs: self.options.commandline.clone(),
        };
        OutputStore::write_json_atomic(&self.store.task_start_path(start_time), &start)
    }

    /// Ids of the samples dataset and, when a unique list is in use, the
    /// unique dataset. Unregistered datasets are written into the output
    /// directory and registered from there.
    fn register_input_datasets(&self) -> Result<Vec<String>, ImageDownloaderError> {
        let root = self.store.root();
        let mut ids = Vec::with_capacity(2);
        let samples_id = match &self.provenance.samples {
            DatasetProvenance::Registered { guid } => guid.clone(),
            DatasetProvenance::Described(descriptor) => {
                write_csv(&self.inputs.samples, &self.store.samples_copy_path())?;
                self.registrar.register_dataset(
                    root,
                    &DatasetInfo::from_descriptor(descriptor, SAMPLES_CSVFILE),
                )?
            }
        };
        tracing::debug!("samples dataset id: {samples_id}");
        ids.push(samples_id);

        if let Some(unique) = &self.inputs.unique {
            let unique_id = match &self.provenance.unique {
                Some(DatasetProvenance::Registered { guid }) => guid.clone(),
                Some(DatasetProvenance::Described(descriptor)) => {
                    write_csv(unique, &self.store.unique_copy_path())?;
                    self.registrar.register_dataset(
                        root,
                        &DatasetInfo::from_descriptor(descriptor, UNIQUE_CSVFILE),
                    )?
                }
                None => {
                    return Err(ImageDownloaderError::InvalidProvenance(
                        "unique dataset is missing".to_string(),
                    ));
                }
            };
            tracing::debug!("unique dataset id: {unique_id}");
            ids.push(unique_id);
        }
        Ok(ids)
    }
}

fn run_by() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}
