use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::app::{CancelToken, ProgressEvent, ProgressSink};
use crate::domain::{Color, DownloadTask, FailureRecord};
use crate::error::ImageDownloaderError;
use crate::store::OutputStore;

const CHUNK_SIZE: usize = 8192;

/// Executes a single task. `Ok(None)` is success, `Ok(Some(_))` a retryable
/// failure and `Err(_)` aborts the whole batch.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, task: &DownloadTask) -> Result<Option<FailureRecord>, ImageDownloaderError>;
    fn describe(&self) -> String;
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Option<Duration>) -> Result<Self, ImageDownloaderError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-imgdl/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?,
        );
        let mut builder = Client::builder().default_headers(headers);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|err| ImageDownloaderError::DownloadHttp(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, task: &DownloadTask) -> Result<Option<FailureRecord>, ImageDownloaderError> {
        tracing::debug!("downloading {task}");
        let mut response = self
            .client
            .get(&task.source)
            .send()
            .map_err(|err| ImageDownloaderError::DownloadHttp(format!("{}: {err}", task.source)))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().unwrap_or_default();
            return Ok(Some(FailureRecord {
                status,
                message,
                task: task.clone(),
            }));
        }

        let partial = partial_path(&task.destination);
        let mut file = File::create(&partial)
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        let mut buffer = [0u8; CHUNK_SIZE];
        loop {
            let read = response.read(&mut buffer).map_err(|err| {
                ImageDownloaderError::DownloadHttp(format!("{}: {err}", task.source))
            })?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        }
        file.flush()
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        fs::rename(&partial, &task.destination)
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        Ok(None)
    }

    fn describe(&self) -> String {
        "http".to_string()
    }
}

/// Treats task sources as local paths. A missing source is reported like an
/// HTTP 404 so it goes through the same retry accounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyFetcher;

impl Fetcher for CopyFetcher {
    fn fetch(&self, task: &DownloadTask) -> Result<Option<FailureRecord>, ImageDownloaderError> {
        let source = Path::new(&task.source);
        if !source.is_file() {
            return Ok(Some(FailureRecord {
                status: 404,
                message: format!("{} not found", task.source),
                task: task.clone(),
            }));
        }
        tracing::debug!("copying {task}");
        OutputStore::copy_file_atomic(source, &task.destination)?;
        Ok(None)
    }

    fn describe(&self) -> String {
        "copy".to_string()
    }
}

/// Succeeds without fetching when the destination already holds data.
#[derive(Debug, Clone)]
pub struct SkipExisting<F> {
    inner: F,
}

impl<F: Fetcher> SkipExisting<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F: Fetcher> Fetcher for SkipExisting<F> {
    fn fetch(&self, task: &DownloadTask) -> Result<Option<FailureRecord>, ImageDownloaderError> {
        let existing = fs::metadata(&task.destination)
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false);
        if existing {
            tracing::debug!("{} exists, skipping", task.destination.display());
            return Ok(None);
        }
        self.inner.fetch(task)
    }

    fn describe(&self) -> String {
        format!("{} (skip existing)", self.inner.describe())
    }
}

impl Fetcher for Box<dyn Fetcher> {
    fn fetch(&self, task: &DownloadTask) -> Result<Option<FailureRecord>, ImageDownloaderError> {
        (**self).fetch(task)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

pub trait ImageDownloader: Send + Sync {
    /// Runs every task and returns the failures in completion order.
    fn download_images(
        &self,
        tasks: Vec<DownloadTask>,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<FailureRecord>, ImageDownloaderError>;

    fn describe(&self) -> String;
}

/// Fixed width worker pool over a shared task queue.
pub struct PoolDownloader<F> {
    fetcher: F,
    poolsize: usize,
    cancel: CancelToken,
}

impl<F: Fetcher> PoolDownloader<F> {
    pub fn new(fetcher: F, poolsize: usize) -> Self {
        Self {
            fetcher,
            poolsize: poolsize.max(1),
            cancel: CancelToken::new(),
        }
    }

    /// Workers take no new task once `cancel` is raised; tasks already in
    /// flight run to completion.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn poolsize(&self) -> usize {
        self.poolsize
    }
}

impl<F: Fetcher> ImageDownloader for PoolDownloader<F> {
    fn download_images(
        &self,
        tasks: Vec<DownloadTask>,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<FailureRecord>, ImageDownloaderError> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let total = tasks.len();
        let workers = self.poolsize.min(total);
        let report_every = (total / 100).max(1);
        let queue = Mutex::new(VecDeque::from(tasks));
        let abort = AtomicBool::new(false);
        let started = Instant::now();
        tracing::info!("downloading {total} images with {workers} workers");

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel();
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let abort = &abort;
                let fetcher = &self.fetcher;
                let cancel = &self.cancel;
                scope.spawn(move || {
                    while !abort.load(Ordering::Relaxed) && !cancel.is_cancelled() {
                        let next = queue.lock().ok().and_then(|mut queue| queue.pop_front());
                        let Some(task) = next else {
                            break;
                        };
                        let outcome = fetcher.fetch(&task);
                        if outcome.is_err() {
                            abort.store(true, Ordering::Relaxed);
                        }
                        if tx.send(outcome).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            let mut failures = Vec::new();
            let mut fatal = None;
            let mut done = 0usize;
            for outcome in rx.iter() {
                done += 1;
                match outcome {
                    Ok(Some(failure)) => failures.push(failure),
                    Ok(None) => {}
                    Err(err) => {
                        if fatal.is_none() {
                            fatal = Some(err);
                        }
                    }
                }
                if done % report_every == 0 || done == total {
                    sink.event(ProgressEvent {
                        message: format!("download.progress done={done} total={total}"),
                        elapsed: Some(started.elapsed()),
                    });
                }
            }
            match fatal {
                Some(err) => Err(err),
                None if done < total && self.cancel.is_cancelled() => {
                    tracing::warn!("download cancelled after {done} of {total} images");
                    Err(ImageDownloaderError::Cancelled)
                }
                None => Ok(failures),
            }
        })
    }

    fn describe(&self) -> String {
        format!(
            "PoolDownloader(fetcher={}, poolsize={})",
            self.fetcher.describe(),
            self.poolsize
        )
    }
}

/// Fetches only the first sample's four channels and copies them to every
/// other destination of the same channel.
pub struct FakeDownloader<F> {
    fetcher: F,
    cancel: CancelToken,
}

impl<F: Fetcher> FakeDownloader<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl<F: Fetcher> ImageDownloader for FakeDownloader<F> {
    fn download_images(
        &self,
        tasks: Vec<DownloadTask>,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<FailureRecord>, ImageDownloaderError> {
        tracing::warn!("fake images mode: only the first sample is downloaded");
        let total = tasks.len();
        let started = Instant::now();
        let mut templates: HashMap<Color, PathBuf> = HashMap::new();
        let mut tasks = tasks.into_iter();

        for task in tasks.by_ref().take(Color::ALL.len()) {
            if let Some(failure) = self.fetcher.fetch(&task)? {
                return Err(ImageDownloaderError::FakeDownload(format!(
                    "{} returned status {}",
                    task.source, failure.status
                )));
            }
            let color = channel_of(&task.destination)?;
            templates.insert(color, task.destination);
        }

        for (index, task) in tasks.enumerate() {
            self.cancel.check()?;
            let color = channel_of(&task.destination)?;
            let template = templates.get(&color).ok_or_else(|| {
                ImageDownloaderError::FakeDownload(format!("no {color} image to copy"))
            })?;
            OutputStore::copy_file_atomic(template, &task.destination)?;
            let done = index + Color::ALL.len() + 1;
            if done % 100 == 0 || done == total {
                sink.event(ProgressEvent {
                    message: format!("download.progress done={done} total={total}"),
                    elapsed: Some(started.elapsed()),
                });
            }
        }
        Ok(Vec::new())
    }

    fn describe(&self) -> String {
        format!("FakeDownloader(fetcher={})", self.fetcher.describe())
    }
}

/// Channel named by the text after the last `_` of the file name, up to its
/// first `.`: `1_A1_1_red.jpg` and `1_A1_1_red.ome.tif` are both red.
fn channel_of(destination: &Path) -> Result<Color, ImageDownloaderError> {
    destination
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.rsplit('_').next())
        .and_then(|tail| tail.split('.').next())
        .and_then(Color::from_name)
        .ok_or_else(|| {
            ImageDownloaderError::FakeDownload(format!(
                "cannot tell channel of {}",
                destination.display()
            ))
        })
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name: OsString = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
