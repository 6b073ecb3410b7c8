use std::collections::BTreeMap;

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::{DownloadTask, FailureRecord};
use crate::download::ImageDownloader;
use crate::error::ImageDownloaderError;

pub const DEFAULT_MAX_RETRY: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct RetryOutcome {
    pub failures: Vec<FailureRecord>,
    pub rounds: usize,
}

/// Number of failures per status code.
pub fn failure_counts(failures: &[FailureRecord]) -> BTreeMap<u16, usize> {
    let mut counts = BTreeMap::new();
    for failure in failures {
        *counts.entry(failure.status).or_insert(0) += 1;
    }
    counts
}

/// Original tasks of `failures`, sorted by destination so retry rounds are
/// reproducible regardless of completion order.
pub fn tasks_to_retry(failures: Vec<FailureRecord>) -> Vec<DownloadTask> {
    let mut tasks: Vec<DownloadTask> = failures.into_iter().map(|failure| failure.task).collect();
    tasks.sort_by(|a, b| a.destination.cmp(&b.destination));
    tasks
}

/// Re-submits every failed task once, whatever its status.
pub fn retry_failed(
    downloader: &dyn ImageDownloader,
    failures: Vec<FailureRecord>,
    sink: &dyn ProgressSink,
) -> Result<Vec<FailureRecord>, ImageDownloaderError> {
    let counts = failure_counts(&failures);
    tracing::debug!("failed download counts by status code: {counts:?}");
    downloader.download_images(tasks_to_retry(failures), sink)
}

pub struct RetryCoordinator<'a> {
    downloader: &'a dyn ImageDownloader,
    max_retry: usize,
}

impl<'a> RetryCoordinator<'a> {
    pub fn new(downloader: &'a dyn ImageDownloader, max_retry: usize) -> Self {
        Self {
            downloader,
            max_retry,
        }
    }

    /// Retries until nothing fails or `max_retry` rounds have run.
    pub fn run(
        &self,
        mut failures: Vec<FailureRecord>,
        sink: &dyn ProgressSink,
    ) -> Result<RetryOutcome, ImageDownloaderError> {
        let mut rounds = 0;
        while !failures.is_empty() && rounds < self.max_retry {
            rounds += 1;
            tracing::error!(
                "{} images failed to download. Retrying #{rounds}",
                failures.len()
            );
            sink.event(ProgressEvent::message(format!(
                "phase=Retry; round {rounds} of {} for {} images",
                self.max_retry,
                failures.len()
            )));
            failures = retry_failed(self.downloader, failures, sink)?;
        }
        Ok(RetryOutcome { failures, rounds })
    }
}
