use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::slice;

use crate::app::{ProgressEvent, ProgressSink};
use crate::atlas::{LineSource, build_image_url_map};
use crate::domain::{Color, DownloadTask, Sample};
use crate::error::ImageDownloaderError;
use crate::manifest::sample_image_ids;
use crate::store::OutputStore;

const LINK_SUFFIX: &str = "blue_red_green.jpg";

/// Resolves samples to per-channel image sources (URLs or local paths).
pub trait ImageSourceResolver: Send {
    fn name(&self) -> &'static str;

    /// Builds lookup state for `samples`. Runs once before any task is emitted.
    fn prepare(
        &mut self,
        samples: &[Sample],
        sink: &dyn ProgressSink,
    ) -> Result<(), ImageDownloaderError>;

    /// The authoritative blue entry for a sample.
    fn base_source(&self, sample: &Sample) -> Option<String>;

    fn channel_source(&self, sample: &Sample, base: &str, color: Color) -> Option<String>;
}

/// Derives the URL of `color` from a blue channel URL, keeping everything up
/// to `_blue` and the file extension.
pub fn channel_url(blue_url: &str, color: Color) -> Option<String> {
    let idx = blue_url.find("_blue")?;
    let prefix = &blue_url[..=idx];
    let (_, ext) = blue_url[idx..].rsplit_once('.')?;
    Some(format!("{prefix}{color}.{ext}"))
}

/// Scans the atlas index once and resolves samples through the image id map.
pub struct IndexScanResolver {
    source: Box<dyn LineSource>,
    url_map: Option<HashMap<String, String>>,
}

impl IndexScanResolver {
    pub fn new(source: Box<dyn LineSource>) -> Self {
        Self {
            source,
            url_map: None,
        }
    }

    pub fn url_count(&self) -> usize {
        self.url_map.as_ref().map(HashMap::len).unwrap_or(0)
    }
}

impl ImageSourceResolver for IndexScanResolver {
    fn name(&self) -> &'static str {
        "index-scan"
    }

    fn prepare(
        &mut self,
        samples: &[Sample],
        sink: &dyn ProgressSink,
    ) -> Result<(), ImageDownloaderError> {
        if self.url_map.is_some() {
            return Ok(());
        }
        let valid_ids = sample_image_ids(samples);
        sink.event(ProgressEvent::message(format!(
            "phase=Resolve; scanning image index for {} image ids",
            valid_ids.len()
        )));
        let lines = self.source.open(sink)?;
        let map = build_image_url_map(lines, Some(&valid_ids))?;
        tracing::info!("found {} of {} image ids in index", map.len(), valid_ids.len());
        self.url_map = Some(map);
        Ok(())
    }

    fn base_source(&self, sample: &Sample) -> Option<String> {
        self.url_map.as_ref()?.get(&sample.image_id()).cloned()
    }

    fn channel_source(&self, _sample: &Sample, base: &str, color: Color) -> Option<String> {
        channel_url(base, color)
    }
}

/// Resolves samples that carry an explicit `linkprefix` URL.
#[derive(Debug, Default)]
pub struct LinkPrefixResolver {
    url_map: HashMap<String, String>,
}

impl LinkPrefixResolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ImageSourceResolver for LinkPrefixResolver {
    fn name(&self) -> &'static str {
        "link-prefix"
    }

    fn prepare(
        &mut self,
        samples: &[Sample],
        _sink: &dyn ProgressSink,
    ) -> Result<(), ImageDownloaderError> {
        self.url_map = samples
            .iter()
            .filter_map(|sample| {
                sample
                    .link_prefix()
                    .map(|prefix| (sample.image_id(), format!("{prefix}{LINK_SUFFIX}")))
            })
            .collect();
        Ok(())
    }

    fn base_source(&self, sample: &Sample) -> Option<String> {
        self.url_map.get(&sample.image_id()).cloned()
    }

    fn channel_source(&self, _sample: &Sample, base: &str, color: Color) -> Option<String> {
        channel_url(base, color)
    }
}

/// Resolves samples to files of an already downloaded archive laid out as
/// `<linkprefix>/<color>/<filename><color><suffix>`.
#[derive(Debug)]
pub struct LocalCopyResolver {
    suffix: String,
    prefix_map: HashMap<String, String>,
}

impl LocalCopyResolver {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            prefix_map: HashMap::new(),
        }
    }
}

impl ImageSourceResolver for LocalCopyResolver {
    fn name(&self) -> &'static str {
        "local-copy"
    }

    fn prepare(
        &mut self,
        samples: &[Sample],
        _sink: &dyn ProgressSink,
    ) -> Result<(), ImageDownloaderError> {
        self.prefix_map = samples
            .iter()
            .filter_map(|sample| {
                sample
                    .link_prefix()
                    .map(|prefix| (sample.image_id(), prefix.to_string()))
            })
            .collect();
        Ok(())
    }

    fn base_source(&self, sample: &Sample) -> Option<String> {
        self.prefix_map.get(&sample.image_id()).cloned()
    }

    fn channel_source(&self, sample: &Sample, base: &str, color: Color) -> Option<String> {
        let path = Path::new(base)
            .join(color.as_str())
            .join(format!("{}{color}{}", sample.filename, self.suffix));
        Some(path.to_string_lossy().to_string())
    }
}

/// Lazy sequence of download tasks, four per resolvable sample in
/// [`Color::ALL`] order.
pub struct ImageTasks<'a> {
    resolver: &'a dyn ImageSourceResolver,
    samples: slice::Iter<'a, Sample>,
    store: &'a OutputStore,
    suffix: &'a str,
    pending: VecDeque<DownloadTask>,
    skipped: usize,
}

impl<'a> ImageTasks<'a> {
    pub fn new(
        resolver: &'a dyn ImageSourceResolver,
        samples: &'a [Sample],
        store: &'a OutputStore,
        suffix: &'a str,
    ) -> Self {
        Self {
            resolver,
            samples: samples.iter(),
            store,
            suffix,
            pending: VecDeque::with_capacity(Color::ALL.len()),
            skipped: 0,
        }
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn sample_tasks(&self, sample: &Sample) -> Option<Vec<DownloadTask>> {
        let base = self.resolver.base_source(sample)?;
        Color::ALL
            .into_iter()
            .map(|color| {
                let source = self.resolver.channel_source(sample, &base, color)?;
                let destination = self
                    .store
                    .color_dir(color)
                    .join(format!("{}{color}{}", sample.image_name(), self.suffix));
                Some(DownloadTask::new(source, destination.into_std_path_buf()))
            })
            .collect()
    }
}

impl Iterator for ImageTasks<'_> {
    type Item = DownloadTask;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(task) = self.pending.pop_front() {
                return Some(task);
            }
            let sample = self.samples.next()?;
            match self.sample_tasks(sample) {
                Some(tasks) => self.pending.extend(tasks),
                None => {
                    self.skipped += 1;
                    tracing::error!(
                        "{} not found by {} resolver, skipping sample",
                        sample.image_id(),
                        self.resolver.name()
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_url_keeps_prefix_and_extension() {
        let url = "http://images.proteinatlas.org/15021/1736_F10_19_cr5805e721b05c3_blue_red_green.jpg";
        assert_eq!(
            channel_url(url, Color::Red).as_deref(),
            Some("http://images.proteinatlas.org/15021/1736_F10_19_cr5805e721b05c3_red.jpg")
        );
        assert_eq!(
            channel_url(url, Color::Blue).as_deref(),
            Some("http://images.proteinatlas.org/15021/1736_F10_19_cr5805e721b05c3_blue.jpg")
        );
    }

    #[test]
    fn channel_url_requires_blue_token() {
        assert_eq!(channel_url("http://host/1_A1_1_red.jpg", Color::Green), None);
    }
}
