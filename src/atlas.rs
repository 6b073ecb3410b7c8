//! Streaming access to the Human Protein Atlas XML index and extraction of
//! blue channel image URLs from it.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use flate2::read::MultiGzDecoder;
use regex::Regex;
use reqwest::blocking::Client;

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::Sample;
use crate::error::ImageDownloaderError;

pub const DEFAULT_PROTEINATLAS_URL: &str =
    "https://www.proteinatlas.org/download/proteinatlas.xml.gz";
pub const DEFAULT_CELL_LINE: &str = "U2OS";

const CHUNK_SIZE: usize = 8192;
const PROGRESS_STEP_BYTES: u64 = 64 * 1024 * 1024;

static TAG_PAYLOAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.*>(.*)<.*$").expect("tag payload pattern"));
static ID_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bid="([^"]+)""#).expect("id attribute pattern"));
static NAME_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bname="([^"]+)""#).expect("name attribute pattern"));

/// Lazy, single pass sequence of lines from an index document.
pub struct AtlasLines {
    inner: std::io::Lines<Box<dyn BufRead + Send>>,
}

impl AtlasLines {
    pub fn from_reader<R: BufRead + Send + 'static>(reader: R) -> Self {
        let boxed: Box<dyn BufRead + Send> = Box::new(reader);
        Self {
            inner: boxed.lines(),
        }
    }
}

impl Iterator for AtlasLines {
    type Item = Result<String, ImageDownloaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|line| {
            line.map_err(|err| ImageDownloaderError::Filesystem(format!("read index: {err}")))
        })
    }
}

pub trait LineSource: Send {
    fn open(&self, sink: &dyn ProgressSink) -> Result<AtlasLines, ImageDownloaderError>;
}

/// Reads `proteinatlas.xml` or `proteinatlas.xml.gz` from a local path, or
/// fetches it into `workdir` first when given a URL.
pub struct AtlasReader {
    source: String,
    workdir: PathBuf,
    client: Client,
}

impl AtlasReader {
    pub fn new(source: impl Into<String>, workdir: impl Into<PathBuf>) -> Result<Self, ImageDownloaderError> {
        let client = Client::builder()
            .user_agent(format!("kira-imgdl/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| ImageDownloaderError::IndexHttp(err.to_string()))?;
        Ok(Self::with_client(source, workdir, client))
    }

    pub fn with_client(source: impl Into<String>, workdir: impl Into<PathBuf>, client: Client) -> Self {
        Self {
            source: source.into(),
            workdir: workdir.into(),
            client,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn open_source(
        &self,
        source: &str,
        sink: &dyn ProgressSink,
        fetched: bool,
    ) -> Result<AtlasLines, ImageDownloaderError> {
        let path = Path::new(source);
        if path.is_file() {
            return open_local(path);
        }
        if !fetched && is_url(source) {
            let local = self.fetch(source, sink)?;
            let local = local.to_string_lossy().to_string();
            return self.open_source(&local, sink, true);
        }
        Err(ImageDownloaderError::SourceUnavailable(source.to_string()))
    }

    fn fetch(&self, url: &str, sink: &dyn ProgressSink) -> Result<PathBuf, ImageDownloaderError> {
        let destination = self.workdir.join(index_file_name(url));
        tracing::info!("downloading {url} to {}", destination.display());
        sink.event(ProgressEvent::message(format!(
            "phase=Resolve; fetching image index {url}"
        )));

        let started = Instant::now();
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| ImageDownloaderError::IndexHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "image index request failed".to_string());
            return Err(ImageDownloaderError::IndexStatus { status, message });
        }

        let mut file = File::create(&destination)
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        let mut buffer = [0u8; CHUNK_SIZE];
        let mut total = 0u64;
        let mut next_report = PROGRESS_STEP_BYTES;
        loop {
            let read = response
                .read(&mut buffer)
                .map_err(|err| ImageDownloaderError::IndexHttp(err.to_string()))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
            total += read as u64;
            if total >= next_report {
                next_report += PROGRESS_STEP_BYTES;
                sink.event(ProgressEvent {
                    message: format!("index.progress bytes={total}"),
                    elapsed: Some(started.elapsed()),
                });
            }
        }
        file.flush()
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        let elapsed: Duration = started.elapsed();
        tracing::info!("fetched {total} bytes of image index in {:.1}s", elapsed.as_secs_f64());
        Ok(destination)
    }
}

impl LineSource for AtlasReader {
    fn open(&self, sink: &dyn ProgressSink) -> Result<AtlasLines, ImageDownloaderError> {
        self.open_source(&self.source, sink, false)
    }
}

fn open_local(path: &Path) -> Result<AtlasLines, ImageDownloaderError> {
    let file = File::open(path).map_err(|err| {
        ImageDownloaderError::Filesystem(format!("open {}: {err}", path.display()))
    })?;
    let is_gz = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("gz"))
        .unwrap_or(false);
    if is_gz {
        return Ok(AtlasLines::from_reader(BufReader::new(MultiGzDecoder::new(file))));
    }
    Ok(AtlasLines::from_reader(BufReader::new(file)))
}

/// Last path segment of `url` without query or fragment, so the `.gz`
/// extension survives for `proteinatlas.xml.gz?format=gz`.
fn index_file_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && !name.contains(':'))
        .unwrap_or("proteinatlas.xml")
}

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Text between the last `>` and the following `<` of a line.
pub fn url_from_line(line: &str) -> Option<String> {
    TAG_PAYLOAD
        .captures(line.trim_end_matches(['\r', '\n']))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// `http://host/15021/1736_F10_19_cr58_blue_red_green.jpg` becomes
/// `15021/1736_F10_19_`.
pub fn image_id_from_url(url: &str) -> String {
    let mut segments = url.rsplit('/');
    let last = segments.next().unwrap_or_default();
    let tail = match segments.next() {
        Some(parent) => format!("{parent}/{last}"),
        None => last.to_string(),
    };
    let fields: Vec<&str> = tail.split('_').take(3).collect();
    format!("{}_", fields.join("_"))
}

pub fn is_blue_image_line(line: &str) -> bool {
    line.contains("<imageUrl>") && line.contains("blue")
}

/// Builds the image id to blue image URL map from index lines, keeping only
/// ids present in `valid_ids` when given. The first URL seen for an id wins.
pub fn build_image_url_map<I>(
    lines: I,
    valid_ids: Option<&HashSet<String>>,
) -> Result<HashMap<String, String>, ImageDownloaderError>
where
    I: IntoIterator<Item = Result<String, ImageDownloaderError>>,
{
    let mut map = HashMap::new();
    for line in lines {
        let line = line?;
        if !is_blue_image_line(&line) {
            continue;
        }
        let Some(url) = url_from_line(&line) else {
            continue;
        };
        let image_id = image_id_from_url(&url);
        if let Some(valid) = valid_ids {
            if !valid.contains(&image_id) {
                continue;
            }
        }
        map.entry(image_id).or_insert(url);
    }
    Ok(map)
}

/// Which index entries become samples: genes named in `proteins` (symbol or
/// Ensembl id, any case; every gene when absent) imaged in `cell_line`.
#[derive(Debug, Clone)]
pub struct IndexSampleQuery {
    proteins: Option<HashSet<String>>,
    cell_line: String,
}

impl IndexSampleQuery {
    pub fn new(proteins: Option<Vec<String>>, cell_line: Option<&str>) -> Self {
        Self {
            proteins: proteins.map(|list| {
                list.iter()
                    .map(|protein| protein.trim().to_ascii_uppercase())
                    .filter(|protein| !protein.is_empty())
                    .collect()
            }),
            cell_line: cell_line_key(cell_line.unwrap_or(DEFAULT_CELL_LINE)),
        }
    }

    pub fn cell_line(&self) -> &str {
        &self.cell_line
    }

    fn wants_gene(&self, gene: Option<&str>, ensembl: Option<&str>) -> bool {
        let Some(proteins) = &self.proteins else {
            return true;
        };
        [gene, ensembl]
            .into_iter()
            .flatten()
            .any(|name| proteins.contains(&name.to_ascii_uppercase()))
    }

    fn wants_cell_line(&self, name: &str) -> bool {
        cell_line_key(name) == self.cell_line
    }
}

/// `U-2 OS`, `u2os` and `U2OS` compare equal.
fn cell_line_key(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

#[derive(Debug, Default)]
struct EntryScope {
    gene: Option<String>,
    ensembl: Option<String>,
    antibody: Option<String>,
    cell_line: Option<String>,
    locations: Vec<String>,
}

/// Builds samples from the index for every composite image of a wanted gene
/// in the wanted cell line. Each sample links to its image directory, so the
/// link prefix resolver can fetch it without a second index pass. An image
/// listed twice yields one sample.
pub fn samples_from_index<I>(
    lines: I,
    query: &IndexSampleQuery,
) -> Result<Vec<Sample>, ImageDownloaderError>
where
    I: IntoIterator<Item = Result<String, ImageDownloaderError>>,
{
    let mut samples = Vec::new();
    let mut seen = HashSet::new();
    let mut scope = EntryScope::default();
    for line in lines {
        let line = line?;
        let tag = line.trim_start();
        if tag.starts_with("<entry") {
            scope = EntryScope::default();
        } else if tag.starts_with("<name>") && scope.gene.is_none() {
            scope.gene = url_from_line(tag).filter(|name| !name.is_empty());
        } else if tag.starts_with("<identifier") && tag.contains(r#"db="Ensembl""#) {
            scope.ensembl = attribute(&ID_ATTR, tag);
        } else if tag.starts_with("<antibody") {
            scope.antibody = attribute(&ID_ATTR, tag);
            scope.cell_line = None;
            scope.locations.clear();
        } else if tag.starts_with("<cellLine") {
            scope.cell_line = url_from_line(tag)
                .filter(|name| !name.is_empty())
                .or_else(|| attribute(&NAME_ATTR, tag));
            scope.locations.clear();
        } else if tag.starts_with("<location") {
            if let Some(location) = url_from_line(tag).filter(|value| !value.is_empty()) {
                scope.locations.push(location);
            }
        } else if tag.starts_with("</data>") {
            scope.cell_line = None;
            scope.locations.clear();
        } else if tag.starts_with("<imageUrl>") && tag.contains("blue_red_green") {
            let Some(url) = url_from_line(tag) else {
                continue;
            };
            let wanted = scope
                .cell_line
                .as_deref()
                .map(|name| query.wants_cell_line(name))
                .unwrap_or(false)
                && query.wants_gene(scope.gene.as_deref(), scope.ensembl.as_deref());
            if !wanted || !seen.insert(image_id_from_url(&url)) {
                continue;
            }
            match sample_from_url(&url, &scope) {
                Some(sample) => samples.push(sample),
                None => tracing::debug!("skipping index image {url}: incomplete entry"),
            }
        }
    }
    Ok(samples)
}

fn attribute(pattern: &Regex, tag: &str) -> Option<String> {
    pattern
        .captures(tag)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn sample_from_url(url: &str, scope: &EntryScope) -> Option<Sample> {
    let antibody = scope.antibody.clone()?;
    let ensembl_ids = scope.ensembl.clone()?;
    let linkprefix = &url[..url.find("blue_red_green")?];
    let image_id = image_id_from_url(url);
    let image_name = image_id.rsplit('/').next()?;
    let mut fields = image_name.split('_');
    let plate = fields.next().filter(|value| !value.is_empty())?;
    let position = fields.next().filter(|value| !value.is_empty())?;
    let sample = fields.next().filter(|value| !value.is_empty())?;
    Some(Sample {
        filename: format!("/archive/{plate}/{image_name}"),
        if_plate_id: plate.to_string(),
        position: position.to_string(),
        sample: sample.to_string(),
        status: String::new(),
        locations: scope.locations.join(","),
        antibody,
        ensembl_ids,
        gene_names: scope.gene.clone().unwrap_or_default(),
        linkprefix: Some(linkprefix.to_string()),
    })
}
