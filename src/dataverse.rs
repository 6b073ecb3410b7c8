use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;

use crate::app::{ProgressEvent, ProgressSink};
use crate::error::ImageDownloaderError;
use crate::fs_util::{extract_zip, find_single_file};

const DATAVERSE_BASE: &str = "https://dataverse.lib.virginia.edu/api";
const CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataverseExport {
    pub dataset_version: DatasetVersion,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetVersion {
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub label: String,
    pub data_file: DataFile,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataFile {
    pub id: u64,
}

impl DataverseExport {
    pub fn file_id(&self, label: &str) -> Result<u64, ImageDownloaderError> {
        self.dataset_version
            .files
            .iter()
            .find(|entry| entry.label == label)
            .map(|entry| entry.data_file.id)
            .ok_or_else(|| {
                ImageDownloaderError::DataverseResolution(format!(
                    "Dataset '{label}' not found in the dataverse export"
                ))
            })
    }
}

pub trait DataverseClient: Send + Sync {
    fn export_dataset(&self, doi: &str) -> Result<DataverseExport, ImageDownloaderError>;
    fn download_file(&self, file_id: u64, destination: &Path) -> Result<(), ImageDownloaderError>;
}

#[derive(Clone)]
pub struct DataverseHttpClient {
    client: Client,
    base_url: String,
}

impl DataverseHttpClient {
    pub fn new() -> Result<Self, ImageDownloaderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(3600))
            .user_agent(format!("kira-imgdl/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| ImageDownloaderError::DataverseHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: DATAVERSE_BASE.to_string(),
        })
    }
}

impl DataverseClient for DataverseHttpClient {
    fn export_dataset(&self, doi: &str) -> Result<DataverseExport, ImageDownloaderError> {
        let url = format!("{}/datasets/export", self.base_url);
        let persistent_id = format!("doi:{}", doi_number(doi));
        let response = self
            .client
            .get(url)
            .query(&[("exporter", "dataverse_json"), ("persistentId", persistent_id.as_str())])
            .send()
            .map_err(|err| ImageDownloaderError::DataverseHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "Failed to fetch dataverse JSON".to_string());
            return Err(ImageDownloaderError::DataverseStatus { status, message });
        }
        response
            .json::<DataverseExport>()
            .map_err(|err| ImageDownloaderError::DataverseHttp(err.to_string()))
    }

    fn download_file(&self, file_id: u64, destination: &Path) -> Result<(), ImageDownloaderError> {
        let url = format!("{}/access/datafile/{file_id}", self.base_url);
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| ImageDownloaderError::DataverseHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "Failed to download file".to_string());
            return Err(ImageDownloaderError::DataverseStatus { status, message });
        }
        let mut file = File::create(destination)
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        let mut buffer = [0u8; CHUNK_SIZE];
        loop {
            let read = response
                .read(&mut buffer)
                .map_err(|err| ImageDownloaderError::DataverseHttp(err.to_string()))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }
}

/// `https://doi.org/10.18130/V3/B35XWX` and `10.18130/V3/B35XWX` both give
/// `10.18130/V3/B35XWX`.
pub fn doi_number(doi: &str) -> &str {
    match doi.split_once(".org/") {
        Some((_, number)) => number,
        None => doi,
    }
}

/// Downloads `dataset` (a zip file label) of the DOI into a freshly created
/// `outdir`, unpacks it and returns the single `.tsv` table inside.
pub fn fetch_cm4ai_table(
    client: &dyn DataverseClient,
    doi: &str,
    dataset: &str,
    outdir: &Path,
    sink: &dyn ProgressSink,
) -> Result<PathBuf, ImageDownloaderError> {
    if outdir.exists() {
        return Err(ImageDownloaderError::DirectoryExists(outdir.to_path_buf()));
    }
    fs::create_dir_all(outdir).map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;

    sink.event(ProgressEvent::message(format!(
        "phase=Dataverse; resolving {dataset} in {}",
        doi_number(doi)
    )));
    let file_id = client.export_dataset(doi)?.file_id(dataset)?;
    let zip_path = outdir.join(dataset);
    sink.event(ProgressEvent::message(format!(
        "phase=Dataverse; downloading file {file_id}"
    )));
    client.download_file(file_id, &zip_path)?;
    extract_zip(&zip_path, outdir)?;

    let dataset_dir = outdir.join(dataset.trim_end_matches(".zip"));
    find_single_file(&dataset_dir, "tsv").map_err(|err| match err {
        ImageDownloaderError::Filesystem(message) => {
            ImageDownloaderError::DataverseResolution(message)
        }
        other => other,
    })
}
