use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ImageDownloaderError {
    #[error("image index source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("{} already exists", .0.display())]
    DirectoryExists(PathBuf),

    #[error("unique list is not set, cannot build allowed antibody set")]
    MissingUniqueList,

    #[error("invalid provenance: {0}")]
    InvalidProvenance(String),

    #[error("failed to read provenance file at {0}")]
    ProvenanceRead(PathBuf),

    #[error("failed to read manifest {0}")]
    ManifestRead(PathBuf),

    #[error("failed to parse manifest: {0}")]
    ManifestParse(String),

    #[error("Either samples, cm4ai table, dataverse DOI, protein list or cell line must be specified")]
    MissingInputSelection,

    #[error("no images in the index for {0}")]
    NoMatchingSamples(String),

    #[error("image index request failed: {0}")]
    IndexHttp(String),

    #[error("image index returned status {status}: {message}")]
    IndexStatus { status: u16, message: String },

    #[error("download request failed: {0}")]
    DownloadHttp(String),

    #[error("Failed to download: {count} images")]
    DownloadsFailed { count: usize },

    #[error("run cancelled")]
    Cancelled,

    #[error("unable to create fake images: {0}")]
    FakeDownload(String),

    #[error("gene query failed: {0}")]
    GeneQueryHttp(String),

    #[error("gene query returned status {status}: {message}")]
    GeneQueryStatus { status: u16, message: String },

    #[error("dataverse request failed: {0}")]
    DataverseHttp(String),

    #[error("dataverse returned status {status}: {message}")]
    DataverseStatus { status: u16, message: String },

    #[error("{0}")]
    DataverseResolution(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
