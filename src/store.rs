use std::fs;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::domain::Color;
use crate::error::ImageDownloaderError;

pub const SAMPLES_CSVFILE: &str = "samples.csv";
pub const UNIQUE_CSVFILE: &str = "unique.csv";
pub const IMAGE_GENE_NODE_ATTR_FILE: &str = "image_gene_node_attributes.tsv";
pub const IMAGE_GENE_NODE_ERRORS_FILE: &str = "image_gene_node_attributes.errors";
pub const RO_CRATE_METADATA_FILE: &str = "ro-crate-metadata.json";

/// Layout of a run's output directory.
#[derive(Debug, Clone)]
pub struct OutputStore {
    root: Utf8PathBuf,
}

impl OutputStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn from_path(path: &Path) -> Result<Self, ImageDownloaderError> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?
                .join(path)
        };
        let root = Utf8PathBuf::from_path_buf(absolute).map_err(|_| {
            ImageDownloaderError::Filesystem("non-utf8 output directory".to_string())
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn color_dir(&self, color: Color) -> Utf8PathBuf {
        self.root.join(color.as_str())
    }

    pub fn attributes_path(&self) -> Utf8PathBuf {
        self.root.join(IMAGE_GENE_NODE_ATTR_FILE)
    }

    pub fn errors_path(&self) -> Utf8PathBuf {
        self.root.join(IMAGE_GENE_NODE_ERRORS_FILE)
    }

    pub fn samples_copy_path(&self) -> Utf8PathBuf {
        self.root.join(SAMPLES_CSVFILE)
    }

    pub fn unique_copy_path(&self) -> Utf8PathBuf {
        self.root.join(UNIQUE_CSVFILE)
    }

    pub fn crate_metadata_path(&self) -> Utf8PathBuf {
        self.root.join(RO_CRATE_METADATA_FILE)
    }

    pub fn task_start_path(&self, start_time: i64) -> Utf8PathBuf {
        self.root.join(format!("task_{start_time}_start.json"))
    }

    pub fn task_finish_path(&self, start_time: i64) -> Utf8PathBuf {
        self.root.join(format!("task_{start_time}_finish.json"))
    }

    /// Creates the output directory and one subdirectory per color channel.
    /// Fails without touching the filesystem when the directory already
    /// exists, unless `existing_ok` is set.
    pub fn create(&self, existing_ok: bool) -> Result<(), ImageDownloaderError> {
        if self.root.as_std_path().exists() && !existing_ok {
            return Err(ImageDownloaderError::DirectoryExists(
                self.root.clone().into_std_path_buf(),
            ));
        }
        for color in Color::ALL {
            let dir = self.color_dir(color);
            if dir.as_std_path().is_dir() {
                tracing::debug!("{dir} already exists");
                continue;
            }
            tracing::debug!("creating directory: {dir}");
            create_dir_mode(dir.as_std_path())?;
        }
        Ok(())
    }

    pub fn write_json_atomic<T: Serialize>(
        path: &Utf8Path,
        value: &T,
    ) -> Result<(), ImageDownloaderError> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), ImageDownloaderError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        }
        let tmp_path = tmp_path(path);
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Copies `source` next to `dest` and renames it into place, so readers
    /// never observe a partially written file.
    pub fn copy_file_atomic(source: &Path, dest: &Path) -> Result<(), ImageDownloaderError> {
        let parent = dest
            .parent()
            .ok_or_else(|| ImageDownloaderError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent)
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        let temp = tempfile::Builder::new()
            .prefix(".kira-imgdl-copy")
            .tempfile_in(parent)
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        fs::copy(source, temp.path()).map_err(|err| {
            ImageDownloaderError::Filesystem(format!("copy {}: {err}", source.display()))
        })?;
        temp.persist(dest)
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStart {
    pub start_time: i64,
    pub version: String,
    pub outdir: String,
    pub image_downloader: String,
    pub image_suffix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commandlineargs: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFinish {
    pub start_time: i64,
    pub end_time: i64,
    pub elapsed_time: i64,
    pub status: i32,
}

#[cfg(unix)]
fn create_dir_mode(path: &Path) -> Result<(), ImageDownloaderError> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))
}

#[cfg(not(unix))]
fn create_dir_mode(path: &Path) -> Result<(), ImageDownloaderError> {
    fs::create_dir_all(path).map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))
}

/// `<name>.tmp` beside `path`; siblings differing only in extension get
/// distinct temp files.
fn tmp_path(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{path}.tmp"))
}
