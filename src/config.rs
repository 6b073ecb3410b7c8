use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ImageDownloaderError;
use crate::retry::DEFAULT_MAX_RETRY;

pub const DEFAULT_POOLSIZE: usize = 4;
pub const DEFAULT_IMAGE_SUFFIX: &str = ".jpg";

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub outdir: PathBuf,
    pub image_suffix: String,
    pub max_retry: usize,
    pub skip_failed: bool,
    pub skip_logging: bool,
    /// Set when an earlier step already created `outdir`.
    pub existing_outdir: bool,
    /// Recorded verbatim in the start marker and computation entry.
    pub commandline: Option<serde_json::Value>,
}

impl RunOptions {
    pub fn new(outdir: impl Into<PathBuf>) -> Self {
        Self {
            outdir: outdir.into(),
            image_suffix: DEFAULT_IMAGE_SUFFIX.to_string(),
            max_retry: DEFAULT_MAX_RETRY,
            skip_failed: false,
            skip_logging: false,
            existing_outdir: false,
            commandline: None,
        }
    }
}

/// Dataset provenance: either an already registered guid or the fields
/// needed to register it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DatasetProvenance {
    Registered { guid: String },
    Described(DatasetDescriptor),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatasetDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub author: String,
    pub version: String,
    pub data_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_published: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Provenance {
    pub organization_name: String,
    pub project_name: String,
    pub samples: DatasetProvenance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique: Option<DatasetProvenance>,
}

impl Provenance {
    /// Document printed when no provenance file is given.
    pub fn example(with_ids: bool) -> Self {
        let dataset = if with_ids {
            DatasetProvenance::Registered {
                guid: "ID of dataset".to_string(),
            }
        } else {
            DatasetProvenance::Described(DatasetDescriptor {
                name: "Name of dataset".to_string(),
                description: "Description of dataset".to_string(),
                author: "Author of dataset".to_string(),
                version: "Version of dataset".to_string(),
                data_format: "Format of data".to_string(),
                date_published: Some("Date dataset was published".to_string()),
                url: None,
            })
        };
        Self {
            organization_name: "Name of organization".to_string(),
            project_name: "Name of project".to_string(),
            samples: dataset.clone(),
            unique: Some(dataset),
        }
    }

    pub fn validate(&self, needs_unique: bool) -> Result<(), ImageDownloaderError> {
        if self.organization_name.trim().is_empty() {
            return Err(ImageDownloaderError::InvalidProvenance(
                "organization-name is empty".to_string(),
            ));
        }
        if self.project_name.trim().is_empty() {
            return Err(ImageDownloaderError::InvalidProvenance(
                "project-name is empty".to_string(),
            ));
        }
        if needs_unique && self.unique.is_none() {
            return Err(ImageDownloaderError::InvalidProvenance(
                "unique is required when a unique list is given".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load_provenance(path: &Path) -> Result<Provenance, ImageDownloaderError> {
        let content = fs::read_to_string(path)
            .map_err(|_| ImageDownloaderError::ProvenanceRead(path.to_path_buf()))?;
        Self::parse_provenance(&content)
    }

    pub fn parse_provenance(content: &str) -> Result<Provenance, ImageDownloaderError> {
        let provenance: Provenance = serde_json::from_str(content)
            .map_err(|err| ImageDownloaderError::InvalidProvenance(err.to_string()))?;
        provenance.validate(false)?;
        Ok(provenance)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn guid_and_descriptor_datasets() {
        let content = r#"{
            "organization-name": "CM4AI",
            "project-name": "Example",
            "samples": {"guid": "ark:/57799/b9samples"},
            "unique": {
                "name": "unique list",
                "author": "someone",
                "version": "1.0",
                "data-format": "csv"
            }
        }"#;
        let provenance = ConfigLoader::parse_provenance(content).unwrap();
        assert_matches!(provenance.samples, DatasetProvenance::Registered { .. });
        assert_matches!(
            provenance.unique,
            Some(DatasetProvenance::Described(DatasetDescriptor { ref data_format, .. })) if data_format == "csv"
        );
    }

    #[test]
    fn missing_project_name_is_invalid() {
        let content = r#"{"organization-name": "x", "samples": {"guid": "g"}}"#;
        let err = ConfigLoader::parse_provenance(content).unwrap_err();
        assert_matches!(err, ImageDownloaderError::InvalidProvenance(_));
    }

    #[test]
    fn unique_required_when_requested() {
        let mut provenance = Provenance::example(true);
        provenance.unique = None;
        assert!(provenance.validate(false).is_ok());
        assert_matches!(
            provenance.validate(true),
            Err(ImageDownloaderError::InvalidProvenance(_))
        );
    }

    #[test]
    fn example_serializes_with_kebab_keys() {
        let value = serde_json::to_value(Provenance::example(false)).unwrap();
        assert_eq!(value["organization-name"], "Name of organization");
        assert_eq!(value["samples"]["data-format"], "Format of data");
        let value = serde_json::to_value(Provenance::example(true)).unwrap();
        assert_eq!(value["unique"]["guid"], "ID of dataset");
    }
}
