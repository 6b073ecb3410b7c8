//! Registration of the run, its inputs and its outputs in an RO-Crate
//! metadata document kept in the output directory.

use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::DatasetDescriptor;
use crate::error::ImageDownloaderError;
use crate::store::{OutputStore, RO_CRATE_METADATA_FILE};

const RO_CRATE_CONTEXT: &str = "https://w3id.org/ro/crate/1.1/context";
const ARK_NAAN: &str = "99999";

#[derive(Debug, Clone)]
pub struct CrateInfo {
    pub name: String,
    pub organization_name: String,
    pub project_name: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct DatasetInfo {
    pub name: String,
    pub description: String,
    pub author: String,
    pub version: String,
    pub data_format: String,
    pub date_published: String,
    /// Path relative to the crate root, or a URL.
    pub location: String,
}

impl DatasetInfo {
    pub fn from_descriptor(descriptor: &DatasetDescriptor, location: impl Into<String>) -> Self {
        Self {
            name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            author: descriptor.author.clone(),
            version: descriptor.version.clone(),
            data_format: descriptor.data_format.clone(),
            date_published: descriptor.date_published.clone().unwrap_or_else(today),
            location: descriptor.url.clone().unwrap_or_else(|| location.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SoftwareInfo {
    pub name: String,
    pub description: String,
    pub author: String,
    pub version: String,
    pub file_format: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ComputationInfo {
    pub name: String,
    pub run_by: String,
    pub command: String,
    pub description: String,
    pub used_software: Vec<String>,
    pub used_dataset: Vec<String>,
    pub generated: Vec<String>,
}

/// Records provenance entities and hands back their identifiers.
pub trait ProvenanceRegistrar {
    fn register_rocrate(&self, root: &Utf8Path, info: &CrateInfo) -> Result<String, ImageDownloaderError>;

    fn register_dataset(
        &self,
        root: &Utf8Path,
        dataset: &DatasetInfo,
    ) -> Result<String, ImageDownloaderError>;

    fn register_software(
        &self,
        root: &Utf8Path,
        software: &SoftwareInfo,
    ) -> Result<String, ImageDownloaderError>;

    fn register_computation(
        &self,
        root: &Utf8Path,
        computation: &ComputationInfo,
    ) -> Result<String, ImageDownloaderError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CrateDocument {
    #[serde(rename = "@context")]
    context: String,
    #[serde(rename = "@graph")]
    graph: Vec<Value>,
}

/// Keeps `ro-crate-metadata.json` under the output directory. Identifiers
/// are `ark:` ids derived from the entity kind and its position in the graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRoCrate;

impl LocalRoCrate {
    pub fn new() -> Self {
        Self
    }

    fn load(root: &Utf8Path) -> Result<CrateDocument, ImageDownloaderError> {
        let path = root.join(RO_CRATE_METADATA_FILE);
        let content = fs::read_to_string(path.as_std_path()).map_err(|err| {
            ImageDownloaderError::Filesystem(format!("read {path}: {err}"))
        })?;
        serde_json::from_str(&content)
            .map_err(|err| ImageDownloaderError::Filesystem(format!("parse {path}: {err}")))
    }

    fn append(root: &Utf8Path, kind: &str, mut entity: Value) -> Result<String, ImageDownloaderError> {
        let mut document = Self::load(root)?;
        let id = format!("ark:{ARK_NAAN}/{kind}-{:05}", document.graph.len());
        entity["@id"] = Value::String(id.clone());
        if let Some(crate_root) = document
            .graph
            .iter_mut()
            .find(|node| node.get("@id").and_then(Value::as_str) == Some("./"))
        {
            if let Some(parts) = crate_root["hasPart"].as_array_mut() {
                parts.push(json!({ "@id": id }));
            }
        }
        document.graph.push(entity);
        OutputStore::write_json_atomic(&root.join(RO_CRATE_METADATA_FILE), &document)?;
        tracing::debug!("registered {kind} {id}");
        Ok(id)
    }
}

impl ProvenanceRegistrar for LocalRoCrate {
    fn register_rocrate(&self, root: &Utf8Path, info: &CrateInfo) -> Result<String, ImageDownloaderError> {
        let id = format!("ark:{ARK_NAAN}/rocrate-{}", slug(&info.name));
        let document = CrateDocument {
            context: RO_CRATE_CONTEXT.to_string(),
            graph: vec![
                json!({
                    "@id": RO_CRATE_METADATA_FILE,
                    "@type": "CreativeWork",
                    "about": { "@id": "./" },
                }),
                json!({
                    "@id": "./",
                    "@type": "Dataset",
                    "identifier": id,
                    "name": info.name,
                    "description": info.description,
                    "organizationName": info.organization_name,
                    "projectName": info.project_name,
                    "dateCreated": chrono::Utc::now().to_rfc3339(),
                    "hasPart": [],
                }),
            ],
        };
        OutputStore::write_json_atomic(&root.join(RO_CRATE_METADATA_FILE), &document)?;
        Ok(id)
    }

    fn register_dataset(
        &self,
        root: &Utf8Path,
        dataset: &DatasetInfo,
    ) -> Result<String, ImageDownloaderError> {
        Self::append(
            root,
            "dataset",
            json!({
                "@type": "EVI:Dataset",
                "name": dataset.name,
                "description": dataset.description,
                "author": dataset.author,
                "version": dataset.version,
                "format": dataset.data_format,
                "datePublished": dataset.date_published,
                "contentUrl": dataset.location,
            }),
        )
    }

    fn register_software(
        &self,
        root: &Utf8Path,
        software: &SoftwareInfo,
    ) -> Result<String, ImageDownloaderError> {
        Self::append(
            root,
            "software",
            json!({
                "@type": "EVI:Software",
                "name": software.name,
                "description": software.description,
                "author": software.author,
                "version": software.version,
                "format": software.file_format,
                "url": software.url,
            }),
        )
    }

    fn register_computation(
        &self,
        root: &Utf8Path,
        computation: &ComputationInfo,
    ) -> Result<String, ImageDownloaderError> {
        let refs = |ids: &[String]| -> Vec<Value> {
            ids.iter().map(|id| json!({ "@id": id })).collect()
        };
        Self::append(
            root,
            "computation",
            json!({
                "@type": "EVI:Computation",
                "name": computation.name,
                "runBy": computation.run_by,
                "command": computation.command,
                "description": computation.description,
                "dateCreated": today(),
                "usedSoftware": refs(&computation.used_software),
                "usedDataset": refs(&computation.used_dataset),
                "generated": refs(&computation.generated),
            }),
        )
    }
}

pub fn today() -> String {
    chrono::Local::now().format("%m-%d-%Y").to_string()
}

fn slug(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect()
}
