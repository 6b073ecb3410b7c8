use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use camino::Utf8Path;
use csv::{ReaderBuilder, WriterBuilder};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

pub use crate::domain::split_ensembl_ids;
use crate::domain::{Sample, UniqueEntry};
use crate::error::ImageDownloaderError;
use crate::store::OutputStore;

pub const MYGENE_QUERY_URL: &str = "https://mygene.info/v3/query";
pub const GENE_SPECIES: &str = "human";
pub const GENE_FIELDS: [&str; 2] = ["ensembl.gene", "symbol"];
const QUERY_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsemblGene {
    pub gene: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnsemblField {
    One(EnsemblGene),
    Many(Vec<EnsemblGene>),
}

impl EnsemblField {
    pub fn gene_ids(&self) -> Vec<&str> {
        match self {
            EnsemblField::One(entry) => vec![entry.gene.as_str()],
            EnsemblField::Many(entries) => entries.iter().map(|entry| entry.gene.as_str()).collect(),
        }
    }
}

/// One result of a batched gene query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneRecord {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensembl: Option<EnsemblField>,
    #[serde(default)]
    pub notfound: bool,
}

pub trait GeneQuery: Send + Sync {
    fn query_many(
        &self,
        ids: &[String],
        species: &str,
        fields: &[&str],
    ) -> Result<Vec<GeneRecord>, ImageDownloaderError>;
}

#[derive(Clone)]
pub struct MyGeneClient {
    client: Client,
    base_url: String,
}

impl MyGeneClient {
    pub fn new() -> Result<Self, ImageDownloaderError> {
        let client = Client::builder()
            .user_agent(format!("kira-imgdl/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| ImageDownloaderError::GeneQueryHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: MYGENE_QUERY_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn query_batch(
        &self,
        ids: &[String],
        species: &str,
        fields: &str,
    ) -> Result<Vec<GeneRecord>, ImageDownloaderError> {
        let query = ids.join(",");
        let response = self
            .client
            .post(&self.base_url)
            .form(&[
                ("q", query.as_str()),
                ("scopes", "ensembl.gene"),
                ("fields", fields),
                ("species", species),
            ])
            .send()
            .map_err(|err| ImageDownloaderError::GeneQueryHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "gene query failed".to_string());
            return Err(ImageDownloaderError::GeneQueryStatus { status, message });
        }
        response
            .json::<Vec<GeneRecord>>()
            .map_err(|err| ImageDownloaderError::GeneQueryHttp(err.to_string()))
    }
}

impl GeneQuery for MyGeneClient {
    fn query_many(
        &self,
        ids: &[String],
        species: &str,
        fields: &[&str],
    ) -> Result<Vec<GeneRecord>, ImageDownloaderError> {
        let fields = fields.join(",");
        let mut records = Vec::with_capacity(ids.len());
        for batch in ids.chunks(QUERY_BATCH_SIZE) {
            tracing::debug!("querying {} ensembl ids", batch.len());
            records.extend(self.query_batch(batch, species, &fields)?);
        }
        Ok(records)
    }
}

/// One row of `image_gene_node_attributes.tsv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneNodeAttribute {
    pub name: String,
    pub represents: String,
    pub ambiguous: String,
    pub antibody: String,
    pub filename: String,
}

#[derive(Debug, Clone, Default)]
pub struct AttributeTable {
    /// Keyed by the queried ensembl id.
    pub attributes: BTreeMap<String, GeneNodeAttribute>,
    pub errors: Vec<String>,
}

impl AttributeTable {
    pub fn write_tsv(&self, path: &Utf8Path) -> Result<(), ImageDownloaderError> {
        let mut writer = WriterBuilder::new().delimiter(b'\t').from_writer(Vec::new());
        if self.attributes.is_empty() {
            writer
                .write_record(["name", "represents", "ambiguous", "antibody", "filename"])
                .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        }
        for attribute in self.attributes.values() {
            writer
                .serialize(attribute)
                .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        }
        let content = writer
            .into_inner()
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
        OutputStore::write_bytes_atomic(path, &content)
    }

    pub fn write_errors(&self, path: &Utf8Path) -> Result<(), ImageDownloaderError> {
        let mut content = String::new();
        for error in &self.errors {
            content.push_str(error);
            content.push('\n');
        }
        OutputStore::write_bytes_atomic(path, content.as_bytes())
    }
}

pub fn read_attributes_tsv(path: &Path) -> Result<Vec<GeneNodeAttribute>, ImageDownloaderError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(|_| ImageDownloaderError::ManifestRead(path.to_path_buf()))?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let row: GeneNodeAttribute =
            record.map_err(|err| ImageDownloaderError::ManifestParse(err.to_string()))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Which samples contribute antibodies to the attribute table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AntibodyFilter {
    Unrestricted,
    UniqueList,
}

/// Builds gene node attributes from samples and gene query results.
pub struct AttributeAggregator<Q> {
    query: Q,
    fold: usize,
    filter: AntibodyFilter,
}

#[derive(Debug, Clone, Copy)]
struct Assignment<'a> {
    antibody: &'a str,
    ambiguous: bool,
}

impl<Q: GeneQuery> AttributeAggregator<Q> {
    pub fn new(query: Q, fold: usize, filter: AntibodyFilter) -> Self {
        Self {
            query,
            fold,
            filter,
        }
    }

    pub fn fold(&self) -> usize {
        self.fold
    }

    /// Antibodies allowed to represent a gene, `None` when unrestricted.
    pub fn allowed_antibodies<'a>(
        &self,
        unique: Option<&'a [UniqueEntry]>,
    ) -> Result<Option<HashSet<&'a str>>, ImageDownloaderError> {
        match self.filter {
            AntibodyFilter::Unrestricted => Ok(None),
            AntibodyFilter::UniqueList => {
                let unique = unique.ok_or(ImageDownloaderError::MissingUniqueList)?;
                Ok(Some(unique.iter().map(|entry| entry.antibody.as_str()).collect()))
            }
        }
    }

    pub fn aggregate(
        &self,
        samples: &[Sample],
        unique: Option<&[UniqueEntry]>,
    ) -> Result<AttributeTable, ImageDownloaderError> {
        let ids: BTreeSet<&str> = samples
            .iter()
            .flat_map(|sample| split_ensembl_ids(&sample.ensembl_ids))
            .collect();
        let ids: Vec<String> = ids.into_iter().map(str::to_string).collect();
        tracing::info!("querying gene symbols for {} ensembl ids", ids.len());
        let records = self.query.query_many(&ids, GENE_SPECIES, &GENE_FIELDS)?;

        let allowed = self.allowed_antibodies(unique)?;
        let mut gene_antibody: HashMap<&str, Assignment> = HashMap::new();
        let mut antibody_filenames: HashMap<&str, BTreeSet<String>> = HashMap::new();
        let mut ambiguous_antibodies: HashMap<&str, &str> = HashMap::new();

        for sample in samples {
            let antibody = sample.antibody.as_str();
            if let Some(allowed) = &allowed {
                if !allowed.contains(antibody) {
                    continue;
                }
            }
            let ambiguous = sample.is_ambiguous();
            if ambiguous {
                ambiguous_antibodies.insert(antibody, sample.ensembl_ids.as_str());
            }
            for gene in split_ensembl_ids(&sample.ensembl_ids) {
                let candidate = Assignment {
                    antibody,
                    ambiguous,
                };
                gene_antibody
                    .entry(gene)
                    .and_modify(|current| {
                        if current.ambiguous && !ambiguous {
                            *current = candidate;
                        }
                    })
                    .or_insert(candidate);
            }
            antibody_filenames
                .entry(antibody)
                .or_default()
                .insert(sample.image_name());
        }

        let mut table = AttributeTable::default();
        for record in &records {
            let Some(symbol) = record.symbol.as_deref() else {
                table.errors.push(format!(
                    "Skipping {}: no symbol in query result: {}",
                    record.query,
                    describe_record(record)
                ));
                continue;
            };
            let Some(ensembl) = &record.ensembl else {
                table.errors.push(format!(
                    "Skipping {}: no ensembl in query result: {}",
                    record.query,
                    describe_record(record)
                ));
                continue;
            };
            let gene_ids = ensembl.gene_ids();
            let Some(assignment) = gene_ids
                .iter()
                .find_map(|gene| gene_antibody.get(gene))
            else {
                table.errors.push(format!(
                    "Skipping {}: no antibody for ensembl ids {}",
                    record.query,
                    gene_ids.join(",")
                ));
                continue;
            };
            let filename = antibody_filenames
                .get(assignment.antibody)
                .and_then(|filenames| select_fold(filenames, self.fold))
                .unwrap_or_default();
            table.attributes.insert(
                record.query.clone(),
                GeneNodeAttribute {
                    name: symbol.to_string(),
                    represents: format!("ensembl:{}", gene_ids.join(";")),
                    ambiguous: ambiguous_antibodies
                        .get(assignment.antibody)
                        .map(|value| value.to_string())
                        .unwrap_or_default(),
                    antibody: assignment.antibody.to_string(),
                    filename,
                },
            );
        }
        for error in &table.errors {
            tracing::error!("{error}");
        }
        Ok(table)
    }
}

/// 1-indexed pick from `filenames`, clamped to the last element.
pub fn select_fold(filenames: &BTreeSet<String>, fold: usize) -> Option<String> {
    let last = filenames.len().checked_sub(1)?;
    let index = fold.saturating_sub(1).min(last);
    filenames.iter().nth(index).cloned()
}

fn describe_record(record: &GeneRecord) -> String {
    serde_json::to_string(record).unwrap_or_else(|_| record.query.clone())
}
