use std::collections::{BTreeSet, HashSet};
use std::io::Read;
use std::path::Path;

use camino::Utf8Path;
use csv::{ReaderBuilder, WriterBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::{Sample, UniqueEntry};
use crate::error::ImageDownloaderError;
use crate::store::OutputStore;

pub fn load_samples(path: &Path) -> Result<Vec<Sample>, ImageDownloaderError> {
    load_csv(path, b',')
}

pub fn load_unique_list(path: &Path) -> Result<Vec<UniqueEntry>, ImageDownloaderError> {
    load_csv(path, b',')
}

pub fn read_samples<R: Read>(reader: R) -> Result<Vec<Sample>, ImageDownloaderError> {
    read_csv(reader, b',')
}

pub fn read_unique_list<R: Read>(reader: R) -> Result<Vec<UniqueEntry>, ImageDownloaderError> {
    read_csv(reader, b',')
}

/// Gene symbols or Ensembl ids, one per line or comma separated. Blank
/// entries and `#` comment lines are skipped.
pub fn load_protein_list(path: &Path) -> Result<Vec<String>, ImageDownloaderError> {
    let content = std::fs::read_to_string(path)
        .map_err(|_| ImageDownloaderError::ManifestRead(path.to_path_buf()))?;
    Ok(parse_protein_list(&content))
}

pub fn parse_protein_list(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .flat_map(|line| line.split(','))
        .map(str::trim)
        .filter(|protein| !protein.is_empty())
        .map(str::to_string)
        .collect()
}

/// Writes rows with a header line, replacing `path` atomically.
pub fn write_csv<T: Serialize>(rows: &[T], path: &Utf8Path) -> Result<(), ImageDownloaderError> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    for row in rows {
        writer
            .serialize(row)
            .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
    }
    let content = writer
        .into_inner()
        .map_err(|err| ImageDownloaderError::Filesystem(err.to_string()))?;
    OutputStore::write_bytes_atomic(path, &content)
}

/// Image ids (`<antibody>/<plate>_<position>_<sample>_`) of every sample.
pub fn sample_image_ids(samples: &[Sample]) -> HashSet<String> {
    samples.iter().map(Sample::image_id).collect()
}

#[derive(Debug, Deserialize)]
struct Cm4aiRow {
    #[serde(rename = "Antibody ID")]
    antibody: String,
    #[serde(rename = "ENSEMBL ID")]
    ensembl_ids: String,
    #[serde(rename = "Treatment")]
    treatment: String,
    #[serde(rename = "Well")]
    well: String,
    #[serde(rename = "Region")]
    region: String,
    #[serde(rename = "Gene", default)]
    gene: String,
}

/// Samples and unique antibodies read from a CM4AI RO-Crate table.
#[derive(Debug, Clone)]
pub struct Cm4aiTable {
    pub samples: Vec<Sample>,
    pub unique: Vec<UniqueEntry>,
}

impl Cm4aiTable {
    /// Reads the tab separated table. Images are expected under
    /// `<table dir>/<color>/` so the table directory becomes every sample's
    /// link prefix.
    pub fn load(path: &Path) -> Result<Self, ImageDownloaderError> {
        let rows: Vec<Cm4aiRow> = load_csv(path, b'\t')?;
        let prefix = path
            .parent()
            .map(|dir| dir.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string());
        Ok(Self::from_rows(rows, &prefix))
    }

    fn from_rows(rows: Vec<Cm4aiRow>, prefix: &str) -> Self {
        let mut samples = Vec::with_capacity(rows.len());
        let mut unique = Vec::new();
        let mut seen = BTreeSet::new();
        for row in rows {
            let filename = format!("{}_{}_{}_", row.treatment, row.well, row.region);
            if seen.insert(row.antibody.clone()) {
                unique.push(UniqueEntry {
                    antibody: row.antibody.clone(),
                    ensembl_ids: row.ensembl_ids.clone(),
                    gene_names: row.gene.clone(),
                    atlas_name: String::new(),
                    locations: String::new(),
                    n_location: String::new(),
                });
            }
            samples.push(Sample {
                filename,
                if_plate_id: row.treatment,
                position: row.well,
                sample: row.region,
                status: String::new(),
                locations: String::new(),
                antibody: row.antibody,
                ensembl_ids: row.ensembl_ids,
                gene_names: row.gene,
                linkprefix: Some(prefix.to_string()),
            });
        }
        Self { samples, unique }
    }

    pub fn read<R: Read>(reader: R, prefix: &str) -> Result<Self, ImageDownloaderError> {
        let rows: Vec<Cm4aiRow> = read_csv(reader, b'\t')?;
        Ok(Self::from_rows(rows, prefix))
    }
}

fn load_csv<T: DeserializeOwned>(path: &Path, delimiter: u8) -> Result<Vec<T>, ImageDownloaderError> {
    let file = std::fs::File::open(path)
        .map_err(|_| ImageDownloaderError::ManifestRead(path.to_path_buf()))?;
    read_csv(file, delimiter).map_err(|err| match err {
        ImageDownloaderError::ManifestParse(message) => {
            ImageDownloaderError::ManifestParse(format!("{}: {message}", path.display()))
        }
        other => other,
    })
}

fn read_csv<T: DeserializeOwned, R: Read>(
    reader: R,
    delimiter: u8,
) -> Result<Vec<T>, ImageDownloaderError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .from_reader(reader);
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let row: T = record.map_err(|err| ImageDownloaderError::ManifestParse(err.to_string()))?;
        rows.push(row);
    }
    Ok(rows)
}
