use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static ANTIBODY_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^HPA0*|^CAB0*").expect("antibody prefix pattern"));
static ENSEMBL_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\W*,\W*").expect("ensembl split pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Red,
    Green,
    Blue,
    Yellow,
}

impl Color {
    /// Channel enumeration order; every sample yields its tasks in this order.
    pub const ALL: [Color; 4] = [Color::Red, Color::Green, Color::Blue, Color::Yellow];

    pub fn as_str(self) -> &'static str {
        match self {
            Color::Red => "red",
            Color::Green => "green",
            Color::Blue => "blue",
            Color::Yellow => "yellow",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|color| color.as_str() == value)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of the samples manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub filename: String,
    pub if_plate_id: String,
    pub position: String,
    pub sample: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub locations: String,
    pub antibody: String,
    pub ensembl_ids: String,
    #[serde(default)]
    pub gene_names: String,
    #[serde(default)]
    pub linkprefix: Option<String>,
}

impl Sample {
    /// `<plate>_<position>_<sample>_`, the filename prefix shared by all channels.
    pub fn image_name(&self) -> String {
        format!("{}_{}_{}_", self.if_plate_id, self.position, self.sample)
    }

    /// `<antibody digits>/<plate>_<position>_<sample>_`, the key used by the image index.
    pub fn image_id(&self) -> String {
        format!(
            "{}/{}",
            normalize_antibody(&self.antibody),
            self.image_name()
        )
    }

    pub fn link_prefix(&self) -> Option<&str> {
        self.linkprefix
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn ensembl_id_list(&self) -> Vec<&str> {
        split_ensembl_ids(&self.ensembl_ids).collect()
    }

    /// More than one gene behind the antibody, counted the way the ids are
    /// split for gene lookup.
    pub fn is_ambiguous(&self) -> bool {
        split_ensembl_ids(&self.ensembl_ids).nth(1).is_some()
    }
}

/// One row of the optional unique antibody manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueEntry {
    pub antibody: String,
    pub ensembl_ids: String,
    pub gene_names: String,
    #[serde(default)]
    pub atlas_name: String,
    #[serde(default)]
    pub locations: String,
    #[serde(default)]
    pub n_location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DownloadTask {
    pub source: String,
    pub destination: PathBuf,
}

impl DownloadTask {
    pub fn new(source: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

impl fmt::Display for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination.display())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub status: u16,
    pub message: String,
    pub task: DownloadTask,
}

pub fn split_ensembl_ids(value: &str) -> impl Iterator<Item = &str> {
    ENSEMBL_SPLIT
        .split(value)
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

pub fn normalize_antibody(antibody: &str) -> String {
    ANTIBODY_PREFIX.replace(antibody, "").into_owned()
}
