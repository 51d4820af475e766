use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SampleAccession(String);

impl SampleAccession {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SampleAccession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SampleAccession {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'));
        if !is_valid {
            return Err(IngestError::InvalidAccession(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

/// Kind of FASTA-derived record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Contig,
    Gene,
    Protein,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Contig => "contig",
            RecordKind::Gene => "gene",
            RecordKind::Protein => "protein",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "contig" | "contigs" => Ok(RecordKind::Contig),
            "gene" | "genes" => Ok(RecordKind::Gene),
            "protein" | "proteins" => Ok(RecordKind::Protein),
            _ => Err(IngestError::InvalidRecordKind(value.to_string())),
        }
    }
}

/// Fixed taxonomic rank ordering, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    Root,
    Domain,
    Phylum,
    Class,
    Order,
    Family,
    Genus,
    Species,
    Strain,
}

impl Rank {
    /// Ranks below root, in lineage order.
    pub const LINEAGE: [Rank; 8] = [
        Rank::Domain,
        Rank::Phylum,
        Rank::Class,
        Rank::Order,
        Rank::Family,
        Rank::Genus,
        Rank::Species,
        Rank::Strain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Rank::Root => "root",
            Rank::Domain => "domain",
            Rank::Phylum => "phylum",
            Rank::Class => "class",
            Rank::Order => "order",
            Rank::Family => "family",
            Rank::Genus => "genus",
            Rank::Species => "species",
            Rank::Strain => "strain",
        }
    }

    pub fn level(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rank {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        if let Ok(level) = normalized.parse::<u8>() {
            return [Rank::Root]
                .into_iter()
                .chain(Rank::LINEAGE)
                .find(|rank| rank.level() == level)
                .ok_or_else(|| IngestError::InvalidRank(value.to_string()));
        }
        match normalized.as_str() {
            "root" => Ok(Rank::Root),
            "domain" => Ok(Rank::Domain),
            "phylum" => Ok(Rank::Phylum),
            "class" | "klass" => Ok(Rank::Class),
            "order" => Ok(Rank::Order),
            "family" => Ok(Rank::Family),
            "genus" => Ok(Rank::Genus),
            "species" => Ok(Rank::Species),
            "strain" => Ok(Rank::Strain),
            _ => Err(IngestError::InvalidRank(value.to_string())),
        }
    }
}

/// Per-sample pipeline stage, each with its own completion flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Contigs,
    Binning,
    Checkm,
    Genes,
    Proteins,
    Taxa,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Contigs,
        Stage::Binning,
        Stage::Checkm,
        Stage::Genes,
        Stage::Proteins,
        Stage::Taxa,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Contigs => "contigs",
            Stage::Binning => "binning",
            Stage::Checkm => "checkm",
            Stage::Genes => "genes",
            Stage::Proteins => "proteins",
            Stage::Taxa => "taxa",
        }
    }

    /// Stage whose flag must be set before this one may run.
    pub fn prerequisite(&self) -> Option<Stage> {
        match self {
            Stage::Contigs => None,
            Stage::Binning => Some(Stage::Contigs),
            Stage::Checkm => Some(Stage::Binning),
            Stage::Genes => Some(Stage::Contigs),
            Stage::Proteins => Some(Stage::Genes),
            Stage::Taxa => Some(Stage::Binning),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Genome binning method variants.
///
/// Every variant shares the same contract: a method label and a rule
/// locating the per-sample bin files under the data root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BinMethod {
    #[serde(rename = "MAX")]
    Max,
    #[serde(rename = "MET_P97S93E300")]
    Met93,
    #[serde(rename = "MET_P99S97E300")]
    Met97,
    #[serde(rename = "MET_P99S99E300")]
    Met99,
}

impl BinMethod {
    pub const ALL: [BinMethod; 4] = [
        BinMethod::Max,
        BinMethod::Met93,
        BinMethod::Met97,
        BinMethod::Met99,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            BinMethod::Max => "MAX",
            BinMethod::Met93 => "MET_P97S93E300",
            BinMethod::Met97 => "MET_P99S97E300",
            BinMethod::Met99 => "MET_P99S99E300",
        }
    }

    /// Directory below `BINS/` holding this method's bin files.
    pub fn directory(&self) -> &'static str {
        match self {
            BinMethod::Max => "MAX_BIN",
            BinMethod::Met93 | BinMethod::Met97 | BinMethod::Met99 => "METABAT",
        }
    }

    /// File extension a bin file must carry, if the method fixes one.
    pub fn required_extension(&self) -> Option<&'static str> {
        match self {
            BinMethod::Max => Some("fasta"),
            BinMethod::Met93 | BinMethod::Met97 | BinMethod::Met99 => None,
        }
    }

    /// File name prefix shared by all bin files of a sample, up to the bin index.
    pub fn file_prefix(&self, sample: &SampleAccession) -> String {
        format!("{}_{}_bins.", sample.as_str(), self.label())
    }
}

impl fmt::Display for BinMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for BinMethod {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        BinMethod::ALL
            .into_iter()
            .find(|method| method.label().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| IngestError::UnknownBinMethod(value.to_string()))
    }
}
