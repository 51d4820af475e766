use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{BinMethod, SampleAccession};
use crate::error::IngestError;
use crate::layout::DataLayout;
use crate::store::{BinId, SampleId, StatsId, Tables};

/// CheckM quality metrics for one bin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckmStats {
    pub translation_table: u64,
    pub gc_std: f64,
    pub ambiguous_bases: u64,
    pub genome_size: u64,
    pub longest_contig: u64,
    pub n50_scaffolds: u64,
    pub mean_scaffold_len: f64,
    pub num_contigs: u64,
    pub num_scaffolds: u64,
    pub num_predicted_genes: u64,
    pub longest_scaffold: u64,
    pub gc: f64,
    pub n50_contigs: u64,
    pub coding_density: f64,
    pub mean_contig_length: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Unsigned,
    Float,
}

/// A statistics field: attribute name, display label used as key in the
/// input, and value type.
#[derive(Debug, Clone, Copy)]
pub struct StatsField {
    pub name: &'static str,
    pub label: &'static str,
    pub kind: FieldKind,
}

pub const FIELDS: [StatsField; 15] = [
    StatsField { name: "translation_table", label: "Translation table", kind: FieldKind::Unsigned },
    StatsField { name: "gc_std", label: "GC std", kind: FieldKind::Float },
    StatsField { name: "ambiguous_bases", label: "# ambiguous bases", kind: FieldKind::Unsigned },
    StatsField { name: "genome_size", label: "Genome size", kind: FieldKind::Unsigned },
    StatsField { name: "longest_contig", label: "Longest contig", kind: FieldKind::Unsigned },
    StatsField { name: "n50_scaffolds", label: "N50 (scaffolds)", kind: FieldKind::Unsigned },
    StatsField { name: "mean_scaffold_len", label: "Mean scaffold length", kind: FieldKind::Float },
    StatsField { name: "num_contigs", label: "# contigs", kind: FieldKind::Unsigned },
    StatsField { name: "num_scaffolds", label: "# scaffolds", kind: FieldKind::Unsigned },
    StatsField { name: "num_predicted_genes", label: "# predicted genes", kind: FieldKind::Unsigned },
    StatsField { name: "longest_scaffold", label: "Longest scaffold", kind: FieldKind::Unsigned },
    StatsField { name: "gc", label: "GC", kind: FieldKind::Float },
    StatsField { name: "n50_contigs", label: "N50 (contigs)", kind: FieldKind::Unsigned },
    StatsField { name: "coding_density", label: "Coding density", kind: FieldKind::Float },
    StatsField { name: "mean_contig_length", label: "Mean contig length", kind: FieldKind::Float },
];

#[derive(Debug, Clone, Copy, PartialEq)]
enum FieldValue {
    Unsigned(u64),
    Float(f64),
}

impl StatsField {
    pub fn by_label(label: &str) -> Option<&'static StatsField> {
        FIELDS.iter().find(|field| field.label == label)
    }

    fn coerce(&self, raw: &str) -> Result<FieldValue, String> {
        let raw = raw.trim();
        match self.kind {
            FieldKind::Unsigned => {
                if let Ok(value) = raw.parse::<u64>() {
                    return Ok(FieldValue::Unsigned(value));
                }
                // integral floats such as "11.0" are accepted
                match raw.parse::<f64>() {
                    Ok(value) if value >= 0.0 && value.fract() == 0.0 => {
                        Ok(FieldValue::Unsigned(value as u64))
                    }
                    _ => Err(format!("'{raw}' value must be a non-negative integer")),
                }
            }
            FieldKind::Float => raw
                .parse::<f64>()
                .map(FieldValue::Float)
                .map_err(|_| format!("'{raw}' value must be a float")),
        }
    }
}

impl CheckmStats {
    fn set(&mut self, name: &str, value: FieldValue) {
        let (unsigned, float) = match value {
            FieldValue::Unsigned(v) => (v, v as f64),
            FieldValue::Float(v) => (v as u64, v),
        };
        match name {
            "translation_table" => self.translation_table = unsigned,
            "gc_std" => self.gc_std = float,
            "ambiguous_bases" => self.ambiguous_bases = unsigned,
            "genome_size" => self.genome_size = unsigned,
            "longest_contig" => self.longest_contig = unsigned,
            "n50_scaffolds" => self.n50_scaffolds = unsigned,
            "mean_scaffold_len" => self.mean_scaffold_len = float,
            "num_contigs" => self.num_contigs = unsigned,
            "num_scaffolds" => self.num_scaffolds = unsigned,
            "num_predicted_genes" => self.num_predicted_genes = unsigned,
            "longest_scaffold" => self.longest_scaffold = unsigned,
            "gc" => self.gc = float,
            "n50_contigs" => self.n50_contigs = unsigned,
            "coding_density" => self.coding_density = float,
            "mean_contig_length" => self.mean_contig_length = float,
            _ => {}
        }
    }
}

/// One parsed line of `bin_stats.analyze.tsv`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsLine {
    pub line: u64,
    pub bin_id: String,
    pub stats: CheckmStats,
}

/// Parses `bin_id<TAB>{'Label': value, ...}` lines.
pub fn parse_stats<R: BufRead>(reader: R, path: &Path) -> Result<Vec<StatsLine>, IngestError> {
    let mut out = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line_no = index as u64 + 1;
        let line = line.map_err(|err| IngestError::Filesystem(format!("read {}: {err}", path.display())))?;
        let content = line.trim();
        if content.is_empty() {
            continue;
        }
        let (bin_id, data) = content.split_once('\t').ok_or_else(|| IngestError::StatsFormat {
            path: path.to_path_buf(),
            line: line_no,
            message: "expected bin id and mapping separated by a tab".to_string(),
        })?;
        let data = data.trim().trim_start_matches('{').trim_end_matches('}');

        let mut stats = CheckmStats::default();
        let mut seen = BTreeSet::new();
        for item in data.split(", ") {
            let (key, value) = item.split_once(": ").ok_or_else(|| IngestError::StatsFormat {
                path: path.to_path_buf(),
                line: line_no,
                message: format!("expected 'key: value' but got {item:?}"),
            })?;
            let key = key.trim().trim_matches('\'').trim_matches('"');
            let field = StatsField::by_label(key).ok_or_else(|| IngestError::StatsUnknownField {
                path: path.to_path_buf(),
                line: line_no,
                key: key.to_string(),
                content: line.clone(),
            })?;
            let value = field.coerce(value).map_err(|message| IngestError::StatsValue {
                path: path.to_path_buf(),
                line: line_no,
                field: field.label.to_string(),
                message,
                content: line.clone(),
            })?;
            stats.set(field.name, value);
            seen.insert(field.name);
        }

        if let Some(missing) = FIELDS.iter().find(|field| !seen.contains(field.name)) {
            return Err(IngestError::StatsFormat {
                path: path.to_path_buf(),
                line: line_no,
                message: format!("missing field {:?}", missing.label),
            });
        }

        out.push(StatsLine {
            line: line_no,
            bin_id: bin_id.trim().to_string(),
            stats,
        });
    }
    Ok(out)
}

/// Sample, method and number embedded in a statistics bin id such as
/// `Sample_42895_MET_P99S99E300_bins.6`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinKey {
    pub sample: String,
    pub method: BinMethod,
    pub number: u32,
}

pub struct BinKeyParser {
    pattern: Regex,
}

impl BinKeyParser {
    pub fn new() -> Result<Self, IngestError> {
        let methods = BinMethod::ALL
            .iter()
            .map(|method| regex::escape(method.label()))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = Regex::new(&format!(
            r"^(?P<sample>.+)_(?P<method>{methods})_bins\.(?P<number>\d+)$"
        ))
        .map_err(|err| IngestError::Store(err.to_string()))?;
        Ok(Self { pattern })
    }

    pub fn parse(&self, bin_id: &str) -> Option<BinKey> {
        let caps = self.pattern.captures(bin_id)?;
        Some(BinKey {
            sample: caps["sample"].to_string(),
            method: caps["method"].parse().ok()?,
            number: caps["number"].parse().ok()?,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsImportReport {
    pub bins: BTreeMap<BinMethod, usize>,
}

/// Loads the CheckM statistics of one sample and links them to its bins.
///
/// Returns `None` when the sample has no statistics file.
pub fn import_sample_stats(
    tables: &mut Tables,
    layout: &DataLayout,
    sample: SampleId,
    accession: &SampleAccession,
) -> Result<Option<StatsImportReport>, IngestError> {
    let path = layout.checkm_stats_path(accession);
    if !path.as_std_path().exists() {
        warn!(sample = %accession, path = %path, "checkm stats do not exist");
        return Ok(None);
    }
    let file = File::open(path.as_std_path())
        .map_err(|err| IngestError::Filesystem(format!("open {path}: {err}")))?;
    let lines = parse_stats(BufReader::new(file), path.as_std_path())?;

    let parser = BinKeyParser::new()?;
    let mut grouped: BTreeMap<BinMethod, Vec<(BinId, StatsId)>> = BTreeMap::new();
    let mut seen: HashMap<BinId, u64> = HashMap::new();
    for entry in lines {
        let key = parser.parse(&entry.bin_id).ok_or_else(|| IngestError::StatsFormat {
            path: path.clone().into_std_path_buf(),
            line: entry.line,
            message: format!("bad bin id in stats: {}", entry.bin_id),
        })?;
        if key.sample != accession.as_str() {
            return Err(IngestError::StatsSampleMismatch {
                path: path.clone().into_std_path_buf(),
                line: entry.line,
                bin_id: entry.bin_id,
                expected: accession.to_string(),
            });
        }
        let bin = tables
            .find_bin(sample, key.method, key.number)
            .map(|bin| bin.id)
            .ok_or_else(|| IngestError::UnknownBin {
                path: path.clone().into_std_path_buf(),
                line: entry.line,
                bin_id: entry.bin_id.clone(),
            })?;
        if let Some(first) = seen.insert(bin, entry.line) {
            return Err(IngestError::StatsFormat {
                path: path.clone().into_std_path_buf(),
                line: entry.line,
                message: format!("bin {} already listed on line {first}", entry.bin_id),
            });
        }
        let stats = tables.create_stats(entry.stats);
        grouped.entry(key.method).or_default().push((bin, stats));
    }

    let mut report = StatsImportReport::default();
    for (method, updates) in grouped {
        let count = tables.bulk_update_bin_stats(method, &updates)?;
        report.bins.insert(method, count);
    }
    info!(sample = %accession, bins = report.bins.values().sum::<usize>(), "checkm stats imported");
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_key_splits_sample_method_number() {
        let parser = BinKeyParser::new().unwrap();
        let key = parser.parse("Sample_42895_MET_P99S99E300_bins.6").unwrap();
        assert_eq!(key.sample, "Sample_42895");
        assert_eq!(key.method, BinMethod::Met99);
        assert_eq!(key.number, 6);
        assert!(parser.parse("Sample_42895_CONCOCT_bins.6").is_none());
    }

    #[test]
    fn integral_float_accepted_for_unsigned() {
        let field = StatsField::by_label("Translation table").unwrap();
        assert_eq!(field.coerce("11.0").unwrap(), FieldValue::Unsigned(11));
        assert!(field.coerce("11.5").is_err());
    }
}
