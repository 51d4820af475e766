use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::BufRead;
use std::path::Path;

use camino::Utf8PathBuf;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{BinMethod, SampleAccession};
use crate::error::IngestError;
use crate::fasta::{open_sequential, FastaIndexer, PlainHeader};
use crate::layout::DataLayout;
use crate::store::{SampleId, Tables};

/// A bin FASTA file with the bin number taken from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinFile {
    pub path: Utf8PathBuf,
    pub number: u32,
}

/// Recognizes the bin files of one sample and method:
/// `<sample>_<label>_bins.<number>[.<ext>]`.
pub struct BinFilePattern {
    method: BinMethod,
    pattern: Regex,
}

impl BinFilePattern {
    pub fn new(method: BinMethod, sample: &SampleAccession) -> Result<Self, IngestError> {
        let prefix = regex::escape(&method.file_prefix(sample));
        let pattern = Regex::new(&format!(r"^{prefix}(?P<index>[^.]+)(?:\.(?P<ext>.+))?$"))
            .map_err(|err| IngestError::Store(err.to_string()))?;
        Ok(Self { method, pattern })
    }

    /// `None` for files that belong to another sample or method. A matching
    /// file with a non-numeric index is an error.
    pub fn matches(&self, path: &Utf8PathBuf) -> Option<Result<BinFile, IngestError>> {
        let name = path.file_name()?;
        let caps = self.pattern.captures(name)?;
        let ext = caps.name("ext").map(|ext| ext.as_str());
        if let Some(required) = self.method.required_extension()
            && ext != Some(required)
        {
            return None;
        }
        let index = &caps["index"];
        Some(
            index
                .parse::<u32>()
                .map(|number| BinFile {
                    path: path.clone(),
                    number,
                })
                .map_err(|_| IngestError::BinFileName {
                    path: path.clone().into_std_path_buf(),
                    message: format!("bin index {index:?} is not a number"),
                }),
        )
    }
}

/// Bin files of a sample for one method, sorted by path.
pub fn bin_files(
    layout: &DataLayout,
    method: BinMethod,
    sample: &SampleAccession,
) -> Result<Vec<BinFile>, IngestError> {
    let dir = layout.bin_dir(method);
    if !dir.as_std_path().is_dir() {
        return Ok(Vec::new());
    }
    let pattern = BinFilePattern::new(method, sample)?;

    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| IngestError::Filesystem(format!("read {dir}: {err}")))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        if let Some(file) = pattern.matches(&path) {
            files.push(file?);
        }
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Collects the identifiers of every record in a bin file.
pub fn read_members<R: BufRead>(reader: R, path: &Path) -> Result<HashSet<String>, IngestError> {
    FastaIndexer::new(reader, PlainHeader, path)
        .map(|record| record.map(|record| record.fields.identifier))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct BinReport {
    pub number: u32,
    pub members: usize,
    pub assigned: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BinImportReport {
    pub methods: BTreeMap<BinMethod, Vec<BinReport>>,
}

impl BinImportReport {
    pub fn bins(&self) -> usize {
        self.methods.values().map(Vec::len).sum()
    }
}

fn import_bin_file(
    tables: &mut Tables,
    sample: SampleId,
    accession: &SampleAccession,
    method: BinMethod,
    file: &BinFile,
) -> Result<BinReport, IngestError> {
    if tables.find_bin(sample, method, file.number).is_some() {
        return Err(IngestError::DuplicateBin {
            path: file.path.clone().into_std_path_buf(),
            sample: accession.to_string(),
            method: method.label().to_string(),
            number: file.number,
        });
    }
    let bin = tables.create_bin(sample, method, file.number)?;
    let members = read_members(open_sequential(file.path.as_std_path())?, file.path.as_std_path())?;
    let assigned = tables.assign_bin(sample, method, bin, &members);

    if members.is_empty() {
        warn!(sample = %accession, method = %method, file = %file.path, "got empty cluster");
    } else if assigned < members.len() {
        debug!(
            sample = %accession,
            method = %method,
            number = file.number,
            unknown = members.len() - assigned,
            "bin names contigs that are not loaded"
        );
    }
    Ok(BinReport {
        number: file.number,
        members: members.len(),
        assigned,
    })
}

/// Creates the bins of every requested method and links their contigs.
///
/// Methods without files are reported with a warning and left empty.
pub fn import_sample_bins(
    tables: &mut Tables,
    layout: &DataLayout,
    sample: SampleId,
    accession: &SampleAccession,
    methods: &[BinMethod],
) -> Result<BinImportReport, IngestError> {
    let mut report = BinImportReport::default();
    for &method in methods {
        let files = bin_files(layout, method, accession)?;
        if files.is_empty() {
            warn!(sample = %accession, method = %method, "no bins found");
            continue;
        }
        let mut bins = Vec::with_capacity(files.len());
        for file in &files {
            bins.push(import_bin_file(tables, sample, accession, method, file)?);
        }
        info!(
            sample = %accession,
            method = %method,
            bins = bins.len(),
            contigs = bins.iter().map(|bin| bin.assigned).sum::<usize>(),
            "bins imported"
        );
        report.methods.insert(method, bins);
    }
    Ok(report)
}
