use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::domain::Rank;

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("invalid sample accession: {0}")]
    InvalidAccession(String),

    #[error("unknown binning method: {0}")]
    UnknownBinMethod(String),

    #[error("unknown taxonomic rank: {0}")]
    InvalidRank(String),

    #[error("unknown record kind: {0}")]
    InvalidRecordKind(String),

    #[error("missing config file omics-ingest.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("sample not found: {0}")]
    SampleNotFound(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("failed parsing FASTA header in {path}:{line}: {message}, line: {content}")]
    HeaderParse {
        path: PathBuf,
        line: u64,
        message: String,
        content: String,
    },

    #[error("corrupt sequence at offset {offset} in {path}: {message}")]
    SequenceCorrupt {
        path: PathBuf,
        offset: u64,
        message: String,
    },

    #[error("bad coverage table {path}:{line}: {message}")]
    CoverageFormat {
        path: PathBuf,
        line: u64,
        message: String,
    },

    #[error(
        "sequence and coverage data out of order at record {record} ({path}): sequence {sequence_id:?}, coverage row {coverage_id:?}"
    )]
    OrderViolation {
        path: PathBuf,
        record: u64,
        sequence_id: String,
        coverage_id: String,
    },

    #[error("failed parsing bin file name {path}: {message}")]
    BinFileName { path: PathBuf, message: String },

    #[error("duplicate bin {method} #{number} for sample {sample} in {path}")]
    DuplicateBin {
        path: PathBuf,
        sample: String,
        method: String,
        number: u32,
    },

    #[error("failed parsing {path}:{line}: no field matches {key:?}, offending line is: {content}")]
    StatsUnknownField {
        path: PathBuf,
        line: u64,
        key: String,
        content: String,
    },

    #[error("failed parsing field {field:?} at {path}:{line}: {message}, line: {content}")]
    StatsValue {
        path: PathBuf,
        line: u64,
        field: String,
        message: String,
        content: String,
    },

    #[error("bad statistics line {path}:{line}: {message}")]
    StatsFormat {
        path: PathBuf,
        line: u64,
        message: String,
    },

    #[error("bad sample name in stats {path}:{line}: {bin_id} -- expected: {expected}")]
    StatsSampleMismatch {
        path: PathBuf,
        line: u64,
        bin_id: String,
        expected: String,
    },

    #[error("no bin for statistics bin id {bin_id} at {path}:{line}")]
    UnknownBin {
        path: PathBuf,
        line: u64,
        bin_id: String,
    },

    #[error("unknown taxonomic name: {rank} {name}")]
    UnknownTaxName { name: String, rank: Rank },

    #[error("lineage has more names than ranks: {0}")]
    LineageTooDeep(String),

    #[error("lowest common ancestor needs at least one taxon")]
    EmptyTaxa,

    #[error("unknown taxid: {0}")]
    UnknownTaxon(u32),

    #[error("bad taxonomy file {path}:{line}: {message}")]
    TaxonomyFormat {
        path: PathBuf,
        line: u64,
        message: String,
    },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("{program} did not exit within {secs}s and was killed")]
    DecompressTimeout { program: String, secs: u64 },
}
