//! Mapping coverage tables (`*.rpkm`) and their lock-step join with FASTA
//! records.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use crate::error::IngestError;
use crate::fasta::{IndexedRecord, SequenceFields};
use crate::store::CoverageAttributes;

pub const COVERAGE_COLUMNS: [&str; 8] = [
    "Name", "Length", "Bases", "Coverage", "Reads", "RPKM", "Frags", "FPKM",
];

/// Header key holding the number of reads of the sample.
pub const HEADER_READS: &str = "Reads";
/// Header key holding the number of mapped reads.
pub const HEADER_MAPPED: &str = "Mapped";
/// Header key holding the number of reference sequences.
pub const HEADER_REF_SEQUENCES: &str = "RefSequences";

/// One `#key<TAB>value` line of the header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    pub value: String,
    pub line: u64,
}

pub type CoverageHeader = BTreeMap<String, HeaderEntry>;

#[derive(Debug, Clone, PartialEq)]
pub struct CoverageRow {
    pub line: u64,
    pub name: String,
    pub attributes: CoverageAttributes,
}

/// Streams the rows of a coverage table.
///
/// The `#key<TAB>value` header block and the column-name row are consumed
/// by [`CoverageReader::new`].
pub struct CoverageReader<R> {
    reader: R,
    path: PathBuf,
    header: CoverageHeader,
    line_no: u64,
    limit: Option<usize>,
    emitted: usize,
    buf: String,
    done: bool,
}

impl<R: BufRead> CoverageReader<R> {
    pub fn new(mut reader: R, path: &Path, limit: Option<usize>) -> Result<Self, IngestError> {
        let mut header = BTreeMap::new();
        let mut line_no = 0;
        let mut buf = String::new();
        let format_error = |line: u64, message: String| IngestError::CoverageFormat {
            path: path.to_path_buf(),
            line,
            message,
        };

        loop {
            buf.clear();
            let read = reader
                .read_line(&mut buf)
                .map_err(|err| IngestError::Filesystem(format!("read {}: {err}", path.display())))?;
            if read == 0 {
                return Err(format_error(line_no, "missing column-name row".to_string()));
            }
            line_no += 1;

            let Some(content) = buf.trim_end_matches(['\n', '\r']).strip_prefix('#') else {
                return Err(format_error(
                    line_no,
                    format!("expected header but got: {}", buf.trim_end()),
                ));
            };
            let row: Vec<&str> = content.split('\t').collect();
            if row.first() == Some(&COVERAGE_COLUMNS[0]) {
                if row != COVERAGE_COLUMNS {
                    return Err(format_error(
                        line_no,
                        format!("unexpected column names: {}", row.join(" ")),
                    ));
                }
                break;
            }
            match row.as_slice() {
                [key, value] => {
                    header.insert(
                        key.trim().to_string(),
                        HeaderEntry {
                            value: value.trim().to_string(),
                            line: line_no,
                        },
                    );
                }
                _ => {
                    return Err(format_error(
                        line_no,
                        format!("expected key and value but got: {content}"),
                    ));
                }
            }
        }

        Ok(Self {
            reader,
            path: path.to_path_buf(),
            header,
            line_no,
            limit,
            emitted: 0,
            buf,
            done: false,
        })
    }

    pub fn header(&self) -> &CoverageHeader {
        &self.header
    }

    fn parse_row(&self, content: &str) -> Result<CoverageRow, IngestError> {
        let cols: Vec<&str> = content.split('\t').collect();
        let error = |message: String| IngestError::CoverageFormat {
            path: self.path.clone(),
            line: self.line_no,
            message,
        };
        if cols.len() < COVERAGE_COLUMNS.len() {
            return Err(error(format!(
                "expected {} columns, got {}",
                COVERAGE_COLUMNS.len(),
                cols.len()
            )));
        }
        let int = |index: usize| {
            cols[index]
                .trim()
                .parse::<u64>()
                .map_err(|_| error(format!("{}: bad integer {:?}", COVERAGE_COLUMNS[index], cols[index])))
        };
        let float = |index: usize| {
            cols[index]
                .trim()
                .parse::<f64>()
                .map_err(|_| error(format!("{}: bad number {:?}", COVERAGE_COLUMNS[index], cols[index])))
        };

        Ok(CoverageRow {
            line: self.line_no,
            name: cols[0].to_string(),
            attributes: CoverageAttributes {
                length: int(1)?,
                bases: int(2)?,
                coverage: float(3)?,
                reads_mapped: int(4)?,
                rpkm: float(5)?,
                frags_mapped: int(6)?,
                fpkm: float(7)?,
            },
        })
    }
}

impl<R: BufRead> Iterator for CoverageReader<R> {
    type Item = Result<CoverageRow, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.limit.is_some_and(|limit| self.emitted >= limit) {
            return None;
        }
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(err) => {
                    self.done = true;
                    let message = format!("read {}: {err}", self.path.display());
                    return Some(Err(IngestError::Filesystem(message)));
                }
            }
            self.line_no += 1;
            let content = self.buf.trim_end_matches(['\n', '\r']);
            if content.trim().is_empty() {
                continue;
            }
            let row = self.parse_row(content);
            if row.is_err() {
                self.done = true;
            } else {
                self.emitted += 1;
            }
            return Some(row);
        }
    }
}

/// Read and mapping counts of a sample, taken from the header of its contig
/// coverage table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MappingCounts {
    pub read_count: Option<u64>,
    pub reads_mapped: Option<u64>,
    pub num_ref_sequences: Option<u64>,
}

impl MappingCounts {
    pub fn from_header(header: &CoverageHeader, path: &Path) -> Result<Self, IngestError> {
        let get = |key: &str| -> Result<Option<u64>, IngestError> {
            header
                .get(key)
                .map(|entry| {
                    entry
                        .value
                        .replace(',', "")
                        .parse::<u64>()
                        .map_err(|_| IngestError::CoverageFormat {
                            path: path.to_path_buf(),
                            line: entry.line,
                            message: format!("header {key}: bad count {:?}", entry.value),
                        })
                })
                .transpose()
        };
        Ok(Self {
            read_count: get(HEADER_READS)?,
            reads_mapped: get(HEADER_MAPPED)?,
            num_ref_sequences: get(HEADER_REF_SEQUENCES)?,
        })
    }
}

/// Advances a record stream and a coverage-row stream together.
///
/// The i-th row must describe the i-th record: its name has to contain the
/// record identifier. Anything else, including one stream ending before the
/// other, is an [`IngestError::OrderViolation`].
pub struct CoverageJoin<I, C> {
    records: I,
    rows: C,
    path: PathBuf,
    position: u64,
    failed: bool,
}

impl<I, C> CoverageJoin<I, C> {
    pub fn new(records: I, rows: C, coverage_path: &Path) -> Self {
        Self {
            records,
            rows,
            path: coverage_path.to_path_buf(),
            position: 0,
            failed: false,
        }
    }

    fn violation(&mut self, sequence_id: &str, coverage_id: &str) -> IngestError {
        self.failed = true;
        IngestError::OrderViolation {
            path: self.path.clone(),
            record: self.position,
            sequence_id: sequence_id.to_string(),
            coverage_id: coverage_id.to_string(),
        }
    }
}

impl<T, I, C> Iterator for CoverageJoin<I, C>
where
    T: SequenceFields,
    I: Iterator<Item = Result<IndexedRecord<T>, IngestError>>,
    C: Iterator<Item = Result<CoverageRow, IngestError>>,
{
    type Item = Result<(IndexedRecord<T>, CoverageAttributes), IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let record = self.records.next();
        let row = self.rows.next();
        self.position += 1;

        match (record, row) {
            (None, None) => None,
            (Some(Err(err)), _) | (_, Some(Err(err))) => {
                self.failed = true;
                Some(Err(err))
            }
            (Some(Ok(record)), Some(Ok(row))) => {
                if row.name.contains(record.fields.identifier()) {
                    Some(Ok((record, row.attributes)))
                } else {
                    Some(Err(self.violation(record.fields.identifier(), &row.name)))
                }
            }
            (Some(Ok(record)), None) => {
                Some(Err(self.violation(record.fields.identifier(), "<end of coverage table>")))
            }
            (None, Some(Ok(row))) => Some(Err(self.violation("<end of sequence file>", &row.name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    const TABLE: &str = "#Reads\t1,200\n#Mapped\t900\n#RefSequences\t2\n\
#Name\tLength\tBases\tCoverage\tReads\tRPKM\tFrags\tFPKM\n\
k1 flag=1\t10\t100\t10.0\t5\t1.5\t3\t1.1\n";

    #[test]
    fn header_block_feeds_mapping_counts() {
        let reader = CoverageReader::new(Cursor::new(TABLE), Path::new("t.rpkm"), None).unwrap();
        let counts = MappingCounts::from_header(reader.header(), Path::new("t.rpkm")).unwrap();
        assert_eq!(counts.read_count, Some(1200));
        assert_eq!(counts.reads_mapped, Some(900));
        assert_eq!(counts.num_ref_sequences, Some(2));

        let rows: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "k1 flag=1");
        assert_eq!(rows[0].attributes.reads_mapped, 5);
        assert_eq!(rows[0].line, 5);
    }

    #[test]
    fn bad_header_count_names_its_line() {
        let table = TABLE.replace("#Mapped\t900", "#Mapped\tmany");
        let reader = CoverageReader::new(Cursor::new(table), Path::new("t.rpkm"), None).unwrap();
        assert_eq!(reader.header()["Mapped"].line, 2);
        let err = MappingCounts::from_header(reader.header(), Path::new("t.rpkm")).unwrap_err();
        assert!(matches!(err, IngestError::CoverageFormat { line: 2, .. }));
    }

    #[test]
    fn wrong_columns_rejected() {
        let table = "#Name\tLength\tBases\n";
        let err = CoverageReader::new(Cursor::new(table), Path::new("t.rpkm"), None).err();
        assert!(matches!(err, Some(IngestError::CoverageFormat { line: 1, .. })));
    }
}
