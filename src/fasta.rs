//! Offset indexing of FASTA-like files.
//!
//! Records are located by the byte offset of their marker line and the byte
//! span up to the next marker (or end of stream). Sequence text is not kept;
//! it is re-read from the source file on demand.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::IngestError;
use crate::store::{SequenceDetail, SequenceId, Strand};

pub const RECORD_MARKER: u8 = b'>';

/// Read buffer for the single forward pass over large inputs.
pub const SEQUENTIAL_BUFFER: usize = 1024 * 1024;

/// Opens a file for one sequential pass.
pub fn open_sequential(path: &Path) -> Result<BufReader<File>, IngestError> {
    let file = File::open(path)
        .map_err(|err| IngestError::Filesystem(format!("open {}: {err}", path.display())))?;
    Ok(BufReader::with_capacity(SEQUENTIAL_BUFFER, file))
}

/// Converts a header line (marker included) into typed identifying fields.
pub trait HeaderParser {
    type Fields;

    fn parse(&mut self, header: &str) -> Result<Self::Fields, String>;
}

impl<T, F> HeaderParser for F
where
    F: FnMut(&str) -> Result<T, String>,
{
    type Fields = T;

    fn parse(&mut self, header: &str) -> Result<T, String> {
        self(header)
    }
}

/// Parsed header fields that can become a stored sequence record.
pub trait SequenceFields {
    fn identifier(&self) -> &str;
    fn detail(&self) -> SequenceDetail;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedRecord<T> {
    pub header: String,
    pub fields: T,
    pub source_offset: u64,
    pub source_length: u64,
    /// 1-based line number of the header.
    pub line: u64,
}

struct Pending<T> {
    header: String,
    fields: T,
    offset: u64,
    line: u64,
}

impl<T> Pending<T> {
    fn finish(self, end: u64) -> IndexedRecord<T> {
        IndexedRecord {
            header: self.header,
            fields: self.fields,
            source_offset: self.offset,
            source_length: end - self.offset,
            line: self.line,
        }
    }
}

/// Lazy, single-pass iterator over the records of a FASTA-like stream.
///
/// Holds at most one record back: a record is yielded once the next marker
/// line, or the end of the stream, fixes its length.
pub struct FastaIndexer<R, P: HeaderParser> {
    reader: R,
    parser: P,
    path: PathBuf,
    marker: u8,
    limit: Option<usize>,
    position: u64,
    line_no: u64,
    emitted: usize,
    pending: Option<Pending<P::Fields>>,
    buf: Vec<u8>,
    done: bool,
}

impl<R: BufRead, P: HeaderParser> FastaIndexer<R, P> {
    pub fn new(reader: R, parser: P, path: &Path) -> Self {
        Self {
            reader,
            parser,
            path: path.to_path_buf(),
            marker: RECORD_MARKER,
            limit: None,
            position: 0,
            line_no: 0,
            emitted: 0,
            pending: None,
            buf: Vec::with_capacity(256),
            done: false,
        }
    }

    pub fn with_marker(mut self, marker: u8) -> Self {
        self.marker = marker;
        self
    }

    /// Stop after `limit` records without reading the rest of the stream.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    fn fail(&mut self, err: IngestError) -> Option<Result<IndexedRecord<P::Fields>, IngestError>> {
        self.done = true;
        Some(Err(err))
    }
}

impl<R: BufRead, P: HeaderParser> Iterator for FastaIndexer<R, P> {
    type Item = Result<IndexedRecord<P::Fields>, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.limit.is_some_and(|limit| self.emitted >= limit) {
            self.done = true;
            return None;
        }

        loop {
            self.buf.clear();
            let read = match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(read) => read,
                Err(err) => {
                    let message = format!("read {}: {err}", self.path.display());
                    return self.fail(IngestError::Filesystem(message));
                }
            };

            if read == 0 {
                // end of stream closes the last record
                self.done = true;
                let end = self.position;
                return self.pending.take().map(|pending| {
                    self.emitted += 1;
                    Ok(pending.finish(end))
                });
            }

            let start = self.position;
            self.position += read as u64;
            self.line_no += 1;

            if self.buf.first() != Some(&self.marker) {
                continue;
            }

            let header = String::from_utf8_lossy(&self.buf)
                .trim_end_matches(['\n', '\r'])
                .to_string();
            let fields = match self.parser.parse(&header) {
                Ok(fields) => fields,
                Err(message) => {
                    let err = IngestError::HeaderParse {
                        path: self.path.clone(),
                        line: self.line_no,
                        message,
                        content: header,
                    };
                    return self.fail(err);
                }
            };

            let next = Pending {
                header,
                fields,
                offset: start,
                line: self.line_no,
            };
            if let Some(previous) = self.pending.replace(next) {
                self.emitted += 1;
                return Some(Ok(previous.finish(start)));
            }
        }
    }
}

fn strip_marker(header: &str) -> &str {
    header
        .strip_prefix(RECORD_MARKER as char)
        .unwrap_or(header)
        .trim()
}

/// Header that is the identifier itself: `>ID`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainHeader;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContigFields {
    pub identifier: String,
}

impl HeaderParser for PlainHeader {
    type Fields = ContigFields;

    fn parse(&mut self, header: &str) -> Result<ContigFields, String> {
        let identifier = strip_marker(header);
        if identifier.is_empty() {
            return Err("empty identifier".to_string());
        }
        Ok(ContigFields {
            identifier: identifier.to_string(),
        })
    }
}

impl SequenceFields for ContigFields {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn detail(&self) -> SequenceDetail {
        SequenceDetail::Contig
    }
}

/// Prodigal gene header: `>NAME # START # END # STRAND # MISC`, where `NAME`
/// is `<contig>_<n>` and the contig is already loaded for the sample.
#[derive(Debug, Clone, Default)]
pub struct GeneHeader {
    contigs: HashMap<String, SequenceId>,
}

impl GeneHeader {
    pub fn new(contigs: HashMap<String, SequenceId>) -> Self {
        Self { contigs }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneFields {
    pub identifier: String,
    pub contig: SequenceId,
    pub start: u64,
    pub end: u64,
    pub strand: Strand,
}

impl HeaderParser for GeneHeader {
    type Fields = GeneFields;

    fn parse(&mut self, header: &str) -> Result<GeneFields, String> {
        let parts: Vec<&str> = strip_marker(header).split(" # ").collect();
        let [name, start, end, strand, _misc] = parts.as_slice() else {
            return Err(format!("expected 5 '#'-separated fields, got {}", parts.len()));
        };

        let (contig_name, number) = name
            .rsplit_once('_')
            .ok_or_else(|| format!("gene name {name:?} lacks a _<number> suffix"))?;
        number
            .parse::<u64>()
            .map_err(|_| format!("gene name {name:?} lacks a _<number> suffix"))?;
        let contig = *self
            .contigs
            .get(contig_name)
            .ok_or_else(|| format!("unknown contig {contig_name:?}"))?;

        let strand = match *strand {
            "1" => Strand::Forward,
            "-1" => Strand::Reverse,
            other => return Err(format!("expected strand to be \"1\" or \"-1\", got {other:?}")),
        };

        Ok(GeneFields {
            identifier: name.to_string(),
            contig,
            start: start
                .trim()
                .parse()
                .map_err(|_| format!("bad start position {start:?}"))?,
            end: end
                .trim()
                .parse()
                .map_err(|_| format!("bad end position {end:?}"))?,
            strand,
        })
    }
}

impl SequenceFields for GeneFields {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn detail(&self) -> SequenceDetail {
        SequenceDetail::Gene {
            contig: self.contig,
            start: self.start,
            end: self.end,
            strand: self.strand,
        }
    }
}

/// Protein header `>GENE # ...`, naming a gene already loaded for the sample.
#[derive(Debug, Clone, Default)]
pub struct ProteinHeader {
    genes: HashMap<String, SequenceId>,
}

impl ProteinHeader {
    pub fn new(genes: HashMap<String, SequenceId>) -> Self {
        Self { genes }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProteinFields {
    pub identifier: String,
    pub gene: SequenceId,
}

impl HeaderParser for ProteinHeader {
    type Fields = ProteinFields;

    fn parse(&mut self, header: &str) -> Result<ProteinFields, String> {
        let stripped = strip_marker(header);
        let name = stripped
            .split_once(" # ")
            .map(|(name, _)| name)
            .unwrap_or(stripped)
            .trim();
        let gene = *self
            .genes
            .get(name)
            .ok_or_else(|| format!("unknown gene {name:?}"))?;
        Ok(ProteinFields {
            identifier: name.to_string(),
            gene,
        })
    }
}

impl SequenceFields for ProteinFields {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn detail(&self) -> SequenceDetail {
        SequenceDetail::Protein { gene: self.gene }
    }
}

/// A record re-read from its source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSequence {
    pub header: String,
    pub sequence: String,
}

impl StoredSequence {
    pub fn to_fasta(&self) -> String {
        format!("{}\n{}", self.header, self.sequence)
    }
}

fn corrupt(path: &Path, offset: u64, message: impl Into<String>) -> IngestError {
    IngestError::SequenceCorrupt {
        path: path.to_path_buf(),
        offset,
        message: message.into(),
    }
}

fn open_at(path: &Path, offset: u64) -> Result<BufReader<File>, IngestError> {
    let mut file = File::open(path)
        .map_err(|err| IngestError::Filesystem(format!("open {}: {err}", path.display())))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|err| IngestError::Filesystem(format!("seek {}: {err}", path.display())))?;
    Ok(BufReader::new(file))
}

/// Returns the raw bytes `[offset, offset + length)` of the source file.
pub fn read_span(path: &Path, offset: u64, length: u64) -> Result<Vec<u8>, IngestError> {
    let mut reader = open_at(path, offset)?;
    let mut bytes = Vec::with_capacity(length as usize);
    reader
        .by_ref()
        .take(length)
        .read_to_end(&mut bytes)
        .map_err(|err| IngestError::Filesystem(format!("read {}: {err}", path.display())))?;
    if (bytes.len() as u64) < length {
        return Err(corrupt(
            path,
            offset,
            format!("file ends {} bytes short of the recorded span", length - bytes.len() as u64),
        ));
    }
    Ok(bytes)
}

/// Re-reads one record: its header line and its sequence with line breaks
/// removed.
///
/// Reading stops at the next marker line or once `length` bytes are
/// consumed; a record running past `length` is reported as corrupt.
pub fn retrieve_sequence(path: &Path, offset: u64, length: u64) -> Result<StoredSequence, IngestError> {
    let mut reader = open_at(path, offset)?;
    let mut buf = Vec::new();
    let read_line = |reader: &mut BufReader<File>, buf: &mut Vec<u8>| {
        buf.clear();
        reader
            .read_until(b'\n', buf)
            .map_err(|err| IngestError::Filesystem(format!("read {}: {err}", path.display())))
    };

    let mut consumed = read_line(&mut reader, &mut buf)? as u64;
    if buf.first() != Some(&RECORD_MARKER) {
        return Err(corrupt(path, offset, "no record marker at offset"));
    }
    if consumed > length {
        return Err(corrupt(path, offset, "header is longer than the recorded span"));
    }
    let header = String::from_utf8_lossy(&buf)
        .trim_end_matches(['\n', '\r'])
        .to_string();

    let mut sequence = Vec::new();
    while consumed < length {
        let read = read_line(&mut reader, &mut buf)?;
        if read == 0 {
            return Err(corrupt(path, offset, "file ends inside the recorded span"));
        }
        if buf.first() == Some(&RECORD_MARKER) {
            return Err(corrupt(path, offset, "next record starts inside the recorded span"));
        }
        consumed += read as u64;
        if consumed > length {
            return Err(corrupt(
                path,
                offset,
                format!("sequence has a length more than {length} bytes"),
            ));
        }
        sequence.extend(buf.iter().copied().filter(|byte| !byte.is_ascii_whitespace()));
    }

    Ok(StoredSequence {
        header,
        sequence: String::from_utf8_lossy(&sequence).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn closure_header_parser() {
        let data = b">a x\nAC\n>b y\nGT\n";
        let parser = |header: &str| -> Result<String, String> {
            Ok(header[1..].split_whitespace().next().unwrap_or("").to_string())
        };
        let records: Vec<_> = FastaIndexer::new(Cursor::new(&data[..]), parser, Path::new("mem"))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].fields, "a");
        assert_eq!((records[0].source_offset, records[0].source_length), (0, 8));
        assert_eq!((records[1].source_offset, records[1].source_length), (8, 8));
        assert_eq!(records[1].line, 3);
    }

    #[test]
    fn gene_header_requires_known_contig() {
        let mut contigs = HashMap::new();
        contigs.insert("k141_7".to_string(), SequenceId(3));
        let mut parser = GeneHeader::new(contigs);

        let fields = parser
            .parse(">k141_7_2 # 110 # 400 # -1 # ID=1_2;partial=00")
            .unwrap();
        assert_eq!(fields.contig, SequenceId(3));
        assert_eq!(fields.strand, Strand::Reverse);
        assert_eq!((fields.start, fields.end), (110, 400));

        assert!(parser.parse(">k141_8_1 # 1 # 9 # 1 # x").is_err());
        assert!(parser.parse(">k141_7_1 # 1 # 9 # 0 # x").is_err());
    }
}
