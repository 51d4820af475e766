use std::io::Cursor;
use std::path::Path;

use assert_matches::assert_matches;

use omics_ingest::coverage::{CoverageJoin, CoverageReader};
use omics_ingest::error::IngestError;
use omics_ingest::fasta::{FastaIndexer, PlainHeader};

const FASTA: &str = ">c1\nAAAA\n>c2\nCC\n>c3\nG\n";
const HEADER: &str = "#Reads\t100\n#Mapped\t80\n#RefSequences\t3\n\
#Name\tLength\tBases\tCoverage\tReads\tRPKM\tFrags\tFPKM\n";

fn table(rows: &[(&str, u64)]) -> String {
    let mut out = HEADER.to_string();
    for (name, reads) in rows {
        out.push_str(&format!("{name}\t4\t40\t10.0\t{reads}\t2.5\t{reads}\t2.5\n"));
    }
    out
}

fn join(
    fasta: &'static str,
    coverage: String,
) -> Result<Vec<(String, u64)>, IngestError> {
    let records = FastaIndexer::new(Cursor::new(fasta.as_bytes()), PlainHeader, Path::new("c.fa"));
    let rows = CoverageReader::new(Cursor::new(coverage.into_bytes()), Path::new("c.rpkm"), None)?;
    CoverageJoin::new(records, rows, Path::new("c.rpkm"))
        .map(|item| item.map(|(record, attributes)| (record.fields.identifier, attributes.reads_mapped)))
        .collect()
}

#[test]
fn rows_pair_with_records_in_order() {
    let joined = join(FASTA, table(&[("c1", 5), ("c2", 6), ("c3", 7)])).unwrap();
    assert_eq!(
        joined,
        vec![
            ("c1".to_string(), 5),
            ("c2".to_string(), 6),
            ("c3".to_string(), 7)
        ]
    );
}

#[test]
fn row_name_may_carry_extra_text() {
    let joined = join(FASTA, table(&[("c1 flag=1", 5), ("c2 flag=0", 6), ("c3", 7)])).unwrap();
    assert_eq!(joined.len(), 3);
}

#[test]
fn shuffled_rows_are_an_order_violation() {
    let err = join(FASTA, table(&[("c2", 6), ("c1", 5), ("c3", 7)])).unwrap_err();
    assert_matches!(
        err,
        IngestError::OrderViolation { record: 1, ref sequence_id, ref coverage_id, .. }
            if sequence_id == "c1" && coverage_id == "c2"
    );
}

#[test]
fn short_table_is_an_order_violation() {
    let err = join(FASTA, table(&[("c1", 5), ("c2", 6)])).unwrap_err();
    assert_matches!(err, IngestError::OrderViolation { record: 3, .. });
}

#[test]
fn bad_row_names_its_line() {
    let mut coverage = table(&[("c1", 5)]);
    coverage.push_str("c2\t4\tforty\t10.0\t1\t2.5\t1\t2.5\n");
    let err = join(FASTA, coverage).unwrap_err();
    assert_matches!(err, IngestError::CoverageFormat { line: 6, .. });
}

#[test]
fn header_line_without_hash_is_rejected() {
    let coverage = "Reads\t100\n".to_string();
    let err = CoverageReader::new(Cursor::new(coverage.into_bytes()), Path::new("c.rpkm"), None).err();
    assert_matches!(err, Some(IngestError::CoverageFormat { line: 1, .. }));
}
