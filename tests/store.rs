use std::collections::HashSet;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use omics_ingest::domain::{BinMethod, RecordKind, SampleAccession, Stage};
use omics_ingest::error::IngestError;
use omics_ingest::store::{JsonStore, NewSequence, RecordStore, SampleId, SequenceDetail};

fn contig(sample: SampleId, identifier: &str, offset: u64) -> NewSequence {
    NewSequence {
        sample,
        identifier: identifier.to_string(),
        source_offset: offset,
        source_length: 8,
        detail: SequenceDetail::Contig,
        coverage: None,
    }
}

fn store_path(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().join("store").join("tables.json")).unwrap()
}

#[test]
fn reopened_store_keeps_lookups() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    let accession: SampleAccession = "S1".parse().unwrap();

    let mut store = JsonStore::open(&path).unwrap();
    store
        .atomic(|tables| {
            let (sample, _) = tables.get_or_create_sample(&accession);
            tables.bulk_create_sequences(vec![contig(sample, "k1", 0), contig(sample, "k2", 8)])?;
            tables.create_bin(sample, BinMethod::Max, 1)?;
            tables.set_stage(sample, Stage::Contigs, true)
        })
        .unwrap();
    let writes = store.writes();

    let store = JsonStore::open(&path).unwrap();
    let tables = store.tables();
    let sample = tables.sample_by_accession(&accession).unwrap();
    assert!(sample.is_done(Stage::Contigs));
    let k2 = tables
        .sequence_by_identifier(sample.id, RecordKind::Contig, "k2")
        .unwrap();
    assert_eq!(k2.source_offset, 8);
    assert!(tables.find_bin(sample.id, BinMethod::Max, 1).is_some());
    assert_eq!(store.writes(), writes);
}

#[test]
fn failed_transaction_writes_no_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    let accession: SampleAccession = "S1".parse().unwrap();

    let mut store = JsonStore::open(&path).unwrap();
    let result: Result<(), IngestError> = store.atomic(|tables| {
        tables.get_or_create_sample(&accession);
        Err(IngestError::Store("abort".to_string()))
    });
    assert!(result.is_err());
    assert!(!path.as_std_path().exists());
    assert!(store.tables().sample_by_accession(&accession).is_none());
}

#[test]
fn duplicate_identifier_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = JsonStore::open(&store_path(&dir)).unwrap();
    let accession: SampleAccession = "S1".parse().unwrap();

    let result = store.atomic(|tables| {
        let (sample, _) = tables.get_or_create_sample(&accession);
        tables.bulk_create_sequences(vec![contig(sample, "k1", 0), contig(sample, "k1", 8)])
    });
    assert_matches!(result, Err(IngestError::Store(_)));
    assert_eq!(store.tables().samples().count(), 0);
}

#[test]
fn existing_sample_is_not_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = JsonStore::open(&store_path(&dir)).unwrap();
    let accession: SampleAccession = "S1".parse().unwrap();

    let (first, created) = store
        .atomic(|tables| Ok(tables.get_or_create_sample(&accession)))
        .unwrap();
    assert!(created);
    let writes = store.writes();

    let (second, created) = store
        .atomic(|tables| Ok(tables.get_or_create_sample(&accession)))
        .unwrap();
    assert!(!created);
    assert_eq!(first, second);
    assert_eq!(store.writes(), writes);
}

#[test]
fn bin_members_follow_assignments_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    let s1: SampleAccession = "S1".parse().unwrap();
    let s2: SampleAccession = "S2".parse().unwrap();
    let names = |values: &[&str]| values.iter().map(|v| v.to_string()).collect::<HashSet<_>>();

    let mut store = JsonStore::open(&path).unwrap();
    store
        .atomic(|tables| {
            let (first, _) = tables.get_or_create_sample(&s1);
            let (second, _) = tables.get_or_create_sample(&s2);
            tables.bulk_create_sequences(vec![contig(first, "k1", 0), contig(first, "k2", 8)])?;
            tables.bulk_create_sequences(vec![contig(second, "k1", 0)])?;
            let one = tables.create_bin(first, BinMethod::Max, 1)?;
            let two = tables.create_bin(first, BinMethod::Max, 2)?;
            tables.assign_bin(first, BinMethod::Max, one, &names(&["k1", "k2"]));
            tables.assign_bin(first, BinMethod::Max, two, &names(&["k2"]));
            Ok(())
        })
        .unwrap();

    let store = JsonStore::open(&path).unwrap();
    let tables = store.tables();
    let sample = tables.sample_by_accession(&s1).unwrap().id;
    let members = |number| {
        let bin = tables.find_bin(sample, BinMethod::Max, number).unwrap();
        tables
            .bin_members(bin)
            .map(|seq| seq.identifier.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(members(1), vec!["k1"]);
    assert_eq!(members(2), vec!["k2"]);

    let other = tables.sample_by_accession(&s2).unwrap().id;
    assert_eq!(tables.sequences(other, RecordKind::Contig).count(), 1);
    assert_eq!(tables.bins(other).count(), 0);
    assert_eq!(tables.bins(sample).count(), 2);
}
