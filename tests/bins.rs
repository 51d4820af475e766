use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use omics_ingest::bins::{bin_files, import_sample_bins};
use omics_ingest::domain::{BinMethod, SampleAccession};
use omics_ingest::error::IngestError;
use omics_ingest::layout::DataLayout;
use omics_ingest::store::{NewSequence, SampleId, SequenceDetail, Tables};

fn setup(contigs: &[&str]) -> (tempfile::TempDir, DataLayout, Tables, SampleId, SampleAccession) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let layout = DataLayout::new(root);

    let mut tables = Tables::new();
    let accession: SampleAccession = "S1".parse().unwrap();
    let (sample, _) = tables.get_or_create_sample(&accession);
    let records = contigs
        .iter()
        .enumerate()
        .map(|(index, identifier)| NewSequence {
            sample,
            identifier: identifier.to_string(),
            source_offset: index as u64 * 10,
            source_length: 10,
            detail: SequenceDetail::Contig,
            coverage: None,
        })
        .collect();
    tables.bulk_create_sequences(records).unwrap();
    (dir, layout, tables, sample, accession)
}

fn write_bin(layout: &DataLayout, method: BinMethod, name: &str, content: &str) {
    let dir = layout.bin_dir(method);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(name), content).unwrap();
}

#[test]
fn bin_assigns_only_known_contigs() {
    let (_dir, layout, mut tables, sample, accession) = setup(&["id1", "id2"]);
    write_bin(&layout, BinMethod::Max, "S1_MAX_bins.1.fasta", ">id1\nACGT\n>id9\nGG\n");

    let report = import_sample_bins(&mut tables, &layout, sample, &accession, &[BinMethod::Max]).unwrap();
    let bins = &report.methods[&BinMethod::Max];
    assert_eq!(bins.len(), 1);
    assert_eq!(bins[0].number, 1);
    assert_eq!(bins[0].members, 2);
    assert_eq!(bins[0].assigned, 1);

    let bin = tables.find_bin(sample, BinMethod::Max, 1).unwrap();
    let members: Vec<&str> = tables.bin_members(bin).map(|seq| seq.identifier.as_str()).collect();
    assert_eq!(members, vec!["id1"]);
}

#[test]
fn empty_bin_is_kept() {
    let (_dir, layout, mut tables, sample, accession) = setup(&["id1"]);
    write_bin(&layout, BinMethod::Met97, "S1_MET_P99S97E300_bins.3.fa", "");

    let report = import_sample_bins(&mut tables, &layout, sample, &accession, &[BinMethod::Met97]).unwrap();
    assert_eq!(report.methods[&BinMethod::Met97][0].members, 0);
    assert!(tables.find_bin(sample, BinMethod::Met97, 3).is_some());
}

#[test]
fn methods_without_files_are_skipped() {
    let (_dir, layout, mut tables, sample, accession) = setup(&["id1"]);
    write_bin(&layout, BinMethod::Max, "S1_MAX_bins.1.fasta", ">id1\n");

    let report = import_sample_bins(&mut tables, &layout, sample, &accession, &BinMethod::ALL).unwrap();
    assert_eq!(report.methods.len(), 1);
    assert_eq!(report.bins(), 1);
}

#[test]
fn files_of_other_samples_and_methods_are_ignored() {
    let (_dir, layout, _tables, _sample, accession) = setup(&[]);
    write_bin(&layout, BinMethod::Met93, "S1_MET_P97S93E300_bins.2.fa", "");
    write_bin(&layout, BinMethod::Met93, "S1_MET_P97S93E300_bins.10.fa", "");
    write_bin(&layout, BinMethod::Met93, "S11_MET_P97S93E300_bins.1.fa", "");
    write_bin(&layout, BinMethod::Met99, "S1_MET_P99S99E300_bins.1.fa", "");

    let files = bin_files(&layout, BinMethod::Met93, &accession).unwrap();
    let numbers: Vec<u32> = files.iter().map(|file| file.number).collect();
    assert_eq!(numbers, vec![10, 2]);
}

#[test]
fn non_numeric_index_is_fatal() {
    let (_dir, layout, mut tables, sample, accession) = setup(&[]);
    write_bin(&layout, BinMethod::Met93, "S1_MET_P97S93E300_bins.unbinned.fa", ">x\n");

    let err = import_sample_bins(&mut tables, &layout, sample, &accession, &[BinMethod::Met93]).unwrap_err();
    assert_matches!(err, IngestError::BinFileName { .. });
}

#[test]
fn duplicate_bin_number_is_fatal() {
    let (_dir, layout, mut tables, sample, accession) = setup(&["id1"]);
    write_bin(&layout, BinMethod::Max, "S1_MAX_bins.01.fasta", ">id1\n");
    write_bin(&layout, BinMethod::Max, "S1_MAX_bins.1.fasta", ">id1\n");

    let err = import_sample_bins(&mut tables, &layout, sample, &accession, &[BinMethod::Max]).unwrap_err();
    assert_matches!(
        err,
        IngestError::DuplicateBin { number: 1, ref path, .. } if path.ends_with("S1_MAX_bins.1.fasta")
    );
}
