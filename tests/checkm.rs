use std::fs;
use std::io::Cursor;
use std::path::Path;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use omics_ingest::checkm::{import_sample_stats, parse_stats};
use omics_ingest::domain::{BinMethod, SampleAccession};
use omics_ingest::error::IngestError;
use omics_ingest::layout::DataLayout;
use omics_ingest::store::Tables;

fn stats_line(bin_id: &str) -> String {
    format!(
        "{bin_id}\t{{'Translation table': 11, 'GC std': 0.012, '# ambiguous bases': 0, \
'Genome size': 2048000, 'Longest contig': 90000, 'N50 (scaffolds)': 41000, \
'Mean scaffold length': 20480.5, '# contigs': 100, '# scaffolds': 100, \
'# predicted genes': 1900, 'Longest scaffold': 90000, 'GC': 0.52, \
'N50 (contigs)': 41000, 'Coding density': 0.89, 'Mean contig length': 20480.5}}"
    )
}

fn setup() -> (tempfile::TempDir, DataLayout, SampleAccession) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, DataLayout::new(root), "S1".parse().unwrap())
}

fn write_stats(layout: &DataLayout, accession: &SampleAccession, content: &str) {
    let path = layout.checkm_stats_path(accession);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

#[test]
fn parses_every_field() {
    let lines = parse_stats(Cursor::new(stats_line("S1_MAX_bins.1")), Path::new("s.tsv")).unwrap();
    assert_eq!(lines.len(), 1);
    let stats = &lines[0].stats;
    assert_eq!(stats.translation_table, 11);
    assert_eq!(stats.genome_size, 2_048_000);
    assert_eq!(stats.num_predicted_genes, 1900);
    assert!((stats.gc - 0.52).abs() < f64::EPSILON);
    assert!((stats.mean_contig_length - 20480.5).abs() < f64::EPSILON);
}

#[test]
fn unknown_field_is_fatal() {
    let line = stats_line("S1_MAX_bins.1").replace("'GC std'", "'GC stdev'");
    let err = parse_stats(Cursor::new(line), Path::new("s.tsv")).unwrap_err();
    assert_matches!(err, IngestError::StatsUnknownField { line: 1, ref key, .. } if key == "GC stdev");
}

#[test]
fn bad_value_names_the_field() {
    let line = stats_line("S1_MAX_bins.1").replace("'# contigs': 100", "'# contigs': many");
    let err = parse_stats(Cursor::new(line), Path::new("s.tsv")).unwrap_err();
    assert_matches!(err, IngestError::StatsValue { ref field, .. } if field == "# contigs");
}

#[test]
fn stats_attach_to_bins_per_method() {
    let (_dir, layout, accession) = setup();
    let mut tables = Tables::new();
    let (sample, _) = tables.get_or_create_sample(&accession);
    let max = tables.create_bin(sample, BinMethod::Max, 1).unwrap();
    let met = tables.create_bin(sample, BinMethod::Met99, 6).unwrap();
    write_stats(
        &layout,
        &accession,
        &format!("{}\n{}\n", stats_line("S1_MAX_bins.1"), stats_line("S1_MET_P99S99E300_bins.6")),
    );

    let report = import_sample_stats(&mut tables, &layout, sample, &accession)
        .unwrap()
        .unwrap();
    assert_eq!(report.bins[&BinMethod::Max], 1);
    assert_eq!(report.bins[&BinMethod::Met99], 1);
    for bin in [max, met] {
        let stats = tables.bin(bin).unwrap().checkm.unwrap();
        assert_eq!(tables.stats(stats).unwrap().translation_table, 11);
    }
}

#[test]
fn stats_of_another_sample_are_rejected() {
    let (_dir, layout, accession) = setup();
    let mut tables = Tables::new();
    let (sample, _) = tables.get_or_create_sample(&accession);
    tables.create_bin(sample, BinMethod::Max, 1).unwrap();
    write_stats(&layout, &accession, &stats_line("S2_MAX_bins.1"));

    let err = import_sample_stats(&mut tables, &layout, sample, &accession).unwrap_err();
    assert_matches!(err, IngestError::StatsSampleMismatch { ref expected, .. } if expected == "S1");
}

#[test]
fn stats_for_missing_bin_are_rejected() {
    let (_dir, layout, accession) = setup();
    let mut tables = Tables::new();
    let (sample, _) = tables.get_or_create_sample(&accession);
    write_stats(&layout, &accession, &stats_line("S1_MAX_bins.4"));

    let err = import_sample_stats(&mut tables, &layout, sample, &accession).unwrap_err();
    assert_matches!(err, IngestError::UnknownBin { line: 1, .. });
}

#[test]
fn missing_stats_file_is_not_an_error() {
    let (_dir, layout, accession) = setup();
    let mut tables = Tables::new();
    let (sample, _) = tables.get_or_create_sample(&accession);
    assert!(import_sample_stats(&mut tables, &layout, sample, &accession).unwrap().is_none());
}

#[test]
fn repeated_bin_id_is_rejected() {
    let (_dir, layout, accession) = setup();
    let mut tables = Tables::new();
    let (sample, _) = tables.get_or_create_sample(&accession);
    tables.create_bin(sample, BinMethod::Max, 1).unwrap();
    let line = stats_line("S1_MAX_bins.1");
    write_stats(&layout, &accession, &format!("{line}\n{line}\n"));

    let err = import_sample_stats(&mut tables, &layout, sample, &accession).unwrap_err();
    assert_matches!(err, IngestError::StatsFormat { line: 2, ref message, .. } if message.contains("line 1"));
}
