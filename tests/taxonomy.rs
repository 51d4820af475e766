use std::fs::{self, File};
use std::io::{Cursor, Write};
use std::path::Path;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use flate2::Compression;
use flate2::write::GzEncoder;

use omics_ingest::domain::Rank;
use omics_ingest::error::IngestError;
use omics_ingest::layout::DataLayout;
use omics_ingest::domain::SampleAccession;
use omics_ingest::store::{NewSequence, SequenceDetail, Tables};
use omics_ingest::taxonomy::{
    LineageBatch, LineageResolver, Resolution, assign_sample_taxa, format_lineage, lca_of_taxids,
    load_reference, load_taxa, load_taxnames,
};

const NAMES: &str = "domain\tA\nphylum\tB\nphylum\tX\nclass\tC\nclass\tD\n";
const TAXA: &str = "1\tA;B;C\n2\tA;B;D\n3\tA;X\n4\tA;Q\n";

fn loaded() -> Tables {
    let mut tables = Tables::new();
    load_taxnames(&mut tables, Cursor::new(NAMES), Path::new("taxnames.tsv")).unwrap();
    load_taxa(&mut tables, Cursor::new(TAXA), Path::new("taxa.tsv")).unwrap();
    tables
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[test]
fn lca_is_the_shared_prefix() {
    let tables = loaded();
    assert_eq!(lca_of_taxids(&tables, &[1, 2, 3]).unwrap(), strings(&["A"]));
    assert_eq!(lca_of_taxids(&tables, &[1, 2]).unwrap(), strings(&["A", "B"]));
}

#[test]
fn lca_of_one_taxon_is_its_lineage() {
    let tables = loaded();
    let names = lca_of_taxids(&tables, &[1]).unwrap();
    assert_eq!(names, strings(&["A", "B", "C"]));
    assert_eq!(format_lineage(&names), "A;B;C");
}

#[test]
fn lca_needs_known_taxa() {
    let tables = loaded();
    assert_matches!(lca_of_taxids(&tables, &[]), Err(IngestError::EmptyTaxa));
    assert_matches!(lca_of_taxids(&tables, &[99]), Err(IngestError::UnknownTaxon(99)));
}

#[test]
fn unknown_names_leave_lineage_unset() {
    let mut tables = Tables::new();
    load_taxnames(&mut tables, Cursor::new(NAMES), Path::new("taxnames.tsv")).unwrap();
    let report = load_taxa(&mut tables, Cursor::new(TAXA), Path::new("taxa.tsv")).unwrap();

    assert_eq!(report.taxa, 4);
    assert_eq!(report.unknown_names, 1);
    assert_eq!(report.lineages_created, 3);
    assert!(tables.taxon_by_taxid(4).unwrap().lineage.is_none());
    assert!(tables.taxon_by_taxid(1).unwrap().lineage.is_some());
}

#[test]
fn resolving_twice_gives_the_same_lineage() {
    let tables = loaded();
    let resolver = LineageResolver::new(&tables);
    let first = resolver.resolve("A;B;C").unwrap();
    let second = resolver.resolve(" A;B;C ").unwrap();
    assert_matches!(first, Resolution::Found(_));
    assert_eq!(first, second);
    assert_eq!(
        Some(first),
        tables
            .taxon_by_taxid(1)
            .and_then(|taxon| taxon.lineage)
            .map(Resolution::Found)
    );
}

#[test]
fn unknown_name_reports_its_rank() {
    let tables = loaded();
    let resolver = LineageResolver::new(&tables);
    let err = resolver.key_for("A;Nope").unwrap_err();
    assert_matches!(err, IngestError::UnknownTaxName { rank: Rank::Phylum, ref name } if name == "Nope");
}

#[test]
fn batch_creates_each_missing_lineage_once() {
    let mut tables = loaded();
    let before = tables.lineages().count();
    let mut resolver = LineageResolver::new(&tables);
    let mut batch = LineageBatch::new();

    assert_eq!(batch.resolve_or_defer(&resolver, "A;X;C", 'a').unwrap(), None);
    assert_eq!(batch.resolve_or_defer(&resolver, "A;X;C", 'b').unwrap(), None);
    assert!(batch.resolve_or_defer(&resolver, "A;B", 'c').unwrap().is_none());

    let created = batch.create_missing(&mut tables, &mut resolver);
    assert_eq!(created.len(), 3);
    assert_eq!(created[0].1, created[1].1);
    assert_ne!(created[0].1, created[2].1);
    assert_eq!(tables.lineages().count(), before + 2);
    assert_eq!(resolver.resolve("A;X;C").unwrap(), Resolution::Found(created[0].1));
}

#[test]
fn gzip_reference_loads_once() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let layout = DataLayout::new(root);
    fs::create_dir_all(layout.taxonomy_dir()).unwrap();
    fs::write(layout.taxnames_path(), NAMES).unwrap();
    let mut encoder = GzEncoder::new(
        File::create(layout.taxonomy_dir().join("taxa.tsv.gz")).unwrap(),
        Compression::default(),
    );
    encoder.write_all(TAXA.as_bytes()).unwrap();
    encoder.finish().unwrap();

    let mut tables = Tables::new();
    let report = load_reference(&mut tables, &layout, None).unwrap().unwrap();
    assert_eq!(report.names_created, 5);
    assert_eq!(report.taxa.taxa, 4);
    assert!(tables.taxonomy_loaded());

    let writes = tables.writes();
    assert!(load_reference(&mut tables, &layout, None).unwrap().is_none());
    assert_eq!(tables.writes(), writes);
}

#[test]
fn later_line_for_a_taxid_wins() {
    let mut tables = Tables::new();
    load_taxnames(&mut tables, Cursor::new(NAMES), Path::new("taxnames.tsv")).unwrap();
    load_taxa(&mut tables, Cursor::new("1\tA;B;C\n"), Path::new("taxa.tsv")).unwrap();

    let repeated = "7\tA;X;D\n7\tA;B;C\n8\tA;X;C\n8\tA;Q\n";
    let report = load_taxa(&mut tables, Cursor::new(repeated), Path::new("taxa.tsv")).unwrap();
    assert_eq!(report.lineages_created, 0);
    assert_eq!(
        tables.taxon_by_taxid(7).unwrap().lineage,
        tables.taxon_by_taxid(1).unwrap().lineage
    );
    assert!(tables.taxon_by_taxid(8).unwrap().lineage.is_none());
}

#[test]
fn unknown_contig_taxid_names_file_and_line() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let layout = DataLayout::new(root);
    let accession: SampleAccession = "S1".parse().unwrap();
    fs::create_dir_all(layout.taxonomy_dir()).unwrap();
    fs::write(layout.contig_taxa_path(&accession), "k1\t1\nk1\t999\n").unwrap();

    let mut tables = loaded();
    let (sample, _) = tables.get_or_create_sample(&accession);
    tables
        .bulk_create_sequences(vec![NewSequence {
            sample,
            identifier: "k1".to_string(),
            source_offset: 0,
            source_length: 8,
            detail: SequenceDetail::Contig,
            coverage: None,
        }])
        .unwrap();

    let err = assign_sample_taxa(&mut tables, &layout, sample, &accession).unwrap_err();
    assert_matches!(
        err,
        IngestError::TaxonomyFormat { line: 2, ref path, ref message }
            if path.ends_with("S1_contig_taxa.tsv") && message.contains("999")
    );
}
