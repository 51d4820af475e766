use camino::Utf8PathBuf;

use crate::domain::{BinMethod, RecordKind, SampleAccession};

/// File naming conventions of the per-sample output tree below the data root.
#[derive(Debug, Clone)]
pub struct DataLayout {
    data_root: Utf8PathBuf,
}

impl DataLayout {
    pub fn new(data_root: Utf8PathBuf) -> Self {
        Self { data_root }
    }

    pub fn contig_fasta_path(&self, sample: &SampleAccession) -> Utf8PathBuf {
        self.data_root
            .join("ASSEMBLIES")
            .join("MERGED")
            .join(format!("{sample}_MCDD.fa"))
    }

    pub fn contig_coverage_path(&self, sample: &SampleAccession) -> Utf8PathBuf {
        self.data_root
            .join("ASSEMBLIES")
            .join("COVERAGE")
            .join(format!("{sample}_READSvsCONTIGS.rpkm"))
    }

    pub fn gene_fasta_path(&self, sample: &SampleAccession) -> Utf8PathBuf {
        self.data_root
            .join("GENES")
            .join(format!("{sample}_GENES.fna"))
    }

    pub fn gene_coverage_path(&self, sample: &SampleAccession) -> Utf8PathBuf {
        self.data_root
            .join("GENES")
            .join("COVERAGE")
            .join(format!("{sample}_READSvsGENES.rpkm"))
    }

    pub fn protein_fasta_path(&self, sample: &SampleAccession) -> Utf8PathBuf {
        self.data_root
            .join("PROTEINS")
            .join(format!("{sample}_PROTEINS.faa"))
    }

    pub fn fasta_path(&self, sample: &SampleAccession, kind: RecordKind) -> Utf8PathBuf {
        match kind {
            RecordKind::Contig => self.contig_fasta_path(sample),
            RecordKind::Gene => self.gene_fasta_path(sample),
            RecordKind::Protein => self.protein_fasta_path(sample),
        }
    }

    /// Proteins carry no coverage table.
    pub fn coverage_path(&self, sample: &SampleAccession, kind: RecordKind) -> Option<Utf8PathBuf> {
        match kind {
            RecordKind::Contig => Some(self.contig_coverage_path(sample)),
            RecordKind::Gene => Some(self.gene_coverage_path(sample)),
            RecordKind::Protein => None,
        }
    }

    pub fn bin_dir(&self, method: BinMethod) -> Utf8PathBuf {
        self.data_root.join("BINS").join(method.directory())
    }

    pub fn checkm_stats_path(&self, sample: &SampleAccession) -> Utf8PathBuf {
        self.data_root
            .join("BINS")
            .join("CHECKM")
            .join(format!("{sample}_CHECKM"))
            .join("storage")
            .join("bin_stats.analyze.tsv")
    }

    pub fn taxonomy_dir(&self) -> Utf8PathBuf {
        self.data_root.join("TAXONOMY")
    }

    pub fn taxnames_path(&self) -> Utf8PathBuf {
        self.taxonomy_dir().join("taxnames.tsv")
    }

    /// Taxon reference table, preferring the uncompressed file when both exist.
    pub fn taxa_path(&self) -> Option<Utf8PathBuf> {
        let plain = self.taxonomy_dir().join("taxa.tsv");
        if plain.as_std_path().exists() {
            return Some(plain);
        }
        let compressed = self.taxonomy_dir().join("taxa.tsv.gz");
        if compressed.as_std_path().exists() {
            return Some(compressed);
        }
        None
    }

    pub fn contig_taxa_path(&self, sample: &SampleAccession) -> Utf8PathBuf {
        self.taxonomy_dir()
            .join(format!("{sample}_contig_taxa.tsv"))
    }
}
