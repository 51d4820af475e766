//! Per-sample ingestion pipeline.
//!
//! Every stage of a sample runs in its own transaction and records a
//! completion flag on success, so a re-run only does what is still missing.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::bins;
use crate::checkm;
use crate::config::{DecompressorSpec, ResolvedConfig, DEFAULT_BATCH_SIZE};
use crate::coverage::{CoverageHeader, CoverageJoin, CoverageReader, MappingCounts};
use crate::domain::{BinMethod, RecordKind, SampleAccession, Stage};
use crate::error::IngestError;
use crate::fasta::{
    open_sequential, read_span, retrieve_sequence, FastaIndexer, GeneHeader, HeaderParser,
    IndexedRecord, PlainHeader, ProteinHeader, SequenceFields, StoredSequence,
};
use crate::layout::DataLayout;
use crate::store::{CoverageAttributes, NewSequence, RecordStore, SampleId, Tables};
use crate::taxonomy::{self, TaxonomyReport};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub batch_size: usize,
    /// Cap on records read per file.
    pub limit: Option<usize>,
    pub methods: Vec<BinMethod>,
    pub decompressor: Option<DecompressorSpec>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            limit: None,
            methods: BinMethod::ALL.to_vec(),
            decompressor: None,
        }
    }
}

impl LoadOptions {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            limit: config.limit,
            methods: config.methods.clone(),
            decompressor: config.decompressor.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub listed: usize,
    pub created: Vec<String>,
    /// Stored samples missing from the list; they are kept.
    pub extra: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageStatus {
    Loaded,
    /// Completion flag already set.
    Skipped,
    /// Prerequisite stage not complete.
    Waiting,
    /// Input files absent; the flag stays unset.
    NoData,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub sample: String,
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taxonomy: Option<TaxonomyReport>,
    pub stages: Vec<StageOutcome>,
}

impl LoadReport {
    pub fn loaded(&self) -> usize {
        self.stages
            .iter()
            .filter(|outcome| outcome.status == StageStatus::Loaded)
            .count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleStatus {
    pub accession: String,
    pub completed: Vec<Stage>,
    pub contigs: usize,
    pub genes: usize,
    pub proteins: usize,
    pub bins: BTreeMap<BinMethod, usize>,
    pub read_count: Option<u64>,
    pub reads_mapped: Option<u64>,
    pub num_ref_sequences: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub taxonomy_loaded: bool,
    pub taxa: usize,
    pub samples: Vec<SampleStatus>,
}

pub struct Loader<S: RecordStore> {
    store: S,
    layout: DataLayout,
    options: LoadOptions,
}

impl<S: RecordStore> Loader<S> {
    pub fn new(store: S, layout: DataLayout, options: LoadOptions) -> Self {
        Self {
            store,
            layout,
            options,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Registers every accession of the sample list.
    pub fn sync_samples(&mut self, sample_list: &Utf8Path) -> Result<SyncReport, IngestError> {
        let content = fs::read_to_string(sample_list.as_std_path())
            .map_err(|err| IngestError::Filesystem(format!("read {sample_list}: {err}")))?;
        let accessions = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::parse::<SampleAccession>)
            .collect::<Result<Vec<_>, _>>()?;

        let report = self.store.atomic(|tables| {
            let mut report = SyncReport {
                listed: accessions.len(),
                ..SyncReport::default()
            };
            for accession in &accessions {
                if tables.get_or_create_sample(accession).1 {
                    report.created.push(accession.to_string());
                }
            }
            report.extra = tables
                .samples()
                .filter(|sample| !accessions.contains(&sample.accession))
                .map(|sample| sample.accession.to_string())
                .collect();
            Ok(report)
        })?;

        for extra in &report.extra {
            warn!(sample = %extra, "sample in store but not in sample list");
        }
        info!(
            listed = report.listed,
            created = report.created.len(),
            "samples synchronized"
        );
        Ok(report)
    }

    pub fn load_taxonomy(&mut self, sink: &dyn ProgressSink) -> Result<Option<TaxonomyReport>, IngestError> {
        if self.store.tables().taxonomy_loaded() {
            return Ok(None);
        }
        sink.event(ProgressEvent {
            message: "phase=taxonomy; loading reference".to_string(),
            elapsed: None,
        });
        let layout = &self.layout;
        let decompressor = self.options.decompressor.as_ref();
        self.store
            .atomic(|tables| taxonomy::load_reference(tables, layout, decompressor))
    }

    /// Syncs the sample list if one is given, loads the taxonomy reference
    /// and runs every pending stage of every sample.
    ///
    /// Stops at the first fatal error; stages committed before it stay.
    pub fn load_all(
        &mut self,
        sample_list: Option<&Utf8Path>,
        sink: &dyn ProgressSink,
    ) -> Result<LoadReport, IngestError> {
        let started_at = Utc::now();
        let sync = sample_list
            .map(|path| self.sync_samples(path))
            .transpose()?;
        let taxonomy = self.load_taxonomy(sink)?;

        let samples: Vec<(SampleId, SampleAccession)> = self
            .store
            .tables()
            .samples()
            .map(|sample| (sample.id, sample.accession.clone()))
            .collect();

        let mut stages = Vec::new();
        for (id, accession) in &samples {
            for stage in Stage::ALL {
                stages.push(self.run_stage(*id, accession, stage, sink)?);
            }
        }

        Ok(LoadReport {
            started_at,
            finished_at: Utc::now(),
            sync,
            taxonomy,
            stages,
        })
    }

    /// Runs a single stage of a sample by accession.
    pub fn load_stage(
        &mut self,
        accession: &SampleAccession,
        stage: Stage,
        sink: &dyn ProgressSink,
    ) -> Result<StageOutcome, IngestError> {
        let id = self.sample_id(accession)?;
        self.run_stage(id, accession, stage, sink)
    }

    fn sample_id(&self, accession: &SampleAccession) -> Result<SampleId, IngestError> {
        self.store
            .tables()
            .sample_by_accession(accession)
            .map(|sample| sample.id)
            .ok_or_else(|| IngestError::SampleNotFound(accession.to_string()))
    }

    fn run_stage(
        &mut self,
        id: SampleId,
        accession: &SampleAccession,
        stage: Stage,
        sink: &dyn ProgressSink,
    ) -> Result<StageOutcome, IngestError> {
        let sample = self
            .store
            .tables()
            .sample(id)
            .ok_or_else(|| IngestError::SampleNotFound(accession.to_string()))?;
        let outcome = |status, records| StageOutcome {
            sample: accession.to_string(),
            stage,
            status,
            records,
        };

        if sample.is_done(stage) {
            info!(sample = %accession, stage = %stage, "already loaded, skipping");
            return Ok(outcome(StageStatus::Skipped, None));
        }
        if let Some(prerequisite) = stage.prerequisite()
            && !sample.is_done(prerequisite)
        {
            info!(sample = %accession, stage = %stage, needs = %prerequisite, "prerequisite not loaded, skipping");
            return Ok(outcome(StageStatus::Waiting, None));
        }

        sink.event(ProgressEvent {
            message: format!("phase={stage}; sample {accession}"),
            elapsed: None,
        });
        let start = Instant::now();
        let layout = &self.layout;
        let options = &self.options;
        let records = self.store.atomic(|tables| {
            let records = run_stage_in(tables, layout, options, id, accession, stage)?;
            if records.is_some() {
                tables.set_stage(id, stage, true)?;
            }
            Ok(records)
        })?;
        sink.event(ProgressEvent {
            message: format!("phase={stage}; sample {accession} done"),
            elapsed: Some(start.elapsed()),
        });

        Ok(match records {
            Some(count) => outcome(StageStatus::Loaded, Some(count)),
            None => outcome(StageStatus::NoData, None),
        })
    }

    pub fn status(&self) -> StatusReport {
        let tables = self.store.tables();
        let samples = tables
            .samples()
            .map(|sample| SampleStatus {
                accession: sample.accession.to_string(),
                completed: sample.completed.iter().copied().collect(),
                contigs: tables.sequences(sample.id, RecordKind::Contig).count(),
                genes: tables.sequences(sample.id, RecordKind::Gene).count(),
                proteins: tables.sequences(sample.id, RecordKind::Protein).count(),
                bins: tables.bins(sample.id).fold(BTreeMap::new(), |mut counts, bin| {
                    *counts.entry(bin.method).or_insert(0) += 1;
                    counts
                }),
                read_count: sample.read_count,
                reads_mapped: sample.reads_mapped,
                num_ref_sequences: sample.num_ref_sequences,
            })
            .collect();
        StatusReport {
            taxonomy_loaded: tables.taxonomy_loaded(),
            taxa: tables.taxa().count(),
            samples,
        }
    }

    /// Removes a sample's bins and clears the stages built on them.
    pub fn delete_bins(&mut self, accession: &SampleAccession) -> Result<usize, IngestError> {
        let id = self.sample_id(accession)?;
        let deleted = self.store.atomic(|tables| {
            let deleted = tables.delete_bins(id);
            for stage in [Stage::Binning, Stage::Checkm, Stage::Taxa] {
                tables.set_stage(id, stage, false)?;
            }
            Ok(deleted)
        })?;
        info!(sample = %accession, bins = deleted, "bins deleted");
        Ok(deleted)
    }

    fn source(
        &self,
        accession: &SampleAccession,
        kind: RecordKind,
        identifier: &str,
    ) -> Result<(Utf8PathBuf, u64, u64), IngestError> {
        let id = self.sample_id(accession)?;
        let record = self
            .store
            .tables()
            .sequence_by_identifier(id, kind, identifier)
            .ok_or_else(|| IngestError::RecordNotFound(format!("{kind} {identifier} in {accession}")))?;
        Ok((
            self.layout.fasta_path(accession, kind),
            record.source_offset,
            record.source_length,
        ))
    }

    /// Re-reads a stored record from its source file.
    pub fn sequence(
        &self,
        accession: &SampleAccession,
        kind: RecordKind,
        identifier: &str,
    ) -> Result<StoredSequence, IngestError> {
        let (path, offset, length) = self.source(accession, kind, identifier)?;
        retrieve_sequence(path.as_std_path(), offset, length)
    }

    /// The exact source bytes of a stored record.
    pub fn raw_sequence(
        &self,
        accession: &SampleAccession,
        kind: RecordKind,
        identifier: &str,
    ) -> Result<Vec<u8>, IngestError> {
        let (path, offset, length) = self.source(accession, kind, identifier)?;
        read_span(path.as_std_path(), offset, length)
    }

    /// LCA of the given taxids without its unclassified tail.
    pub fn lca(&self, taxids: &[u32]) -> Result<Vec<String>, IngestError> {
        let names = taxonomy::lca_of_taxids(self.store.tables(), taxids)?;
        Ok(taxonomy::classified(&names))
    }
}

/// `Ok(None)` when the stage has no input for this sample.
fn run_stage_in(
    tables: &mut Tables,
    layout: &DataLayout,
    options: &LoadOptions,
    sample: SampleId,
    accession: &SampleAccession,
    stage: Stage,
) -> Result<Option<usize>, IngestError> {
    match stage {
        Stage::Contigs => load_sequences(tables, layout, options, sample, accession, RecordKind::Contig),
        Stage::Binning => {
            let report = bins::import_sample_bins(tables, layout, sample, accession, &options.methods)?;
            Ok(Some(report.bins()))
        }
        Stage::Checkm => Ok(checkm::import_sample_stats(tables, layout, sample, accession)?
            .map(|report| report.bins.values().sum())),
        Stage::Genes => load_sequences(tables, layout, options, sample, accession, RecordKind::Gene),
        Stage::Proteins => {
            load_sequences(tables, layout, options, sample, accession, RecordKind::Protein)
        }
        Stage::Taxa => {
            if !tables.taxonomy_loaded() {
                warn!(sample = %accession, "taxonomy reference not loaded");
                return Ok(None);
            }
            Ok(taxonomy::assign_sample_taxa(tables, layout, sample, accession)?
                .map(|report| report.contigs))
        }
    }
}

fn load_sequences(
    tables: &mut Tables,
    layout: &DataLayout,
    options: &LoadOptions,
    sample: SampleId,
    accession: &SampleAccession,
    kind: RecordKind,
) -> Result<Option<usize>, IngestError> {
    let fasta = layout.fasta_path(accession, kind);
    if !fasta.as_std_path().exists() {
        warn!(sample = %accession, path = %fasta, "{kind} file missing");
        return Ok(None);
    }
    let coverage = layout.coverage_path(accession, kind);
    let coverage = coverage.as_deref().map(Utf8Path::as_std_path);

    let (count, header) = match kind {
        RecordKind::Contig => {
            index_and_join(tables, sample, fasta.as_std_path(), coverage, PlainHeader, options)?
        }
        RecordKind::Gene => {
            let parser = GeneHeader::new(tables.identifier_map(sample, RecordKind::Contig));
            index_and_join(tables, sample, fasta.as_std_path(), coverage, parser, options)?
        }
        RecordKind::Protein => {
            let parser = ProteinHeader::new(tables.identifier_map(sample, RecordKind::Gene));
            index_and_join(tables, sample, fasta.as_std_path(), coverage, parser, options)?
        }
    };

    if kind == RecordKind::Contig
        && let (Some(header), Some(path)) = (header, coverage)
    {
        let counts = MappingCounts::from_header(&header, path)?;
        tables.update_sample(sample, |sample| {
            sample.read_count = counts.read_count;
            sample.reads_mapped = counts.reads_mapped;
            sample.num_ref_sequences = counts.num_ref_sequences;
        })?;
    }
    info!(sample = %accession, kind = %kind, records = count, "sequences loaded");
    Ok(Some(count))
}

fn index_and_join<P>(
    tables: &mut Tables,
    sample: SampleId,
    fasta: &Path,
    coverage: Option<&Path>,
    parser: P,
    options: &LoadOptions,
) -> Result<(usize, Option<CoverageHeader>), IngestError>
where
    P: HeaderParser,
    P::Fields: SequenceFields,
{
    let records = FastaIndexer::new(open_sequential(fasta)?, parser, fasta).with_limit(options.limit);
    match coverage {
        Some(path) => {
            let rows = CoverageReader::new(open_sequential(path)?, path, options.limit)?;
            let header = rows.header().clone();
            let joined = CoverageJoin::new(records, rows, path)
                .map(|item| item.map(|(record, attributes)| (record, Some(attributes))));
            let count = persist_batched(tables, sample, joined, options.batch_size)?;
            Ok((count, Some(header)))
        }
        None => {
            let plain = records.map(|item| item.map(|record| (record, None)));
            let count = persist_batched(tables, sample, plain, options.batch_size)?;
            Ok((count, None))
        }
    }
}

fn persist_batched<T, I>(
    tables: &mut Tables,
    sample: SampleId,
    records: I,
    batch_size: usize,
) -> Result<usize, IngestError>
where
    T: SequenceFields,
    I: Iterator<Item = Result<(IndexedRecord<T>, Option<CoverageAttributes>), IngestError>>,
{
    let batch_size = batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size);
    let mut total = 0;
    for item in records {
        let (record, coverage) = item?;
        batch.push(NewSequence {
            sample,
            identifier: record.fields.identifier().to_string(),
            source_offset: record.source_offset,
            source_length: record.source_length,
            detail: record.fields.detail(),
            coverage,
        });
        if batch.len() >= batch_size {
            total += tables.bulk_create_sequences(std::mem::take(&mut batch))?;
        }
    }
    if !batch.is_empty() {
        total += tables.bulk_create_sequences(batch)?;
    }
    Ok(total)
}
