use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tempfile::Builder;

use crate::checkm::CheckmStats;
use crate::domain::{BinMethod, Rank, RecordKind, SampleAccession, Stage};
use crate::error::IngestError;

macro_rules! record_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

record_id!(SampleId);
record_id!(SequenceId);
record_id!(BinId);
record_id!(StatsId);
record_id!(TaxNameId);
record_id!(LineageId);
record_id!(TaxonId);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub id: SampleId,
    pub accession: SampleAccession,
    #[serde(default)]
    pub completed: BTreeSet<Stage>,
    #[serde(default)]
    pub read_count: Option<u64>,
    #[serde(default)]
    pub reads_mapped: Option<u64>,
    #[serde(default)]
    pub num_ref_sequences: Option<u64>,
}

impl Sample {
    pub fn is_done(&self, stage: Stage) -> bool {
        self.completed.contains(&stage)
    }
}

/// Mapping statistics from one coverage table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageAttributes {
    pub length: u64,
    pub bases: u64,
    pub coverage: f64,
    pub reads_mapped: u64,
    pub rpkm: f64,
    pub frags_mapped: u64,
    pub fpkm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strand {
    #[serde(rename = "+")]
    Forward,
    #[serde(rename = "-")]
    Reverse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SequenceDetail {
    Contig,
    Gene {
        contig: SequenceId,
        start: u64,
        end: u64,
        strand: Strand,
    },
    Protein {
        gene: SequenceId,
    },
}

impl SequenceDetail {
    pub fn kind(&self) -> RecordKind {
        match self {
            SequenceDetail::Contig => RecordKind::Contig,
            SequenceDetail::Gene { .. } => RecordKind::Gene,
            SequenceDetail::Protein { .. } => RecordKind::Protein,
        }
    }
}

/// A sequence record not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSequence {
    pub sample: SampleId,
    pub identifier: String,
    pub source_offset: u64,
    pub source_length: u64,
    pub detail: SequenceDetail,
    pub coverage: Option<CoverageAttributes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub id: SequenceId,
    pub sample: SampleId,
    pub identifier: String,
    pub source_offset: u64,
    pub source_length: u64,
    pub detail: SequenceDetail,
    #[serde(default)]
    pub coverage: Option<CoverageAttributes>,
    #[serde(default)]
    pub bins: BTreeMap<BinMethod, BinId>,
    #[serde(default)]
    pub taxon: Option<TaxonId>,
}

impl SequenceRecord {
    pub fn kind(&self) -> RecordKind {
        self.detail.kind()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bin {
    pub id: BinId,
    pub sample: SampleId,
    pub method: BinMethod,
    pub number: u32,
    #[serde(default)]
    pub checkm: Option<StatsId>,
    #[serde(default)]
    pub lineage: Option<LineageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxName {
    pub id: TaxNameId,
    pub rank: Rank,
    pub name: String,
}

/// One tax name slot per rank below root, `None` where the rank is unset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LineageKey(pub [Option<TaxNameId>; 8]);

impl LineageKey {
    /// Leading set ranks, stopping at the first unset one.
    pub fn prefix(&self) -> impl Iterator<Item = (Rank, TaxNameId)> + '_ {
        Rank::LINEAGE
            .into_iter()
            .zip(self.0.iter())
            .map_while(|(rank, slot)| slot.map(|id| (rank, id)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lineage {
    pub id: LineageId,
    pub key: LineageKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Taxon {
    pub id: TaxonId,
    pub taxid: u32,
    #[serde(default)]
    pub lineage: Option<LineageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredStats {
    pub id: StatsId,
    pub stats: CheckmStats,
}

/// In-memory record tables with uniqueness indexes.
///
/// Every mutating call counts as one write; the counter survives commits so
/// callers can verify that a re-run touched nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    #[serde(default)]
    writes: u64,
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    taxonomy_loaded: bool,
    #[serde(default)]
    samples: BTreeMap<u64, Sample>,
    #[serde(default)]
    sequences: BTreeMap<u64, SequenceRecord>,
    #[serde(default)]
    bins: BTreeMap<u64, Bin>,
    #[serde(default)]
    stats: BTreeMap<u64, StoredStats>,
    #[serde(default)]
    taxnames: BTreeMap<u64, TaxName>,
    #[serde(default)]
    lineages: BTreeMap<u64, Lineage>,
    #[serde(default)]
    taxa: BTreeMap<u64, Taxon>,

    #[serde(skip)]
    sample_index: HashMap<SampleAccession, SampleId>,
    #[serde(skip)]
    sequence_index: HashMap<(SampleId, RecordKind, String), SequenceId>,
    /// Record ids per sample and kind, in creation order.
    #[serde(skip)]
    kind_index: HashMap<(SampleId, RecordKind), Vec<SequenceId>>,
    #[serde(skip)]
    bin_index: HashMap<(SampleId, BinMethod, u32), BinId>,
    #[serde(skip)]
    sample_bins: HashMap<SampleId, BTreeSet<BinId>>,
    #[serde(skip)]
    bin_members: HashMap<BinId, BTreeSet<SequenceId>>,
    #[serde(skip)]
    taxname_index: HashMap<(Rank, String), TaxNameId>,
    #[serde(skip)]
    lineage_index: HashMap<LineageKey, LineageId>,
    #[serde(skip)]
    taxon_index: HashMap<u32, TaxonId>,
}

impl Tables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Rebuild the lookup indexes after deserialization.
    pub fn reindex(&mut self) {
        self.sample_index = self
            .samples
            .values()
            .map(|sample| (sample.accession.clone(), sample.id))
            .collect();
        self.sequence_index = self
            .sequences
            .values()
            .map(|seq| ((seq.sample, seq.kind(), seq.identifier.clone()), seq.id))
            .collect();
        self.kind_index = HashMap::new();
        self.bin_members = HashMap::new();
        for seq in self.sequences.values() {
            self.kind_index
                .entry((seq.sample, seq.kind()))
                .or_default()
                .push(seq.id);
            for bin in seq.bins.values() {
                self.bin_members.entry(*bin).or_default().insert(seq.id);
            }
        }
        self.bin_index = self
            .bins
            .values()
            .map(|bin| ((bin.sample, bin.method, bin.number), bin.id))
            .collect();
        self.sample_bins = HashMap::new();
        for bin in self.bins.values() {
            self.sample_bins.entry(bin.sample).or_default().insert(bin.id);
        }
        self.taxname_index = self
            .taxnames
            .values()
            .map(|name| ((name.rank, name.name.clone()), name.id))
            .collect();
        self.lineage_index = self
            .lineages
            .values()
            .map(|lineage| (lineage.key, lineage.id))
            .collect();
        self.taxon_index = self
            .taxa
            .values()
            .map(|taxon| (taxon.taxid, taxon.id))
            .collect();
    }

    // samples

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.values()
    }

    pub fn sample(&self, id: SampleId) -> Option<&Sample> {
        self.samples.get(&id.0)
    }

    pub fn sample_by_accession(&self, accession: &SampleAccession) -> Option<&Sample> {
        self.sample_index
            .get(accession)
            .and_then(|id| self.samples.get(&id.0))
    }

    pub fn get_or_create_sample(&mut self, accession: &SampleAccession) -> (SampleId, bool) {
        if let Some(id) = self.sample_index.get(accession) {
            return (*id, false);
        }
        let id = SampleId(self.allocate());
        self.samples.insert(
            id.0,
            Sample {
                id,
                accession: accession.clone(),
                completed: BTreeSet::new(),
                read_count: None,
                reads_mapped: None,
                num_ref_sequences: None,
            },
        );
        self.sample_index.insert(accession.clone(), id);
        self.writes += 1;
        (id, true)
    }

    pub fn update_sample<F>(&mut self, id: SampleId, update: F) -> Result<(), IngestError>
    where
        F: FnOnce(&mut Sample),
    {
        let sample = self
            .samples
            .get_mut(&id.0)
            .ok_or_else(|| IngestError::RecordNotFound(format!("sample #{id}")))?;
        update(sample);
        self.writes += 1;
        Ok(())
    }

    pub fn set_stage(&mut self, id: SampleId, stage: Stage, done: bool) -> Result<(), IngestError> {
        self.update_sample(id, |sample| {
            if done {
                sample.completed.insert(stage);
            } else {
                sample.completed.remove(&stage);
            }
        })
    }

    // sequence records

    pub fn bulk_create_sequences(&mut self, records: Vec<NewSequence>) -> Result<usize, IngestError> {
        let count = records.len();
        for new in records {
            let key = (new.sample, new.detail.kind(), new.identifier.clone());
            if self.sequence_index.contains_key(&key) {
                return Err(IngestError::Store(format!(
                    "duplicate {} {} in sample #{}",
                    key.1, key.2, key.0
                )));
            }
            let id = SequenceId(self.allocate());
            self.sequences.insert(
                id.0,
                SequenceRecord {
                    id,
                    sample: new.sample,
                    identifier: new.identifier,
                    source_offset: new.source_offset,
                    source_length: new.source_length,
                    detail: new.detail,
                    coverage: new.coverage,
                    bins: BTreeMap::new(),
                    taxon: None,
                },
            );
            self.kind_index.entry((key.0, key.1)).or_default().push(id);
            self.sequence_index.insert(key, id);
        }
        self.writes += 1;
        Ok(count)
    }

    pub fn sequence(&self, id: SequenceId) -> Option<&SequenceRecord> {
        self.sequences.get(&id.0)
    }

    pub fn sequences(
        &self,
        sample: SampleId,
        kind: RecordKind,
    ) -> impl Iterator<Item = &SequenceRecord> {
        self.kind_index
            .get(&(sample, kind))
            .into_iter()
            .flatten()
            .filter_map(|id| self.sequences.get(&id.0))
    }

    pub fn sequence_by_identifier(
        &self,
        sample: SampleId,
        kind: RecordKind,
        identifier: &str,
    ) -> Option<&SequenceRecord> {
        self.sequence_index
            .get(&(sample, kind, identifier.to_string()))
            .and_then(|id| self.sequences.get(&id.0))
    }

    /// Identifier to record id map for one sample and kind.
    pub fn identifier_map(&self, sample: SampleId, kind: RecordKind) -> HashMap<String, SequenceId> {
        self.sequences(sample, kind)
            .map(|seq| (seq.identifier.clone(), seq.id))
            .collect()
    }

    /// Points every contig of `sample` named in `identifiers` at `bin`.
    /// Returns the number of records updated; unknown identifiers are ignored.
    pub fn assign_bin(
        &mut self,
        sample: SampleId,
        method: BinMethod,
        bin: BinId,
        identifiers: &HashSet<String>,
    ) -> usize {
        let mut updated = 0;
        for identifier in identifiers {
            let key = (sample, RecordKind::Contig, identifier.clone());
            if let Some(id) = self.sequence_index.get(&key)
                && let Some(seq) = self.sequences.get_mut(&id.0)
            {
                if let Some(previous) = seq.bins.insert(method, bin)
                    && let Some(members) = self.bin_members.get_mut(&previous)
                {
                    members.remove(id);
                }
                self.bin_members.entry(bin).or_default().insert(*id);
                updated += 1;
            }
        }
        self.writes += 1;
        updated
    }

    pub fn assign_taxa(&mut self, assignments: &[(SequenceId, TaxonId)]) -> Result<usize, IngestError> {
        for (seq_id, taxon) in assignments {
            let seq = self
                .sequences
                .get_mut(&seq_id.0)
                .ok_or_else(|| IngestError::RecordNotFound(format!("sequence #{seq_id}")))?;
            seq.taxon = Some(*taxon);
        }
        self.writes += 1;
        Ok(assignments.len())
    }

    // bins

    pub fn create_bin(
        &mut self,
        sample: SampleId,
        method: BinMethod,
        number: u32,
    ) -> Result<BinId, IngestError> {
        if self.bin_index.contains_key(&(sample, method, number)) {
            return Err(IngestError::Store(format!(
                "duplicate bin {method} #{number} in sample #{sample}"
            )));
        }
        let id = BinId(self.allocate());
        self.bins.insert(
            id.0,
            Bin {
                id,
                sample,
                method,
                number,
                checkm: None,
                lineage: None,
            },
        );
        self.bin_index.insert((sample, method, number), id);
        self.sample_bins.entry(sample).or_default().insert(id);
        self.writes += 1;
        Ok(id)
    }

    pub fn bin(&self, id: BinId) -> Option<&Bin> {
        self.bins.get(&id.0)
    }

    pub fn find_bin(&self, sample: SampleId, method: BinMethod, number: u32) -> Option<&Bin> {
        self.bin_index
            .get(&(sample, method, number))
            .and_then(|id| self.bins.get(&id.0))
    }

    pub fn bins(&self, sample: SampleId) -> impl Iterator<Item = &Bin> {
        self.sample_bins
            .get(&sample)
            .into_iter()
            .flatten()
            .filter_map(|id| self.bins.get(&id.0))
    }

    pub fn bin_members(&self, bin: &Bin) -> impl Iterator<Item = &SequenceRecord> {
        self.bin_members
            .get(&bin.id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.sequences.get(&id.0))
    }

    /// One bulk update per binning method: attach statistics records to bins.
    pub fn bulk_update_bin_stats(
        &mut self,
        method: BinMethod,
        updates: &[(BinId, StatsId)],
    ) -> Result<usize, IngestError> {
        for (bin_id, stats) in updates {
            let bin = self
                .bins
                .get_mut(&bin_id.0)
                .filter(|bin| bin.method == method)
                .ok_or_else(|| IngestError::RecordNotFound(format!("{method} bin #{bin_id}")))?;
            bin.checkm = Some(*stats);
        }
        self.writes += 1;
        Ok(updates.len())
    }

    pub fn set_bin_lineage(&mut self, bin: BinId, lineage: Option<LineageId>) -> Result<(), IngestError> {
        let bin = self
            .bins
            .get_mut(&bin.0)
            .ok_or_else(|| IngestError::RecordNotFound(format!("bin #{bin}")))?;
        bin.lineage = lineage;
        self.writes += 1;
        Ok(())
    }

    /// Removes all bins of a sample with their statistics and member links.
    pub fn delete_bins(&mut self, sample: SampleId) -> usize {
        let doomed: Vec<Bin> = self.bins(sample).cloned().collect();
        for bin in &doomed {
            self.bins.remove(&bin.id.0);
            self.bin_index.remove(&(bin.sample, bin.method, bin.number));
            if let Some(stats) = bin.checkm {
                self.stats.remove(&stats.0);
            }
            for member in self.bin_members.remove(&bin.id).unwrap_or_default() {
                if let Some(seq) = self.sequences.get_mut(&member.0) {
                    seq.bins.clear();
                }
            }
        }
        self.sample_bins.remove(&sample);
        self.writes += 1;
        doomed.len()
    }

    // statistics

    pub fn create_stats(&mut self, stats: CheckmStats) -> StatsId {
        let id = StatsId(self.allocate());
        self.stats.insert(id.0, StoredStats { id, stats });
        self.writes += 1;
        id
    }

    pub fn stats(&self, id: StatsId) -> Option<&CheckmStats> {
        self.stats.get(&id.0).map(|stored| &stored.stats)
    }

    // taxonomy

    pub fn taxonomy_loaded(&self) -> bool {
        self.taxonomy_loaded
    }

    pub fn set_taxonomy_loaded(&mut self, loaded: bool) {
        self.taxonomy_loaded = loaded;
        self.writes += 1;
    }

    pub fn get_or_create_taxname(&mut self, rank: Rank, name: &str) -> (TaxNameId, bool) {
        let key = (rank, name.to_string());
        if let Some(id) = self.taxname_index.get(&key) {
            return (*id, false);
        }
        let id = TaxNameId(self.allocate());
        self.taxnames.insert(
            id.0,
            TaxName {
                id,
                rank,
                name: name.to_string(),
            },
        );
        self.taxname_index.insert(key, id);
        self.writes += 1;
        (id, true)
    }

    pub fn taxnames(&self) -> impl Iterator<Item = &TaxName> {
        self.taxnames.values()
    }

    pub fn taxname(&self, id: TaxNameId) -> Option<&TaxName> {
        self.taxnames.get(&id.0)
    }

    /// Creates lineages for keys not stored yet; returns ids in input order.
    pub fn bulk_create_lineages<I>(&mut self, keys: I) -> Vec<LineageId>
    where
        I: IntoIterator<Item = LineageKey>,
    {
        let mut ids = Vec::new();
        for key in keys {
            if let Some(id) = self.lineage_index.get(&key) {
                ids.push(*id);
                continue;
            }
            let id = LineageId(self.allocate());
            self.lineages.insert(id.0, Lineage { id, key });
            self.lineage_index.insert(key, id);
            ids.push(id);
        }
        self.writes += 1;
        ids
    }

    pub fn lineages(&self) -> impl Iterator<Item = &Lineage> {
        self.lineages.values()
    }

    pub fn lineage(&self, id: LineageId) -> Option<&Lineage> {
        self.lineages.get(&id.0)
    }

    pub fn upsert_taxon(&mut self, taxid: u32, lineage: Option<LineageId>) -> TaxonId {
        self.writes += 1;
        if let Some(id) = self.taxon_index.get(&taxid).copied() {
            if let Some(taxon) = self.taxa.get_mut(&id.0) {
                taxon.lineage = lineage;
            }
            return id;
        }
        let id = TaxonId(self.allocate());
        self.taxa.insert(id.0, Taxon { id, taxid, lineage });
        self.taxon_index.insert(taxid, id);
        id
    }

    pub fn taxon(&self, id: TaxonId) -> Option<&Taxon> {
        self.taxa.get(&id.0)
    }

    pub fn taxon_by_taxid(&self, taxid: u32) -> Option<&Taxon> {
        self.taxon_index
            .get(&taxid)
            .and_then(|id| self.taxa.get(&id.0))
    }

    pub fn taxa(&self) -> impl Iterator<Item = &Taxon> {
        self.taxa.values()
    }
}

/// Transactional access to the record tables.
pub trait RecordStore {
    fn tables(&self) -> &Tables;

    /// Runs `work` against a working copy of the tables. The copy becomes the
    /// committed state only when `work` returns `Ok`.
    fn atomic<T, F>(&mut self, work: F) -> Result<T, IngestError>
    where
        F: FnOnce(&mut Tables) -> Result<T, IngestError>;

    fn writes(&self) -> u64 {
        self.tables().writes()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Tables,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn tables(&self) -> &Tables {
        &self.tables
    }

    fn atomic<T, F>(&mut self, work: F) -> Result<T, IngestError>
    where
        F: FnOnce(&mut Tables) -> Result<T, IngestError>,
    {
        let mut working = self.tables.clone();
        let value = work(&mut working)?;
        self.tables = working;
        Ok(value)
    }
}

/// Record store whose committed state is mirrored to a JSON snapshot.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: Utf8PathBuf,
    tables: Tables,
}

impl JsonStore {
    pub fn open(path: &Utf8Path) -> Result<Self, IngestError> {
        let tables = if path.as_std_path().exists() {
            let content = fs::read_to_string(path.as_std_path())
                .map_err(|err| IngestError::Filesystem(format!("read {path}: {err}")))?;
            let mut tables: Tables = serde_json::from_str(&content)
                .map_err(|err| IngestError::Store(format!("parse {path}: {err}")))?;
            tables.reindex();
            tables
        } else {
            Tables::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            tables,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn write_snapshot(&self, tables: &Tables) -> Result<(), IngestError> {
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let content = serde_json::to_vec(tables)
            .map_err(|err| IngestError::Store(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix("omics-ingest-store")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        temp.write_all(&content)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        temp.persist(self.path.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

impl RecordStore for JsonStore {
    fn tables(&self) -> &Tables {
        &self.tables
    }

    fn atomic<T, F>(&mut self, work: F) -> Result<T, IngestError>
    where
        F: FnOnce(&mut Tables) -> Result<T, IngestError>,
    {
        let mut working = self.tables.clone();
        let value = work(&mut working)?;
        if working.writes() != self.tables.writes() {
            self.write_snapshot(&working)?;
        }
        self.tables = working;
        Ok(value)
    }
}
