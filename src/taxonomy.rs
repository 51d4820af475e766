//! Taxonomic names, lineages and taxa.
//!
//! A lineage is addressed by the ranked names along it, e.g.
//! `Bacteria;Proteobacteria;Gammaproteobacteria`. Names are resolved against
//! the stored names; unseen lineages are gathered per batch and created in
//! one step.

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::io::BufRead;
use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::DecompressorSpec;
use crate::decompress::open_reference;
use crate::domain::{Rank, RecordKind, SampleAccession};
use crate::error::IngestError;
use crate::fasta::open_sequential;
use crate::layout::DataLayout;
use crate::store::{LineageId, LineageKey, SampleId, TaxNameId, TaxonId, Tables};

pub const LINEAGE_SEPARATOR: char = ';';

/// Outcome of resolving one lineage string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Found(LineageId),
    Missing(LineageKey),
}

/// Lookup of lineage strings against preloaded name and lineage maps.
#[derive(Debug, Clone, Default)]
pub struct LineageResolver {
    names: HashMap<(Rank, String), TaxNameId>,
    lineages: HashMap<LineageKey, LineageId>,
}

impl LineageResolver {
    pub fn new(tables: &Tables) -> Self {
        Self {
            names: tables
                .taxnames()
                .map(|name| ((name.rank, name.name.clone()), name.id))
                .collect(),
            lineages: tables
                .lineages()
                .map(|lineage| (lineage.key, lineage.id))
                .collect(),
        }
    }

    pub fn key_for(&self, value: &str) -> Result<LineageKey, IngestError> {
        let names: Vec<&str> = value.trim().split(LINEAGE_SEPARATOR).map(str::trim).collect();
        if names.len() > Rank::LINEAGE.len() {
            return Err(IngestError::LineageTooDeep(value.to_string()));
        }
        let mut key = LineageKey::default();
        for (slot, (rank, name)) in Rank::LINEAGE.iter().zip(&names).enumerate() {
            let id = self
                .names
                .get(&(*rank, name.to_string()))
                .ok_or_else(|| IngestError::UnknownTaxName {
                    name: name.to_string(),
                    rank: *rank,
                })?;
            key.0[slot] = Some(*id);
        }
        Ok(key)
    }

    pub fn resolve(&self, value: &str) -> Result<Resolution, IngestError> {
        let key = self.key_for(value)?;
        Ok(match self.lineages.get(&key) {
            Some(id) => Resolution::Found(*id),
            None => Resolution::Missing(key),
        })
    }

    pub fn register(&mut self, key: LineageKey, id: LineageId) {
        self.lineages.insert(key, id);
    }
}

/// Collects the unresolved lineages of one batch of inputs.
///
/// Each input carries a caller tag; once the missing lineages are created
/// every deferred tag is paired with its lineage id.
#[derive(Debug)]
pub struct LineageBatch<T> {
    /// Deferred keys by tag; an entry is cleared when its tag shows up again.
    deferred: Vec<Option<(LineageKey, T)>>,
    positions: HashMap<T, usize>,
    unknown: BTreeSet<(Rank, String)>,
}

impl<T> Default for LineageBatch<T> {
    fn default() -> Self {
        Self {
            deferred: Vec::new(),
            positions: HashMap::new(),
            unknown: BTreeSet::new(),
        }
    }
}

impl<T: Clone + Eq + Hash> LineageBatch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Ok(Some(_))` for a stored lineage. `Ok(None)` when the lineage is
    /// new, or names something unknown; the latter is only counted.
    ///
    /// A tag seen again replaces whatever was deferred for it earlier.
    pub fn resolve_or_defer(
        &mut self,
        resolver: &LineageResolver,
        value: &str,
        tag: T,
    ) -> Result<Option<LineageId>, IngestError> {
        if let Some(position) = self.positions.remove(&tag) {
            self.deferred[position] = None;
        }
        match resolver.resolve(value) {
            Ok(Resolution::Found(id)) => Ok(Some(id)),
            Ok(Resolution::Missing(key)) => {
                self.positions.insert(tag.clone(), self.deferred.len());
                self.deferred.push(Some((key, tag)));
                Ok(None)
            }
            Err(IngestError::UnknownTaxName { name, rank }) => {
                self.unknown.insert((rank, name));
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub fn unknown_names(&self) -> &BTreeSet<(Rank, String)> {
        &self.unknown
    }

    /// Creates the deferred lineages in one bulk call and returns the tags
    /// with their new lineage ids.
    pub fn create_missing(
        self,
        tables: &mut Tables,
        resolver: &mut LineageResolver,
    ) -> Vec<(T, LineageId)> {
        if !self.unknown.is_empty() {
            let sample: Vec<String> = self
                .unknown
                .iter()
                .take(5)
                .map(|(rank, name)| format!("{rank} {name}"))
                .collect();
            warn!(
                count = self.unknown.len(),
                first = %sample.join(", "),
                "unknown taxonomic names, lineages left unset"
            );
        }
        let deferred: Vec<(LineageKey, T)> = self.deferred.into_iter().flatten().collect();
        if deferred.is_empty() {
            return Vec::new();
        }

        let mut unique: Vec<LineageKey> = deferred.iter().map(|(key, _)| *key).collect();
        unique.sort();
        unique.dedup();
        let ids = tables.bulk_create_lineages(unique.iter().copied());
        for (key, id) in unique.iter().zip(&ids) {
            resolver.register(*key, *id);
        }
        let created: HashMap<LineageKey, LineageId> = unique.into_iter().zip(ids).collect();

        deferred
            .into_iter()
            .filter_map(|(key, tag)| created.get(&key).map(|id| (tag, *id)))
            .collect()
    }
}

/// Longest lineage prefix shared by every key; `None` for no keys.
pub fn common_prefix<'a, I>(keys: I) -> Option<LineageKey>
where
    I: IntoIterator<Item = &'a LineageKey>,
{
    let mut keys = keys.into_iter();
    let first = *keys.next()?;
    let mut depth = first.prefix().count();
    for key in keys {
        depth = (0..depth)
            .take_while(|&slot| key.0[slot] == first.0[slot])
            .count();
    }
    let mut out = LineageKey::default();
    out.0[..depth].copy_from_slice(&first.0[..depth]);
    Some(out)
}

pub fn lineage_names(tables: &Tables, key: &LineageKey) -> Vec<String> {
    key.prefix()
        .filter_map(|(_, id)| tables.taxname(id).map(|name| name.name.clone()))
        .collect()
}

pub fn format_lineage(names: &[String]) -> String {
    names.join(&LINEAGE_SEPARATOR.to_string())
}

fn taxon_key(tables: &Tables, taxon: TaxonId) -> Result<LineageKey, IngestError> {
    let taxon = tables
        .taxon(taxon)
        .ok_or_else(|| IngestError::RecordNotFound(format!("taxon #{taxon}")))?;
    Ok(taxon
        .lineage
        .and_then(|id| tables.lineage(id))
        .map(|lineage| lineage.key)
        .unwrap_or_default())
}

/// Lowest common ancestor lineage of the given taxa, as names from the
/// highest rank down.
pub fn lca_lineage(tables: &Tables, taxa: &[TaxonId]) -> Result<Vec<String>, IngestError> {
    let keys = taxa
        .iter()
        .map(|taxon| taxon_key(tables, *taxon))
        .collect::<Result<Vec<_>, _>>()?;
    let prefix = common_prefix(&keys).ok_or(IngestError::EmptyTaxa)?;
    Ok(lineage_names(tables, &prefix))
}

/// [`lca_lineage`] for external taxids.
pub fn lca_of_taxids(tables: &Tables, taxids: &[u32]) -> Result<Vec<String>, IngestError> {
    let taxa = taxids
        .iter()
        .map(|taxid| {
            tables
                .taxon_by_taxid(*taxid)
                .map(|taxon| taxon.id)
                .ok_or(IngestError::UnknownTaxon(*taxid))
        })
        .collect::<Result<Vec<_>, _>>()?;
    lca_lineage(tables, &taxa)
}

/// Drops the `UNCLASSIFIED_<parent>_<RANK>` tail of a lineage.
pub fn classified(names: &[String]) -> Vec<String> {
    let Some(first) = names.first() else {
        return Vec::new();
    };
    let mut out = vec![first.clone()];
    for (rank, name) in Rank::LINEAGE[1..].iter().zip(&names[1..]) {
        let placeholder = format!(
            "UNCLASSIFIED_{}_{}",
            out[out.len() - 1],
            rank.as_str().to_ascii_uppercase()
        );
        if *name == placeholder {
            break;
        }
        out.push(name.clone());
    }
    out
}

fn format_error(path: &Path, line: u64, message: impl Into<String>) -> IngestError {
    IngestError::TaxonomyFormat {
        path: path.to_path_buf(),
        line,
        message: message.into(),
    }
}

/// Loads `rank<TAB>name` lines; returns the number of new names.
pub fn load_taxnames<R: BufRead>(tables: &mut Tables, reader: R, path: &Path) -> Result<usize, IngestError> {
    let mut created = 0;
    for (index, line) in reader.lines().enumerate() {
        let line_no = index as u64 + 1;
        let line = line.map_err(|err| IngestError::Filesystem(format!("read {}: {err}", path.display())))?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let (rank, name) = line
            .split_once('\t')
            .ok_or_else(|| format_error(path, line_no, "expected rank and name separated by a tab"))?;
        let rank: Rank = rank
            .parse()
            .map_err(|_| format_error(path, line_no, format!("unknown rank {rank:?}")))?;
        if rank == Rank::Root {
            continue;
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(format_error(path, line_no, "empty name"));
        }
        if tables.get_or_create_taxname(rank, name).1 {
            created += 1;
        }
    }
    Ok(created)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaxaLoadReport {
    pub taxa: usize,
    pub lineages_created: usize,
    pub unknown_names: usize,
}

/// Loads `taxid<TAB>lineage` lines, creating missing lineages in one batch.
/// Taxa whose lineage names an unknown name keep no lineage.
pub fn load_taxa<R: BufRead>(tables: &mut Tables, reader: R, path: &Path) -> Result<TaxaLoadReport, IngestError> {
    let mut resolver = LineageResolver::new(tables);
    let mut batch = LineageBatch::new();
    let mut report = TaxaLoadReport::default();

    for (index, line) in reader.lines().enumerate() {
        let line_no = index as u64 + 1;
        let line = line.map_err(|err| IngestError::Filesystem(format!("read {}: {err}", path.display())))?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let (taxid, lineage) = line
            .split_once('\t')
            .ok_or_else(|| format_error(path, line_no, "expected taxid and lineage separated by a tab"))?;
        let taxid: u32 = taxid
            .trim()
            .parse()
            .map_err(|_| format_error(path, line_no, format!("bad taxid {taxid:?}")))?;
        let lineage = batch
            .resolve_or_defer(&resolver, lineage, taxid)
            .map_err(|err| format_error(path, line_no, err.to_string()))?;
        tables.upsert_taxon(taxid, lineage);
        report.taxa += 1;
    }

    report.unknown_names = batch.unknown_names().len();
    let created = batch.create_missing(tables, &mut resolver);
    let distinct: BTreeSet<LineageId> = created.iter().map(|(_, id)| *id).collect();
    report.lineages_created = distinct.len();
    for (taxid, lineage) in created {
        tables.upsert_taxon(taxid, Some(lineage));
    }
    Ok(report)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaxonomyReport {
    pub names_created: usize,
    #[serde(flatten)]
    pub taxa: TaxaLoadReport,
}

/// Loads the shared taxonomy reference once per store.
///
/// Returns `None` when the files are absent or the reference is already
/// loaded.
pub fn load_reference(
    tables: &mut Tables,
    layout: &DataLayout,
    decompressor: Option<&DecompressorSpec>,
) -> Result<Option<TaxonomyReport>, IngestError> {
    if tables.taxonomy_loaded() {
        return Ok(None);
    }
    let names_path = layout.taxnames_path();
    let Some(taxa_path) = layout.taxa_path() else {
        return Ok(None);
    };
    if !names_path.as_std_path().exists() {
        warn!(path = %names_path, "taxonomy names missing, skipping taxonomy reference");
        return Ok(None);
    }

    let names_created = load_taxnames(
        tables,
        open_sequential(names_path.as_std_path())?,
        names_path.as_std_path(),
    )?;

    let mut reader = open_reference(taxa_path.as_std_path(), decompressor)?;
    let taxa = match load_taxa(tables, &mut reader, taxa_path.as_std_path()) {
        Ok(taxa) => taxa,
        Err(err) => return Err(reader.stall_error().unwrap_or(err)),
    };
    reader.finish()?;

    tables.set_taxonomy_loaded(true);
    info!(
        names = names_created,
        taxa = taxa.taxa,
        lineages = taxa.lineages_created,
        "taxonomy reference loaded"
    );
    Ok(Some(TaxonomyReport { names_created, taxa }))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaxaAssignReport {
    pub contigs: usize,
    pub bins_classified: usize,
}

/// Assigns taxa to the contigs of a sample from `<sample>_contig_taxa.tsv`
/// and gives every bin the LCA lineage of its classified members.
///
/// Returns `None` when the sample has no taxon assignment file.
pub fn assign_sample_taxa(
    tables: &mut Tables,
    layout: &DataLayout,
    sample: SampleId,
    accession: &SampleAccession,
) -> Result<Option<TaxaAssignReport>, IngestError> {
    let path = layout.contig_taxa_path(accession);
    if !path.as_std_path().exists() {
        warn!(sample = %accession, path = %path, "no contig taxa");
        return Ok(None);
    }

    let contigs = tables.identifier_map(sample, RecordKind::Contig);
    let mut assignments = Vec::new();
    let reader = open_sequential(path.as_std_path())?;
    for (index, line) in reader.lines().enumerate() {
        let line_no = index as u64 + 1;
        let line = line.map_err(|err| IngestError::Filesystem(format!("read {path}: {err}")))?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let (contig, taxid) = line.split_once('\t').ok_or_else(|| {
            format_error(path.as_std_path(), line_no, "expected contig and taxid separated by a tab")
        })?;
        let contig = contigs.get(contig.trim()).ok_or_else(|| {
            format_error(path.as_std_path(), line_no, format!("unknown contig {contig:?}"))
        })?;
        let taxid: u32 = taxid
            .trim()
            .parse()
            .map_err(|_| format_error(path.as_std_path(), line_no, format!("bad taxid {taxid:?}")))?;
        let taxon = tables.taxon_by_taxid(taxid).ok_or_else(|| {
            format_error(path.as_std_path(), line_no, format!("unknown taxid {taxid}"))
        })?;
        assignments.push((*contig, taxon.id));
    }
    let assigned = tables.assign_taxa(&assignments)?;

    let bins_classified = assign_bin_lineages(tables, sample)?;
    info!(sample = %accession, contigs = assigned, bins = bins_classified, "taxa assigned");
    Ok(Some(TaxaAssignReport {
        contigs: assigned,
        bins_classified,
    }))
}

fn assign_bin_lineages(tables: &mut Tables, sample: SampleId) -> Result<usize, IngestError> {
    let mut prefixes = Vec::new();
    for bin in tables.bins(sample) {
        let keys: Vec<LineageKey> = tables
            .bin_members(bin)
            .filter_map(|member| member.taxon)
            .filter_map(|taxon| tables.taxon(taxon).and_then(|taxon| taxon.lineage))
            .filter_map(|lineage| tables.lineage(lineage).map(|lineage| lineage.key))
            .collect();
        if let Some(prefix) = common_prefix(&keys)
            && prefix.0[0].is_some()
        {
            prefixes.push((bin.id, prefix));
        }
    }

    let ids = tables.bulk_create_lineages(prefixes.iter().map(|(_, key)| *key));
    for ((bin, _), lineage) in prefixes.iter().zip(ids) {
        tables.set_bin_lineage(*bin, Some(lineage))?;
    }
    Ok(prefixes.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn classified_trims_placeholder_tail() {
        let lineage = names(&[
            "Bacteria",
            "Proteobacteria",
            "UNCLASSIFIED_Proteobacteria_CLASS",
            "UNCLASSIFIED_UNCLASSIFIED_Proteobacteria_CLASS_ORDER",
        ]);
        assert_eq!(classified(&lineage), names(&["Bacteria", "Proteobacteria"]));
        assert_eq!(classified(&names(&["Bacteria", "Firmicutes"])).len(), 2);
        assert!(classified(&[]).is_empty());
    }

    #[test]
    fn too_deep_lineage_is_rejected() {
        let resolver = LineageResolver::default();
        let err = resolver.key_for("a;b;c;d;e;f;g;h;i").unwrap_err();
        assert!(matches!(err, IngestError::LineageTooDeep(_)));
    }
}
