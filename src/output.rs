use std::io::{self, Write};

use serde::Serialize;

use crate::fasta::StoredSequence;
use crate::loader::{LoadReport, ProgressEvent, ProgressSink, StageStatus, StatusReport, SyncReport};
use crate::taxonomy::format_lineage;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_load(report: &LoadReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_sync(report: &SyncReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_status(report: &StatusReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_sequence(sequence: &StoredSequence) -> io::Result<()> {
        #[derive(Serialize)]
        struct Entry<'a> {
            header: &'a str,
            sequence: &'a str,
        }
        Self::print_json(&Entry {
            header: &sequence.header,
            sequence: &sequence.sequence,
        })
    }

    pub fn print_lineage(names: &[String]) -> io::Result<()> {
        Self::print_json(&names)
    }

    pub fn print_deleted(sample: &str, bins: usize) -> io::Result<()> {
        #[derive(Serialize)]
        struct Deleted<'a> {
            sample: &'a str,
            bins: usize,
        }
        Self::print_json(&Deleted { sample, bins })
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Plain summaries on stdout, progress on stderr.
pub struct TextOutput;

impl TextOutput {
    pub fn print_load(report: &LoadReport) {
        if let Some(sync) = &report.sync {
            Self::print_sync(sync);
        }
        if let Some(taxonomy) = &report.taxonomy {
            println!(
                "taxonomy: {} names, {} taxa, {} lineages",
                taxonomy.names_created, taxonomy.taxa.taxa, taxonomy.taxa.lineages_created
            );
        }
        for outcome in &report.stages {
            if outcome.status == StageStatus::Skipped {
                continue;
            }
            let status = match outcome.status {
                StageStatus::Loaded => "loaded",
                StageStatus::Skipped => "skipped",
                StageStatus::Waiting => "waiting",
                StageStatus::NoData => "no data",
            };
            match outcome.records {
                Some(records) => println!(
                    "{:<16} {:<9} {status} ({records})",
                    outcome.sample, outcome.stage.as_str()
                ),
                None => println!("{:<16} {:<9} {status}", outcome.sample, outcome.stage.as_str()),
            }
        }
        println!("{} stage(s) loaded", report.loaded());
    }

    pub fn print_sync(report: &SyncReport) {
        println!(
            "samples: {} listed, {} new, {} not listed",
            report.listed,
            report.created.len(),
            report.extra.len()
        );
    }

    pub fn print_status(report: &StatusReport) {
        let taxonomy = if report.taxonomy_loaded { "loaded" } else { "not loaded" };
        println!("taxonomy: {taxonomy} ({} taxa)", report.taxa);
        for sample in &report.samples {
            let completed: Vec<&str> = sample.completed.iter().map(|stage| stage.as_str()).collect();
            let bins: Vec<String> = sample
                .bins
                .iter()
                .map(|(method, count)| format!("{method}:{count}"))
                .collect();
            println!(
                "{:<16} contigs={} genes={} proteins={} bins=[{}] done=[{}]",
                sample.accession,
                sample.contigs,
                sample.genes,
                sample.proteins,
                bins.join(","),
                completed.join(",")
            );
        }
    }

    pub fn print_lineage(names: &[String]) {
        println!("{}", format_lineage(names));
    }
}

impl ProgressSink for TextOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{}", event.message),
        }
    }
}
