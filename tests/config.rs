use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use omics_ingest::config::{Config, ConfigLoader, DecompressorEntry, DecompressorSpec};
use omics_ingest::domain::BinMethod;
use omics_ingest::error::IngestError;

fn write_config(content: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("omics-ingest.json");
    fs::write(&path, content).unwrap();
    let path = path.to_str().unwrap().to_string();
    (dir, path)
}

#[test]
fn parse_config_shorthand() {
    let (_dir, path) = write_config(
        r#"{
            "data_root": "/data/omics",
            "store": "/tmp/store.json",
            "sample_list": "lists/run1.txt",
            "methods": ["max", "MET_P99S99E300"],
            "decompressor": "unpigz"
        }"#,
    );

    let resolved = ConfigLoader::resolve(Some(&path)).unwrap();
    assert_eq!(resolved.data_root, "/data/omics");
    assert_eq!(resolved.sample_list, "/data/omics/lists/run1.txt");
    assert_eq!(resolved.methods, vec![BinMethod::Max, BinMethod::Met99]);
    assert_eq!(
        resolved.decompressor,
        Some(DecompressorSpec {
            program: "unpigz".to_string(),
            args: vec!["-c".to_string()],
            timeout: Duration::from_secs(15),
        })
    );
}

#[test]
fn parse_config_detailed_decompressor() {
    let (_dir, path) = write_config(
        r#"{
            "data_root": "/data/omics",
            "store": "/tmp/store.json",
            "batch_size": 50,
            "limit": 10,
            "decompressor": { "program": "/usr/bin/pigz", "args": ["-dc", "-p", "4"], "timeout_secs": 60 }
        }"#,
    );

    let resolved = ConfigLoader::resolve(Some(&path)).unwrap();
    assert_eq!(resolved.batch_size, 50);
    assert_eq!(resolved.limit, Some(10));
    let decompressor = resolved.decompressor.unwrap();
    assert_eq!(decompressor.program, "/usr/bin/pigz");
    assert_eq!(decompressor.args, vec!["-dc", "-p", "4"]);
    assert_eq!(decompressor.timeout, Duration::from_secs(60));
}

#[test]
fn zero_batch_size_rejected() {
    let (_dir, path) = write_config(r#"{ "data_root": "/d", "store": "/s.json", "batch_size": 0 }"#);
    assert_matches!(ConfigLoader::resolve(Some(&path)), Err(IngestError::ConfigParse(_)));
}

#[test]
fn unknown_method_rejected() {
    let config = Config {
        schema_version: Some(1),
        data_root: "/d".to_string(),
        store: Some("/s.json".to_string()),
        sample_list: None,
        batch_size: None,
        limit: None,
        methods: Some(vec!["CONCOCT".to_string()]),
        decompressor: Some(DecompressorEntry::Shorthand("gzip".to_string())),
    };
    assert_matches!(ConfigLoader::resolve_config(config), Err(IngestError::ConfigParse(_)));
}

#[test]
fn explicit_missing_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    let result = ConfigLoader::resolve(Some(path.to_str().unwrap()));
    assert_matches!(result, Err(IngestError::ConfigRead(_)));
}

#[test]
fn malformed_json_rejected() {
    let (_dir, path) = write_config("{ \"data_root\": ");
    assert_matches!(ConfigLoader::resolve(Some(&path)), Err(IngestError::ConfigParse(_)));
}
