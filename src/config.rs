use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::BinMethod;
use crate::error::IngestError;

pub const DEFAULT_CONFIG_FILE: &str = "omics-ingest.json";
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_SAMPLE_LIST: &str = "sample_list.txt";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub data_root: String,
    #[serde(default)]
    pub store: Option<String>,
    #[serde(default)]
    pub sample_list: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    #[serde(default)]
    pub decompressor: Option<DecompressorEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DecompressorEntry {
    Shorthand(String),
    Detailed(DecompressorObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DecompressorObject {
    pub program: String,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecompressorSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub data_root: Utf8PathBuf,
    pub store: Utf8PathBuf,
    pub sample_list: Utf8PathBuf,
    pub batch_size: usize,
    pub limit: Option<usize>,
    pub methods: Vec<BinMethod>,
    pub decompressor: Option<DecompressorSpec>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, IngestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(IngestError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| IngestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| IngestError::ConfigParse(err.to_string()))?;
        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, IngestError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let data_root = Utf8PathBuf::from(config.data_root);

        let store = match config.store {
            Some(value) => Utf8PathBuf::from(value),
            None => default_store_path()?,
        };

        let sample_list = match config.sample_list {
            Some(value) => {
                let path = Utf8PathBuf::from(value);
                if path.is_absolute() {
                    path
                } else {
                    data_root.join(path)
                }
            }
            None => data_root.join(DEFAULT_SAMPLE_LIST),
        };

        let batch_size = config.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(IngestError::ConfigParse(
                "batch_size must be greater than zero".to_string(),
            ));
        }

        let methods = match config.methods {
            Some(values) => values
                .iter()
                .map(|value| {
                    value
                        .parse::<BinMethod>()
                        .map_err(|err| IngestError::ConfigParse(err.to_string()))
                })
                .collect::<Result<Vec<_>, IngestError>>()?,
            None => BinMethod::ALL.to_vec(),
        };

        let decompressor = config.decompressor.map(|entry| match entry {
            DecompressorEntry::Shorthand(program) => DecompressorSpec {
                program,
                args: default_decompressor_args(),
                timeout: Duration::from_secs(DEFAULT_DECOMPRESSOR_TIMEOUT_SECS),
            },
            DecompressorEntry::Detailed(obj) => DecompressorSpec {
                program: obj.program,
                args: obj.args.unwrap_or_else(default_decompressor_args),
                timeout: Duration::from_secs(
                    obj.timeout_secs
                        .unwrap_or(DEFAULT_DECOMPRESSOR_TIMEOUT_SECS),
                ),
            },
        });

        Ok(ResolvedConfig {
            schema_version,
            data_root,
            store,
            sample_list,
            batch_size,
            limit: config.limit,
            methods,
            decompressor,
        })
    }
}

const DEFAULT_DECOMPRESSOR_TIMEOUT_SECS: u64 = 15;

pub fn default_decompressor_args() -> Vec<String> {
    vec!["-c".to_string()]
}

pub fn default_store_path() -> Result<Utf8PathBuf, IngestError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.data_dir().join("omics-ingest").join("store.json"))
                .ok()
        })
        .ok_or_else(|| IngestError::Filesystem("unable to resolve data directory".to_string()))
}
