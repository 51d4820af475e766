pub mod bins;
pub mod checkm;
pub mod config;
pub mod coverage;
pub mod decompress;
pub mod domain;
pub mod error;
pub mod fasta;
pub mod layout;
pub mod loader;
pub mod output;
pub mod store;
pub mod taxonomy;
