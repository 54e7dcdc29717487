use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum GeofetchError {
    #[error("unknown accession type for '{accession}': '{prefix}'; supported types: GSE, GSM, SRP, SRX")]
    UnknownAccessionType { accession: String, prefix: String },

    #[error("not an integral accession number: '{accession}' ('{suffix}')")]
    MalformedAccession { accession: String, suffix: String },

    #[error("SOFT line has no key/value separator: {0}")]
    InvalidSoftLine(String),

    #[error("request failed for {url}: {message}")]
    Transport { url: String, message: String },

    #[error("{url} returned status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("failed to read accession list at {0}")]
    InputRead(PathBuf),

    #[error("failed to read config template at {0}")]
    TemplateRead(PathBuf),

    #[error("malformed run-info table: {0}")]
    RunInfoParse(String),

    #[error("unsupported size format: {0}")]
    SizeFormat(String),

    #[error("invalid filter regex: {0}")]
    InvalidFilter(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("prefetch retries exhausted for run {0}")]
    RunDownload(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
