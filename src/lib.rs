//! Downloads and parses GEO and SRA metadata into standard sample
//! annotation sheets, and optionally fetches the data behind it: raw
//! sequencing runs through the sratoolkit, or processed supplementary
//! files straight from GEO. [`Finder`] searches GEO for recently
//! updated series to feed into the pipeline.

pub mod accession;
pub mod app;
pub mod error;
pub mod expand;
pub mod finder;
pub mod ncbi;
pub mod output;
pub mod processed;
pub mod sanitize;
pub mod separate;
pub mod soft;
pub mod sra;

pub use accession::{Accession, AccessionType};
pub use app::{parse_accessions, Geofetcher, GeofetchOptions};
pub use error::GeofetchError;
pub use finder::Finder;
pub use output::FetchSummary;
pub use soft::{parse_gsm_soft, FieldValue, Record};
