use std::fs;
use std::io::{self, Write};
use std::path::Path;

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use tracing::info;

use crate::error::GeofetchError;
use crate::soft::Record;

/// Fixed column subset for annotation sheets, used with `--use-key-subset`
/// instead of taking every key GEO provides.
pub const ANNOTATION_SHEET_KEYS: &[&str] = &[
    "sample_name",
    "protocol",
    "read_type",
    "organism",
    "data_source",
    "Sample_title",
    "Sample_source_name_ch1",
    "Sample_organism_ch1",
    "Sample_library_selection",
    "Sample_library_strategy",
    "Sample_type",
    "SRR",
    "SRX",
    "Sample_geo_accession",
    "Sample_series_id",
    "Sample_instrument_model",
];

/// Built-in project config template; placeholders are substituted
/// textually, matching how user-supplied templates are treated.
pub const DEFAULT_CONFIG_TEMPLATE: &str = "\
# Project config file generated by geofetch {generated_at}
name: {project_name}
pep_version: 2.0.0
sample_table: {annotation}
subsample_table: {subannotation}
experiment_metadata:
{project_metadata}
looper:
  pipeline_interfaces: {pipeline_interfaces}
";

/// Write a sample annotation sheet. The header is the union of keys across
/// all records, in first-seen order, unless the fixed subset is requested;
/// cells missing on a record are left empty.
pub fn write_annotation(
    table: &IndexMap<String, Record>,
    path: &Path,
    use_key_subset: bool,
) -> Result<(), GeofetchError> {
    let keys: Vec<String> = if use_key_subset {
        ANNOTATION_SHEET_KEYS.iter().map(|key| key.to_string()).collect()
    } else {
        union_of_keys(table.values())
    };
    info!(path = %path.display(), "writing sample annotation sheet");
    write_record_csv(table.values(), &keys, path)
}

/// Write processed-file records (sample- or series-level) as a CSV with a
/// union-of-keys header.
pub fn write_processed_annotation(records: &[Record], path: &Path) -> Result<(), GeofetchError> {
    let keys = union_of_keys(records.iter());
    info!(path = %path.display(), "writing processed file sheet");
    write_record_csv(records.iter(), &keys, path)
}

fn union_of_keys<'a>(records: impl Iterator<Item = &'a Record>) -> Vec<String> {
    let keys: IndexSet<String> = records.flat_map(|record| record.keys().cloned()).collect();
    keys.into_iter().collect()
}

fn write_record_csv<'a>(
    records: impl Iterator<Item = &'a Record>,
    keys: &[String],
    path: &Path,
) -> Result<(), GeofetchError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
    }
    let mut writer =
        csv::Writer::from_path(path).map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
    writer
        .write_record(keys)
        .map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
    for record in records {
        let row: Vec<String> = keys
            .iter()
            .map(|key| record.get(key).map(|value| value.to_string()).unwrap_or_default())
            .collect();
        writer
            .write_record(&row)
            .map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
    }
    writer
        .flush()
        .map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Write the subsample table: one row per additional run of a multi-run
/// experiment, under the conventional `sample_name,SRX,SRR` header.
pub fn write_subannotation(
    tables: &IndexMap<String, Vec<[String; 3]>>,
    path: &Path,
) -> Result<(), GeofetchError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
    }
    info!(path = %path.display(), "writing sample subannotation sheet");
    let mut writer =
        csv::Writer::from_path(path).map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
    writer
        .write_record(["sample_name", "SRX", "SRR"])
        .map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
    for rows in tables.values() {
        for row in rows {
            writer
                .write_record(row)
                .map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
        }
    }
    writer
        .flush()
        .map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Substitution values for the project config template.
pub struct ConfigValues<'a> {
    pub project_name: &'a str,
    pub annotation: &'a str,
    pub subannotation: &'a str,
    pub pipeline_interfaces: &'a str,
    pub project_metadata: &'a [Record],
}

/// Render the config template by plain placeholder substitution. The
/// project-level constant attributes land as an indented block under
/// `experiment_metadata`.
pub fn render_config(template: &str, values: &ConfigValues<'_>) -> String {
    let metadata_block = if values.project_metadata.is_empty() {
        "  {}".to_string()
    } else {
        values
            .project_metadata
            .iter()
            .flat_map(|entry| entry.iter())
            .map(|(key, value)| format!("  {key}: \"{value}\""))
            .collect::<Vec<_>>()
            .join("\n")
    };
    template
        .replace("{generated_at}", &chrono::Utc::now().to_rfc3339())
        .replace("{project_name}", values.project_name)
        .replace("{annotation}", values.annotation)
        .replace("{subannotation}", values.subannotation)
        .replace("{pipeline_interfaces}", values.pipeline_interfaces)
        .replace("{project_metadata}", &metadata_block)
}

/// Machine-readable run summary, printed in non-interactive use.
#[derive(Debug, Clone, Serialize, Default)]
pub struct FetchSummary {
    pub accessions_processed: usize,
    pub samples: usize,
    pub failed_runs: Vec<String>,
    pub annotation: Option<String>,
    pub subannotation: Option<String>,
    pub config: Option<String>,
}

pub fn print_json(summary: &FetchSummary) -> io::Result<()> {
    let json = serde_json::to_string_pretty(summary).map_err(io::Error::other)?;
    let mut stdout = io::stdout();
    stdout.write_all(json.as_bytes())?;
    stdout.write_all(b"\n")?;
    Ok(())
}
