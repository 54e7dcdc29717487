use std::collections::HashMap;

use regex::RegexBuilder;
use tracing::{debug, warn};

use crate::error::GeofetchError;
use crate::sanitize::{sanitize_name, unique_name};
use crate::soft::{
    FieldValue, Record, merge_field, parse_soft_line, SAMPLE_TABLE_BEGIN, SAMPLE_TABLE_END,
};

const SERIES_SUPP_KEY: &str = "Series_supplementary_file";
const SAMPLE_SUPP_KEY: &str = "Sample_supplementary_file";

/// Where a tar filelist comes from. The GSE pass needs one network fetch
/// (the `filelist.txt` sibling of a `.tar` supplementary file); keeping it
/// behind a trait lets tests feed a canned table.
pub trait FilelistSource {
    fn fetch_filelist(&self, url: &str) -> Result<String, GeofetchError>;
}

/// One row of a GEO archive filelist: tab-separated `Name`/`Size`/`Type`
/// columns, located by header name since GEO does not fix their order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileListEntry {
    pub name: String,
    pub size: String,
    pub kind: String,
}

pub fn parse_filelist(text: &str) -> Result<Vec<FileListEntry>, GeofetchError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .map_err(|err| GeofetchError::RunInfoParse(err.to_string()))?
        .clone();
    let position = |name: &str| headers.iter().position(|header| header == name);
    let (Some(name_idx), Some(size_idx), Some(kind_idx)) =
        (position("Name"), position("Size"), position("Type"))
    else {
        return Err(GeofetchError::RunInfoParse(
            "filelist is missing Name/Size/Type columns".to_string(),
        ));
    };

    let mut entries = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|err| GeofetchError::RunInfoParse(err.to_string()))?;
        let field = |idx: usize| row.get(idx).unwrap_or("").to_string();
        entries.push(FileListEntry {
            name: field(name_idx),
            size: field(size_idx),
            kind: field(kind_idx),
        });
    }
    Ok(entries)
}

/// Supplementary/processed file records recovered from a GSE+GSM SOFT pair.
/// Same record shape on both sides; `series` entries belong to the series
/// itself, `samples` entries to individual GSM blocks.
#[derive(Debug, Default)]
pub struct ProcessedFiles {
    pub samples: Vec<Record>,
    pub series: Vec<Record>,
}

struct PendingFiles {
    record: Record,
    files: Vec<String>,
}

/// Walk the GSE and GSM line sequences and recover one record per
/// supplementary file.
///
/// The series pass collects series-level fields and supplementary URLs. A
/// `.tar` supplementary file triggers a fetch of its sibling
/// `filelist.txt`, whose rows later annotate per-file size and type, and a
/// sample pass over the GSM lines that gathers each sample's own
/// supplementary files. Non-archive URLs attach to the series itself.
pub fn collect_processed_files(
    gse_lines: &[String],
    gsm_lines: &[String],
    source: &dyn FilelistSource,
) -> ProcessedFiles {
    let mut series_record = Record::new();
    let mut series_urls: Vec<String> = Vec::new();
    let mut tar_urls: Vec<String> = Vec::new();

    for line in gse_lines {
        if line.is_empty() || line.starts_with('^') {
            continue;
        }
        let (key, value) = match parse_soft_line(line) {
            Ok(pair) => pair,
            Err(_) => {
                debug!(line = line.as_str(), "skipping unparseable series SOFT line");
                continue;
            }
        };
        if key == SERIES_SUPP_KEY {
            let url = value.trim().to_string();
            if basename(&url).ends_with(".tar") {
                tar_urls.push(url);
            } else {
                series_urls.push(url);
            }
        } else {
            merge_field(&mut series_record, &key, value);
        }
    }

    if let Some(accession) = series_record
        .get("Series_geo_accession")
        .and_then(FieldValue::as_text)
    {
        debug!(series = accession, "collecting processed files");
    }

    // One filelist per archive; merged so sample files from any of the
    // series' archives pick up their size and type.
    let mut filelist: HashMap<String, FileListEntry> = HashMap::new();
    for url in &tar_urls {
        let filelist_url = sibling_filelist_url(url);
        match source
            .fetch_filelist(&filelist_url)
            .and_then(|text| parse_filelist(&text))
        {
            Ok(entries) => {
                for entry in entries {
                    filelist.insert(entry.name.clone(), entry);
                }
            }
            Err(err) => warn!(url = %filelist_url, %err, "could not read archive filelist"),
        }
    }

    let mut result = ProcessedFiles::default();

    if !tar_urls.is_empty() {
        let samples = collect_sample_files(gsm_lines);
        result.samples = explode_files(samples, &filelist);
    }
    if !series_urls.is_empty() {
        result.series = explode_files(
            vec![PendingFiles {
                record: series_record,
                files: series_urls,
            }],
            &filelist,
        );
    }
    result
}

/// GSM pass: same `^`-marker and embedded-table skip rules as the metadata
/// parser, but only `Sample_supplementary_file` URLs are pulled out into a
/// per-sample file list. Samples without any files are dropped.
fn collect_sample_files(gsm_lines: &[String]) -> Vec<PendingFiles> {
    let mut samples: Vec<PendingFiles> = Vec::new();
    let mut current: Option<PendingFiles> = None;
    let mut skipping = false;

    for line in gsm_lines {
        if line.is_empty() {
            continue;
        }
        if skipping {
            if line.starts_with(SAMPLE_TABLE_END) {
                skipping = false;
            }
            continue;
        }
        if line.starts_with(SAMPLE_TABLE_BEGIN) {
            skipping = true;
            continue;
        }
        if line.starts_with('^') {
            if let Some(done) = current.take() {
                if !done.files.is_empty() {
                    samples.push(done);
                }
            }
            current = Some(PendingFiles {
                record: Record::new(),
                files: Vec::new(),
            });
            continue;
        }
        let Some(pending) = current.as_mut() else {
            continue;
        };
        let (key, value) = match parse_soft_line(line) {
            Ok(pair) => pair,
            Err(_) => {
                debug!(line = line.as_str(), "skipping unparseable sample SOFT line");
                continue;
            }
        };
        if key.starts_with(SAMPLE_SUPP_KEY) {
            let url = value.trim();
            if !url.is_empty() && url.to_uppercase() != "NONE" {
                pending.files.push(url.to_string());
            }
        } else {
            merge_field(&mut pending.record, &key, value);
        }
    }
    if let Some(done) = current.take() {
        if !done.files.is_empty() {
            samples.push(done);
        }
    }
    samples
}

/// Explode each owner's file list into one record per file, then split
/// each file into `file_url` (full) and `file` (basename), derive a
/// sanitized, deduplicated `sample_name`, and annotate size/type from the
/// archive filelist when the basename is known there.
fn explode_files(
    owners: Vec<PendingFiles>,
    filelist: &HashMap<String, FileListEntry>,
) -> Vec<Record> {
    let mut records: Vec<Record> = Vec::new();
    let mut used_names: Vec<String> = Vec::new();

    for owner in owners {
        for file_url in owner.files {
            let mut record = owner.record.clone();
            let base = basename(&file_url);

            let title = record
                .get("Sample_title")
                .and_then(FieldValue::as_text)
                .filter(|title| !title.is_empty())
                .map(str::to_string);
            let raw_name = title.unwrap_or_else(|| base.clone());
            let name = unique_name(&sanitize_name(&raw_name), &used_names);
            used_names.push(name.clone());

            record.insert("sample_name".to_string(), FieldValue::Text(name));
            record.insert("file".to_string(), FieldValue::Text(base.clone()));
            record.insert("file_url".to_string(), FieldValue::Text(file_url));
            if let Some(entry) = filelist.get(&base) {
                record.insert(
                    "file_size".to_string(),
                    FieldValue::Text(entry.size.clone()),
                );
                record.insert("type".to_string(), FieldValue::Text(entry.kind.clone()));
            }
            records.push(record);
        }
    }
    records
}

fn basename(url: &str) -> String {
    url.rsplit('/').next().unwrap_or(url).to_string()
}

fn sibling_filelist_url(tar_url: &str) -> String {
    match tar_url.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/filelist.txt"),
        None => "filelist.txt".to_string(),
    }
}

/// Keep only records whose `file` matches `pattern`, case-insensitively.
/// Running the filter again over its own output returns the same list.
pub fn run_filter(records: &[Record], pattern: &str) -> Result<Vec<Record>, GeofetchError> {
    let re = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|err| GeofetchError::InvalidFilter(err.to_string()))?;
    Ok(records
        .iter()
        .filter(|record| {
            record
                .get("file")
                .map(|file| re.is_match(&file.to_string()))
                .unwrap_or(false)
        })
        .cloned()
        .collect())
}

/// Keep only records whose `file_size` is at most `cap` bytes. Records
/// with a missing or unreadable size are kept, with a warning.
pub fn run_size_filter(records: &[Record], cap: u64) -> Vec<Record> {
    records
        .iter()
        .filter(|record| {
            let Some(size) = record.get("file_size") else {
                warn!("record has no file_size; keeping it");
                return true;
            };
            match convert_size(&size.to_string()) {
                Ok(bytes) => bytes <= cap,
                Err(err) => {
                    warn!(%err, "unreadable file_size; keeping record");
                    true
                }
            }
        })
        .cloned()
        .collect()
}

/// Convert a human-readable size like `"2MB"` to bytes. Powers of 1024; a
/// bare numeral is treated as a byte count already.
pub fn convert_size(size: &str) -> Result<u64, GeofetchError> {
    let trimmed = size.trim().to_lowercase();
    let digits_end = trimmed
        .find(|ch: char| ch.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(digits_end);
    let number: f64 = number
        .trim()
        .parse()
        .map_err(|_| GeofetchError::SizeFormat(size.to_string()))?;
    let multiplier: u64 = match suffix.trim() {
        "" | "b" => 1,
        "kb" => 1024,
        "mb" => 1024 * 1024,
        "gb" => 1024 * 1024 * 1024,
        _ => return Err(GeofetchError::SizeFormat(size.to_string())),
    };
    Ok((number * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn convert_known_suffixes() {
        assert_eq!(convert_size("2MB").unwrap(), 2_097_152);
        assert_eq!(convert_size("13KB").unwrap(), 13_312);
        assert_eq!(convert_size("4B").unwrap(), 4);
        assert_eq!(convert_size("1gb").unwrap(), 1_073_741_824);
    }

    #[test]
    fn convert_bare_numeral_is_bytes() {
        assert_eq!(convert_size("500").unwrap(), 500);
    }

    #[test]
    fn convert_rejects_garbage() {
        assert_matches!(convert_size("huge"), Err(GeofetchError::SizeFormat(_)));
        assert_matches!(convert_size("2TiB"), Err(GeofetchError::SizeFormat(_)));
    }

    fn file_record(name: &str, size: &str) -> Record {
        let mut record = Record::new();
        record.insert("file".to_string(), FieldValue::Text(name.to_string()));
        if !size.is_empty() {
            record.insert("file_size".to_string(), FieldValue::Text(size.to_string()));
        }
        record
    }

    #[test]
    fn name_filter_is_idempotent() {
        let records = vec![
            file_record("GSM1_peaks.BED.gz", "1024"),
            file_record("GSM2_counts.csv.gz", "2048"),
            file_record("GSM3_peaks.bed.gz", "4096"),
        ];
        let once = run_filter(&records, r"\.bed\.gz$").unwrap();
        assert_eq!(once.len(), 2);
        let twice = run_filter(&once, r"\.bed\.gz$").unwrap();
        assert_eq!(twice, once);
    }

    #[test]
    fn size_filter_is_idempotent_and_keeps_unreadable_sizes() {
        let records = vec![
            file_record("small.bed.gz", "1024"),
            file_record("big.bed.gz", "900000000"),
            file_record("sizeless.bed.gz", ""),
        ];
        let once = run_size_filter(&records, 1024 * 1024);
        assert_eq!(once.len(), 2);
        assert!(once.iter().any(|r| r["file"].to_string() == "sizeless.bed.gz"));
        let twice = run_size_filter(&once, 1024 * 1024);
        assert_eq!(twice, once);
    }

    #[test]
    fn filelist_columns_found_by_name() {
        let text = "Size\tName\tType\n1024\tGSM1_peaks.bed.gz\tBED\n";
        let entries = parse_filelist(text).unwrap();
        assert_eq!(
            entries,
            vec![FileListEntry {
                name: "GSM1_peaks.bed.gz".to_string(),
                size: "1024".to_string(),
                kind: "BED".to_string(),
            }]
        );
    }

    #[test]
    fn sibling_filelist_derivation() {
        assert_eq!(
            sibling_filelist_url("https://host/geo/suppl/GSE1_RAW.tar"),
            "https://host/geo/suppl/filelist.txt"
        );
    }
}
