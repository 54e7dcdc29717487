use std::fmt;

use indexmap::IndexMap;
use regex::Regex;
use tracing::debug;

use crate::error::GeofetchError;

/// A single metadata field. GEO repeats keys freely (`!Sample_characteristics_ch1`
/// appears once per characteristic), so a field is either a scalar or an
/// ordered list of every value seen, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(value) => Some(value),
            FieldValue::List(_) => None,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, FieldValue::List(_))
    }

    /// Append another value, promoting a scalar to a list on the second
    /// occurrence of the same key.
    pub fn push(&mut self, value: String) {
        match self {
            FieldValue::Text(first) => {
                *self = FieldValue::List(vec![std::mem::take(first), value]);
            }
            FieldValue::List(values) => values.push(value),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(value) => write!(f, "{value}"),
            FieldValue::List(values) => write!(f, "{}", values.join(", ")),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

/// One parsed SOFT record (a sample or a series): field name in original
/// case, mapped to its value. Insertion order mirrors the file.
pub type Record = IndexMap<String, FieldValue>;

/// Merge a parsed key/value into a record, promoting repeated keys to lists.
pub fn merge_field(record: &mut Record, key: &str, value: String) {
    match record.get_mut(key) {
        Some(existing) => existing.push(value),
        None => {
            record.insert(key.to_string(), FieldValue::Text(value));
        }
    }
}

/// Parse one SOFT line of the form `!key = value` or `^MARKER = value`.
///
/// The split happens at the first `=` only; any further `=` characters
/// belong to the value (`!url = http://x?a=b` must keep `a=b`). A line with
/// no `=` at all is an error the caller is expected to skip, not a reason
/// to abandon the file.
pub fn parse_soft_line(line: &str) -> Result<(String, String), GeofetchError> {
    let body = line.get(1..).unwrap_or("");
    let (key, value) = body
        .split_once('=')
        .ok_or_else(|| GeofetchError::InvalidSoftLine(line.to_string()))?;
    Ok((key.trim_end().to_string(), value.trim_start().to_string()))
}

/// Accession pattern for SRA experiments embedded in GSM relation lines.
pub const EXPERIMENT_PATTERN: &str = r"SRX\d{4,8}";
/// Accession pattern for SRA projects embedded in GSE relation lines.
pub const PROJECT_PATTERN: &str = r"SRP\d{4,8}";

/// Marker opening GEO's embedded per-sample expression table. Everything up
/// to [`SAMPLE_TABLE_END`] duplicates fields we already collect, so the
/// whole region is skipped.
pub const SAMPLE_TABLE_BEGIN: &str = "!sample_table_begin";
pub const SAMPLE_TABLE_END: &str = "!sample_table_end";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Idle,
    InRecord,
    SkippingEmbeddedTable,
}

/// Result of a GSM SOFT parse: one record per sample, keyed by SRX
/// accession where one was discovered, otherwise by GSM accession.
#[derive(Debug, Default)]
pub struct GsmTable {
    pub records: IndexMap<String, Record>,
    pub samples_processed: usize,
}

/// State machine over the line sequence of a GSM SOFT file.
///
/// `^`-marker lines open a new sample record; non-marker lines merge into
/// the current one. The first `SRX` accession spotted inside a sample block
/// re-keys that record from its GSM id to the SRX id (once, and only once,
/// per block), stashing the GSM id under `gsm_id`.
pub struct GsmSoftParser<'a> {
    limit: &'a IndexMap<String, String>,
    table: IndexMap<String, Record>,
    state: ParserState,
    current: Option<String>,
    srx_converted: bool,
    samples_processed: usize,
    experiment_re: Regex,
}

impl<'a> GsmSoftParser<'a> {
    /// `limit` maps GSM accessions to caller-chosen display names; an empty
    /// map means every sample in the file is kept.
    pub fn new(limit: &'a IndexMap<String, String>) -> Self {
        Self {
            limit,
            table: IndexMap::new(),
            state: ParserState::Idle,
            current: None,
            srx_converted: false,
            samples_processed: 0,
            experiment_re: Regex::new(EXPERIMENT_PATTERN).unwrap(),
        }
    }

    pub fn feed_line(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        if self.state == ParserState::SkippingEmbeddedTable {
            if line.starts_with(SAMPLE_TABLE_END) {
                self.state = if self.current.is_some() {
                    ParserState::InRecord
                } else {
                    ParserState::Idle
                };
            }
            return;
        }
        if line.starts_with(SAMPLE_TABLE_BEGIN) {
            self.state = ParserState::SkippingEmbeddedTable;
            return;
        }
        if line.starts_with('^') {
            self.open_record(line);
            return;
        }
        if self.state == ParserState::InRecord {
            self.merge_line(line);
        }
    }

    pub fn finish(self) -> GsmTable {
        GsmTable {
            records: self.table,
            samples_processed: self.samples_processed,
        }
    }

    fn open_record(&mut self, line: &str) {
        let Ok((_, sample_id)) = parse_soft_line(line) else {
            debug!(line, "unparseable record marker");
            return;
        };
        if !self.limit.is_empty() && !self.limit.contains_key(&sample_id) {
            // Caller restricted processing to a subset of this series.
            self.current = None;
            self.state = ParserState::Idle;
            return;
        }
        debug!(sample = %sample_id, "found sample");
        let mut record = Record::new();
        for key in ["sample_name", "protocol", "organism", "read_type"] {
            record.insert(key.to_string(), FieldValue::Text(String::new()));
        }
        self.table.insert(sample_id.clone(), record);
        self.current = Some(sample_id);
        self.srx_converted = false;
        self.samples_processed += 1;
        self.state = ParserState::InRecord;
    }

    fn merge_line(&mut self, line: &str) {
        let Some(current_id) = self.current.clone() else {
            return;
        };
        let (key, value) = match parse_soft_line(line) {
            Ok(pair) => pair,
            Err(_) => {
                debug!(sample = %current_id, line, "skipping unparseable SOFT line");
                return;
            }
        };
        if let Some(record) = self.table.get_mut(&current_id) {
            merge_field(record, &key, value);
        }
        if !self.srx_converted {
            if let Some(found) = self.experiment_re.find(line) {
                self.rekey_to_srx(&current_id, found.as_str());
            }
        }
    }

    /// Move the current record from its GSM key to the discovered SRX key.
    /// Happens at most once per sample block; later SRX mentions in the same
    /// block are left alone.
    fn rekey_to_srx(&mut self, gsm_id: &str, srx_id: &str) {
        debug!(srx = srx_id, gsm = gsm_id, "linking sample to SRA experiment");
        if let Some(mut record) = self.table.shift_remove(gsm_id) {
            record.insert("gsm_id".to_string(), FieldValue::Text(gsm_id.to_string()));
            self.table.insert(srx_id.to_string(), record);
        }
        self.current = Some(srx_id.to_string());
        self.srx_converted = true;
    }
}

/// Parse the full line sequence of a GSM SOFT file.
pub fn parse_gsm_soft(lines: &[String], limit: &IndexMap<String, String>) -> GsmTable {
    let mut parser = GsmSoftParser::new(limit);
    for line in lines {
        parser.feed_line(line);
    }
    parser.finish()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn line_value_keeps_embedded_equals() {
        let (key, value) = parse_soft_line("!k = a=b=c").unwrap();
        assert_eq!(key, "k");
        assert_eq!(value, "a=b=c");
    }

    #[test]
    fn line_without_separator_fails() {
        let err = parse_soft_line("!no separator here").unwrap_err();
        assert_matches!(err, GeofetchError::InvalidSoftLine(_));
    }

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|line| line.to_string()).collect()
    }

    #[test]
    fn first_srx_mention_wins_the_record_key() {
        let table = parse_gsm_soft(
            &lines(&[
                "^SAMPLE = GSM100",
                "!Sample_title = liver",
                "!Sample_relation = SRA: https://www.ncbi.nlm.nih.gov/sra?term=SRX700001",
                "!Sample_relation = SRA: https://www.ncbi.nlm.nih.gov/sra?term=SRX700002",
            ]),
            &IndexMap::new(),
        );
        assert_eq!(table.records.len(), 1);
        assert!(table.records.contains_key("SRX700001"));
        assert!(!table.records.contains_key("SRX700002"));
        let record = &table.records["SRX700001"];
        assert_eq!(
            record.get("gsm_id").and_then(FieldValue::as_text),
            Some("GSM100")
        );
        // Both relation lines still land in the record as a list.
        assert!(record.get("Sample_relation").is_some_and(FieldValue::is_list));
    }

    #[test]
    fn embedded_sample_table_region_is_dropped() {
        let table = parse_gsm_soft(
            &lines(&[
                "^SAMPLE = GSM100",
                "!Sample_title = liver",
                "!sample_table_begin",
                "!Sample_title = from the expression table",
                "ID_REF\tVALUE",
                "!sample_table_end",
                "!Sample_organism_ch1 = Homo sapiens",
            ]),
            &IndexMap::new(),
        );
        let record = &table.records["GSM100"];
        assert_eq!(
            record.get("Sample_title"),
            Some(&FieldValue::Text("liver".to_string()))
        );
        assert_eq!(
            record.get("Sample_organism_ch1").and_then(FieldValue::as_text),
            Some("Homo sapiens")
        );
    }

    #[test]
    fn inclusion_map_limits_parsed_samples() {
        let mut limit = IndexMap::new();
        limit.insert("GSM2".to_string(), "kept".to_string());
        let table = parse_gsm_soft(
            &lines(&[
                "^SAMPLE = GSM1",
                "!Sample_title = dropped",
                "^SAMPLE = GSM2",
                "!Sample_title = kept",
            ]),
            &limit,
        );
        assert_eq!(table.samples_processed, 1);
        assert_eq!(table.records.len(), 1);
        assert_eq!(
            table.records["GSM2"].get("Sample_title").and_then(FieldValue::as_text),
            Some("kept")
        );
    }

    #[test]
    fn repeated_key_promotes_to_list() {
        let mut record = Record::new();
        merge_field(&mut record, "ch", "first".to_string());
        merge_field(&mut record, "ch", "second".to_string());
        merge_field(&mut record, "ch", "third".to_string());
        assert_eq!(
            record.get("ch"),
            Some(&FieldValue::List(vec![
                "first".to_string(),
                "second".to_string(),
                "third".to_string()
            ]))
        );
    }
}
