use indexmap::IndexSet;
use tracing::debug;

use crate::soft::{FieldValue, Record};

/// Cutoff above which the left-hand side of a `key: value` element is
/// considered prose rather than a column name. Tuned against real GEO
/// characteristics fields, where free-text sentences occasionally contain
/// a stray `: `.
pub const MAX_DERIVED_KEY_LEN: usize = 40;

/// Expand every list-valued field across `records` into derived columns.
///
/// The candidate key set is the union of keys over all records; keys with
/// no list-valued occurrence are left untouched, which also makes a second
/// pass over already-expanded records a no-op.
pub fn expand_metadata_list(records: &mut [Record]) {
    let keys: IndexSet<String> = records
        .iter()
        .flat_map(|record| record.keys().cloned())
        .collect();
    for key in &keys {
        expand_metadata_list_item(records, key);
    }
}

/// Expand one key. GEO encodes structured sample characteristics as
/// repeated `key: value` strings inside a list; each such element becomes
/// its own column. Elements that do not look like `key: value` pairs (no
/// `": "`, an implausibly long left side, or a left side opening a
/// parenthetical group) are folded back into a single joined string kept
/// under the original key.
pub fn expand_metadata_list_item(records: &mut [Record], key: &str) {
    let any_list = records
        .iter()
        .any(|record| record.get(key).map(FieldValue::is_list).unwrap_or(false));
    if !any_list {
        return;
    }

    for record in records.iter_mut() {
        let Some(value) = record.get(key) else {
            debug!(key, "field absent on record during list expansion");
            continue;
        };
        let elements = match value {
            FieldValue::Text(text) => vec![text.clone()],
            FieldValue::List(values) => values.clone(),
        };

        let mut joined = String::new();
        let mut fallback = false;
        for elem in &elements {
            match elem.split_once(": ") {
                Some((left, right)) => {
                    let parenthetical = left.contains('(');
                    if left.len() > MAX_DERIVED_KEY_LEN || parenthetical {
                        fallback = true;
                        let sep = if parenthetical { "(" } else { ", " };
                        accumulate(&mut joined, elem, sep);
                    } else if let Some(existing) = record.get(left) {
                        // Derived column collision: keep both values.
                        let merged = format!("{existing}. {right}");
                        record.insert(left.to_string(), FieldValue::Text(merged));
                    } else {
                        record.insert(left.to_string(), FieldValue::Text(right.to_string()));
                    }
                }
                None => {
                    fallback = true;
                    accumulate(&mut joined, elem, ", ");
                }
            }
        }

        if fallback {
            record.insert(key.to_string(), FieldValue::Text(joined));
        } else {
            record.shift_remove(key);
        }
    }
}

fn accumulate(joined: &mut String, elem: &str, sep: &str) {
    if joined.is_empty() {
        joined.push_str(elem);
    } else {
        joined.push_str(sep);
        joined.push_str(elem);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::merge_field;

    fn record_with_list(key: &str, elems: &[&str]) -> Record {
        let mut record = Record::new();
        for elem in elems {
            merge_field(&mut record, key, elem.to_string());
        }
        record
    }

    #[test]
    fn list_elements_become_columns() {
        let mut records = vec![record_with_list(
            "Sample_characteristics_ch1",
            &["tissue: liver", "age: 61"],
        )];
        expand_metadata_list(&mut records);
        assert_eq!(
            records[0].get("tissue"),
            Some(&FieldValue::Text("liver".to_string()))
        );
        assert_eq!(
            records[0].get("age"),
            Some(&FieldValue::Text("61".to_string()))
        );
        assert!(!records[0].contains_key("Sample_characteristics_ch1"));
    }

    #[test]
    fn prose_elements_fold_into_one_string() {
        let mut records = vec![record_with_list(
            "Sample_description",
            &["no colon here", "also plain"],
        )];
        expand_metadata_list(&mut records);
        assert_eq!(
            records[0].get("Sample_description"),
            Some(&FieldValue::Text("no colon here, also plain".to_string()))
        );
    }

    #[test]
    fn expansion_is_idempotent() {
        let mut records = vec![record_with_list(
            "Sample_characteristics_ch1",
            &["tissue: liver", "free text element"],
        )];
        expand_metadata_list(&mut records);
        let snapshot = records.clone();
        expand_metadata_list(&mut records);
        assert_eq!(records, snapshot);
    }
}
