use indexmap::{IndexMap, IndexSet};

use crate::soft::{FieldValue, Record};

/// Default ceiling on the length of a value still considered for
/// project-level promotion. Zero disables the length gate entirely.
pub const DEFAULT_MAX_LEN: usize = 50;
/// Values longer than this are considered too large to be useful at either
/// level.
pub const DEFAULT_DEL_LIMIT: usize = 250;
/// Per-sample attribute values longer than this are truncated in the output
/// table.
pub const DEFAULT_ATTR_LIMIT_TRUNCATE: usize = 500;

/// Split a flat list of per-sample records into a per-sample table and a
/// list of project-level constant attributes.
///
/// A key is constant when every record that carries it holds the same value
/// as the first carrier. With a nonzero `max_len`, a first value longer
/// than `max_len` (or `del_limit`) disqualifies the key up front; with
/// `max_len == 0` the length gate is off. Constant keys are removed from
/// every sample record unconditionally, but emitted into the project-level
/// list only when the value is within `del_limit`; a constant value over
/// that limit is dropped from both levels. Remaining per-sample values
/// longer than `attr_limit_truncate` are cut and marked with a trailing
/// `" ..."`.
pub fn separate_common_meta(
    records: &[Record],
    max_len: usize,
    del_limit: usize,
    attr_limit_truncate: usize,
) -> (Vec<Record>, Vec<Record>) {
    let keys: IndexSet<String> = records
        .iter()
        .flat_map(|record| record.keys().cloned())
        .collect();

    let mut differing: IndexSet<String> = IndexSet::new();
    for key in &keys {
        let mut first_value: Option<String> = None;
        for record in records {
            // A record without the key does not break constancy.
            let Some(value) = record.get(key) else {
                continue;
            };
            let text = value.to_string();
            match &first_value {
                None => {
                    if max_len != 0 && (text.len() > max_len || text.len() > del_limit) {
                        differing.insert(key.clone());
                        break;
                    }
                    first_value = Some(text);
                }
                Some(first) => {
                    if *first != text {
                        differing.insert(key.clone());
                        break;
                    }
                }
            }
        }
    }

    let mut project_level: Vec<Record> = Vec::new();
    for key in &keys {
        if differing.contains(key) {
            continue;
        }
        let Some(value) = records.iter().find_map(|record| record.get(key)) else {
            continue;
        };
        let text = value.to_string();
        if text.len() <= del_limit {
            let mut entry: Record = IndexMap::new();
            entry.insert(key.clone(), FieldValue::Text(text.replace('"', "")));
            project_level.push(entry);
        }
    }

    // Rebuild the sample table instead of deleting keys in place.
    let sample_level: Vec<Record> = records
        .iter()
        .map(|record| {
            record
                .iter()
                .filter(|(key, _)| differing.contains(*key))
                .map(|(key, value)| {
                    let text = value.to_string();
                    let value = if text.chars().count() > attr_limit_truncate {
                        let head: String = text.chars().take(attr_limit_truncate).collect();
                        FieldValue::Text(format!("{head} ..."))
                    } else {
                        value.clone()
                    };
                    (key.clone(), value)
                })
                .collect()
        })
        .collect();

    (sample_level, project_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> Record {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), FieldValue::Text(value.to_string())))
            .collect()
    }

    #[test]
    fn constant_key_moves_to_project_level() {
        let records = vec![
            record(&[("name", "Antonio"), ("number", "1"), ("car", "Fiat")]),
            record(&[("name", "Markus"), ("number", "1"), ("car", "Jeep")]),
            record(&[("name", "Pablo"), ("number", "1"), ("car", "Jeep")]),
        ];
        let (samples, project) =
            separate_common_meta(&records, 0, DEFAULT_DEL_LIMIT, DEFAULT_ATTR_LIMIT_TRUNCATE);
        assert_eq!(project.len(), 1);
        assert_eq!(
            project[0].get("number"),
            Some(&FieldValue::Text("1".to_string()))
        );
        for sample in &samples {
            assert!(!sample.contains_key("number"));
            assert!(sample.contains_key("name"));
            assert!(sample.contains_key("car"));
        }
    }

    #[test]
    fn oversized_constant_is_dropped_everywhere() {
        // Documented quirk: a constant value over del_limit disappears from
        // both the sample and project tables.
        let big = "x".repeat(20);
        let records = vec![
            record(&[("name", "a"), ("blob", &big)]),
            record(&[("name", "b"), ("blob", &big)]),
        ];
        let (samples, project) = separate_common_meta(&records, 0, 10, 500);
        assert!(project.iter().all(|entry| !entry.contains_key("blob")));
        assert!(samples.iter().all(|sample| !sample.contains_key("blob")));
    }

    #[test]
    fn long_first_value_disqualifies_key_when_gate_enabled() {
        let long = "y".repeat(60);
        let records = vec![record(&[("field", &long)]), record(&[("field", &long)])];
        let (samples, project) = separate_common_meta(&records, 50, 250, 500);
        assert!(project.is_empty());
        assert!(samples.iter().all(|sample| sample.contains_key("field")));
    }

    #[test]
    fn long_varying_values_are_truncated() {
        let records = vec![
            record(&[("desc", &"a".repeat(30))]),
            record(&[("desc", "short")]),
        ];
        let (samples, _) = separate_common_meta(&records, 0, 250, 10);
        assert_eq!(
            samples[0].get("desc"),
            Some(&FieldValue::Text(format!("{} ...", "a".repeat(10))))
        );
        assert_eq!(
            samples[1].get("desc"),
            Some(&FieldValue::Text("short".to_string()))
        );
    }

    #[test]
    fn project_values_lose_embedded_quotes() {
        let records = vec![
            record(&[("title", "a \"quoted\" study")]),
            record(&[("title", "a \"quoted\" study")]),
        ];
        let (_, project) = separate_common_meta(&records, 0, 250, 500);
        assert_eq!(
            project[0].get("title"),
            Some(&FieldValue::Text("a quoted study".to_string()))
        );
    }
}
