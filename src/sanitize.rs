/// Punctuation replaced with underscores in derived sample names. This is
/// the ASCII punctuation set minus `-` and `+`, which appear in legitimate
/// treatment labels.
const PUNCTUATION: &str = "!\"#$%&'()*,./:;<=>?@[\\]^_`{|}~";

/// Normalize a free-text sample title into a safe, lowercase identifier.
pub fn sanitize_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|ch| {
            if ch == ' ' || PUNCTUATION.contains(ch) {
                '_'
            } else {
                ch
            }
        })
        .collect();
    sanitized = sanitized.replace("__", "_");
    sanitized.to_lowercase()
}

/// Return `name` unchanged if unused, otherwise the first `name_1`,
/// `name_2`, ... not present in `existing`.
pub fn unique_name(name: &str, existing: &[String]) -> String {
    if !existing.iter().any(|used| used == name) {
        return name.to_string();
    }
    let mut suffix = 1;
    loop {
        let candidate = format!("{name}_{suffix}");
        if !existing.iter().any(|used| used == &candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_punctuation_and_spaces() {
        assert_eq!(sanitize_name("Huh7, siNC (H3K27ac)"), "huh7_sinc_h3k27ac_");
        assert_eq!(sanitize_name("Sample Title"), "sample_title");
    }

    #[test]
    fn doubled_underscores_collapse() {
        assert_eq!(sanitize_name("a  b"), "a_b");
    }

    #[test]
    fn dedupe_appends_increasing_suffix() {
        let mut existing = vec!["sample_1".to_string()];
        let first = unique_name("sample_1", &existing);
        assert_eq!(first, "sample_1_1");
        existing.push(first);
        let second = unique_name("sample_1", &existing);
        assert_eq!(second, "sample_1_2");
    }

    #[test]
    fn unused_name_passes_through() {
        assert_eq!(unique_name("fresh", &["other".to_string()]), "fresh");
    }
}
