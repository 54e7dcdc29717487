use std::collections::HashSet;
use std::fs;
use std::path::Path;

use chrono::{Duration, Local};
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::GeofetchError;
use crate::ncbi::MetadataClient;

const ESEARCH_GSE_BASE: &str =
    "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi?db=gds&term=GSE[ETYP]";
const THREE_MONTH_FILTER: &str = "+AND+\"published+last+3+months\"[Filter]";

/// Default ceiling on the number of UIDs one esearch query returns.
pub const DEFAULT_RETMAX: usize = 10_000;

/// esearch's JSON envelope. Only the id list and the total count matter; the
/// rest of the result is ignored.
#[derive(Debug, Deserialize)]
struct EsearchEnvelope {
    esearchresult: EsearchResult,
}

#[derive(Debug, Deserialize)]
struct EsearchResult {
    #[serde(default)]
    count: Option<String>,
    #[serde(default)]
    idlist: Vec<String>,
}

/// Discovers GSE accessions through the NCBI esearch endpoint, optionally
/// narrowed by an Entrez query filter and a date window. The most recent
/// result is kept so successive searches can be diffed.
pub struct Finder<C: MetadataClient> {
    client: C,
    query_filter: String,
    query_ending: String,
    last_result: Vec<String>,
    uid_re: Regex,
}

impl<C: MetadataClient> Finder<C> {
    /// `filters` is an Entrez term fragment, e.g. `Homo sapiens[Organism]`;
    /// `None` searches the whole GEO series index.
    pub fn new(client: C, filters: Option<&str>, retmax: usize) -> Self {
        let query_filter = match filters {
            Some(filters) if !filters.is_empty() => format!("+(AND+{filters})"),
            _ => String::new(),
        };
        Self {
            client,
            query_filter,
            query_ending: format!("&retmax={retmax}&retmode=json&usehistory=y"),
            last_result: Vec::new(),
            uid_re: Regex::new(r"^[1-9]+0+([1-9][0-9]*)").unwrap(),
        }
    }

    /// Every GSE accession the query filter matches, without a date window.
    pub fn fetch_all(&mut self) -> Result<Vec<String>, GeofetchError> {
        let url = self.compose_url(None);
        self.fetch_by_url(&url)
    }

    /// GSE accessions uploaded or updated in the last three months.
    pub fn fetch_last_three_months(&mut self) -> Result<Vec<String>, GeofetchError> {
        let url = self.compose_url(Some(THREE_MONTH_FILTER.to_string()));
        self.fetch_by_url(&url)
    }

    /// GSE accessions uploaded or updated in the last week.
    pub fn fetch_last_week(&mut self) -> Result<Vec<String>, GeofetchError> {
        self.fetch_by_day_count(7)
    }

    /// GSE accessions uploaded or updated in the last `n_days` days.
    pub fn fetch_by_day_count(&mut self, n_days: i64) -> Result<Vec<String>, GeofetchError> {
        let start = (Local::now() - Duration::days(n_days))
            .format("%Y/%m/%d")
            .to_string();
        self.fetch_by_date(&start, None)
    }

    /// GSE accessions in an update-date window. Dates are `YYYY/MM/DD`; a
    /// missing `end_date` means today.
    pub fn fetch_by_date(
        &mut self,
        start_date: &str,
        end_date: Option<&str>,
    ) -> Result<Vec<String>, GeofetchError> {
        let end = match end_date {
            Some(end) => end.to_string(),
            None => Local::now().format("%Y/%m/%d").to_string(),
        };
        let date_filter =
            format!("+AND+(\"{start_date}\"[Update+Date]+:+\"{end}\"[Update+Date])");
        let url = self.compose_url(Some(date_filter));
        self.fetch_by_url(&url)
    }

    /// Run one esearch query and turn its UID list into GSE accessions,
    /// remembering the result. A malformed response yields an empty list
    /// rather than an error, as does a UID that is not in GEO's series
    /// numbering scheme.
    pub fn fetch_by_url(&mut self, url: &str) -> Result<Vec<String>, GeofetchError> {
        let text = self.client.fetch_text(url)?;
        let envelope: EsearchEnvelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%err, "unreadable esearch response");
                self.last_result = Vec::new();
                return Ok(Vec::new());
            }
        };
        let result = envelope.esearchresult;
        if let Some(count) = result.count {
            info!(count = count.as_str(), "series matching the query");
        }
        let gse_list: Vec<String> = result
            .idlist
            .iter()
            .filter_map(|uid| self.uid_to_gse(uid))
            .collect();
        self.last_result = gse_list.clone();
        Ok(gse_list)
    }

    /// GEO series UIDs are the accession number behind a `2...0` prefix
    /// (`200180501` is `GSE180501`).
    pub fn uid_to_gse(&self, uid: &str) -> Option<String> {
        match self.uid_re.captures(uid) {
            Some(caps) => Some(format!("GSE{}", &caps[1])),
            None => {
                warn!(uid, "UID does not look like a GEO series id; skipping");
                None
            }
        }
    }

    /// The accessions of the most recent search, empty before the first one.
    pub fn last_result(&self) -> &[String] {
        &self.last_result
    }

    /// Write one accession per line; `gse_list` defaults to the last result.
    pub fn save_to_file(
        &self,
        path: &Path,
        gse_list: Option<&[String]>,
    ) -> Result<(), GeofetchError> {
        let list = gse_list.unwrap_or(&self.last_result);
        let mut body = list.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        fs::write(path, body).map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
        info!(path = %path.display(), accessions = list.len(), "saved accession list");
        Ok(())
    }

    fn compose_url(&self, date_filter: Option<String>) -> String {
        format!(
            "{ESEARCH_GSE_BASE}{}{}{}",
            self.query_filter,
            date_filter.unwrap_or_default(),
            self.query_ending
        )
    }
}

/// Accessions present in `new` but not in `old`, in `new`'s order.
pub fn find_differences(old: &[String], new: &[String]) -> Vec<String> {
    let seen: HashSet<&str> = old.iter().map(String::as_str).collect();
    new.iter()
        .filter(|gse| !seen.contains(gse.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct CannedClient {
        body: String,
        requested: Mutex<Vec<String>>,
    }

    impl CannedClient {
        fn new(body: &str) -> Self {
            Self {
                body: body.to_string(),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    impl MetadataClient for CannedClient {
        fn fetch_text(&self, url: &str) -> Result<String, GeofetchError> {
            self.requested.lock().unwrap().push(url.to_string());
            Ok(self.body.clone())
        }

        fn probe_size(&self, _url: &str) -> Option<u64> {
            None
        }

        fn download_file(&self, _url: &str, _destination: &Path) -> Result<(), GeofetchError> {
            Ok(())
        }
    }

    const ESEARCH_BODY: &str = r#"{"header":{"type":"esearch"},"esearchresult":{"count":"3","retmax":"3","idlist":["200180501","200000124","bogus"],"translationset":[]}}"#;

    #[test]
    fn uids_become_gse_accessions() {
        let mut finder = Finder::new(CannedClient::new(ESEARCH_BODY), None, DEFAULT_RETMAX);
        let found = finder.fetch_all().unwrap();
        // The malformed UID is dropped, not fatal.
        assert_eq!(found, vec!["GSE180501".to_string(), "GSE124".to_string()]);
        assert_eq!(finder.last_result(), found.as_slice());
    }

    #[test]
    fn query_carries_filter_retmax_and_dates() {
        let mut finder = Finder::new(
            CannedClient::new(ESEARCH_BODY),
            Some("Homo sapiens[Organism]"),
            500,
        );
        finder
            .fetch_by_date("2023/01/01", Some("2023/02/01"))
            .unwrap();
        let requested = finder.client.requested.lock().unwrap();
        assert_eq!(requested.len(), 1);
        let url = &requested[0];
        assert!(url.starts_with(ESEARCH_GSE_BASE));
        assert!(url.contains("+(AND+Homo sapiens[Organism])"));
        assert!(url.contains("\"2023/01/01\"[Update+Date]+:+\"2023/02/01\"[Update+Date]"));
        assert!(url.contains("&retmax=500&retmode=json"));
    }

    #[test]
    fn malformed_response_gives_empty_result() {
        let mut finder = Finder::new(CannedClient::new("<html>downtime</html>"), None, 10);
        assert!(finder.fetch_all().unwrap().is_empty());
        assert!(finder.last_result().is_empty());
    }

    #[test]
    fn differences_keep_new_order() {
        let old = vec!["GSE1".to_string(), "GSE2".to_string()];
        let new = vec![
            "GSE3".to_string(),
            "GSE1".to_string(),
            "GSE4".to_string(),
        ];
        assert_eq!(
            find_differences(&old, &new),
            vec!["GSE3".to_string(), "GSE4".to_string()]
        );
    }

    #[test]
    fn saved_file_has_one_accession_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new_series.txt");
        let mut finder = Finder::new(CannedClient::new(ESEARCH_BODY), None, 10);
        finder.fetch_all().unwrap();
        finder.save_to_file(&path, None).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "GSE180501\nGSE124\n"
        );
    }
}
