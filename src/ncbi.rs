use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, info, warn};

use crate::accession::{geo_series_prefix, Accession, AccessionType};
use crate::error::GeofetchError;
use crate::processed::FilelistSource;

pub trait MetadataClient: Send + Sync {
    fn fetch_text(&self, url: &str) -> Result<String, GeofetchError>;
    /// Content-Length of `url`, or `None` when the probe fails for any
    /// reason; callers treat an unknown size as "proceed".
    fn probe_size(&self, url: &str) -> Option<u64>;
    fn download_file(&self, url: &str, destination: &Path) -> Result<(), GeofetchError>;
}

#[derive(Clone)]
pub struct NcbiHttpClient {
    client: Client,
}

impl NcbiHttpClient {
    pub fn new() -> Result<Self, GeofetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("geofetch/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| GeofetchError::Filesystem(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| GeofetchError::Transport {
                url: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }

    fn normalize_url(url: &str) -> String {
        if let Some(rest) = url.strip_prefix("ftp://ftp.ncbi.nlm.nih.gov/") {
            return format!("https://ftp.ncbi.nlm.nih.gov/{}", rest);
        }
        url.to_string()
    }
}

impl MetadataClient for NcbiHttpClient {
    fn fetch_text(&self, url: &str) -> Result<String, GeofetchError> {
        let url = Self::normalize_url(url);
        debug!(%url, "fetching");
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| GeofetchError::Transport {
                url: url.clone(),
                message: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(GeofetchError::HttpStatus {
                url: url.clone(),
                status: response.status().as_u16(),
            });
        }
        response.text().map_err(|err| GeofetchError::Transport {
            url,
            message: err.to_string(),
        })
    }

    fn probe_size(&self, url: &str) -> Option<u64> {
        let url = Self::normalize_url(url);
        let response = self.client.head(&url).send().ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.content_length()
    }

    fn download_file(&self, url: &str, destination: &Path) -> Result<(), GeofetchError> {
        let url = Self::normalize_url(url);
        let mut response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| GeofetchError::Transport {
                url: url.clone(),
                message: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(GeofetchError::HttpStatus {
                url,
                status: response.status().as_u16(),
            });
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
        }
        let mut file =
            File::create(destination).map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

impl FilelistSource for NcbiHttpClient {
    fn fetch_filelist(&self, url: &str) -> Result<String, GeofetchError> {
        self.fetch_text(url)
    }
}

/// Predictable URL of the bulk family archive for a series; its size is a
/// cheap upper-bound proxy for how big the GSM SOFT response will be.
pub fn family_archive_url(accession: &Accession) -> String {
    format!(
        "https://ftp.ncbi.nlm.nih.gov/geo/series/{prefix}/{acc}/miniml/{acc}_family.xml.tgz",
        prefix = geo_series_prefix(accession),
        acc = accession.as_str()
    )
}

/// Fetch the metadata document for `accession`, split into non-empty,
/// `\r`-stripped lines.
///
/// `kind` overrides the URL template (a GSE accession is fetched with the
/// GSM template to get the per-sample view). When `destination` is given,
/// the raw text is written there verbatim first; a destination with no
/// extension is treated as a directory and the filename is derived from
/// the accession. For the GSM bulk view, `size_cap` guards against
/// monster series: the family archive is size-probed and an over-cap
/// series yields an empty result instead of an error.
pub fn fetch_metadata(
    client: &dyn MetadataClient,
    accession: &Accession,
    kind: AccessionType,
    destination: Option<&Path>,
    size_cap: Option<u64>,
) -> Result<Vec<String>, GeofetchError> {
    if kind == AccessionType::Gsm {
        if let Some(cap) = size_cap {
            let probe_url = family_archive_url(accession);
            match client.probe_size(&probe_url) {
                Some(size) if size > cap => {
                    warn!(
                        accession = accession.as_str(),
                        size, cap, "series exceeds the soft size cap; skipping"
                    );
                    return Ok(Vec::new());
                }
                Some(size) => debug!(accession = accession.as_str(), size, "series size probe"),
                None => debug!(
                    accession = accession.as_str(),
                    "size probe failed; proceeding"
                ),
            }
        }
    }

    let url = accession.lookup_url_as(kind);
    let text = client.fetch_text(&url)?;

    if let Some(destination) = destination {
        let path = resolve_destination(destination, accession, kind);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
        }
        fs::write(&path, &text).map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
        info!(path = %path.display(), "wrote raw metadata");
    }

    Ok(split_metadata_lines(&text))
}

pub fn split_metadata_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn resolve_destination(destination: &Path, accession: &Accession, kind: AccessionType) -> PathBuf {
    if destination.extension().is_some() {
        return destination.to_path_buf();
    }
    let filename = match kind {
        AccessionType::Gse | AccessionType::Gsm => format!("{}.soft", accession.as_str()),
        AccessionType::Srp | AccessionType::Srx => format!("{}.csv", accession.as_str()),
    };
    destination.join(filename)
}

/// Row type of the SRA run-info table: column name to cell value, in
/// column order.
pub type RunInfoRow = IndexMap<String, String>;

/// Parse the run-info CSV returned by the SRA efetch endpoint.
pub fn parse_runinfo(text: &str) -> Result<Vec<RunInfoRow>, GeofetchError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .map_err(|err| GeofetchError::RunInfoParse(err.to_string()))?
        .clone();
    let mut rows = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|err| GeofetchError::RunInfoParse(err.to_string()))?;
        let mut mapped = RunInfoRow::new();
        for (header, value) in headers.iter().zip(row.iter()) {
            mapped.insert(header.to_string(), value.to_string());
        }
        rows.push(mapped);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_without_extension_is_a_directory() {
        let acc: Accession = "GSE61150".parse().unwrap();
        let path = resolve_destination(Path::new("meta/project"), &acc, AccessionType::Gsm);
        assert_eq!(path, Path::new("meta/project/GSE61150.soft"));
        let path = resolve_destination(Path::new("meta/out.soft"), &acc, AccessionType::Gsm);
        assert_eq!(path, Path::new("meta/out.soft"));
    }

    #[test]
    fn metadata_lines_lose_cr_and_blanks() {
        let lines = split_metadata_lines("^SAMPLE = GSM1\r\n\r\n!k = v\r\n");
        assert_eq!(lines, vec!["^SAMPLE = GSM1", "!k = v"]);
    }

    #[test]
    fn runinfo_rows_keyed_by_header() {
        let text = "Run,Experiment,LibraryLayout\nSRR1,SRX1,SINGLE\nSRR2,SRX1,PAIRED\n";
        let rows = parse_runinfo(text).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("Run").map(String::as_str), Some("SRR1"));
        assert_eq!(rows[1].get("LibraryLayout").map(String::as_str), Some("PAIRED"));
    }

    #[test]
    fn family_archive_url_uses_series_prefix() {
        let acc: Accession = "GSE61150".parse().unwrap();
        assert_eq!(
            family_archive_url(&acc),
            "https://ftp.ncbi.nlm.nih.gov/geo/series/GSE61nnn/GSE61150/miniml/GSE61150_family.xml.tgz"
        );
    }
}
