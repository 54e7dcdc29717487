use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GeofetchError;

/// The accession families geofetch knows how to look up at NCBI. An SRX
/// identifier fetches the same run-info table as an SRP, just for a single
/// sample, so the two share a URL template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessionType {
    Gse,
    Gsm,
    Srp,
    Srx,
}

impl AccessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessionType::Gse => "GSE",
            AccessionType::Gsm => "GSM",
            AccessionType::Srp => "SRP",
            AccessionType::Srx => "SRX",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "GSE" => Some(AccessionType::Gse),
            "GSM" => Some(AccessionType::Gsm),
            "SRP" => Some(AccessionType::Srp),
            "SRX" => Some(AccessionType::Srx),
            _ => None,
        }
    }
}

impl fmt::Display for AccessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A validated GEO/SRA accession: a known three-letter prefix plus an
/// integral suffix, e.g. `GSE61150` or `SRX079566`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Accession {
    value: String,
    kind: AccessionType,
}

impl Accession {
    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn kind(&self) -> AccessionType {
        self.kind
    }

    /// NCBI lookup URL for this accession's metadata. GSE and GSM resolve to
    /// the GEO acc.cgi text view; SRP and SRX resolve to the SRA run-info
    /// table.
    pub fn lookup_url(&self) -> String {
        self.lookup_url_as(self.kind)
    }

    /// Same as [`lookup_url`](Self::lookup_url), but force the URL template
    /// of another type. Used to fetch the per-sample GSM view of a GSE
    /// accession.
    pub fn lookup_url_as(&self, kind: AccessionType) -> String {
        match kind {
            AccessionType::Gse => format!(
                "https://www.ncbi.nlm.nih.gov/geo/query/acc.cgi?targ=gse&acc={}&form=text&view=full",
                self.value
            ),
            AccessionType::Gsm => format!(
                "https://www.ncbi.nlm.nih.gov/geo/query/acc.cgi?targ=gsm&acc={}&form=text&view=full",
                self.value
            ),
            AccessionType::Srp | AccessionType::Srx => format!(
                "https://trace.ncbi.nlm.nih.gov/Traces/sra/sra.cgi?save=efetch&db=sra&rettype=runinfo&term={}",
                self.value
            ),
        }
    }
}

impl fmt::Display for Accession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl FromStr for Accession {
    type Err = GeofetchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        // Guard the split point for non-ASCII garbage input.
        let mut split = trimmed.len().min(3);
        if !trimmed.is_char_boundary(split) {
            split = 0;
        }
        let (prefix, suffix) = trimmed.split_at(split);
        let prefix = prefix.to_uppercase();
        let kind = AccessionType::from_prefix(&prefix).ok_or_else(|| {
            GeofetchError::UnknownAccessionType {
                accession: trimmed.to_string(),
                prefix: prefix.clone(),
            }
        })?;
        if suffix.is_empty() || suffix.parse::<u64>().is_err() {
            return Err(GeofetchError::MalformedAccession {
                accession: trimmed.to_string(),
                suffix: suffix.to_string(),
            });
        }
        Ok(Self {
            value: format!("{prefix}{suffix}"),
            kind,
        })
    }
}

/// Directory prefix under which GEO groups a series on its FTP site,
/// e.g. `GSE61150` lives under `GSE61nnn`.
pub fn geo_series_prefix(accession: &Accession) -> String {
    let digits = accession.as_str().trim_start_matches("GSE");
    if digits.len() <= 3 {
        return "GSEnnn".to_string();
    }
    let head = &digits[..digits.len() - 3];
    format!("GSE{}nnn", head)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn classify_known_types() {
        let acc: Accession = "GSE12345".parse().unwrap();
        assert_eq!(acc.kind(), AccessionType::Gse);
        assert_eq!(acc.as_str(), "GSE12345");

        let acc: Accession = "srx079566".parse().unwrap();
        assert_eq!(acc.kind(), AccessionType::Srx);
        assert_eq!(acc.as_str(), "SRX079566");
    }

    #[test]
    fn classify_unknown_prefix() {
        let err = "XYZ123".parse::<Accession>().unwrap_err();
        assert_matches!(err, GeofetchError::UnknownAccessionType { .. });
    }

    #[test]
    fn classify_non_integral_suffix() {
        let err = "GSEabc".parse::<Accession>().unwrap_err();
        assert_matches!(err, GeofetchError::MalformedAccession { .. });
    }

    #[test]
    fn srx_and_srp_share_runinfo_url() {
        let srp: Accession = "SRP055171".parse().unwrap();
        let srx: Accession = "SRX883589".parse().unwrap();
        assert!(srp.lookup_url().contains("rettype=runinfo"));
        assert!(srx.lookup_url().contains("rettype=runinfo"));
    }

    #[test]
    fn series_ftp_prefix() {
        let acc: Accession = "GSE61150".parse().unwrap();
        assert_eq!(geo_series_prefix(&acc), "GSE61nnn");
        let short: Accession = "GSE150".parse().unwrap();
        assert_eq!(geo_series_prefix(&short), "GSEnnn");
    }
}
