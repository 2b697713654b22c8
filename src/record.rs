use std::collections::BTreeMap;

use crate::eclass::EclassFingerprint;
use crate::error::{Error, Result};

/// Metadata keys produced by the `depend` phase.
///
/// When an ebuild declares an unsupported EAPI every one of these is
/// stored empty.
pub const AUX_KEYS: &[&str] = &[
    "DEPEND",
    "RDEPEND",
    "SLOT",
    "SRC_URI",
    "RESTRICT",
    "HOMEPAGE",
    "LICENSE",
    "DESCRIPTION",
    "KEYWORDS",
    "INHERITED",
    "IUSE",
    "REQUIRED_USE",
    "PDEPEND",
    "BDEPEND",
    "EAPI",
    "PROPERTIES",
    "DEFINED_PHASES",
    "IDEPEND",
];

const MTIME_KEY: &str = "_mtime_";
const ECLASSES_KEY: &str = "_eclasses_";

/// Cached metadata of one ebuild.
///
/// Persisted in the md5-cache style `KEY=VALUE` format, with two extra
/// keys: `_mtime_` (the ebuild's mtime, in seconds, when the record was
/// generated) and `_eclasses_` (tab-separated `name\tdigest` pairs).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataRecord {
    /// Extracted values. `INHERITED` is never stored here.
    pub fields: BTreeMap<String, String>,
    pub source_mtime: u64,
    pub eclasses: Vec<EclassFingerprint>,
}

impl MetadataRecord {
    /// Value of `key`, empty when absent.
    ///
    /// `INHERITED` is rebuilt from the eclass fingerprints.
    pub fn get(&self, key: &str) -> String {
        if key == "INHERITED" {
            return self.inherited();
        }
        self.fields.get(key).cloned().unwrap_or_default()
    }

    /// Space-separated names of the inherited eclasses.
    pub fn inherited(&self) -> String {
        self.eclasses
            .iter()
            .map(|fp| fp.name.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Decode a persisted record.
    ///
    /// Any malformed line, a missing or non-numeric `_mtime_`, or an odd
    /// number of `_eclasses_` items is reported as
    /// [`Error::InvalidCacheEntry`].
    ///
    /// # Examples
    ///
    /// ```
    /// use portage_repo::MetadataRecord;
    ///
    /// let record = MetadataRecord::parse("EAPI=8\nSLOT=0\n_mtime_=1700000000\n").unwrap();
    /// assert_eq!(record.get("SLOT"), "0");
    /// assert_eq!(record.source_mtime, 1_700_000_000);
    /// assert!(MetadataRecord::parse("EAPI=8\n").is_err());
    /// ```
    pub fn parse(input: &str) -> Result<MetadataRecord> {
        let mut fields = BTreeMap::new();
        let mut mtime = None;
        let mut eclasses = Vec::new();

        for line in input.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .filter(|(key, _)| is_valid_key(key))
                .ok_or_else(|| Error::InvalidCacheEntry(format!("malformed line: {line:?}")))?;
            match key {
                MTIME_KEY => {
                    let parsed = value.trim().parse::<u64>().map_err(|_| {
                        Error::InvalidCacheEntry(format!("invalid {MTIME_KEY}: {value:?}"))
                    })?;
                    mtime = Some(parsed);
                }
                ECLASSES_KEY => eclasses = parse_eclasses(value)?,
                "INHERITED" => {}
                _ => {
                    fields.insert(key.to_string(), value.to_string());
                }
            }
        }

        let source_mtime =
            mtime.ok_or_else(|| Error::InvalidCacheEntry(format!("missing {MTIME_KEY}")))?;
        Ok(MetadataRecord {
            fields,
            source_mtime,
            eclasses,
        })
    }

    /// Encode for persistence. Empty values are omitted; embedded newlines
    /// are flattened to spaces.
    pub fn serialize(&self) -> String {
        let mut lines = Vec::new();
        for (key, value) in &self.fields {
            if !value.is_empty() {
                lines.push(format!("{key}={}", value.replace('\n', " ")));
            }
        }
        if !self.eclasses.is_empty() {
            let parts: Vec<&str> = self
                .eclasses
                .iter()
                .flat_map(|fp| [fp.name.as_str(), fp.digest.as_str()])
                .collect();
            lines.push(format!("{ECLASSES_KEY}={}", parts.join("\t")));
        }
        lines.push(format!("{MTIME_KEY}={}", self.source_mtime));
        lines.push(String::new()); // trailing newline
        lines.join("\n")
    }
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse the `_eclasses_` value: tab-separated pairs of `name\tdigest`.
fn parse_eclasses(s: &str) -> Result<Vec<EclassFingerprint>> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    let parts: Vec<&str> = s.split('\t').collect();
    if parts.len() % 2 != 0 {
        return Err(Error::InvalidCacheEntry(format!(
            "odd number of {ECLASSES_KEY} items"
        )));
    }
    Ok(parts
        .chunks(2)
        .map(|chunk| EclassFingerprint {
            name: chunk[0].to_string(),
            digest: chunk[1].to_string(),
        })
        .collect())
}

/// Read `KEY=VALUE` lines, skipping anything else.
pub(crate) fn parse_key_values(input: &str) -> BTreeMap<String, String> {
    input
        .lines()
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| is_valid_key(key))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Names from an md5-cache `_eclasses_` value (`name\tdigest...`).
pub(crate) fn eclass_names(s: &str) -> Vec<String> {
    s.split('\t')
        .step_by(2)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}
