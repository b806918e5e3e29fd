/// Data model shared across relayfetch crates.
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Exit countries tried when `EXIT_COUNTRIES` is not set, in priority order.
pub const DEFAULT_CANDIDATES: &[&str] = &["se", "ch", "nl", "is", "no", "fi", "dk", "de"];

/// A two-letter exit identity token (country code), stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EgressCandidate(String);

impl EgressCandidate {
    pub fn parse(code: &str) -> Result<Self, ConfigError> {
        let code = code.trim();
        if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(code.to_ascii_lowercase()))
        } else {
            Err(ConfigError::InvalidCandidate(code.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Exit-node selector expression understood by the proxy, e.g. `{se}`.
    pub fn exit_selector(&self) -> String {
        format!("{{{}}}", self.0)
    }
}

impl fmt::Display for EgressCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_uppercase())
    }
}

impl TryFrom<String> for EgressCandidate {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EgressCandidate> for String {
    fn from(value: EgressCandidate) -> Self {
        value.0
    }
}

/// Ordered, deduplicated, non-empty list of exit candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateList(Vec<EgressCandidate>);

impl CandidateList {
    /// Parse codes in order; later duplicates are dropped.
    pub fn from_codes<I, S>(codes: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list: Vec<EgressCandidate> = Vec::new();
        for code in codes {
            let code = code.as_ref();
            if code.trim().is_empty() {
                continue;
            }
            let candidate = EgressCandidate::parse(code)?;
            if !list.contains(&candidate) {
                list.push(candidate);
            }
        }
        if list.is_empty() {
            return Err(ConfigError::NoCandidates);
        }
        Ok(Self(list))
    }

    /// Parse a comma separated list such as `se,ch,nl`.
    pub fn from_csv(csv: &str) -> Result<Self, ConfigError> {
        Self::from_codes(csv.split(','))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EgressCandidate> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for CandidateList {
    fn default() -> Self {
        Self(
            DEFAULT_CANDIDATES
                .iter()
                .map(|c| EgressCandidate(c.to_string()))
                .collect(),
        )
    }
}

impl<'a> IntoIterator for &'a CandidateList {
    type Item = &'a EgressCandidate;
    type IntoIter = std::slice::Iter<'a, EgressCandidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Configuration for one proxy launch. Built fresh for every candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub socks_port: u16,
    pub control_port: u16,
    pub exit_selector: String,
    pub geoip: PathBuf,
    pub geoip6: PathBuf,
}

impl ProxyConfig {
    pub fn for_candidate(
        candidate: &EgressCandidate,
        socks_port: u16,
        control_port: u16,
        geoip: PathBuf,
        geoip6: PathBuf,
    ) -> Self {
        Self {
            socks_port,
            control_port,
            exit_selector: candidate.exit_selector(),
            geoip,
            geoip6,
        }
    }

    /// Render as torrc directives.
    pub fn render(&self) -> String {
        format!(
            "GeoIPFile {}\nGeoIPv6File {}\nSocksPort {}\nControlPort {}\nExitNodes {}\n",
            self.geoip.display(),
            self.geoip6.display(),
            self.socks_port,
            self.control_port,
            self.exit_selector,
        )
    }
}
