/// Parsing of HTML directory listings on the bundle distribution server.
use std::cmp::Ordering;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

/// Version directories look like `href="13.5.2/"`. Pre-releases such as
/// `13.5a3/` never match.
static VERSION_DIR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"href="([0-9][0-9.]*)/""#).unwrap()
});

/// A dotted version compared numerically, so `10.0 > 9.10 > 9.9`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleVersion {
    parts: Vec<u64>,
    raw: String,
}

impl BundleVersion {
    pub fn parse(raw: &str) -> Option<Self> {
        let parts = raw
            .split('.')
            .map(|p| p.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            parts,
            raw: raw.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Ord for BundleVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts
            .cmp(&other.parts)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl PartialOrd for BundleVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BundleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// All release version directories in a listing page.
pub fn parse_versions(html: &str) -> Vec<BundleVersion> {
    VERSION_DIR_RE
        .captures_iter(html)
        .filter_map(|cap| BundleVersion::parse(&cap[1]))
        .collect()
}

/// Highest version by dotted-integer comparison.
pub fn latest_version(html: &str) -> Option<BundleVersion> {
    parse_versions(html).into_iter().max()
}

/// Find `{component}-{os}-{arch}-*.{ext}` in a version listing page.
pub fn find_bundle_file(html: &str, component: &str, os: &str, arch: &str, ext: &str) -> Option<String> {
    let pattern = format!(
        r#"({}-{}-{}-[^"'<>\s/]*?\.{})(?:["'<\s]|$)"#,
        regex::escape(component),
        regex::escape(os),
        regex::escape(arch),
        regex::escape(ext),
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(html).map(|cap| cap[1].to_string())
}
