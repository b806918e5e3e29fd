/// Protocol types for Rust <-> yt-dlp communication.
///
/// Requests become command-line arguments; yt-dlp's stdout/stderr lines
/// (one per line thanks to `--newline`) are parsed back into events.
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

/// Format selector: best video up to 1080p plus best audio, or best muxed.
pub const DEFAULT_FORMAT: &str = "bestvideo[height<=1080]+bestaudio/best";
pub const DEFAULT_MERGE_FORMAT: &str = "mp4";
/// yt-dlp always gets exactly one internal retry; candidates rotate instead.
pub const FETCHER_RETRIES: u32 = 1;
pub const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

// ====== REQUEST (Rust -> yt-dlp) ======

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub format: String,
    pub proxy: Option<String>,
    pub codec_location: Option<PathBuf>,
    pub output_template: String,
    pub windows_filenames: bool,
    pub restrict_filenames: bool,
    pub retries: u32,
    pub merge_format: String,
}

/// Builder for constructing fetch requests.
impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            format: DEFAULT_FORMAT.to_string(),
            proxy: None,
            codec_location: None,
            output_template: OUTPUT_TEMPLATE.to_string(),
            windows_filenames: true,
            restrict_filenames: true,
            retries: FETCHER_RETRIES,
            merge_format: DEFAULT_MERGE_FORMAT.to_string(),
        }
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_codec_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.codec_location = Some(path.into());
        self
    }

    /// Save as `<dir>/<title>.<ext>`.
    pub fn with_output_dir(mut self, dir: &Path) -> Self {
        self.output_template = dir.join(OUTPUT_TEMPLATE).to_string_lossy().into_owned();
        self
    }

    /// Render as yt-dlp command-line arguments, URL last.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--newline".to_string(),
            "--no-colors".to_string(),
            "-f".to_string(),
            self.format.clone(),
        ];
        if let Some(proxy) = &self.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        if let Some(codec) = &self.codec_location {
            args.push("--ffmpeg-location".to_string());
            args.push(codec.to_string_lossy().into_owned());
        }
        args.push("-o".to_string());
        args.push(self.output_template.clone());
        if self.windows_filenames {
            args.push("--windows-filenames".to_string());
        }
        if self.restrict_filenames {
            args.push("--restrict-filenames".to_string());
        }
        args.push("--retries".to_string());
        args.push(self.retries.to_string());
        args.push("--merge-output-format".to_string());
        args.push(self.merge_format.clone());
        args.push(self.url.clone());
        args
    }
}

// ====== EVENTS (yt-dlp -> Rust) ======

#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    Progress {
        percent: f64,
        total: Option<String>,
        speed: Option<String>,
        eta: Option<String>,
    },
    Destination(PathBuf),
    AlreadyDownloaded(PathBuf),
    Merging(PathBuf),
    Error(String),
}

static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\[download\]\s+(\d+(?:\.\d+)?)%(?:\s+of\s+~?\s*(\S+))?(?:.*?\s+at\s+(\S+))?(?:.*?\s+ETA\s+(\S+))?"
    ).unwrap()
});

static DESTINATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[download\]\s+Destination:\s+(.+)$").unwrap()
});

static ALREADY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[download\]\s+(.+?)\s+has already been downloaded").unwrap()
});

static MERGING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\[Merger\]\s+Merging formats into "(.+)"$"#).unwrap()
});

impl FetchEvent {
    /// Parse one output line. Lines that carry nothing useful yield `None`.
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if let Some(rest) = line.strip_prefix("ERROR:") {
            return Some(FetchEvent::Error(rest.trim().to_string()));
        }

        if let Some(cap) = MERGING_RE.captures(line) {
            return Some(FetchEvent::Merging(PathBuf::from(&cap[1])));
        }

        if let Some(cap) = DESTINATION_RE.captures(line) {
            return Some(FetchEvent::Destination(PathBuf::from(&cap[1])));
        }

        if let Some(cap) = ALREADY_RE.captures(line) {
            return Some(FetchEvent::AlreadyDownloaded(PathBuf::from(&cap[1])));
        }

        if let Some(cap) = PROGRESS_RE.captures(line) {
            let percent = cap[1].parse::<f64>().ok()?;
            return Some(FetchEvent::Progress {
                percent: percent.min(100.0),
                total: cap.get(2).map(|m| m.as_str().to_string()),
                speed: cap
                    .get(3)
                    .map(|m| m.as_str().to_string())
                    .filter(|s| s != "Unknown"),
                eta: cap.get(4).map(|m| m.as_str().to_string()),
            });
        }

        None
    }

    pub fn is_error(&self) -> bool {
        matches!(self, FetchEvent::Error(_))
    }

    /// Path of the file being written, when this event names one.
    pub fn output_path(&self) -> Option<&Path> {
        match self {
            FetchEvent::Destination(p) | FetchEvent::AlreadyDownloaded(p) | FetchEvent::Merging(p) => {
                Some(p)
            }
            _ => None,
        }
    }
}
