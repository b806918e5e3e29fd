/// Runtime settings, read from the environment (and `.env` via dotenvy in main).
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::ConfigError;
use crate::models::CandidateList;

pub const DEFAULT_SOCKS_PORT: u16 = 12212;
pub const DEFAULT_CONTROL_PORT: u16 = 12213;
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 40;
pub const DEFAULT_STALL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CHUNK_BYTES: usize = 64 * 1024;
pub const DEFAULT_IDENTITY_CHECK_URL: &str = "https://check.torproject.org/api/ip";
pub const DEFAULT_TOR_INDEX_URL: &str = "https://dist.torproject.org/torbrowser/";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Root for `tor/`, `data/`, `ffmpeg-latest/` and portable tools.
    pub install_root: PathBuf,
    /// Where finished media lands.
    pub download_dir: PathBuf,
    pub socks_port: u16,
    pub control_port: u16,
    pub candidates: CandidateList,
    pub ready_timeout: Duration,
    pub stall_timeout: Duration,
    pub chunk_size: usize,
    pub identity_check: bool,
    pub identity_check_url: String,
    pub tor_index_url: String,
    pub ytdlp_bin: Option<String>,
    pub verbose: bool,
}

impl Settings {
    /// Read settings from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let install_root = match std::env::var("RELAYFETCH_HOME") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => executable_dir()?,
        };

        let download_dir = std::env::var("DOWNLOAD_DIR")
            .ok()
            .filter(|d| !d.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| default_download_dir(&install_root));

        let candidates = match std::env::var("EXIT_COUNTRIES") {
            Ok(csv) => CandidateList::from_csv(&csv)?,
            Err(_) => CandidateList::default(),
        };

        let settings = Self {
            install_root,
            download_dir,
            socks_port: env_parse("SOCKS_PORT", DEFAULT_SOCKS_PORT),
            control_port: env_parse("CONTROL_PORT", DEFAULT_CONTROL_PORT),
            candidates,
            ready_timeout: Duration::from_secs(env_parse(
                "READY_TIMEOUT_SECS",
                DEFAULT_READY_TIMEOUT_SECS,
            )),
            stall_timeout: Duration::from_secs(env_parse(
                "STALL_TIMEOUT_SECS",
                DEFAULT_STALL_TIMEOUT_SECS,
            )),
            chunk_size: env_parse("TRANSFER_CHUNK_BYTES", DEFAULT_CHUNK_BYTES).max(1),
            identity_check: env_flag("IDENTITY_CHECK", true),
            identity_check_url: std::env::var("IDENTITY_CHECK_URL")
                .unwrap_or_else(|_| DEFAULT_IDENTITY_CHECK_URL.to_string()),
            tor_index_url: std::env::var("TOR_INDEX_URL")
                .unwrap_or_else(|_| DEFAULT_TOR_INDEX_URL.to_string()),
            ytdlp_bin: std::env::var("YTDLP_BIN").ok().filter(|b| !b.trim().is_empty()),
            verbose: false,
        };

        debug!("Loaded settings: {:?}", settings);
        Ok(settings)
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Boolean switch accepting `1/0`, `true/false`, `yes/no` and `on/off`.
fn env_flag(key: &str, default: bool) -> bool {
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => default,
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        other => {
            warn!("Ignoring {}={:?}, expected true/false; using {}", key, other, default);
            default
        }
    }
}

fn executable_dir() -> Result<PathBuf, ConfigError> {
    let exe = std::env::current_exe().map_err(|e| ConfigError::InstallRoot(e.to_string()))?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| ConfigError::InstallRoot(format!("{} has no parent", exe.display())))
}

/// `~/Downloads` when it exists, otherwise the installation root.
pub fn default_download_dir(install_root: &Path) -> PathBuf {
    home::home_dir()
        .map(|home| home.join("Downloads"))
        .filter(|dir| dir.is_dir())
        .unwrap_or_else(|| install_root.to_path_buf())
}
