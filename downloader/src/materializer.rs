/// Makes external binaries and data files available under the installation
/// root, downloading them on first use.
///
/// Every lookup prefers what is already on disk. Resolved paths are cached for
/// the life of the process and re-checked on each call, so deleting a file is
/// enough to force it to be fetched again.
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use relayfetch_shared::config::DEFAULT_TOR_INDEX_URL;
use relayfetch_shared::errors::DependencyError;
use relayfetch_shared::naming::sanitize_filename;

use crate::archive;
use crate::listing;
use crate::platform::Platform;
use crate::transfer::{Transfer, DEFAULT_CHUNK_SIZE, DEFAULT_STALE_TIMEOUT};

pub const TOR_COMPONENT: &str = "tor-expert-bundle";
pub const TOR_ARCHIVE_EXT: &str = "tar.gz";

/// What can be materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    /// Tor binary plus its geoip/geoip6 data files.
    Proxy,
    /// 7-Zip, used to unpack the codec archive.
    Converter,
    /// ffmpeg, handed to the media fetcher for merging.
    Codec,
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Proxy => write!(f, "tor"),
            Dependency::Converter => write!(f, "7-Zip"),
            Dependency::Codec => write!(f, "ffmpeg"),
        }
    }
}

/// The proxy binary and its two sidecar data files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyBundle {
    pub binary: PathBuf,
    pub geoip: PathBuf,
    pub geoip6: PathBuf,
}

impl ProxyBundle {
    pub fn is_complete(&self) -> bool {
        self.binary.is_file() && self.geoip.is_file() && self.geoip6.is_file()
    }
}

/// Anything that can hand out a ready-to-launch proxy bundle.
pub trait ProxyBinarySource {
    fn proxy_bundle(&self) -> impl Future<Output = Result<ProxyBundle, DependencyError>> + Send;
}

impl<T: ProxyBinarySource + Send + Sync> ProxyBinarySource for Arc<T> {
    fn proxy_bundle(&self) -> impl Future<Output = Result<ProxyBundle, DependencyError>> + Send {
        self.as_ref().proxy_bundle()
    }
}

/// Canonical locations under the installation root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir().map(|cwd| cwd.join(&root)).unwrap_or(root)
        };
        Self { root }
    }

    pub fn tor_dir(&self) -> PathBuf {
        self.root.join("tor")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn codec_dir(&self) -> PathBuf {
        self.root.join("ffmpeg-latest")
    }

    pub fn proxy_bundle(&self, platform: &Platform) -> ProxyBundle {
        ProxyBundle {
            binary: self.tor_dir().join(platform.executable("tor")),
            geoip: self.data_dir().join("geoip"),
            geoip6: self.data_dir().join("geoip6"),
        }
    }
}

/// Resolved paths, one slot per dependency.
#[derive(Debug, Default)]
struct DependencyBundle {
    proxy: Mutex<Option<ProxyBundle>>,
    converter: Mutex<Option<PathBuf>>,
    codec: Mutex<Option<PathBuf>>,
}

async fn cached<T, F, Fut>(
    slot: &Mutex<Option<T>>,
    still_valid: impl Fn(&T) -> bool,
    init: F,
) -> Result<T, DependencyError>
where
    T: Clone,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, DependencyError>>,
{
    let mut guard = slot.lock().await;
    if let Some(value) = guard.as_ref() {
        if still_valid(value) {
            return Ok(value.clone());
        }
    }
    let value = init().await?;
    *guard = Some(value.clone());
    Ok(value)
}

pub struct Materializer {
    layout: Layout,
    platform: Platform,
    transfer: Transfer,
    index_url: String,
    codec_url: Option<String>,
    converter_url: Option<String>,
    stale_timeout: Duration,
    chunk_size: usize,
    system_lookup: bool,
    resolved: DependencyBundle,
}

impl Materializer {
    pub fn new(root: impl Into<PathBuf>, platform: Platform, transfer: Transfer) -> Self {
        Self {
            layout: Layout::new(root),
            platform,
            transfer,
            index_url: DEFAULT_TOR_INDEX_URL.to_string(),
            codec_url: None,
            converter_url: None,
            stale_timeout: DEFAULT_STALE_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            system_lookup: true,
            resolved: DependencyBundle::default(),
        }
    }

    pub fn with_index_url(mut self, url: impl Into<String>) -> Self {
        self.index_url = url.into();
        self
    }

    /// Fetch the ffmpeg `.7z` from `url` instead of the platform table.
    pub fn with_codec_url(mut self, url: impl Into<String>) -> Self {
        self.codec_url = Some(url.into());
        self
    }

    /// Fetch the portable 7-Zip from `url` instead of the platform table.
    pub fn with_converter_url(mut self, url: impl Into<String>) -> Self {
        self.converter_url = Some(url.into());
        self
    }

    pub fn with_transfer_limits(mut self, stale_timeout: Duration, chunk_size: usize) -> Self {
        self.stale_timeout = stale_timeout;
        self.chunk_size = chunk_size;
        self
    }

    /// Only consider files under the installation root, never `PATH`.
    pub fn without_system_lookup(mut self) -> Self {
        self.system_lookup = false;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Make `dependency` available and return the path of its main file.
    pub async fn ensure(&self, dependency: Dependency) -> Result<PathBuf, DependencyError> {
        match dependency {
            Dependency::Proxy => self.proxy().await.map(|bundle| bundle.binary),
            Dependency::Converter => self.converter().await,
            Dependency::Codec => self.codec().await,
        }
    }

    pub async fn proxy(&self) -> Result<ProxyBundle, DependencyError> {
        cached(&self.resolved.proxy, ProxyBundle::is_complete, || self.materialize_proxy()).await
    }

    pub async fn converter(&self) -> Result<PathBuf, DependencyError> {
        cached(&self.resolved.converter, |p: &PathBuf| p.is_file(), || {
            self.materialize_converter()
        })
        .await
    }

    pub async fn codec(&self) -> Result<PathBuf, DependencyError> {
        cached(&self.resolved.codec, |p: &PathBuf| p.is_file(), || self.materialize_codec()).await
    }

    async fn materialize_proxy(&self) -> Result<ProxyBundle, DependencyError> {
        let bundle = self.layout.proxy_bundle(&self.platform);
        if bundle.is_complete() {
            debug!("Tor already present at {}", bundle.binary.display());
            return Ok(bundle);
        }

        info!("Required Tor files missing. Downloading Tor Expert Bundle...");
        let (os, arch) = self.platform.tor_bundle_handles()?;

        let index = self.get_text(&self.index_url).await?;
        let latest = listing::latest_version(&index).ok_or_else(|| {
            DependencyError::NotFound(format!("release version in {}", self.index_url))
        })?;

        let version_url = format!("{}/{}/", self.index_url.trim_end_matches('/'), latest);
        let page = self.get_text(&version_url).await?;
        let file_name = listing::find_bundle_file(&page, TOR_COMPONENT, os, arch, TOR_ARCHIVE_EXT)
            .map(|name| sanitize_filename(&name))
            .ok_or_else(|| {
                DependencyError::NotFound(format!(
                    "{}-{}-{} in {}",
                    TOR_COMPONENT, os, arch, version_url
                ))
            })?;

        tokio::fs::create_dir_all(&self.layout.root).await?;
        let archive_path = self.layout.root.join(&file_name);
        info!("Downloading {}...", file_name);
        self.transfer
            .fetch(
                &format!("{}{}", version_url, file_name),
                &archive_path,
                &format!("Tor {}", latest),
                self.stale_timeout,
                self.chunk_size,
            )
            .await?;

        let staging = tempfile::Builder::new()
            .prefix(".tor-unpack-")
            .tempdir_in(&self.layout.root)?;
        let unpacked = {
            let archive_path = archive_path.clone();
            let staging_path = staging.path().to_path_buf();
            tokio::task::spawn_blocking(move || archive::extract_tar_gz(&archive_path, &staging_path))
                .await
                .map_err(|e| DependencyError::Extract {
                    archive: file_name.clone(),
                    reason: e.to_string(),
                })
                .and_then(|r| r)
        };
        remove_quietly(&archive_path).await;
        unpacked?;

        self.place_proxy_files(staging.path(), &bundle)?;
        if !bundle.is_complete() {
            return Err(DependencyError::NotFound(format!(
                "tor files after unpacking {}",
                file_name
            )));
        }
        info!("Tor {} installed at {}", latest, bundle.binary.display());
        Ok(bundle)
    }

    /// Move the binary (with everything next to it, i.e. its shared
    /// libraries) and the geoip files out of the staging directory.
    fn place_proxy_files(&self, staging: &Path, bundle: &ProxyBundle) -> Result<(), DependencyError> {
        let binary_name = self.platform.executable("tor");
        let binary = archive::find_file(staging, &binary_name)
            .ok_or_else(|| DependencyError::NotFound(format!("{} in bundle", binary_name)))?;

        let tor_dir = self.layout.tor_dir();
        let data_dir = self.layout.data_dir();
        std::fs::create_dir_all(&tor_dir)?;
        std::fs::create_dir_all(&data_dir)?;

        if let Some(binary_dir) = binary.parent() {
            for entry in std::fs::read_dir(binary_dir)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    std::fs::rename(entry.path(), tor_dir.join(entry.file_name()))?;
                }
            }
        }

        for (name, target) in [("geoip", &bundle.geoip), ("geoip6", &bundle.geoip6)] {
            match archive::find_file(staging, name) {
                Some(found) => std::fs::rename(found, target)?,
                None => warn!("{} missing from bundle", name),
            }
        }
        Ok(())
    }

    async fn materialize_converter(&self) -> Result<PathBuf, DependencyError> {
        if self.system_lookup {
            for name in ["7z", "7za", "7zz"] {
                if let Ok(path) = which::which(name) {
                    debug!("Using system 7-Zip at {}", path.display());
                    return Ok(path);
                }
            }
        }

        let local = self.layout.root.join(self.platform.executable("7zr"));
        if local.is_file() {
            return Ok(local);
        }

        let url = match &self.converter_url {
            Some(url) => url.as_str(),
            None => self.platform.converter_url()?,
        };
        info!("Downloading portable 7-Zip...");
        tokio::fs::create_dir_all(&self.layout.root).await?;
        self.transfer
            .fetch(url, &local, "7-Zip", self.stale_timeout, self.chunk_size)
            .await?;
        mark_executable(&local)?;
        Ok(local)
    }

    async fn materialize_codec(&self) -> Result<PathBuf, DependencyError> {
        let name = self.platform.executable("ffmpeg");
        let codec_dir = self.layout.codec_dir();
        if let Some(found) = archive::find_file(&codec_dir, &name) {
            return Ok(found);
        }

        if self.system_lookup {
            if let Ok(path) = which::which("ffmpeg") {
                info!("Using system ffmpeg at {}", path.display());
                return Ok(path);
            }
        }

        let url = match &self.codec_url {
            Some(url) => url.as_str(),
            None => self.platform.codec_bundle_url()?,
        };
        info!("ffmpeg not found. Downloading ffmpeg...");
        tokio::fs::create_dir_all(&self.layout.root).await?;
        let archive_path = self.layout.root.join("ffmpeg.7z");
        self.transfer
            .fetch(url, &archive_path, "ffmpeg", self.stale_timeout, self.chunk_size)
            .await?;

        let converter = self.converter().await?;
        let unpacked = archive::extract_with_7z(&converter, &archive_path, &codec_dir).await;
        remove_quietly(&archive_path).await;
        unpacked?;

        archive::find_file(&codec_dir, &name)
            .ok_or_else(|| DependencyError::NotFound(format!("{} after extraction", name)))
    }

    async fn get_text(&self, url: &str) -> Result<String, DependencyError> {
        let listing_error = |e: reqwest::Error| DependencyError::Listing {
            url: url.to_string(),
            reason: e.to_string(),
        };
        self.transfer
            .client()
            .get(url)
            .timeout(self.stale_timeout)
            .send()
            .await
            .map_err(listing_error)?
            .error_for_status()
            .map_err(listing_error)?
            .text()
            .await
            .map_err(listing_error)
    }
}

impl ProxyBinarySource for Materializer {
    fn proxy_bundle(&self) -> impl Future<Output = Result<ProxyBundle, DependencyError>> + Send {
        self.proxy()
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
