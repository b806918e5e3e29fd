/// Archive unpacking and file lookup helpers for bootstrapped dependencies.
use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

use relayfetch_shared::errors::DependencyError;

/// Unpack a `.tar.gz` into `destination`. Blocking; run off the async runtime.
pub fn extract_tar_gz(archive_path: &Path, destination: &Path) -> Result<(), DependencyError> {
    info!("Extracting {} -> {}", archive_path.display(), destination.display());
    std::fs::create_dir_all(destination)?;

    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive.unpack(destination).map_err(|e| DependencyError::Extract {
        archive: archive_path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Unpack any archive 7-Zip understands by running the converter binary.
pub async fn extract_with_7z(
    converter: &Path,
    archive_path: &Path,
    destination: &Path,
) -> Result<(), DependencyError> {
    info!(
        "Extracting {} with {} -> {}",
        archive_path.display(),
        converter.display(),
        destination.display()
    );
    tokio::fs::create_dir_all(destination).await?;

    let output = Command::new(converter)
        .arg("x")
        .arg(archive_path)
        .arg(format!("-o{}", destination.display()))
        .arg("-y")
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DependencyError::Extract {
            archive: archive_path.display().to_string(),
            reason: format!("{} exited with {}: {}", converter.display(), output.status, stderr.trim()),
        });
    }
    Ok(())
}

/// First file under `root` (recursively) whose name matches `name`,
/// ignoring ASCII case.
pub fn find_file(root: &Path, name: &str) -> Option<PathBuf> {
    if !root.is_dir() {
        return None;
    }
    let found = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .find(|e| e.file_name().to_string_lossy().eq_ignore_ascii_case(name))
        .map(|e| e.into_path());
    debug!("Lookup {} under {}: {:?}", name, root.display(), found);
    found
}
