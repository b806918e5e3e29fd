/// yt-dlp subprocess adapter.
///
/// Runs one yt-dlp invocation per fetch. Stdout is parsed line by line into
/// `FetchEvent`s; stderr is forwarded to the `yt_dlp` tracing target.
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relayfetch_shared::errors::{DependencyError, FetchError};
use relayfetch_shared::fetcher_protocol::{FetchEvent, FetchRequest};

/// The external media download engine.
pub trait MediaFetcher {
    /// Download `request.url`; on success returns the saved file when known.
    async fn fetch(&self, request: &FetchRequest) -> Result<Option<PathBuf>, FetchError>;
}

pub struct YtDlpFetcher {
    binary: PathBuf,
    events: Option<mpsc::UnboundedSender<FetchEvent>>,
}

impl YtDlpFetcher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            events: None,
        }
    }

    /// Resolve the yt-dlp executable: an explicit path or name, else `yt-dlp` on `PATH`.
    pub fn locate(configured: Option<&str>) -> Result<PathBuf, DependencyError> {
        let name = configured.unwrap_or("yt-dlp");
        which::which(name).map_err(|e| DependencyError::NotFound(format!("{} ({})", name, e)))
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<FetchEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, event: FetchEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

impl MediaFetcher for YtDlpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<Option<PathBuf>, FetchError> {
        info!("Running yt-dlp for {}", request.url);
        debug!("yt-dlp args: {:?}", request.to_args());

        let mut child = Command::new(&self.binary)
            .args(request.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FetchError::Spawn(format!("{}: {}", self.binary.display(), e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::Spawn("no stdout handle".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FetchError::Spawn("no stderr handle".into()))?;

        // Stderr reader task - forward to tracing, remember the last ERROR line
        let stderr_task = tokio::spawn(async move {
            let mut last_error = None;
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "yt_dlp", "{}", line);
                if let Some(FetchEvent::Error(message)) = FetchEvent::from_line(&line) {
                    last_error = Some(message);
                }
            }
            last_error
        });

        let mut output = None;
        let mut last_error = None;
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Some(event) = FetchEvent::from_line(&line) else {
                continue;
            };
            if let Some(path) = event.output_path() {
                output = Some(path.to_path_buf());
            }
            if let FetchEvent::Error(message) = &event {
                last_error = Some(message.clone());
            }
            self.emit(event);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| FetchError::Spawn(format!("waiting for yt-dlp: {}", e)))?;
        let stderr_error = stderr_task.await.unwrap_or_else(|e| {
            warn!("yt-dlp stderr reader failed: {}", e);
            None
        });

        if status.success() {
            Ok(output)
        } else {
            let message = stderr_error.or(last_error);
            Err(FetchError::classify(message.as_deref(), status.code()))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("yt-dlp");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn request() -> FetchRequest {
        FetchRequest::new("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
            .with_proxy("socks5://127.0.0.1:12212")
    }

    #[tokio::test]
    async fn test_success_reports_merged_file_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(
            dir.path(),
            r#"echo "[download] Destination: /tmp/Clip.f137.mp4"
echo "[download]  42.0% of 10.00MiB at 1.00MiB/s ETA 00:05"
echo "[Merger] Merging formats into \"/tmp/Clip.mp4\""
exit 0"#,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fetcher = YtDlpFetcher::new(bin).with_events(tx);

        let output = fetcher.fetch(&request()).await.unwrap();
        assert_eq!(output, Some(PathBuf::from("/tmp/Clip.mp4")));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], FetchEvent::Progress { percent, .. } if percent == 42.0));
    }

    #[tokio::test]
    async fn test_failure_is_classified_from_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(
            dir.path(),
            r#"echo "ERROR: [youtube] dQw4w9WgXcQ: Video unavailable. This video is not available in your country" >&2
exit 1"#,
        );

        let err = YtDlpFetcher::new(bin).fetch(&request()).await.unwrap_err();
        assert!(matches!(err, FetchError::GeoRestricted(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_failure_without_output_keeps_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "exit 2");

        let err = YtDlpFetcher::new(bin).fetch(&request()).await.unwrap_err();
        assert_eq!(
            err,
            FetchError::Failed {
                code: Some(2),
                message: "no error output".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let err = YtDlpFetcher::new("/nonexistent/yt-dlp")
            .fetch(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Spawn(_)));
    }

    #[test]
    fn test_locate_rejects_unknown_name() {
        assert!(matches!(
            YtDlpFetcher::locate(Some("relayfetch-no-such-fetcher")),
            Err(DependencyError::NotFound(_))
        ));
    }
}
