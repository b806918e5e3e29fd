/// Unified error types for the relayfetch system.
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Top-level error type for relayfetch.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Proxy supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Rotation error: {0}")]
    Rotation(#[from] RotationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Invalid runtime settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid exit country code {0:?} (expected two ASCII letters)")]
    InvalidCandidate(String),

    #[error("exit country list is empty")]
    NoCandidates,

    #[error("cannot determine installation root: {0}")]
    InstallRoot(String),
}

/// Errors from a single streaming transfer. All are terminal for the call.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("HTTP request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    #[error("{label} stalled: no data for {}s", elapsed.as_secs())]
    Stall { label: String, elapsed: Duration },

    #[error("IO error while writing transfer: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    pub fn http(url: &str, reason: impl ToString) -> Self {
        TransferError::Http {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this failure came from the stall watchdog.
    pub fn is_stall(&self) -> bool {
        matches!(self, TransferError::Stall { .. })
    }
}

/// Errors while making an external binary or data file available locally.
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("no known bundle for platform {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("failed to read listing {url}: {reason}")]
    Listing { url: String, reason: String },

    #[error("failed to unpack {archive}: {reason}")]
    Extract { archive: String, reason: String },

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while launching the proxy subprocess.
///
/// Per-candidate problems (slow startup, fetch failures) are not errors here;
/// anything in this enum means no candidate can succeed either.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("failed to write proxy configuration: {0}")]
    ConfigWrite(std::io::Error),

    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures reported by the external media fetcher (yt-dlp).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("failed to run media fetcher: {0}")]
    Spawn(String),

    #[error("geo restricted: {0}")]
    GeoRestricted(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("video unavailable: {0}")]
    Unavailable(String),

    #[error("media fetcher failed (exit {code:?}): {message}")]
    Failed { code: Option<i32>, message: String },
}

impl FetchError {
    /// Classify a failed run from its last error line and exit code.
    pub fn classify(message: Option<&str>, code: Option<i32>) -> Self {
        let message = message
            .map(|m| m.trim().trim_start_matches("ERROR:").trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "no error output".to_string());
        let lower = message.to_lowercase();

        if lower.contains("not available in your country")
            || lower.contains("geo restrict")
            || lower.contains("geo-restrict")
        {
            FetchError::GeoRestricted(message)
        } else if lower.contains("http error 429") || lower.contains("too many requests") {
            FetchError::RateLimited(message)
        } else if lower.contains("sign in to confirm") || lower.contains("login required") {
            FetchError::AuthRequired(message)
        } else if lower.contains("video unavailable")
            || lower.contains("private video")
            || lower.contains("has been removed")
        {
            FetchError::Unavailable(message)
        } else {
            FetchError::Failed { code, message }
        }
    }
}

/// Why a single egress candidate did not produce a download.
#[derive(Debug, Clone, Error)]
pub enum AttemptFailure {
    #[error("proxy not ready after {}s", timeout.as_secs())]
    NotReady { timeout: Duration },

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// One line of the final failure summary.
#[derive(Debug, Clone)]
pub struct CandidateFailure {
    pub candidate: String,
    pub started_at: DateTime<Utc>,
    pub reason: AttemptFailure,
}

impl std::fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (at {}): {}",
            self.candidate.to_uppercase(),
            self.started_at.format("%H:%M:%S"),
            self.reason
        )
    }
}

/// Errors from the egress rotation loop.
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("all {} exit countries failed:\n{}", failures.len(), render_failures(failures))]
    AllCandidatesFailed { failures: Vec<CandidateFailure> },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

fn render_failures(failures: &[CandidateFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("  - {}", f))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Result type alias for relayfetch operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_geo_restriction() {
        let err = FetchError::classify(
            Some("ERROR: [youtube] abc: The uploader has not made this video available in your country"),
            Some(1),
        );
        assert!(matches!(err, FetchError::GeoRestricted(_)));
    }

    #[test]
    fn test_classify_rate_limit_and_auth() {
        assert!(matches!(
            FetchError::classify(Some("ERROR: HTTP Error 429: Too Many Requests"), Some(1)),
            FetchError::RateLimited(_)
        ));
        assert!(matches!(
            FetchError::classify(Some("ERROR: Sign in to confirm you're not a bot"), Some(1)),
            FetchError::AuthRequired(_)
        ));
    }

    #[test]
    fn test_classify_fallback_keeps_code() {
        let err = FetchError::classify(None, Some(2));
        assert_eq!(
            err,
            FetchError::Failed {
                code: Some(2),
                message: "no error output".to_string()
            }
        );
    }

    #[test]
    fn test_all_failed_summary_lists_candidates() {
        let err = RotationError::AllCandidatesFailed {
            failures: vec![
                CandidateFailure {
                    candidate: "se".into(),
                    started_at: Utc::now(),
                    reason: AttemptFailure::NotReady {
                        timeout: Duration::from_secs(40),
                    },
                },
                CandidateFailure {
                    candidate: "ch".into(),
                    started_at: Utc::now(),
                    reason: AttemptFailure::Fetch(FetchError::RateLimited("slow down".into())),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("all 2 exit countries failed"));
        assert!(text.contains("SE"));
        assert!(text.contains("proxy not ready after 40s"));
        assert!(text.contains("CH"));
        assert!(text.contains("rate limited: slow down"));
    }
}
