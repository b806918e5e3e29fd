/// Streaming HTTP transfer with a stall watchdog.
///
/// Bytes are appended to the destination as they arrive. When no non-empty
/// chunk shows up for longer than the stale timeout the transfer aborts, even
/// if the connection is still technically open.
use std::path::Path;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relayfetch_shared::errors::TransferError;

pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Per-call progress state. Dropped when the call returns.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub bytes_received: u64,
    pub expected_total: Option<u64>,
    started: Instant,
    last_receipt: Instant,
}

impl TransferProgress {
    pub fn new(expected_total: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            bytes_received: 0,
            expected_total,
            started: now,
            last_receipt: now,
        }
    }

    fn record(&mut self, len: usize) {
        self.bytes_received += len as u64;
        self.last_receipt = Instant::now();
    }

    pub fn since_last_receipt(&self) -> Duration {
        self.last_receipt.elapsed()
    }

    pub fn percent(&self) -> Option<f64> {
        self.expected_total
            .filter(|t| *t > 0)
            .map(|t| self.bytes_received as f64 / t as f64 * 100.0)
    }

    /// Average throughput since the transfer began.
    pub fn bytes_per_sec(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64().max(0.1);
        self.bytes_received as f64 / elapsed
    }
}

/// Observable transfer events, for progress rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Started {
        label: String,
        total: Option<u64>,
    },
    Progress {
        label: String,
        received: u64,
        total: Option<u64>,
        bytes_per_sec: f64,
    },
    Finished {
        label: String,
        received: u64,
    },
    Failed {
        label: String,
        reason: String,
    },
}

/// Stall-aware downloader. Cheap to clone.
#[derive(Clone)]
pub struct Transfer {
    client: reqwest::Client,
    events: Option<mpsc::UnboundedSender<TransferEvent>>,
}

impl Transfer {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client, events: None }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Publish progress on the given channel.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<TransferEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, event: TransferEvent) {
        if let Some(tx) = &self.events {
            // Receiver gone only means nobody is rendering.
            let _ = tx.send(event);
        }
    }

    /// Stream `url` into `dest`, returning the number of bytes written.
    ///
    /// If the transfer fails after `dest` was opened, the partial file is
    /// removed so callers never mistake it for a finished artifact. A failure
    /// before that point leaves whatever was at `dest` untouched.
    pub async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        label: &str,
        stale_timeout: Duration,
        chunk_size: usize,
    ) -> Result<u64, TransferError> {
        info!("{}: downloading {} -> {}", label, url, dest.display());

        let result = match self.request(url, label, stale_timeout).await {
            Ok(response) => {
                self.stream_to_file(response, url, dest, label, stale_timeout, chunk_size.max(1))
                    .await
            }
            Err(e) => Err(e),
        };
        match &result {
            Ok(received) => {
                self.emit(TransferEvent::Finished {
                    label: label.to_string(),
                    received: *received,
                });
                info!("{}: finished ({} KB)", label, received / 1024);
            }
            Err(e) => {
                warn!("{}: transfer failed: {}", label, e);
                self.emit(TransferEvent::Failed {
                    label: label.to_string(),
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    async fn request(
        &self,
        url: &str,
        label: &str,
        stale_timeout: Duration,
    ) -> Result<reqwest::Response, TransferError> {
        tokio::time::timeout(stale_timeout, self.client.get(url).send())
            .await
            .map_err(|_| TransferError::Stall {
                label: label.to_string(),
                elapsed: stale_timeout,
            })?
            .map_err(|e| TransferError::http(url, e))?
            .error_for_status()
            .map_err(|e| TransferError::http(url, e))
    }

    async fn stream_to_file(
        &self,
        response: reqwest::Response,
        url: &str,
        dest: &Path,
        label: &str,
        stale_timeout: Duration,
        chunk_size: usize,
    ) -> Result<u64, TransferError> {
        let total = response.content_length();
        self.emit(TransferEvent::Started {
            label: label.to_string(),
            total,
        });

        let mut file = tokio::fs::File::create(dest).await?;
        let copied = self
            .copy_body(response, &mut file, url, label, stale_timeout, chunk_size)
            .await;
        if copied.is_err() {
            drop(file);
            if let Err(rm) = tokio::fs::remove_file(dest).await {
                warn!("Failed to remove partial file {}: {}", dest.display(), rm);
            }
        }
        copied
    }

    async fn copy_body(
        &self,
        response: reqwest::Response,
        file: &mut tokio::fs::File,
        url: &str,
        label: &str,
        stale_timeout: Duration,
        chunk_size: usize,
    ) -> Result<u64, TransferError> {
        let total = response.content_length();
        let mut stream = response.bytes_stream();
        let mut progress = TransferProgress::new(total);

        loop {
            let remaining = stale_timeout.saturating_sub(progress.since_last_receipt());
            let next = match tokio::time::timeout(remaining, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    return Err(TransferError::Stall {
                        label: label.to_string(),
                        elapsed: progress.since_last_receipt(),
                    })
                }
            };

            let bytes = match next {
                None => break,
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return Err(TransferError::http(url, e)),
            };

            // Empty chunks do not count as progress.
            if bytes.is_empty() {
                continue;
            }

            for piece in bytes.chunks(chunk_size) {
                file.write_all(piece).await?;
                progress.record(piece.len());
                self.emit(TransferEvent::Progress {
                    label: label.to_string(),
                    received: progress.bytes_received,
                    total,
                    bytes_per_sec: progress.bytes_per_sec(),
                });
            }

            match progress.percent() {
                Some(pct) => debug!(
                    "{}: {:6.2}% ({} KB / {} KB) {:6.1} KB/s",
                    label,
                    pct,
                    progress.bytes_received / 1024,
                    total.unwrap_or(0) / 1024,
                    progress.bytes_per_sec() / 1024.0
                ),
                None => debug!(
                    "{}: {} KB {:6.1} KB/s",
                    label,
                    progress.bytes_received / 1024,
                    progress.bytes_per_sec() / 1024.0
                ),
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(progress.bytes_received)
    }
}
