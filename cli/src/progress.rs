/// Terminal progress bars for dependency transfers and the media fetch.
use std::collections::HashMap;

use indicatif::{ProgressBar, ProgressStyle};
use once_cell::sync::Lazy;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use relayfetch_downloader::TransferEvent;
use relayfetch_shared::fetcher_protocol::FetchEvent;

const SIZED_STYLE: &str =
    "{spinner:.blue} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

const UNSIZED_STYLE: &str = "{spinner:.blue} {msg} {bytes} ({bytes_per_sec})";

const FETCH_STYLE: &str = "{spinner:.green} [{bar:40.green/white}] {percent:>3}% {wide_msg}";

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_bar())
}

static SIZED: Lazy<ProgressStyle> = Lazy::new(|| style(SIZED_STYLE).progress_chars("=> "));
static UNSIZED: Lazy<ProgressStyle> = Lazy::new(|| style(UNSIZED_STYLE));
static FETCH: Lazy<ProgressStyle> = Lazy::new(|| style(FETCH_STYLE).progress_chars("=> "));

/// One bar per transfer label; byte counter when the size is unknown.
pub fn spawn_transfer_renderer(mut rx: mpsc::UnboundedReceiver<TransferEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut bars: HashMap<String, ProgressBar> = HashMap::new();
        while let Some(event) = rx.recv().await {
            match event {
                TransferEvent::Started { label, total } => {
                    let bar = match total {
                        Some(len) => ProgressBar::new(len).with_style(SIZED.clone()),
                        None => ProgressBar::no_length().with_style(UNSIZED.clone()),
                    };
                    bar.set_message(label.clone());
                    bars.insert(label, bar);
                }
                TransferEvent::Progress { label, received, .. } => {
                    if let Some(bar) = bars.get(&label) {
                        bar.set_position(received);
                    }
                }
                TransferEvent::Finished { label, .. } => {
                    if let Some(bar) = bars.remove(&label) {
                        bar.finish_with_message(format!("{} done", label));
                    }
                }
                TransferEvent::Failed { label, reason } => {
                    if let Some(bar) = bars.remove(&label) {
                        bar.abandon_with_message(format!("{} failed: {}", label, reason));
                    }
                }
            }
        }
    })
}

/// A single bar driven by yt-dlp percentages, reused across attempts.
pub fn spawn_fetch_renderer(mut rx: mpsc::UnboundedReceiver<FetchEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new(1000).with_style(FETCH.clone());
        while let Some(event) = rx.recv().await {
            match event {
                FetchEvent::Progress { percent, speed, eta, .. } => {
                    bar.set_position((percent * 10.0).round() as u64);
                    if let (Some(speed), Some(eta)) = (speed, eta) {
                        bar.set_message(format!("{} ETA {}", speed, eta));
                    }
                }
                FetchEvent::Destination(path) => {
                    bar.reset();
                    bar.set_message(display_name(&path));
                }
                FetchEvent::Merging(path) => {
                    bar.set_message(format!("merging into {}", display_name(&path)));
                }
                FetchEvent::AlreadyDownloaded(path) => {
                    bar.set_position(1000);
                    bar.set_message(format!("{} already downloaded", display_name(&path)));
                }
                FetchEvent::Error(message) => {
                    bar.println(format!("yt-dlp: {}", message));
                }
            }
        }
        bar.finish_and_clear();
    })
}

fn display_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_renderers_drain_and_stop_when_senders_drop() {
        let (ttx, trx) = mpsc::unbounded_channel();
        let (ftx, frx) = mpsc::unbounded_channel();
        let transfers = spawn_transfer_renderer(trx);
        let fetches = spawn_fetch_renderer(frx);

        ttx.send(TransferEvent::Started { label: "Tor".into(), total: None }).unwrap();
        ttx.send(TransferEvent::Progress {
            label: "Tor".into(),
            received: 10,
            total: None,
            bytes_per_sec: 10.0,
        })
        .unwrap();
        ttx.send(TransferEvent::Finished { label: "Tor".into(), received: 10 }).unwrap();
        ftx.send(FetchEvent::Destination("/tmp/a.mp4".into())).unwrap();
        ftx.send(FetchEvent::Progress {
            percent: 50.0,
            total: None,
            speed: Some("1MiB/s".into()),
            eta: Some("00:01".into()),
        })
        .unwrap();
        drop(ttx);
        drop(ftx);

        transfers.await.unwrap();
        fetches.await.unwrap();
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name(std::path::Path::new("/tmp/My_Clip.mp4")), "My_Clip.mp4");
    }
}
