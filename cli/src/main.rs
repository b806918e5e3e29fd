/// relayfetch - Main Entry Point
///
/// Downloads a video through Tor, rotating the exit country until one
/// attempt succeeds. Tor, ffmpeg and 7-Zip are fetched on first use.
mod identity;
mod progress;
mod rotation;
mod shutdown;
mod target_link;
mod workers;

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use relayfetch_downloader::{Dependency, Materializer, Platform, Transfer};
use relayfetch_shared::config::Settings;
use relayfetch_shared::errors::RelayResult;
use relayfetch_shared::fetcher_protocol::FetchRequest;

use identity::{IdentityProbe, TorCheckProbe};
use rotation::{Delivery, ProxyControl, RotationController};
use workers::media_fetcher::{MediaFetcher, YtDlpFetcher};
use workers::proxy_supervisor::ProxySupervisor;

#[derive(Debug, Parser)]
#[command(name = "relayfetch", version, about = "Download a video through rotating Tor exit countries")]
struct Cli {
    /// Show tor and yt-dlp output and debug logs
    #[arg(short, long)]
    verbose: bool,

    /// Video URL; asked for interactively when omitted
    url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    info!("=== relayfetch starting ===");

    let settings = Settings::from_env()?.with_verbose(cli.verbose);
    let input = match cli.url {
        Some(url) => url,
        None => prompt_for_url()?,
    };
    let Some(link) = target_link::detect(&input) else {
        bail!("no URL found in {:?}", input.trim());
    };
    info!("Target: {} {}", link.kind(), link.url());
    if let Some(id) = link.id() {
        debug!("Target id: {}", id);
    }
    if link.is_playlist() {
        info!("Playlist entries will be fetched one by one through the same exit");
    }

    tokio::fs::create_dir_all(&settings.download_dir)
        .await
        .with_context(|| format!("creating {}", settings.download_dir.display()))?;
    info!("Saving to {}", settings.download_dir.display());

    let platform = Platform::current()?;
    debug!("Host platform: {}", platform);

    let client = reqwest::Client::builder()
        .connect_timeout(settings.stall_timeout)
        .build()?;
    let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
    let transfer_renderer = progress::spawn_transfer_renderer(transfer_rx);
    let materializer = Arc::new(
        Materializer::new(
            &settings.install_root,
            platform,
            Transfer::new(client).with_events(transfer_tx),
        )
        .with_index_url(&settings.tor_index_url)
        .with_transfer_limits(settings.stall_timeout, settings.chunk_size),
    );

    let ytdlp = YtDlpFetcher::locate(settings.ytdlp_bin.as_deref())?;
    info!("Using yt-dlp at {}", ytdlp.display());
    let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
    let fetch_renderer = progress::spawn_fetch_renderer(fetch_rx);
    let fetcher = YtDlpFetcher::new(ytdlp).with_events(fetch_tx);

    let supervisor = ProxySupervisor::new(
        materializer.clone(),
        settings.socks_port,
        settings.control_port,
    )
    .with_verbose(settings.verbose);
    let identity = settings
        .identity_check
        .then(|| TorCheckProbe::new(&settings.identity_check_url));

    let mut controller = RotationController::new(
        supervisor,
        fetcher,
        identity,
        settings.candidates.clone(),
        settings.ready_timeout,
    );

    let outcome = tokio::select! {
        result = run(&mut controller, &materializer, &settings, link.url()) => Some(result),
        _ = shutdown::shutdown_signal() => None,
    };

    controller.shutdown().await;
    debug!("Proxy supervisor state: {:?}", controller.proxy().state());

    // Closing the event channels lets the renderers finish their bars.
    drop(controller);
    drop(materializer);
    let _ = transfer_renderer.await;
    let _ = fetch_renderer.await;

    match outcome {
        Some(Ok(delivery)) => {
            match &delivery.output {
                Some(path) => info!("Saved {} (exit country {})", path.display(), delivery.candidate),
                None => info!(
                    "Download finished in {} (exit country {})",
                    settings.download_dir.display(),
                    delivery.candidate
                ),
            }
            Ok(())
        }
        Some(Err(e)) => {
            error!("{}", e);
            Err(e.into())
        }
        None => {
            warn!("Interrupted, proxy stopped");
            bail!("interrupted")
        }
    }
}

/// Make sure ffmpeg is around, then rotate through exit countries.
async fn run<P, F, I>(
    controller: &mut RotationController<P, F, I>,
    materializer: &Materializer,
    settings: &Settings,
    url: &str,
) -> RelayResult<Delivery>
where
    P: ProxyControl,
    F: MediaFetcher,
    I: IdentityProbe,
{
    let codec = materializer.ensure(Dependency::Codec).await?;
    info!("Using ffmpeg at {}", codec.display());

    let request = FetchRequest::new(url)
        .with_codec_location(codec)
        .with_output_dir(&settings.download_dir);
    Ok(controller.run(&request).await?)
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let mut directives = format!(
        "relayfetch={0},relayfetch_downloader={0},relayfetch_shared={0}",
        level
    );
    if verbose {
        directives.push_str(",tor=debug,yt_dlp=debug");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives)),
        )
        .init();
}

fn prompt_for_url() -> anyhow::Result<String> {
    print!("Enter video URL: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin()
        .read_line(&mut line)
        .context("reading URL from stdin")?;
    Ok(line)
}
