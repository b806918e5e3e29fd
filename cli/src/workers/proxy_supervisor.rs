/// Tor subprocess supervisor.
///
/// Owns at most one tor process at a time. Each launch gets a freshly written,
/// uniquely named torrc that is removed again on termination. A tor instance
/// that was already listening on the SOCKS port before we started is used
/// as-is and never signalled.
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use relayfetch_downloader::ProxyBinarySource;
use relayfetch_shared::errors::SupervisorError;
use relayfetch_shared::models::{EgressCandidate, ProxyConfig};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Configuring,
    Starting,
    AwaitingReady,
    Ready,
    Terminating,
}

/// Runtime handle over one proxy process.
#[derive(Debug)]
pub struct ProxySession {
    child: Option<Child>,
    config_path: Option<PathBuf>,
    started_by_us: bool,
    candidate: EgressCandidate,
}

pub struct ProxySupervisor<S> {
    source: S,
    socks_port: u16,
    control_port: u16,
    verbose: bool,
    grace_period: Duration,
    poll_interval: Duration,
    state: SupervisorState,
    session: Option<ProxySession>,
}

impl<S: ProxyBinarySource> ProxySupervisor<S> {
    pub fn new(source: S, socks_port: u16, control_port: u16) -> Self {
        Self {
            source,
            socks_port,
            control_port,
            verbose: false,
            grace_period: DEFAULT_GRACE_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            state: SupervisorState::Idle,
            session: None,
        }
    }

    /// Forward tor's own output to the `tor` tracing target.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn proxy_url(&self) -> String {
        format!("socks5://127.0.0.1:{}", self.socks_port)
    }

    /// Launch tor for `candidate`, replacing whatever session exists.
    pub async fn start(&mut self, candidate: &EgressCandidate) -> Result<(), SupervisorError> {
        self.terminate().await;
        self.state = SupervisorState::Configuring;

        if port_accepts(self.socks_port).await {
            warn!(
                "SOCKS port {} is already served by another process; using it as-is (exit country {} not enforced)",
                self.socks_port, candidate
            );
            self.session = Some(ProxySession {
                child: None,
                config_path: None,
                started_by_us: false,
                candidate: candidate.clone(),
            });
            self.state = SupervisorState::Starting;
            return Ok(());
        }

        let bundle = match self.source.proxy_bundle().await {
            Ok(bundle) => bundle,
            Err(e) => {
                self.state = SupervisorState::Idle;
                return Err(e.into());
            }
        };

        let config = ProxyConfig::for_candidate(
            candidate,
            self.socks_port,
            self.control_port,
            bundle.geoip.clone(),
            bundle.geoip6.clone(),
        );
        let config_path = std::env::temp_dir().join(format!("relayfetch-{}.torrc", Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&config_path, config.render()).await {
            self.state = SupervisorState::Idle;
            return Err(SupervisorError::ConfigWrite(e));
        }
        debug!("Wrote proxy config {}", config_path.display());

        self.state = SupervisorState::Starting;
        info!("Starting Tor with exit country {}", candidate);

        let mut command = Command::new(&bundle.binary);
        command
            .arg("-f")
            .arg(&config_path)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = bundle.binary.parent() {
            command.current_dir(dir);
            // The expert bundle ships its own libevent/openssl next to the binary.
            #[cfg(target_os = "linux")]
            command.env("LD_LIBRARY_PATH", dir);
        }
        if self.verbose {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                remove_config(&config_path);
                self.state = SupervisorState::Idle;
                return Err(SupervisorError::Spawn {
                    binary: bundle.binary.display().to_string(),
                    source,
                });
            }
        };
        info!("Tor spawned (pid: {:?})", child.id());

        forward_output(child.stdout.take());
        forward_output(child.stderr.take());

        self.session = Some(ProxySession {
            child: Some(child),
            config_path: Some(config_path),
            started_by_us: true,
            candidate: candidate.clone(),
        });
        Ok(())
    }

    /// Poll the SOCKS port until it accepts a connection or `timeout` passes.
    pub async fn await_ready(&mut self, timeout: Duration) -> bool {
        if self.session.is_none() {
            return false;
        }
        self.state = SupervisorState::AwaitingReady;
        let deadline = Instant::now() + timeout;

        loop {
            if port_accepts(self.socks_port).await {
                info!("Tor is accepting connections on port {}", self.socks_port);
                self.state = SupervisorState::Ready;
                return true;
            }

            if let Some(child) = self.session.as_mut().and_then(|s| s.child.as_mut()) {
                if let Ok(Some(status)) = child.try_wait() {
                    warn!("Tor exited before becoming ready: {}", status);
                    return false;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("Tor not ready after {}s", timeout.as_secs());
                return false;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Stop the current session. Safe to call any number of times.
    pub async fn terminate(&mut self) {
        let Some(mut session) = self.session.take() else {
            self.state = SupervisorState::Idle;
            return;
        };
        self.state = SupervisorState::Terminating;

        if session.started_by_us {
            if let Some(child) = session.child.take() {
                info!("Stopping Tor (exit country {})", session.candidate);
                stop_child(child, self.grace_period).await;
            }
        } else {
            info!("Leaving pre-existing proxy on port {} running", self.socks_port);
        }

        if let Some(path) = session.config_path.take() {
            remove_config(&path);
        }
        self.state = SupervisorState::Idle;
    }
}

impl<S> Drop for ProxySupervisor<S> {
    fn drop(&mut self) {
        // Can't await here; kill_on_drop reaps whatever start_kill misses.
        if let Some(mut session) = self.session.take() {
            if session.started_by_us {
                if let Some(child) = session.child.as_mut() {
                    let _ = child.start_kill();
                }
            }
            if let Some(path) = session.config_path.take() {
                remove_config(&path);
            }
        }
    }
}

async fn port_accepts(port: u16) -> bool {
    matches!(
        tokio::time::timeout(Duration::from_secs(1), TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

fn forward_output<R>(stream: Option<R>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    if let Some(stream) = stream {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "tor", "{}", line);
            }
        });
    }
}

async fn stop_child(mut child: Child, grace_period: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!("Tor already exited: {}", status);
        return;
    }

    request_stop(&mut child);
    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => info!("Tor exited with status: {}", status),
        Ok(Err(e)) => warn!("Error waiting for tor: {}", e),
        Err(_) => {
            warn!("Tor did not exit in time, killing...");
            if let Err(e) = child.kill().await {
                warn!("Failed to kill tor: {}", e);
            }
        }
    }
}

#[cfg(unix)]
fn request_stop(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("Failed to send SIGTERM to tor (pid {}): {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to stop tor: {}", e);
    }
}

fn remove_config(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed proxy config {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove proxy config {}: {}", path.display(), e),
    }
}
