/// Exit-country rotation.
///
/// Candidates are tried strictly in order, one at a time. Each attempt is
/// start, wait for readiness, optional identity check, fetch; the proxy is
/// terminated after every attempt whatever its outcome. The first successful
/// fetch ends the loop.
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use relayfetch_downloader::ProxyBinarySource;
use relayfetch_shared::errors::{AttemptFailure, CandidateFailure, RotationError, SupervisorError};
use relayfetch_shared::fetcher_protocol::FetchRequest;
use relayfetch_shared::models::{CandidateList, EgressCandidate};

use crate::identity::IdentityProbe;
use crate::workers::media_fetcher::MediaFetcher;
use crate::workers::proxy_supervisor::ProxySupervisor;

/// What the rotation loop needs from the proxy supervisor.
pub trait ProxyControl {
    async fn start(&mut self, candidate: &EgressCandidate) -> Result<(), SupervisorError>;
    async fn await_ready(&mut self, timeout: Duration) -> bool;
    async fn terminate(&mut self);
    fn proxy_url(&self) -> String;
}

impl<S: ProxyBinarySource> ProxyControl for ProxySupervisor<S> {
    async fn start(&mut self, candidate: &EgressCandidate) -> Result<(), SupervisorError> {
        ProxySupervisor::start(self, candidate).await
    }

    async fn await_ready(&mut self, timeout: Duration) -> bool {
        ProxySupervisor::await_ready(self, timeout).await
    }

    async fn terminate(&mut self) {
        ProxySupervisor::terminate(self).await
    }

    fn proxy_url(&self) -> String {
        ProxySupervisor::proxy_url(self)
    }
}

/// A completed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub candidate: EgressCandidate,
    pub output: Option<PathBuf>,
}

pub struct RotationController<P, F, I> {
    proxy: P,
    fetcher: F,
    identity: I,
    candidates: CandidateList,
    ready_timeout: Duration,
}

impl<P, F, I> RotationController<P, F, I>
where
    P: ProxyControl,
    F: MediaFetcher,
    I: IdentityProbe,
{
    pub fn new(proxy: P, fetcher: F, identity: I, candidates: CandidateList, ready_timeout: Duration) -> Self {
        Self {
            proxy,
            fetcher,
            identity,
            candidates,
            ready_timeout,
        }
    }

    pub fn proxy(&self) -> &P {
        &self.proxy
    }

    /// Stop whatever proxy session is still alive.
    pub async fn shutdown(&mut self) {
        self.proxy.terminate().await;
    }

    pub async fn run(&mut self, request: &FetchRequest) -> Result<Delivery, RotationError> {
        let candidates = self.candidates.clone();
        let total = candidates.len();
        let mut failures = Vec::with_capacity(total);

        for (index, candidate) in candidates.iter().enumerate() {
            let started_at = Utc::now();
            info!("Trying exit country {} ({}/{})", candidate, index + 1, total);

            let outcome = self.attempt(candidate, request).await;
            self.proxy.terminate().await;

            match outcome? {
                Ok(output) => {
                    info!("Download finished via exit country {}", candidate);
                    return Ok(Delivery {
                        candidate: candidate.clone(),
                        output,
                    });
                }
                Err(reason) => {
                    warn!("Exit country {} failed: {}", candidate, reason);
                    failures.push(CandidateFailure {
                        candidate: candidate.to_string(),
                        started_at,
                        reason,
                    });
                }
            }
        }

        Err(RotationError::AllCandidatesFailed { failures })
    }

    /// Outer error is fatal for the whole run; inner error moves on to the
    /// next candidate.
    async fn attempt(
        &mut self,
        candidate: &EgressCandidate,
        request: &FetchRequest,
    ) -> Result<Result<Option<PathBuf>, AttemptFailure>, SupervisorError> {
        self.proxy.start(candidate).await?;

        if !self.proxy.await_ready(self.ready_timeout).await {
            return Ok(Err(AttemptFailure::NotReady {
                timeout: self.ready_timeout,
            }));
        }

        let proxy_url = self.proxy.proxy_url();
        match self.identity.probe(&proxy_url).await {
            Some(report) => info!(
                "Exit identity: {} (anonymized: {})",
                report.address, report.is_anonymized
            ),
            None => debug!("No exit identity report"),
        }

        let request = request.clone().with_proxy(proxy_url);
        Ok(self.fetcher.fetch(&request).await.map_err(AttemptFailure::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use relayfetch_shared::errors::{DependencyError, FetchError};

    use crate::identity::IdentityReport;

    #[derive(Default)]
    struct RecordingProxy {
        log: Vec<String>,
        ready: Vec<&'static str>,
        fail_start: Option<&'static str>,
        current: Option<String>,
    }

    impl ProxyControl for RecordingProxy {
        async fn start(&mut self, candidate: &EgressCandidate) -> Result<(), SupervisorError> {
            self.log.push(format!("start:{}", candidate.as_str()));
            if self.fail_start == Some(candidate.as_str()) {
                return Err(DependencyError::NotFound("tor".into()).into());
            }
            self.current = Some(candidate.as_str().to_string());
            Ok(())
        }

        async fn await_ready(&mut self, _timeout: Duration) -> bool {
            self.current
                .as_deref()
                .map(|c| self.ready.iter().any(|r| *r == c))
                .unwrap_or(false)
        }

        async fn terminate(&mut self) {
            self.log.push("terminate".to_string());
            self.current = None;
        }

        fn proxy_url(&self) -> String {
            "socks5://127.0.0.1:12212".to_string()
        }
    }

    #[derive(Default)]
    struct ScriptedFetcher {
        results: RefCell<VecDeque<Result<Option<PathBuf>, FetchError>>>,
        calls: RefCell<Vec<FetchRequest>>,
    }

    impl ScriptedFetcher {
        fn with(results: Vec<Result<Option<PathBuf>, FetchError>>) -> Self {
            Self {
                results: RefCell::new(results.into()),
                calls: RefCell::default(),
            }
        }
    }

    impl MediaFetcher for ScriptedFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<Option<PathBuf>, FetchError> {
            self.calls.borrow_mut().push(request.clone());
            self.results
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Spawn("unexpected call".into())))
        }
    }

    #[derive(Default)]
    struct CountingProbe {
        calls: RefCell<u32>,
    }

    impl IdentityProbe for CountingProbe {
        async fn probe(&self, _proxy_url: &str) -> Option<IdentityReport> {
            *self.calls.borrow_mut() += 1;
            None
        }
    }

    fn candidates(codes: &[&str]) -> CandidateList {
        CandidateList::from_codes(codes.iter().copied()).unwrap()
    }

    fn request() -> FetchRequest {
        FetchRequest::new("https://youtu.be/dQw4w9WgXcQ")
    }

    fn controller(
        proxy: RecordingProxy,
        fetcher: ScriptedFetcher,
        codes: &[&str],
    ) -> RotationController<RecordingProxy, ScriptedFetcher, CountingProbe> {
        RotationController::new(
            proxy,
            fetcher,
            CountingProbe::default(),
            candidates(codes),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_never_ready_cycles_every_candidate_without_fetching() {
        let mut ctl = controller(RecordingProxy::default(), ScriptedFetcher::default(), &["se", "ch", "nl"]);

        let err = ctl.run(&request()).await.unwrap_err();
        assert_eq!(
            ctl.proxy().log,
            vec!["start:se", "terminate", "start:ch", "terminate", "start:nl", "terminate"]
        );
        assert!(ctl.fetcher.calls.borrow().is_empty());
        assert_eq!(*ctl.identity.calls.borrow(), 0);

        match err {
            RotationError::AllCandidatesFailed { failures } => {
                let order: Vec<&str> = failures.iter().map(|f| f.candidate.as_str()).collect();
                assert_eq!(order, vec!["SE", "CH", "NL"]);
                assert!(failures
                    .iter()
                    .all(|f| matches!(f.reason, AttemptFailure::NotReady { .. })));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_success_short_circuits() {
        let proxy = RecordingProxy {
            ready: vec!["se", "ch"],
            ..Default::default()
        };
        let fetcher = ScriptedFetcher::with(vec![Ok(Some(PathBuf::from("/tmp/clip.mp4")))]);
        let mut ctl = controller(proxy, fetcher, &["se", "ch"]);

        let delivery = ctl.run(&request()).await.unwrap();
        assert_eq!(delivery.candidate.as_str(), "se");
        assert_eq!(delivery.output, Some(PathBuf::from("/tmp/clip.mp4")));
        assert_eq!(ctl.proxy().log, vec!["start:se", "terminate"]);

        let calls = ctl.fetcher.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].proxy.as_deref(), Some("socks5://127.0.0.1:12212"));
        assert_eq!(*ctl.identity.calls.borrow(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_advances_to_next_candidate() {
        let proxy = RecordingProxy {
            ready: vec!["se", "ch"],
            ..Default::default()
        };
        let fetcher = ScriptedFetcher::with(vec![
            Err(FetchError::GeoRestricted("blocked".into())),
            Ok(None),
        ]);
        let mut ctl = controller(proxy, fetcher, &["se", "ch", "nl"]);

        let delivery = ctl.run(&request()).await.unwrap();
        assert_eq!(delivery.candidate.as_str(), "ch");
        assert_eq!(
            ctl.proxy().log,
            vec!["start:se", "terminate", "start:ch", "terminate"]
        );
        assert_eq!(ctl.fetcher.calls.borrow().len(), 2);
    }

    #[tokio::test]
    async fn test_mixed_failures_are_all_reported() {
        let proxy = RecordingProxy {
            ready: vec!["ch"],
            ..Default::default()
        };
        let fetcher = ScriptedFetcher::with(vec![Err(FetchError::RateLimited("429".into()))]);
        let mut ctl = controller(proxy, fetcher, &["se", "ch"]);

        let err = ctl.run(&request()).await.unwrap_err();
        let RotationError::AllCandidatesFailed { failures } = err else {
            panic!("expected AllCandidatesFailed");
        };
        assert!(matches!(failures[0].reason, AttemptFailure::NotReady { .. }));
        assert!(matches!(
            failures[1].reason,
            AttemptFailure::Fetch(FetchError::RateLimited(_))
        ));
        let summary = RotationError::AllCandidatesFailed { failures }.to_string();
        assert!(summary.starts_with("all 2 exit countries failed"));
    }

    #[tokio::test]
    async fn test_dependency_failure_is_fatal_and_cleans_up() {
        let proxy = RecordingProxy {
            fail_start: Some("se"),
            ..Default::default()
        };
        let mut ctl = controller(proxy, ScriptedFetcher::default(), &["se", "ch"]);

        let err = ctl.run(&request()).await.unwrap_err();
        assert!(matches!(err, RotationError::Supervisor(_)));
        assert_eq!(ctl.proxy().log, vec!["start:se", "terminate"]);
    }
}
