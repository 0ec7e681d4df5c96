//! Certificate renewal worker.
//!
//! Runs the renewal tool once at startup and then on a fixed interval. After
//! a successful run the certificate directory is rescanned off the async
//! runtime and the new generation is swapped in. Any failure leaves the
//! generation in service untouched; the next tick retries.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::tool::RenewalTool;
use crate::certs::CertificateStore;
use crate::error::RenewalError;

/// Default time between renewal runs.
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Shortest accepted renewal interval.
pub const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalState {
    Idle,
    Renewing,
}

/// What a trigger or reload did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// The tool ran and a new generation was swapped in.
    Renewed { domain_count: usize },
    /// A new generation was swapped in without running the tool.
    Reloaded { domain_count: usize },
    /// Another renewal or reload was already in progress.
    Skipped,
}

/// Clears the renewing flag when dropped, including on cancellation.
struct RenewingGuard<'a>(&'a AtomicBool);

impl Drop for RenewingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Single writer of the certificate store.
pub struct RenewalScheduler {
    store: Arc<CertificateStore>,
    tool: Arc<dyn RenewalTool>,
    interval: Duration,
    renewing: AtomicBool,
}

impl RenewalScheduler {
    pub fn new(store: Arc<CertificateStore>, tool: Arc<dyn RenewalTool>) -> Self {
        Self {
            store,
            tool,
            interval: DEFAULT_RENEW_INTERVAL,
            renewing: AtomicBool::new(false),
        }
    }

    /// Set the renewal interval, clamped to [`MIN_RENEW_INTERVAL`].
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_RENEW_INTERVAL);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> RenewalState {
        if self.renewing.load(Ordering::Acquire) {
            RenewalState::Renewing
        } else {
            RenewalState::Idle
        }
    }

    fn begin(&self) -> Option<RenewingGuard<'_>> {
        self.renewing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RenewingGuard(&self.renewing))
    }

    /// Run the renewal tool, then reload and swap certificates.
    ///
    /// Returns [`RenewalOutcome::Skipped`] if a renewal is already running.
    #[instrument(skip(self))]
    pub async fn trigger(&self) -> Result<RenewalOutcome, RenewalError> {
        let Some(_guard) = self.begin() else {
            debug!("Renewal already in progress, skipping");
            return Ok(RenewalOutcome::Skipped);
        };

        info!("Running certificate renewal tool");
        let output = self.tool.run().await?;
        if !output.stdout.is_empty() {
            debug!(stdout = %output.stdout, "Renewal tool output");
        }
        if !output.stderr.is_empty() {
            warn!(stderr = %output.stderr, "Renewal tool reported on stderr");
        }

        let generation = CertificateStore::load_blocking(self.store.cert_dir().to_path_buf()).await?;
        let domain_count = generation.len();
        self.store.swap(generation);

        Ok(RenewalOutcome::Renewed { domain_count })
    }

    /// Reload certificates from disk without running the tool.
    #[instrument(skip(self))]
    pub async fn reload(&self) -> Result<RenewalOutcome, RenewalError> {
        let Some(_guard) = self.begin() else {
            debug!("Renewal already in progress, skipping reload");
            return Ok(RenewalOutcome::Skipped);
        };

        let domain_count = self.store.reload().await?;
        Ok(RenewalOutcome::Reloaded { domain_count })
    }

    /// Run the renewal loop until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting renewal worker"
        );

        // The first tick completes immediately, so renewal also runs at startup.
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.trigger().await {
                        Ok(outcome) => info!(outcome = %outcome, "Certificate renewal complete"),
                        Err(e) => error!(error = %e, "Certificate renewal failed; keeping current certificates"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Renewal worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

impl fmt::Display for RenewalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Renewed { domain_count } => write!(f, "renewed ({domain_count} domains)"),
            Self::Reloaded { domain_count } => write!(f, "reloaded ({domain_count} domains)"),
            Self::Skipped => f.write_str("skipped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::certs::{CERTIFICATE_CHAIN_FILE, PRIVATE_KEY_FILE};
    use crate::renewal::ToolOutput;

    fn write_domain(root: &Path, domain: &str) -> Vec<u8> {
        let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
        let dir = root.join(domain);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(CERTIFICATE_CHAIN_FILE), cert.cert.pem()).unwrap();
        fs::write(dir.join(PRIVATE_KEY_FILE), cert.key_pair.serialize_pem()).unwrap();
        cert.cert.der().to_vec()
    }

    fn leaf_der(store: &CertificateStore, domain: &str) -> Vec<u8> {
        store
            .lookup(domain)
            .unwrap()
            .leaf()
            .unwrap()
            .as_ref()
            .to_vec()
    }

    async fn open_store(root: &Path) -> Arc<CertificateStore> {
        Arc::new(
            CertificateStore::open(root.to_path_buf(), Some("a.test".to_string()))
                .await
                .unwrap(),
        )
    }

    /// Rewrites certificates on disk, then reports the given result.
    struct RewritingTool {
        root: PathBuf,
        domains: Vec<&'static str>,
        fail: bool,
    }

    #[async_trait]
    impl RenewalTool for RewritingTool {
        async fn run(&self) -> Result<ToolOutput, RenewalError> {
            for domain in &self.domains {
                write_domain(&self.root, domain);
            }
            if self.fail {
                return Err(RenewalError::ExitStatus {
                    code: Some(1),
                    stderr: "challenge failed".to_string(),
                });
            }
            Ok(ToolOutput::default())
        }
    }

    /// Parks until released.
    struct BlockingTool {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl RenewalTool for BlockingTool {
        async fn run(&self) -> Result<ToolOutput, RenewalError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(ToolOutput::default())
        }
    }

    #[tokio::test]
    async fn test_successful_renewal_swaps_generation() {
        let dir = tempfile::tempdir().unwrap();
        let original = write_domain(dir.path(), "a.test");
        let store = open_store(dir.path()).await;

        let tool = RewritingTool {
            root: dir.path().to_path_buf(),
            domains: vec!["a.test", "b.test"],
            fail: false,
        };
        let scheduler = RenewalScheduler::new(Arc::clone(&store), Arc::new(tool));

        let outcome = scheduler.trigger().await.unwrap();
        assert_eq!(outcome, RenewalOutcome::Renewed { domain_count: 2 });
        assert_ne!(leaf_der(&store, "a.test"), original);
        assert!(store.lookup("b.test").is_some());
        assert_eq!(scheduler.state(), RenewalState::Idle);
    }

    #[tokio::test]
    async fn test_failed_tool_keeps_current_generation() {
        let dir = tempfile::tempdir().unwrap();
        let original = write_domain(dir.path(), "a.test");
        let store = open_store(dir.path()).await;

        // Files change on disk but the tool reports failure.
        let tool = RewritingTool {
            root: dir.path().to_path_buf(),
            domains: vec!["a.test", "b.test"],
            fail: true,
        };
        let scheduler = RenewalScheduler::new(Arc::clone(&store), Arc::new(tool));

        let err = scheduler.trigger().await.unwrap_err();
        assert!(matches!(err, RenewalError::ExitStatus { code: Some(1), .. }));
        assert_eq!(leaf_der(&store, "a.test"), original);
        assert!(store.lookup("b.test").is_none());
        assert_eq!(scheduler.state(), RenewalState::Idle);
    }

    #[tokio::test]
    async fn test_trigger_while_renewing_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_domain(dir.path(), "a.test");
        let store = open_store(dir.path()).await;

        let tool = Arc::new(BlockingTool {
            started: Notify::new(),
            release: Notify::new(),
        });
        let scheduler = Arc::new(RenewalScheduler::new(store, Arc::clone(&tool) as Arc<dyn RenewalTool>));

        let first = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.trigger().await }
        });
        tool.started.notified().await;

        assert_eq!(scheduler.state(), RenewalState::Renewing);
        assert_eq!(scheduler.trigger().await.unwrap(), RenewalOutcome::Skipped);
        assert_eq!(scheduler.reload().await.unwrap(), RenewalOutcome::Skipped);

        tool.release.notify_one();
        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome, RenewalOutcome::Renewed { domain_count: 1 });
        assert_eq!(scheduler.state(), RenewalState::Idle);
    }

    #[tokio::test]
    async fn test_cancelled_renewal_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        write_domain(dir.path(), "a.test");
        let store = open_store(dir.path()).await;

        let tool = Arc::new(BlockingTool {
            started: Notify::new(),
            release: Notify::new(),
        });
        let scheduler = Arc::new(RenewalScheduler::new(store, Arc::clone(&tool) as Arc<dyn RenewalTool>));

        let task = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.trigger().await }
        });
        tool.started.notified().await;
        assert_eq!(scheduler.state(), RenewalState::Renewing);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(scheduler.state(), RenewalState::Idle);
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_current_generation() {
        let dir = tempfile::tempdir().unwrap();
        let original = write_domain(dir.path(), "a.test");
        let store = open_store(dir.path()).await;

        fs::remove_dir_all(dir.path().join("a.test")).unwrap();

        let tool = RewritingTool {
            root: dir.path().to_path_buf(),
            domains: Vec::new(),
            fail: false,
        };
        let scheduler = RenewalScheduler::new(Arc::clone(&store), Arc::new(tool));

        let err = scheduler.reload().await.unwrap_err();
        assert!(matches!(err, RenewalError::Reload(_)));
        let err = scheduler.trigger().await.unwrap_err();
        assert!(matches!(err, RenewalError::Reload(_)));

        assert_eq!(leaf_der(&store, "a.test"), original);
        assert_eq!(scheduler.state(), RenewalState::Idle);
    }

    #[tokio::test]
    async fn test_reload_picks_up_new_files() {
        let dir = tempfile::tempdir().unwrap();
        write_domain(dir.path(), "a.test");
        let store = open_store(dir.path()).await;
        write_domain(dir.path(), "c.test");

        let tool = RewritingTool {
            root: dir.path().to_path_buf(),
            domains: Vec::new(),
            fail: true,
        };
        let scheduler = RenewalScheduler::new(Arc::clone(&store), Arc::new(tool));

        let outcome = scheduler.reload().await.unwrap();
        assert_eq!(outcome, RenewalOutcome::Reloaded { domain_count: 2 });
        assert!(store.lookup("c.test").is_some());
    }

    #[tokio::test]
    async fn test_run_renews_at_start_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        write_domain(dir.path(), "a.test");
        let store = open_store(dir.path()).await;

        let tool = RewritingTool {
            root: dir.path().to_path_buf(),
            domains: vec!["d.test"],
            fail: false,
        };
        let scheduler = Arc::new(
            RenewalScheduler::new(Arc::clone(&store), Arc::new(tool))
                .with_interval(Duration::from_secs(3600)),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.run(shutdown_rx).await }
        });

        for _ in 0..200 {
            if store.lookup("d.test").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.lookup("d.test").is_some());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_interval_is_clamped() {
        let store = Arc::new(CertificateStore::new(
            Default::default(),
            PathBuf::from("/unused"),
            None,
        ));
        let tool = Arc::new(RewritingTool {
            root: PathBuf::from("/unused"),
            domains: Vec::new(),
            fail: false,
        });

        let scheduler = RenewalScheduler::new(store, tool).with_interval(Duration::from_secs(1));
        assert_eq!(scheduler.interval(), MIN_RENEW_INTERVAL);
    }
}
