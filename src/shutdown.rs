//! Interrupt handling and guaranteed cleanup.
//!
//! One handler is installed per process. The first termination signal flips
//! a one-way cancellation token and runs registered cleanup callbacks in
//! reverse registration order under a bounded budget; a second signal aborts
//! immediately with exit code 130.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit code used when a run is interrupted.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

const CLEANUP_BUDGET: Duration = Duration::from_secs(30);

type CleanupFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type CleanupFn = Box<dyn FnOnce() -> CleanupFuture + Send>;

struct RegisteredCleanup {
    id: u64,
    label: String,
    run: Option<CleanupFn>,
}

/// Process-wide interrupt coordinator.
pub struct InterruptHandler {
    token: CancellationToken,
    cleanups: Mutex<Vec<RegisteredCleanup>>,
    next_id: AtomicU64,
    installed: AtomicBool,
    interrupted: AtomicBool,
}

impl Default for InterruptHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptHandler {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            cleanups: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            installed: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
        }
    }

    /// The cancellation token observed by every suspension point.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// True once the flag flipped or the token was cancelled externally.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst) || self.token.is_cancelled()
    }

    /// Register a cleanup to run on interrupt (or explicitly via
    /// [`Self::run_cleanup`]). Cleanups run in reverse registration order.
    pub fn register_cleanup<F, Fut>(&self, label: &str, cleanup: F) -> u64
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut cleanups = self.cleanups.lock().unwrap();
        cleanups.push(RegisteredCleanup {
            id,
            label: label.to_string(),
            run: Some(Box::new(move || Box::pin(cleanup()) as CleanupFuture)),
        });
        id
    }

    /// Run one registered cleanup if it has not run yet.
    pub async fn run_cleanup(&self, id: u64) {
        let taken = {
            let mut cleanups = self.cleanups.lock().unwrap();
            cleanups
                .iter_mut()
                .find(|c| c.id == id)
                .and_then(|c| c.run.take())
        };
        if let Some(run) = taken {
            run().await;
        }
    }

    /// Flip the one-way flag and run all pending cleanups, newest first.
    /// Safe to call more than once; each cleanup runs at most once.
    pub async fn interrupt_now(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.token.cancel();

        let pending: Vec<(String, CleanupFn)> = {
            let mut cleanups = self.cleanups.lock().unwrap();
            cleanups
                .iter_mut()
                .rev()
                .filter_map(|c| c.run.take().map(|run| (c.label.clone(), run)))
                .collect()
        };
        if pending.is_empty() {
            return;
        }

        info!(count = pending.len(), "running interrupt cleanups");
        let all = async {
            for (label, run) in pending {
                info!(cleanup = %label, "running cleanup");
                run().await;
            }
        };
        if tokio::time::timeout(CLEANUP_BUDGET, all).await.is_err() {
            warn!(
                budget_s = CLEANUP_BUDGET.as_secs(),
                "cleanup budget exhausted; remaining cleanups skipped"
            );
        }
    }

    /// Hook SIGINT/SIGTERM. The first signal cancels and cleans up; a second
    /// aborts the process immediately with exit code 130.
    pub fn install(self: &Arc<Self>) {
        if self.installed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            termination_signal().await;
            warn!("interrupt received; cancelling and cleaning up (press again to abort)");
            let cleanup = handler.interrupt_now();
            tokio::select! {
                _ = cleanup => {}
                _ = termination_signal() => {
                    error!("second interrupt; aborting immediately");
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
            }
        });
    }
}

async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM hook unavailable, listening for SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Run `work`, then run `cleanup` exactly once: on success, failure, or
/// interrupt (in the latter case the handler runs it from the signal path).
pub async fn with_cleanup<T, W, C, Fut>(
    handler: &Arc<InterruptHandler>,
    work: W,
    cleanup: C,
) -> T
where
    W: Future<Output = T>,
    C: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let id = handler.register_cleanup("scoped", cleanup);
    let result = work.await;
    handler.run_cleanup(id).await;
    result
}
