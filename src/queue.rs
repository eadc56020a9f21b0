//! Bounded-parallel processing queue with retry and backoff.
//!
//! Bundles are dispatched FIFO to at most `max_parallel` concurrent workers.
//! A failed attempt whose last check run contains a failed check is requeued
//! with an incremented attempt number and an exponential backoff delay; the
//! backoff sleep happens on the worker before the attempt runs. When the
//! cancellation token fires, no new work is dispatched, in-flight pipelines
//! stop at their next suspension point, and queued items resolve as skipped.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bundling::Bundle;
use crate::pipeline::{BundleResult, BundleStatus};

const BACKOFF_BASE_MS: u64 = 1000;
const BACKOFF_CAP_MS: u64 = 10_000;

/// Delay preceding retry number `retry` (1-based): `min(1000·2^(retry-1), 10000)` ms.
pub fn backoff_delay(retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(16);
    let ms = BACKOFF_BASE_MS.saturating_mul(1u64 << exponent);
    Duration::from_millis(ms.min(BACKOFF_CAP_MS))
}

/// Queue-level retry decision.
///
/// No retry on success, on an exhausted attempt budget, or when the last
/// attempt produced no check results (nothing meaningful to retry). A retry
/// happens when some check failed, or when the failure was flagged as
/// transient (agent rate limit).
pub fn should_retry(result: &BundleResult, attempt: u32, max_retries: u32) -> bool {
    if result.status == BundleStatus::Completed {
        return false;
    }
    if attempt >= max_retries {
        return false;
    }
    if result.retriable {
        return true;
    }
    let Some(run) = &result.check_run else {
        return false;
    };
    if run.results.is_empty() {
        return false;
    }
    run.results.iter().any(|c| c.failed())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    ItemStarted {
        bundle_id: String,
        attempt: u32,
    },
    ItemCompleted {
        bundle_id: String,
        publication_url: Option<String>,
    },
    ItemFailed {
        bundle_id: String,
        error: String,
        recoverable: Option<bool>,
    },
    ItemRetrying {
        bundle_id: String,
        next_attempt: u32,
        delay_ms: u64,
        /// (check name, captured stderr) pairs from the failed run.
        failed_checks: Vec<(String, String)>,
    },
}

type Listener = Arc<dyn Fn(&QueueEvent) + Send + Sync>;
type ProcessorFuture = Pin<Box<dyn std::future::Future<Output = BundleResult> + Send>>;
pub type Processor = Arc<dyn Fn(Bundle, u32) -> ProcessorFuture + Send + Sync>;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<(Bundle, u32)>,
    listeners: Vec<Listener>,
    total: usize,
    processing: usize,
    completed: usize,
    failed: usize,
    /// Pass counts of each bundle's previous attempt, for the
    /// recoverability hint.
    previous_pass_counts: HashMap<String, usize>,
}

/// FIFO queue of bundles processed by up to `max_parallel` workers.
pub struct ProcessingQueue {
    max_parallel: usize,
    max_retries: u32,
    cancel: CancellationToken,
    processor: Mutex<Option<Processor>>,
    state: Mutex<QueueState>,
}

impl ProcessingQueue {
    pub fn new(max_parallel: usize, max_retries: u32, cancel: CancellationToken) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            max_retries: max_retries.max(1),
            cancel,
            processor: Mutex::new(None),
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn enqueue(&self, bundles: impl IntoIterator<Item = Bundle>) {
        let mut state = self.state.lock().unwrap();
        for bundle in bundles {
            state.total += 1;
            state.pending.push_back((bundle, 1));
        }
    }

    pub fn set_processor(&self, processor: Processor) {
        *self.processor.lock().unwrap() = Some(processor);
    }

    pub fn on<F>(&self, listener: F)
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.state.lock().unwrap().listeners.push(Arc::new(listener));
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock().unwrap();
        QueueStats {
            total: state.total,
            pending: state.pending.len(),
            processing: state.processing,
            completed: state.completed,
            failed: state.failed,
        }
    }

    fn emit(&self, event: QueueEvent) {
        let listeners: Vec<Listener> = self.state.lock().unwrap().listeners.clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!("queue listener panicked; event dropped for that listener");
            }
        }
    }

    /// Run the queue to completion (or interruption) and return one terminal
    /// result per enqueued bundle.
    pub async fn start(&self) -> Vec<BundleResult> {
        let Some(processor) = self.processor.lock().unwrap().clone() else {
            error!("queue started without a processor");
            return Vec::new();
        };

        let mut results = Vec::new();
        let mut join_set: JoinSet<BundleResult> = JoinSet::new();
        // Bundle handles for tasks in flight, so a panicked worker still
        // yields a terminal result.
        let mut in_flight: HashMap<tokio::task::Id, (Bundle, u32)> = HashMap::new();

        loop {
            // Dispatch up to capacity unless cancelled.
            while in_flight.len() < self.max_parallel && !self.cancel.is_cancelled() {
                let next = {
                    let mut state = self.state.lock().unwrap();
                    let next = state.pending.pop_front();
                    if next.is_some() {
                        state.processing += 1;
                    }
                    next
                };
                let Some((bundle, attempt)) = next else { break };

                self.emit(QueueEvent::ItemStarted {
                    bundle_id: bundle.id.clone(),
                    attempt,
                });
                debug!(bundle_id = %bundle.id, attempt, "dispatching bundle");

                let processor = Arc::clone(&processor);
                let cancel = self.cancel.clone();
                let task_bundle = bundle.clone();
                let handle = join_set.spawn(async move {
                    if attempt > 1 {
                        // Backoff precedes the retry attempt; a cancellation
                        // during the sleep falls through to the processor,
                        // which observes the token immediately.
                        let delay = backoff_delay(attempt - 1);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => {}
                        }
                    }
                    processor(task_bundle, attempt).await
                });
                in_flight.insert(handle.id(), (bundle, attempt));
            }

            if in_flight.is_empty() {
                let state = self.state.lock().unwrap();
                if state.pending.is_empty() || self.cancel.is_cancelled() {
                    break;
                }
                drop(state);
                continue;
            }

            let Some(joined) = join_set.join_next_with_id().await else {
                break;
            };
            let (result, dispatched) = match joined {
                Ok((id, result)) => (result, in_flight.remove(&id)),
                Err(join_error) => {
                    let id = join_error.id();
                    let dispatched = in_flight.remove(&id);
                    error!(error = %join_error, "queue worker panicked");
                    let Some((bundle, attempt)) = dispatched else {
                        continue;
                    };
                    let mut failed = BundleResult::skipped(bundle, "worker panicked");
                    failed.status = BundleStatus::Failed;
                    failed.attempts = attempt;
                    (failed, None)
                }
            };
            let attempt = dispatched.map(|(_, a)| a).unwrap_or(result.attempts);
            self.settle(result, attempt, &mut results);
        }

        // Whatever never ran resolves as skipped.
        let leftovers: Vec<(Bundle, u32)> = {
            let mut state = self.state.lock().unwrap();
            state.pending.drain(..).collect()
        };
        for (bundle, _) in leftovers {
            debug!(bundle_id = %bundle.id, "marking undispatched bundle as skipped");
            results.push(BundleResult::skipped(bundle, "interrupted"));
        }

        info!(
            total = results.len(),
            completed = results
                .iter()
                .filter(|r| r.status == BundleStatus::Completed)
                .count(),
            "queue drained"
        );
        results
    }

    fn settle(&self, mut result: BundleResult, attempt: u32, results: &mut Vec<BundleResult>) {
        let bundle_id = result.bundle.id.clone();
        let pass_count = result.check_run.as_ref().map(|r| r.pass_count());

        {
            let mut state = self.state.lock().unwrap();
            state.processing = state.processing.saturating_sub(1);
        }

        if result.status == BundleStatus::Completed {
            self.state.lock().unwrap().completed += 1;
            self.emit(QueueEvent::ItemCompleted {
                bundle_id,
                publication_url: result.publication.as_ref().map(|p| p.url.clone()),
            });
            results.push(result);
            return;
        }

        if !self.cancel.is_cancelled() && should_retry(&result, attempt, self.max_retries) {
            let next_attempt = attempt + 1;
            let delay = backoff_delay(next_attempt - 1);
            let failed_checks = result
                .check_run
                .as_ref()
                .map(|run| {
                    run.failed_checks()
                        .into_iter()
                        .map(|c| (c.kind.as_str().to_string(), c.stderr.clone()))
                        .collect()
                })
                .unwrap_or_default();

            self.emit(QueueEvent::ItemRetrying {
                bundle_id: bundle_id.clone(),
                next_attempt,
                delay_ms: delay.as_millis() as u64,
                failed_checks,
            });

            let mut state = self.state.lock().unwrap();
            if let Some(pass_count) = pass_count {
                state.previous_pass_counts.insert(bundle_id, pass_count);
            }
            state.pending.push_back((result.bundle, next_attempt));
            return;
        }

        // Terminal failure: attach the recoverability hint from the last
        // two attempts' pass counts.
        result.attempts = attempt;
        let previous = {
            let state = self.state.lock().unwrap();
            state.previous_pass_counts.get(&bundle_id).copied()
        };
        result.recoverable = match (previous, pass_count) {
            (Some(previous), Some(current)) => Some(current >= previous),
            _ => None,
        };

        self.state.lock().unwrap().failed += 1;
        self.emit(QueueEvent::ItemFailed {
            bundle_id,
            error: result
                .error
                .clone()
                .unwrap_or_else(|| "unknown failure".to_string()),
            recoverable: result.recoverable,
        });
        results.push(result);
    }
}
