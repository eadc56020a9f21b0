//! Progress reporting bus.
//!
//! The reporter holds one status row per bundle and broadcasts tagged
//! lifecycle events to subscribed listeners. Listener panics are caught and
//! must never propagate into a worker. Events carry owned data only.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::pipeline::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Status row for one bundle.
#[derive(Debug, Clone, Serialize)]
pub struct BundleProgress {
    pub bundle_id: String,
    pub stage: Option<Stage>,
    pub status: ProgressStatus,
    /// 0..=100
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl BundleProgress {
    fn pending(bundle_id: &str) -> Self {
        Self {
            bundle_id: bundle_id.to_string(),
            stage: None,
            status: ProgressStatus::Pending,
            progress: 0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// A failed check carried on retry events.
#[derive(Debug, Clone, Serialize)]
pub struct FailedCheck {
    pub check: String,
    pub stderr: String,
}

/// Lifecycle events, delivered in source order per bundle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReportEvent {
    Start {
        total_bundles: usize,
    },
    GroupStart {
        bundle_id: String,
        attempt: u32,
    },
    GroupStage {
        bundle_id: String,
        stage: Stage,
        progress: u8,
    },
    GroupComplete {
        bundle_id: String,
        publication_url: Option<String>,
    },
    GroupFailed {
        bundle_id: String,
        error: String,
    },
    GroupRetry {
        bundle_id: String,
        attempt: u32,
        failed_checks: Vec<FailedCheck>,
    },
    Complete {
        completed: usize,
        failed: usize,
        skipped: usize,
    },
    Error {
        message: String,
    },
    Interrupted,
}

pub type SubscriptionId = u64;

type Listener = Arc<dyn Fn(&ReportEvent) + Send + Sync>;

#[derive(Default)]
struct Inner {
    listeners: HashMap<SubscriptionId, Listener>,
    next_id: SubscriptionId,
    /// Insertion-ordered bundle ids alongside the row map.
    order: Vec<String>,
    rows: HashMap<String, BundleProgress>,
}

/// Observable progress bus shared by the queue, pipeline, and orchestrator.
pub struct ProgressReporter {
    inner: Mutex<Inner>,
    verbose: bool,
}

impl ProgressReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            verbose,
        }
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Subscribe; returns an id for [`Self::unsubscribe`].
    pub fn on<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ReportEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.insert(id, Arc::new(listener));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.lock().unwrap().listeners.remove(&id);
    }

    /// Register the bundles that will be processed, in order.
    pub fn register_bundles<'a>(&self, bundle_ids: impl IntoIterator<Item = &'a str>) {
        let mut inner = self.inner.lock().unwrap();
        for id in bundle_ids {
            if !inner.rows.contains_key(id) {
                inner.order.push(id.to_string());
                inner.rows.insert(id.to_string(), BundleProgress::pending(id));
            }
        }
    }

    /// Emit an event to every listener, updating the status row first.
    /// The listener snapshot is taken under the lock, the calls happen
    /// outside it.
    pub fn emit(&self, event: ReportEvent) {
        let listeners: Vec<Listener> = {
            let mut inner = self.inner.lock().unwrap();
            apply_event(&mut inner, &event);
            inner.listeners.values().cloned().collect()
        };
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!("progress listener panicked; event dropped for that listener");
            }
        }
    }

    pub fn statuses(&self) -> Vec<BundleProgress> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .filter_map(|id| inner.rows.get(id).cloned())
            .collect()
    }

    /// Console-formatted snapshot of all rows (verbose mode).
    pub fn render_snapshot(&self) -> String {
        let statuses = self.statuses();
        let mut out = String::new();
        for row in statuses {
            let icon = match row.status {
                ProgressStatus::Pending => "⏸",
                ProgressStatus::Processing => "🔄",
                ProgressStatus::Completed => "✅",
                ProgressStatus::Failed => "❌",
            };
            let stage = row
                .stage
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!(
                "{icon} {:<40} {:<16} {:>3}%{}\n",
                row.bundle_id,
                stage,
                row.progress,
                row.error
                    .as_deref()
                    .map(|e| format!("  ({e})"))
                    .unwrap_or_default()
            ));
        }
        out
    }
}

fn apply_event(inner: &mut Inner, event: &ReportEvent) {
    match event {
        ReportEvent::GroupStart { bundle_id, .. } => {
            let row = row_mut(inner, bundle_id);
            row.status = ProgressStatus::Processing;
            row.started_at.get_or_insert_with(Utc::now);
            row.error = None;
        }
        ReportEvent::GroupStage {
            bundle_id,
            stage,
            progress,
        } => {
            let row = row_mut(inner, bundle_id);
            row.stage = Some(*stage);
            row.progress = (*progress).min(100);
        }
        ReportEvent::GroupComplete { bundle_id, .. } => {
            let row = row_mut(inner, bundle_id);
            row.status = ProgressStatus::Completed;
            row.progress = 100;
            row.completed_at = Some(Utc::now());
        }
        ReportEvent::GroupFailed { bundle_id, error } => {
            let row = row_mut(inner, bundle_id);
            row.status = ProgressStatus::Failed;
            row.completed_at = Some(Utc::now());
            row.error = Some(error.clone());
        }
        ReportEvent::GroupRetry { bundle_id, .. } => {
            let row = row_mut(inner, bundle_id);
            row.status = ProgressStatus::Processing;
        }
        _ => {}
    }
}

fn row_mut<'a>(inner: &'a mut Inner, bundle_id: &str) -> &'a mut BundleProgress {
    if !inner.rows.contains_key(bundle_id) {
        inner.order.push(bundle_id.to_string());
    }
    inner
        .rows
        .entry(bundle_id.to_string())
        .or_insert_with(|| BundleProgress::pending(bundle_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn listeners_receive_events_in_order() {
        let reporter = ProgressReporter::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        reporter.on(move |event| {
            if let ReportEvent::GroupStage { stage, .. } = event {
                seen_clone.lock().unwrap().push(*stage);
            }
        });
        reporter.emit(ReportEvent::GroupStage {
            bundle_id: "b1".into(),
            stage: Stage::Analysis,
            progress: 20,
        });
        reporter.emit(ReportEvent::GroupStage {
            bundle_id: "b1".into(),
            stage: Stage::Checks,
            progress: 60,
        });
        assert_eq!(*seen.lock().unwrap(), vec![Stage::Analysis, Stage::Checks]);
    }

    #[test]
    fn panicking_listener_does_not_poison_others() {
        let reporter = ProgressReporter::new(false);
        let count = Arc::new(AtomicUsize::new(0));
        reporter.on(|_| panic!("bad listener"));
        let count_clone = Arc::clone(&count);
        reporter.on(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        reporter.emit(ReportEvent::Start { total_bundles: 1 });
        reporter.emit(ReportEvent::Interrupted);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let reporter = ProgressReporter::new(false);
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let id = reporter.on(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        reporter.emit(ReportEvent::Start { total_bundles: 1 });
        reporter.unsubscribe(id);
        reporter.emit(ReportEvent::Interrupted);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_rows_track_lifecycle() {
        let reporter = ProgressReporter::new(false);
        reporter.register_bundles(["b1", "b2"]);
        reporter.emit(ReportEvent::GroupStart {
            bundle_id: "b1".into(),
            attempt: 1,
        });
        reporter.emit(ReportEvent::GroupStage {
            bundle_id: "b1".into(),
            stage: Stage::Fix,
            progress: 40,
        });
        reporter.emit(ReportEvent::GroupComplete {
            bundle_id: "b1".into(),
            publication_url: None,
        });
        reporter.emit(ReportEvent::GroupFailed {
            bundle_id: "b2".into(),
            error: "checks failed".into(),
        });

        let statuses = reporter.statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].status, ProgressStatus::Completed);
        assert_eq!(statuses[0].progress, 100);
        assert_eq!(statuses[1].status, ProgressStatus::Failed);
        assert_eq!(statuses[1].error.as_deref(), Some("checks failed"));
    }

    #[test]
    fn snapshot_renders_every_row() {
        let reporter = ProgressReporter::new(true);
        reporter.register_bundles(["component-auth-1"]);
        let snapshot = reporter.render_snapshot();
        assert!(snapshot.contains("component-auth-1"));
        assert!(snapshot.contains("⏸"));
    }
}
