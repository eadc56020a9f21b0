//! Cost accounting for fixing-agent invocations.
//!
//! One tracker is shared by all queue workers. `add_cost` and bundle
//! rotation form a single critical section; `can_spend` and
//! `current_model_tier` read a snapshot and never rotate state.

use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, warn};

/// Lowest-cost tier used once utilization crosses the hard threshold.
pub const LOWEST_TIER: &str = "haiku";

const FALLBACK_THRESHOLD: f64 = 0.80;
const LOWEST_THRESHOLD: f64 = 0.90;

#[derive(Debug, Default)]
struct Ledger {
    current_bundle: Option<String>,
    bundle_cost: f64,
    session_cost: f64,
}

/// Point-in-time snapshot of the ledger, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub current_bundle: Option<String>,
    pub bundle_cost: f64,
    pub session_cost: f64,
    pub max_per_bundle: Option<f64>,
    pub max_per_session: Option<f64>,
}

/// Per-bundle and per-session cost ledger with model-tier degradation.
#[derive(Debug)]
pub struct BudgetTracker {
    max_per_bundle: Option<f64>,
    max_per_session: Option<f64>,
    preferred_tier: String,
    fallback_tier: String,
    ledger: Mutex<Ledger>,
}

impl BudgetTracker {
    /// Caps of `None` mean uncapped; utilization against an uncapped limit
    /// is always zero.
    pub fn new(
        max_per_bundle: Option<f64>,
        max_per_session: Option<f64>,
        preferred_tier: impl Into<String>,
        fallback_tier: impl Into<String>,
    ) -> Self {
        Self {
            max_per_bundle,
            max_per_session,
            preferred_tier: preferred_tier.into(),
            fallback_tier: fallback_tier.into(),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Record a spend against a bundle. A bundle id different from the
    /// current one rotates the per-bundle counter to zero first; the session
    /// total is never reset by rotation.
    pub fn add_cost(&self, bundle_id: &str, amount: f64) {
        assert!(amount >= 0.0, "cost must be non-negative");
        let mut ledger = self.ledger.lock().unwrap();
        if ledger.current_bundle.as_deref() != Some(bundle_id) {
            debug!(
                bundle_id,
                previous = ledger.current_bundle.as_deref().unwrap_or("-"),
                "rotating budget ledger to new bundle"
            );
            ledger.current_bundle = Some(bundle_id.to_string());
            ledger.bundle_cost = 0.0;
        }
        ledger.bundle_cost += amount;
        ledger.session_cost += amount;
        if let Some(cap) = self.max_per_bundle {
            if ledger.bundle_cost > cap {
                warn!(bundle_id, spent = ledger.bundle_cost, cap, "bundle over budget");
            }
        }
    }

    /// Pure check: would spending `amount` on `bundle_id` stay within caps?
    /// An id other than the current bundle counts its usage as zero.
    pub fn can_spend(&self, bundle_id: &str, amount: f64) -> bool {
        let ledger = self.ledger.lock().unwrap();
        let bundle_cost = if ledger.current_bundle.as_deref() == Some(bundle_id) {
            ledger.bundle_cost
        } else {
            0.0
        };
        let bundle_ok = self
            .max_per_bundle
            .map(|cap| bundle_cost + amount <= cap)
            .unwrap_or(true);
        let session_ok = self
            .max_per_session
            .map(|cap| ledger.session_cost + amount <= cap)
            .unwrap_or(true);
        bundle_ok && session_ok
    }

    /// Select the model tier from current utilization: preferred below 0.80,
    /// fallback in [0.80, 0.90), lowest at or above 0.90.
    pub fn current_model_tier(&self) -> String {
        let ledger = self.ledger.lock().unwrap();
        let bundle_utilization = utilization(ledger.bundle_cost, self.max_per_bundle);
        let session_utilization = utilization(ledger.session_cost, self.max_per_session);
        let u = bundle_utilization.max(session_utilization);
        if u < FALLBACK_THRESHOLD {
            self.preferred_tier.clone()
        } else if u < LOWEST_THRESHOLD {
            self.fallback_tier.clone()
        } else {
            LOWEST_TIER.to_string()
        }
    }

    /// Reset the per-bundle counter for `bundle_id` if it is current.
    pub fn reset_bundle(&self, bundle_id: &str) {
        let mut ledger = self.ledger.lock().unwrap();
        if ledger.current_bundle.as_deref() == Some(bundle_id) {
            ledger.bundle_cost = 0.0;
        }
    }

    /// Reset the whole ledger.
    pub fn reset(&self) {
        let mut ledger = self.ledger.lock().unwrap();
        *ledger = Ledger::default();
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let ledger = self.ledger.lock().unwrap();
        BudgetSnapshot {
            current_bundle: ledger.current_bundle.clone(),
            bundle_cost: ledger.bundle_cost,
            session_cost: ledger.session_cost,
            max_per_bundle: self.max_per_bundle,
            max_per_session: self.max_per_session,
        }
    }

    pub fn session_cost(&self) -> f64 {
        self.ledger.lock().unwrap().session_cost
    }
}

fn utilization(spent: f64, cap: Option<f64>) -> f64 {
    match cap {
        Some(cap) if cap > 0.0 => spent / cap,
        // A zero cap means any spend is over budget.
        Some(_) if spent > 0.0 => f64::INFINITY,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(per_bundle: Option<f64>, per_session: Option<f64>) -> BudgetTracker {
        BudgetTracker::new(per_bundle, per_session, "sonnet", "sonnet-small")
    }

    #[test]
    fn costs_accumulate_monotonically() {
        let t = tracker(Some(10.0), Some(100.0));
        t.add_cost("b1", 0.5);
        t.add_cost("b1", 0.25);
        let snap = t.snapshot();
        assert_eq!(snap.bundle_cost, 0.75);
        assert_eq!(snap.session_cost, 0.75);
    }

    #[test]
    fn rotation_resets_bundle_not_session() {
        let t = tracker(Some(10.0), Some(100.0));
        t.add_cost("b1", 1.0);
        t.add_cost("b2", 0.5);
        let snap = t.snapshot();
        assert_eq!(snap.current_bundle.as_deref(), Some("b2"));
        assert_eq!(snap.bundle_cost, 0.5);
        assert_eq!(snap.session_cost, 1.5);
    }

    #[test]
    fn can_spend_is_pure_and_treats_new_bundles_as_zero() {
        let t = tracker(Some(1.0), Some(100.0));
        t.add_cost("b1", 0.9);
        // Does not rotate state.
        assert!(t.can_spend("b2", 0.9));
        assert_eq!(t.snapshot().current_bundle.as_deref(), Some("b1"));
        // Current bundle is nearly exhausted.
        assert!(!t.can_spend("b1", 0.2));
        assert!(t.can_spend("b1", 0.1));
    }

    #[test]
    fn can_spend_enforces_session_cap_for_new_bundles() {
        let t = tracker(None, Some(1.0));
        t.add_cost("b1", 0.95);
        assert!(!t.can_spend("b2", 0.1));
    }

    #[test]
    fn zero_cap_refuses_everything_spent() {
        let t = tracker(Some(0.01), None);
        t.add_cost("b", 0.02);
        assert!(!t.can_spend("b", 0.0));
    }

    #[test]
    fn tier_degrades_with_utilization() {
        let t = tracker(Some(1.0), None);
        assert_eq!(t.current_model_tier(), "sonnet");
        t.add_cost("b1", 0.79);
        assert_eq!(t.current_model_tier(), "sonnet");
        t.add_cost("b1", 0.01);
        assert_eq!(t.current_model_tier(), "sonnet-small");
        t.add_cost("b1", 0.10);
        assert_eq!(t.current_model_tier(), LOWEST_TIER);
    }

    #[test]
    fn uncapped_budget_never_degrades() {
        let t = tracker(None, None);
        t.add_cost("b1", 1_000.0);
        assert_eq!(t.current_model_tier(), "sonnet");
    }

    #[test]
    fn session_utilization_degrades_tier_too() {
        let t = tracker(None, Some(10.0));
        t.add_cost("b1", 8.5);
        assert_eq!(t.current_model_tier(), "sonnet-small");
        t.add_cost("b2", 0.6);
        assert_eq!(t.current_model_tier(), LOWEST_TIER);
    }

    #[test]
    fn reset_bundle_only_touches_current() {
        let t = tracker(Some(1.0), Some(10.0));
        t.add_cost("b1", 0.4);
        t.reset_bundle("other");
        assert_eq!(t.snapshot().bundle_cost, 0.4);
        t.reset_bundle("b1");
        let snap = t.snapshot();
        assert_eq!(snap.bundle_cost, 0.0);
        assert_eq!(snap.session_cost, 0.4);
    }
}
