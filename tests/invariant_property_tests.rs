//! Law-style invariants checked with proptest: budget monotonicity and
//! rotation, the backoff law, the commit-message law, and the model-tier
//! thresholds.

use proptest::prelude::*;

use fixwright::budget::{BudgetTracker, LOWEST_TIER};
use fixwright::defects::{Defect, DefectContext, DefectKind, DefectOrigin, DefectPriority, DefectState};
use fixwright::pipeline::{generate_commit_message, validate_commit_message};
use fixwright::queue::backoff_delay;

fn arbitrary_kind() -> impl Strategy<Value = DefectKind> {
    prop_oneof![
        Just(DefectKind::Bug),
        Just(DefectKind::Feature),
        Just(DefectKind::Refactor),
        Just(DefectKind::Docs),
        Just(DefectKind::Test),
        Just(DefectKind::Chore),
    ]
}

fn arbitrary_defect() -> impl Strategy<Value = Defect> {
    (
        1u64..100_000,
        ".{0,120}",
        arbitrary_kind(),
        proptest::option::of("[a-z]{1,12}"),
    )
        .prop_map(|(id, title, kind, component)| {
            let now = chrono::Utc::now();
            Defect {
                id,
                title,
                body: String::new(),
                state: DefectState::Open,
                kind,
                labels: Default::default(),
                context: DefectContext {
                    component,
                    priority: DefectPriority::Medium,
                    related_files: Vec::new(),
                    related_symbols: Vec::new(),
                    origin: DefectOrigin::Host,
                },
                created_at: now,
                updated_at: now,
                url: None,
                parent_id: None,
                child_ids: Vec::new(),
            }
        })
}

proptest! {
    /// validateCommitMessage(generateCommitMessage(..)) is always true.
    #[test]
    fn commit_message_law(
        defects in proptest::collection::vec(arbitrary_defect(), 1..6),
        files in proptest::collection::vec("[a-z]{1,8}(/[a-z]{1,8}){0,3}\\.[a-z]{1,4}", 0..6),
    ) {
        let message = generate_commit_message(&defects, &files);
        prop_assert!(
            validate_commit_message(&message),
            "generated message failed validation:\n{}",
            message
        );
    }

    /// Delay before retry k is exactly min(1000·2^(k-1), 10000) ms.
    #[test]
    fn backoff_law(retry in 1u32..40) {
        let expected = 1000u128
            .checked_mul(1u128 << (retry - 1).min(64))
            .unwrap_or(u128::MAX)
            .min(10_000);
        prop_assert_eq!(backoff_delay(retry).as_millis(), expected);
    }

    /// Session and bundle costs are non-decreasing across add_cost calls
    /// with a fixed bundle id.
    #[test]
    fn budget_monotonicity(amounts in proptest::collection::vec(0.0f64..5.0, 1..20)) {
        let tracker = BudgetTracker::new(None, None, "sonnet", "haiku");
        let mut last_bundle = 0.0;
        let mut last_session = 0.0;
        for amount in amounts {
            tracker.add_cost("b", amount);
            let snapshot = tracker.snapshot();
            prop_assert!(snapshot.bundle_cost >= last_bundle);
            prop_assert!(snapshot.session_cost >= last_session);
            prop_assert!(snapshot.session_cost >= snapshot.bundle_cost - 1e-9);
            last_bundle = snapshot.bundle_cost;
            last_session = snapshot.session_cost;
        }
    }

    /// Rotation: switching bundles resets the per-bundle counter to the new
    /// amount and adds exactly that amount to the session total.
    #[test]
    fn budget_rotation(first in 0.0f64..5.0, second in 0.0f64..5.0) {
        let tracker = BudgetTracker::new(None, None, "sonnet", "haiku");
        tracker.add_cost("a", first);
        let before = tracker.snapshot();
        tracker.add_cost("b", second);
        let after = tracker.snapshot();
        prop_assert!((after.bundle_cost - second).abs() < 1e-9);
        prop_assert!((after.session_cost - (before.session_cost + second)).abs() < 1e-9);
    }

    /// Tier selection follows the utilization thresholds exactly.
    #[test]
    fn model_tier_law(spent in 0.0f64..2.0) {
        let tracker = BudgetTracker::new(Some(1.0), None, "preferred", "fallback");
        tracker.add_cost("b", spent);
        let tier = tracker.current_model_tier();
        if spent < 0.80 {
            prop_assert_eq!(tier, "preferred");
        } else if spent < 0.90 {
            prop_assert_eq!(tier, "fallback");
        } else {
            prop_assert_eq!(tier, LOWEST_TIER);
        }
    }
}
