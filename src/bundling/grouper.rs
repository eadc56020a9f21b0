//! Partition defects into bundles by a grouping policy, with size bounds
//! and deterministic branch names.

use std::collections::BTreeMap;

use tracing::debug;

use crate::defects::Defect;

use super::types::{Bundle, GroupPolicy};

/// Branch names git treats specially, never used as a proposed branch.
const RESERVED_BRANCH_NAMES: [&str; 6] = ["HEAD", "head", "main", "master", "origin", "upstream"];

const BRANCH_NAMESPACE: &str = "autofix";
const SLUG_MAX_LEN: usize = 30;

#[derive(Debug, Clone)]
pub struct GroupingOptions {
    pub max_bundle_size: usize,
    pub min_bundle_size: usize,
    /// A defect must carry all of these to be considered.
    pub include_labels: Vec<String>,
    /// A defect must carry none of these.
    pub exclude_labels: Vec<String>,
}

impl Default for GroupingOptions {
    fn default() -> Self {
        Self {
            max_bundle_size: 5,
            min_bundle_size: 1,
            include_labels: Vec::new(),
            exclude_labels: Vec::new(),
        }
    }
}

/// Bundles plus the defects that ended up in no bundle.
#[derive(Debug, Default)]
pub struct GroupingOutcome {
    pub bundles: Vec<Bundle>,
    pub residue: Vec<Defect>,
}

/// Group defects by `policy`. An empty input yields an empty outcome.
///
/// A defect may fan into several buckets under the `file` and `label`
/// policies; buckets smaller than `min_bundle_size` land in the residue.
pub fn group_defects(
    defects: &[Defect],
    policy: GroupPolicy,
    options: &GroupingOptions,
) -> GroupingOutcome {
    let filtered: Vec<&Defect> = defects
        .iter()
        .filter(|d| passes_label_filters(d, options))
        .collect();

    // BTreeMap keeps bucket iteration deterministic across runs.
    let mut buckets: BTreeMap<String, Vec<&Defect>> = BTreeMap::new();
    for defect in &filtered {
        for key in bucket_keys(defect, policy) {
            buckets.entry(key).or_default().push(defect);
        }
    }

    let mut outcome = GroupingOutcome::default();
    let mut bundled_ids = std::collections::HashSet::new();
    let mut used_branches = std::collections::HashSet::new();

    for (value, mut members) in buckets {
        members.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.id.cmp(&b.id))
        });
        members.dedup_by_key(|d| d.id);

        if members.len() < options.min_bundle_size {
            debug!(
                value,
                count = members.len(),
                min = options.min_bundle_size,
                "dropping undersized bucket"
            );
            continue;
        }

        for (seq, chunk) in members.chunks(options.max_bundle_size.max(1)).enumerate() {
            let bundle = build_bundle(policy, &value, seq + 1, chunk, &mut used_branches);
            for d in chunk {
                bundled_ids.insert(d.id);
            }
            outcome.bundles.push(bundle);
        }
    }

    outcome.residue = filtered
        .into_iter()
        .filter(|d| !bundled_ids.contains(&d.id))
        .cloned()
        .collect();
    outcome
}

fn passes_label_filters(defect: &Defect, options: &GroupingOptions) -> bool {
    options
        .include_labels
        .iter()
        .all(|l| defect.labels.contains(l))
        && options
            .exclude_labels
            .iter()
            .all(|l| !defect.labels.contains(l))
}

/// The bucket keys a defect contributes to under a policy. `file` and
/// `label` fan one defect into multiple buckets.
fn bucket_keys(defect: &Defect, policy: GroupPolicy) -> Vec<String> {
    match policy {
        GroupPolicy::Component => vec![defect
            .component()
            .unwrap_or("uncategorized")
            .to_string()],
        GroupPolicy::File => {
            if defect.context.related_files.is_empty() {
                vec!["no-files".to_string()]
            } else {
                defect.context.related_files.clone()
            }
        }
        GroupPolicy::Label => {
            if defect.labels.is_empty() {
                vec!["unlabeled".to_string()]
            } else {
                defect.labels.iter().cloned().collect()
            }
        }
        GroupPolicy::Kind => vec![defect.kind.as_str().to_string()],
        GroupPolicy::Priority => vec![defect.priority().as_str().to_string()],
    }
}

fn build_bundle(
    policy: GroupPolicy,
    value: &str,
    seq: usize,
    members: &[&Defect],
    used_branches: &mut std::collections::HashSet<String>,
) -> Bundle {
    let defects: Vec<Defect> = members.iter().map(|d| (*d).clone()).collect();

    let mut related_files = Vec::new();
    let mut components = Vec::new();
    for d in &defects {
        for f in &d.context.related_files {
            if !related_files.contains(f) {
                related_files.push(f.clone());
            }
        }
        if let Some(c) = d.component() {
            if !components.iter().any(|x: &String| x.as_str() == c) {
                components.push(c.to_string());
            }
        }
    }

    let priority = defects
        .iter()
        .map(|d| d.priority())
        .max()
        .expect("bundle is non-empty");

    let id = format!("{}-{}-{}", policy.as_str(), slugify(value), seq);
    let branch = proposed_branch(policy, value, &defects, used_branches);

    Bundle {
        name: format!("{} ({} defects)", value, defects.len()),
        id,
        policy,
        group_value: value.to_string(),
        defects,
        proposed_branch: branch,
        related_files,
        components,
        priority,
    }
}

/// Deterministic branch name from (policy, value, id range), unique within
/// the session and never a reserved git name.
fn proposed_branch(
    policy: GroupPolicy,
    value: &str,
    defects: &[Defect],
    used: &mut std::collections::HashSet<String>,
) -> String {
    let min_id = defects.iter().map(|d| d.id).min().unwrap_or(0);
    let max_id = defects.iter().map(|d| d.id).max().unwrap_or(0);
    let range = if min_id == max_id {
        format!("{min_id}")
    } else {
        format!("{min_id}-{max_id}")
    };

    let mut slug = slugify(value);
    if slug.is_empty() || RESERVED_BRANCH_NAMES.contains(&slug.as_str()) {
        slug = format!("{}-{}", policy.as_str(), "group");
    }

    let base = format!("{BRANCH_NAMESPACE}/{}-{}-{}", policy.as_str(), slug, range);
    let mut candidate = base.clone();
    let mut n = 2;
    while !used.insert(candidate.clone()) {
        candidate = format!("{base}.{n}");
        n += 1;
    }
    candidate
}

/// Lowercase slug limited to `[a-z0-9-]`, truncated at a word boundary the
/// same way agent branch names are built elsewhere in the toolchain.
pub fn slugify(input: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.len() > SLUG_MAX_LEN {
        let cut = slug[..SLUG_MAX_LEN]
            .rfind('-')
            .unwrap_or(SLUG_MAX_LEN);
        slug.truncate(cut.max(1));
        while slug.ends_with('-') {
            slug.pop();
        }
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defects::test_support::defect;
    use crate::defects::{DefectKind, DefectPriority};

    fn sample() -> Vec<Defect> {
        vec![
            defect(1, DefectKind::Bug, DefectPriority::High, "auth"),
            defect(2, DefectKind::Bug, DefectPriority::Critical, "auth"),
            defect(3, DefectKind::Feature, DefectPriority::Low, "billing"),
            defect(4, DefectKind::Bug, DefectPriority::Medium, "auth"),
        ]
    }

    #[test]
    fn empty_input_is_empty_outcome() {
        let outcome = group_defects(&[], GroupPolicy::Component, &GroupingOptions::default());
        assert!(outcome.bundles.is_empty());
        assert!(outcome.residue.is_empty());
    }

    #[test]
    fn groups_by_component_with_priority_order() {
        let outcome = group_defects(&sample(), GroupPolicy::Component, &GroupingOptions::default());
        assert_eq!(outcome.bundles.len(), 2);
        let auth = outcome
            .bundles
            .iter()
            .find(|b| b.group_value == "auth")
            .unwrap();
        // priority desc, id asc
        assert_eq!(auth.defect_ids(), vec![2, 1, 4]);
        assert_eq!(auth.priority, DefectPriority::Critical);
    }

    #[test]
    fn all_members_share_group_value() {
        let outcome = group_defects(&sample(), GroupPolicy::Component, &GroupingOptions::default());
        for bundle in &outcome.bundles {
            for d in &bundle.defects {
                assert_eq!(d.component().unwrap(), bundle.group_value);
            }
        }
    }

    #[test]
    fn max_bundle_size_splits_buckets() {
        let options = GroupingOptions {
            max_bundle_size: 2,
            ..Default::default()
        };
        let outcome = group_defects(&sample(), GroupPolicy::Component, &options);
        let auth: Vec<_> = outcome
            .bundles
            .iter()
            .filter(|b| b.group_value == "auth")
            .collect();
        assert_eq!(auth.len(), 2);
        assert_eq!(auth[0].len(), 2);
        assert_eq!(auth[1].len(), 1);
        assert_ne!(auth[0].proposed_branch, auth[1].proposed_branch);
    }

    #[test]
    fn min_bundle_size_drops_into_residue() {
        let options = GroupingOptions {
            min_bundle_size: 2,
            ..Default::default()
        };
        let outcome = group_defects(&sample(), GroupPolicy::Component, &options);
        assert_eq!(outcome.bundles.len(), 1);
        assert_eq!(outcome.residue.len(), 1);
        assert_eq!(outcome.residue[0].id, 3);
    }

    #[test]
    fn file_policy_fans_out() {
        let mut d = defect(7, DefectKind::Bug, DefectPriority::High, "core");
        d.context.related_files = vec!["src/a.rs".into(), "src/b.rs".into()];
        let outcome = group_defects(
            &[d],
            GroupPolicy::File,
            &GroupingOptions::default(),
        );
        assert_eq!(outcome.bundles.len(), 2);
    }

    #[test]
    fn label_filters_apply() {
        let mut defects = sample();
        defects[0].labels.insert("auto-fix".into());
        defects[1].labels.insert("auto-fix".into());
        defects[1].labels.insert("wip".into());
        let options = GroupingOptions {
            include_labels: vec!["auto-fix".into()],
            exclude_labels: vec!["wip".into()],
            ..Default::default()
        };
        let outcome = group_defects(&defects, GroupPolicy::Component, &options);
        let ids: Vec<u64> = outcome.bundles.iter().flat_map(|b| b.defect_ids()).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn branch_names_are_valid_and_unique() {
        let outcome = group_defects(&sample(), GroupPolicy::Component, &GroupingOptions::default());
        let mut seen = std::collections::HashSet::new();
        for bundle in &outcome.bundles {
            assert!(bundle
                .proposed_branch
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "._/-".contains(c)));
            assert!(seen.insert(bundle.proposed_branch.clone()));
            assert!(!RESERVED_BRANCH_NAMES.contains(&bundle.proposed_branch.as_str()));
        }
    }

    #[test]
    fn branch_name_is_deterministic() {
        let a = group_defects(&sample(), GroupPolicy::Component, &GroupingOptions::default());
        let b = group_defects(&sample(), GroupPolicy::Component, &GroupingOptions::default());
        let branches = |o: &GroupingOutcome| {
            o.bundles
                .iter()
                .map(|b| b.proposed_branch.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(branches(&a), branches(&b));
    }

    #[test]
    fn slugify_handles_noise() {
        assert_eq!(slugify("Fix   multiple---spaces"), "fix-multiple-spaces");
        assert_eq!(slugify("src/auth/mod.rs"), "src-auth-mod-rs");
        assert_eq!(slugify(""), "");
        let long = slugify("a very long component name that exceeds the slug limit");
        assert!(long.len() <= SLUG_MAX_LEN);
        assert!(!long.ends_with('-'));
    }

    #[test]
    fn kind_and_priority_policies() {
        let outcome = group_defects(&sample(), GroupPolicy::Kind, &GroupingOptions::default());
        let values: Vec<_> = outcome.bundles.iter().map(|b| b.group_value.as_str()).collect();
        assert!(values.contains(&"bug"));
        assert!(values.contains(&"feature"));

        let outcome = group_defects(&sample(), GroupPolicy::Priority, &GroupingOptions::default());
        assert!(outcome
            .bundles
            .iter()
            .any(|b| b.group_value == "critical" && b.defect_ids() == vec![2]));
    }
}
