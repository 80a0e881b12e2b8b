//! Pure operations on the versioned organization aggregate: the two permitted
//! mutation shapes (field-level patch, wholesale adoption), stale rejection,
//! orphan pruning, and stat breakdowns.

use contracts::{
    Organization, OrganizationPatch, StatBlock, StatBreakdownEntry, StatKey, StatModifier,
    STAT_MAX, STAT_MIN,
};

use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdoptOutcome {
    Adopted,
    StaleIgnored,
}

pub fn validate_stats(stats: &StatBlock) -> Result<(), SyncError> {
    match stats.first_out_of_bounds() {
        Some((stat, value)) => Err(SyncError::StatOutOfRange {
            stat,
            value,
            min: STAT_MIN,
            max: STAT_MAX,
        }),
        None => Ok(()),
    }
}

/// Applies a field-level partial update. Precedence is patch-over-existing per
/// field; list fields are replaced wholesale, never merged element-wise.
/// Bumps `version` exactly once when anything changed; an empty or no-op patch
/// leaves the aggregate untouched. Validation runs before any mutation.
pub fn apply_patch(
    organization: &mut Organization,
    patch: &OrganizationPatch,
    now_ms: u64,
) -> Result<bool, SyncError> {
    if let Some(stats) = patch.stats.as_ref() {
        validate_stats(stats)?;
    }

    let mut changed = false;
    if let Some(name) = patch.name.as_ref() {
        changed |= replace_field(&mut organization.name, name.clone());
    }
    if let Some(subtitle) = patch.subtitle.as_ref() {
        changed |= replace_field(&mut organization.subtitle, subtitle.clone());
    }
    if let Some(stats) = patch.stats.as_ref() {
        changed |= replace_field(&mut organization.stats, *stats);
    }
    if let Some(ids) = patch.active_modifier_ids.as_ref() {
        changed |= replace_field(&mut organization.active_modifier_ids, ids.clone());
    }
    if let Some(ids) = patch.resource_ids.as_ref() {
        changed |= replace_field(&mut organization.resource_ids, ids.clone());
    }
    if let Some(ids) = patch.reputation_ids.as_ref() {
        changed |= replace_field(&mut organization.reputation_ids, ids.clone());
    }

    if changed {
        organization.version += 1;
        organization.updated_at_ms = now_ms;
    }
    Ok(changed)
}

fn replace_field<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

/// Wholesale replacement by a remote copy, adopting the remote version
/// counter verbatim. A remote whose version is not strictly greater than the
/// locally held one must never overwrite local state.
pub fn adopt_remote(local: &mut Option<Organization>, remote: Organization) -> AdoptOutcome {
    if let Some(current) = local.as_ref() {
        if remote.version <= current.version {
            return AdoptOutcome::StaleIgnored;
        }
    }
    *local = Some(remote);
    AdoptOutcome::Adopted
}

/// Dedup equality: two snapshots with the same id and version are assumed to
/// be the same logical state, without a deep comparison.
pub fn same_snapshot(a: &Organization, b: &Organization) -> bool {
    a.id == b.id && a.version == b.version
}

/// Removes `patrol_ids` entries the resolver cannot produce a patrol for.
/// One pass removes every orphan and bumps `version` exactly once.
pub fn prune_orphans<F>(organization: &mut Organization, resolves: F, now_ms: u64) -> usize
where
    F: Fn(&str) -> bool,
{
    let before = organization.patrol_ids.len();
    organization.patrol_ids.retain(|id| resolves(id));
    let removed = before - organization.patrol_ids.len();
    if removed > 0 {
        organization.version += 1;
        organization.updated_at_ms = now_ms;
    }
    removed
}

/// Per-stat totals for the organization: base plus the sum of the resolved
/// active modifiers.
pub fn organization_breakdown(
    organization: &Organization,
    modifiers: &[StatModifier],
) -> Vec<StatBreakdownEntry> {
    let modifier_sum = modifiers
        .iter()
        .fold(StatBlock::default(), |acc, modifier| {
            acc.saturating_add(&modifier.modifiers)
        });

    StatKey::ALL
        .iter()
        .map(|key| {
            let base = organization.stats.get(*key);
            let modifier_total = modifier_sum.get(*key);
            StatBreakdownEntry {
                stat: *key,
                base,
                modifier_total,
                total: base.saturating_add(modifier_total),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org_at(version: u64) -> Organization {
        let mut org = Organization::new_default(100);
        org.version = version;
        org
    }

    #[test]
    fn patch_bumps_version_exactly_once() {
        let mut org = org_at(1);
        let patch = OrganizationPatch {
            name: Some("Night Watch".to_string()),
            subtitle: Some("first bell".to_string()),
            stats: Some(StatBlock {
                robustismo: 10,
                ..StatBlock::default()
            }),
            ..OrganizationPatch::default()
        };

        let changed = apply_patch(&mut org, &patch, 200).expect("patch applies");
        assert!(changed);
        assert_eq!(org.version, 2);
        assert_eq!(org.updated_at_ms, 200);
        assert_eq!(org.name, "Night Watch");
    }

    #[test]
    fn noop_patch_leaves_version_alone() {
        let mut org = org_at(3);
        let patch = OrganizationPatch {
            name: Some(org.name.clone()),
            ..OrganizationPatch::default()
        };
        let changed = apply_patch(&mut org, &patch, 999).expect("patch applies");
        assert!(!changed);
        assert_eq!(org.version, 3);
        assert_eq!(org.updated_at_ms, 100);
    }

    #[test]
    fn invalid_stats_reject_before_any_mutation() {
        let mut org = org_at(1);
        let patch = OrganizationPatch {
            name: Some("should not land".to_string()),
            stats: Some(StatBlock {
                robustismo: 120,
                ..StatBlock::default()
            }),
            ..OrganizationPatch::default()
        };

        let err = apply_patch(&mut org, &patch, 200).expect_err("out-of-range stat");
        assert!(matches!(err, SyncError::StatOutOfRange { value: 120, .. }));
        assert_eq!(org.version, 1);
        assert_eq!(org.name, Organization::new_default(0).name);
    }

    #[test]
    fn stale_or_equal_versions_never_overwrite() {
        let mut local = Some(org_at(5));
        assert_eq!(
            adopt_remote(&mut local, org_at(5)),
            AdoptOutcome::StaleIgnored
        );
        assert_eq!(
            adopt_remote(&mut local, org_at(4)),
            AdoptOutcome::StaleIgnored
        );
        assert_eq!(adopt_remote(&mut local, org_at(6)), AdoptOutcome::Adopted);
        assert_eq!(local.as_ref().map(|org| org.version), Some(6));
    }

    #[test]
    fn adopting_into_empty_slot_always_succeeds() {
        let mut local = None;
        assert_eq!(adopt_remote(&mut local, org_at(1)), AdoptOutcome::Adopted);
    }

    #[test]
    fn pruning_several_orphans_bumps_version_once() {
        let mut org = org_at(4);
        org.patrol_ids = vec![
            "patrol:alive".to_string(),
            "patrol:gone-1".to_string(),
            "patrol:gone-2".to_string(),
        ];

        let removed = prune_orphans(&mut org, |id| id == "patrol:alive", 500);
        assert_eq!(removed, 2);
        assert_eq!(org.version, 5);
        assert_eq!(org.patrol_ids, vec!["patrol:alive".to_string()]);

        let removed_again = prune_orphans(&mut org, |id| id == "patrol:alive", 600);
        assert_eq!(removed_again, 0);
        assert_eq!(org.version, 5);
    }

    #[test]
    fn breakdown_applies_modifier_to_base() {
        // Organization at version 3, robustismo 10, modifier +2 -> total 12.
        let mut org = org_at(3);
        org.stats.robustismo = 10;
        let modifiers = vec![StatModifier {
            modifier_id: "mod:armory".to_string(),
            label: "well stocked armory".to_string(),
            modifiers: StatBlock {
                robustismo: 2,
                ..StatBlock::default()
            },
        }];

        let patch = OrganizationPatch {
            active_modifier_ids: Some(vec!["mod:armory".to_string()]),
            ..OrganizationPatch::default()
        };
        apply_patch(&mut org, &patch, 700).expect("patch applies");
        assert_eq!(org.version, 4);

        let breakdown = organization_breakdown(&org, &modifiers);
        let robustismo = breakdown
            .iter()
            .find(|entry| entry.stat == StatKey::Robustismo)
            .expect("robustismo entry");
        assert_eq!(robustismo.base, 10);
        assert_eq!(robustismo.modifier_total, 2);
        assert_eq!(robustismo.total, 12);
    }
}
