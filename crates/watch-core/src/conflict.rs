//! Conflict detection and resolution. Classification uses the version counter
//! as the sole ordering signal; resolution is a pure function of the two
//! snapshots plus the two privilege flags, so re-running it always picks the
//! same winner.

use contracts::{ConflictClassification, Organization, ResolutionStrategy};

use crate::aggregate::same_snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

/// Strictly-greater incoming versions are clean forward updates. An incoming
/// copy at the same id+version is a stale echo of state already held. Any
/// other not-strictly-greater copy was produced concurrently from a common
/// ancestor and needs arbitration.
pub fn classify(local: &Organization, incoming: &Organization) -> ConflictClassification {
    if incoming.version > local.version {
        return ConflictClassification::CleanForward;
    }
    if same_snapshot(local, incoming) && incoming.updated_at_ms == local.updated_at_ms {
        return ConflictClassification::StaleEcho;
    }
    if incoming.version < local.version {
        // An older counter carries nothing the local copy has not already
        // superseded; arbitration would only resurrect lost updates.
        return ConflictClassification::StaleEcho;
    }
    ConflictClassification::Concurrent
}

/// Later advisory timestamp wins; an exact tie keeps the local side so that
/// resolution is stable under replay.
pub fn resolve_last_write_wins(local: &Organization, remote: &Organization) -> Winner {
    if remote.updated_at_ms > local.updated_at_ms {
        Winner::Remote
    } else {
        Winner::Local
    }
}

/// Exactly one privileged side wins outright; otherwise fall back to
/// last-write-wins.
pub fn resolve_authority_priority(
    local: &Organization,
    remote: &Organization,
    local_privileged: bool,
    remote_privileged: bool,
) -> Winner {
    match (local_privileged, remote_privileged) {
        (true, false) => Winner::Local,
        (false, true) => Winner::Remote,
        _ => resolve_last_write_wins(local, remote),
    }
}

/// Runs the automatic strategies; `Manual` yields no winner and the caller
/// queues the conflict for human review.
pub fn resolve(
    strategy: ResolutionStrategy,
    local: &Organization,
    remote: &Organization,
    local_privileged: bool,
    remote_privileged: bool,
) -> Option<Winner> {
    match strategy {
        ResolutionStrategy::LastWriteWins => Some(resolve_last_write_wins(local, remote)),
        ResolutionStrategy::AuthorityPriority => Some(resolve_authority_priority(
            local,
            remote,
            local_privileged,
            remote_privileged,
        )),
        ResolutionStrategy::Manual => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org(version: u64, updated_at_ms: u64, subtitle: &str) -> Organization {
        let mut org = Organization::new_default(updated_at_ms);
        org.version = version;
        org.subtitle = subtitle.to_string();
        org
    }

    #[test]
    fn higher_incoming_version_is_clean_forward() {
        let local = org(5, 100, "local");
        let incoming = org(6, 90, "remote");
        assert_eq!(
            classify(&local, &incoming),
            ConflictClassification::CleanForward
        );
    }

    #[test]
    fn identical_snapshot_is_a_stale_echo() {
        let local = org(5, 100, "same");
        let incoming = org(5, 100, "same");
        assert_eq!(
            classify(&local, &incoming),
            ConflictClassification::StaleEcho
        );
    }

    #[test]
    fn older_incoming_version_is_dropped_as_stale() {
        let local = org(7, 100, "local");
        let incoming = org(4, 500, "remote");
        assert_eq!(
            classify(&local, &incoming),
            ConflictClassification::StaleEcho
        );
    }

    #[test]
    fn equal_version_different_content_is_concurrent() {
        let local = org(6, 100, "local edit");
        let incoming = org(6, 120, "remote edit");
        assert_eq!(
            classify(&local, &incoming),
            ConflictClassification::Concurrent
        );
    }

    #[test]
    fn last_write_wins_picks_later_stamp_and_keeps_local_on_tie() {
        let local = org(6, 100, "local");
        assert_eq!(
            resolve_last_write_wins(&local, &org(6, 200, "remote")),
            Winner::Remote
        );
        assert_eq!(
            resolve_last_write_wins(&local, &org(6, 50, "remote")),
            Winner::Local
        );
        assert_eq!(
            resolve_last_write_wins(&local, &org(6, 100, "remote")),
            Winner::Local
        );
    }

    #[test]
    fn authority_priority_overrides_timestamps() {
        let local = org(6, 999, "player edit");
        let remote = org(6, 1, "gm edit");
        assert_eq!(
            resolve_authority_priority(&local, &remote, false, true),
            Winner::Remote
        );
        assert_eq!(
            resolve_authority_priority(&local, &remote, true, false),
            Winner::Local
        );
    }

    #[test]
    fn authority_priority_falls_back_to_lww_when_symmetric() {
        let local = org(6, 100, "local");
        let remote = org(6, 200, "remote");
        assert_eq!(
            resolve_authority_priority(&local, &remote, true, true),
            Winner::Remote
        );
        assert_eq!(
            resolve_authority_priority(&local, &remote, false, false),
            Winner::Remote
        );
    }

    #[test]
    fn manual_strategy_never_auto_picks() {
        let local = org(6, 100, "local");
        let remote = org(6, 200, "remote");
        assert_eq!(
            resolve(ResolutionStrategy::Manual, &local, &remote, false, true),
            None
        );
    }
}
