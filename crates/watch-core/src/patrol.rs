//! Patrol sub-aggregate manager: the nested collection of patrols belonging
//! to the organization, derived-stat recalculation, debounce bookkeeping for
//! settle-writes, and the one-shot migration of legacy embedded patrols.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use contracts::{
    ChangeKind, Organization, Patrol, PatrolPatch, PatrolSeed, StatBlock, StatModifier,
    SCHEMA_VERSION_V1,
};
use tracing::debug;
use uuid::Uuid;

use crate::aggregate::validate_stats;
use crate::SyncError;

/// `derived = base + Σ organization modifiers + Σ active effect modifiers`.
pub fn derived_stats(
    base: &StatBlock,
    org_modifiers: &[StatModifier],
    effects: &[contracts::EffectInstance],
) -> StatBlock {
    let mut derived = *base;
    for modifier in org_modifiers {
        derived = derived.saturating_add(&modifier.modifiers);
    }
    for effect in effects {
        derived = derived.saturating_add(&effect.modifiers);
    }
    derived
}

#[derive(Debug)]
pub struct PatrolManager {
    patrols: BTreeMap<String, Patrol>,
    debounce: Duration,
    dirty: bool,
    deadline: Option<Instant>,
}

impl PatrolManager {
    pub fn new(debounce: Duration) -> Self {
        Self {
            patrols: BTreeMap::new(),
            debounce,
            dirty: false,
            deadline: None,
        }
    }

    pub fn load(&mut self, patrols: Vec<Patrol>) {
        self.patrols = patrols
            .into_iter()
            .map(|patrol| (patrol.id.clone(), patrol))
            .collect();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.patrols.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Patrol> {
        self.patrols.get(id)
    }

    pub fn list(&self) -> Vec<Patrol> {
        self.patrols.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.patrols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patrols.is_empty()
    }

    /// Allocates a patrol seeded from `seed` and recalculates derived stats
    /// immediately; with no modifiers and no effects the derived stats equal
    /// the base stats exactly.
    pub fn create(
        &mut self,
        organization_id: &str,
        seed: PatrolSeed,
        org_modifiers: &[StatModifier],
        now_ms: u64,
    ) -> Result<Patrol, SyncError> {
        let base_stats = seed.base_stats.unwrap_or_default();
        validate_stats(&base_stats)?;

        let id = format!("patrol:{}", Uuid::new_v4().simple());
        let patrol = Patrol {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            id: id.clone(),
            organization_id: organization_id.to_string(),
            name: seed.name.unwrap_or_else(|| "New Patrol".to_string()),
            subtitle: seed.subtitle.unwrap_or_default(),
            base_stats,
            derived_stats: derived_stats(&base_stats, org_modifiers, &seed.effects),
            effects: seed.effects,
            last_order: seed.last_order,
            officer_id: seed.officer_id,
            soldier_ids: seed.soldier_ids,
            version: 1,
            updated_at_ms: now_ms,
        };
        self.patrols.insert(id, patrol.clone());
        Ok(patrol)
    }

    /// Field-level merge with patch-over-existing precedence; one version
    /// bump per accepted update. `Ok(None)` is the not-found sentinel.
    pub fn update(
        &mut self,
        id: &str,
        patch: &PatrolPatch,
        now_ms: u64,
    ) -> Result<Option<Patrol>, SyncError> {
        if let Some(base_stats) = patch.base_stats.as_ref() {
            validate_stats(base_stats)?;
        }
        let Some(patrol) = self.patrols.get_mut(id) else {
            return Ok(None);
        };

        // Derived stats carry the organization modifiers applied at the last
        // recalculation; keep that component and rebuild on top of the new
        // base and effects.
        let org_component = stat_delta(
            &stat_delta(&patrol.derived_stats, &patrol.base_stats),
            &effects_total(&patrol.effects),
        );

        let mut changed = false;
        let mut stats_touched = false;
        if let Some(name) = patch.name.as_ref() {
            changed |= replace(&mut patrol.name, name.clone());
        }
        if let Some(subtitle) = patch.subtitle.as_ref() {
            changed |= replace(&mut patrol.subtitle, subtitle.clone());
        }
        if let Some(base_stats) = patch.base_stats.as_ref() {
            let touched = replace(&mut patrol.base_stats, *base_stats);
            changed |= touched;
            stats_touched |= touched;
        }
        if let Some(effects) = patch.effects.as_ref() {
            let touched = replace(&mut patrol.effects, effects.clone());
            changed |= touched;
            stats_touched |= touched;
        }
        if let Some(last_order) = patch.last_order.as_ref() {
            changed |= replace(&mut patrol.last_order, Some(last_order.clone()));
        }
        if let Some(officer_id) = patch.officer_id.as_ref() {
            changed |= replace(&mut patrol.officer_id, Some(officer_id.clone()));
        }
        if let Some(soldier_ids) = patch.soldier_ids.as_ref() {
            changed |= replace(&mut patrol.soldier_ids, soldier_ids.clone());
        }

        if stats_touched {
            patrol.derived_stats = patrol
                .base_stats
                .saturating_add(&org_component)
                .saturating_add(&effects_total(&patrol.effects));
        }
        if changed {
            patrol.version += 1;
            patrol.updated_at_ms = now_ms;
        }
        Ok(Some(patrol.clone()))
    }

    /// Recomputes derived stats for one patrol. Idempotent: a recalculation
    /// that lands on the already-held derived stats does not bump the
    /// version, so repeated calls with the same inputs increment it once
    /// total. `None` is the not-found sentinel.
    pub fn recalc(
        &mut self,
        id: &str,
        org_modifiers: &[StatModifier],
        now_ms: u64,
    ) -> Option<bool> {
        let patrol = self.patrols.get_mut(id)?;
        let next = derived_stats(&patrol.base_stats, org_modifiers, &patrol.effects);
        if next == patrol.derived_stats {
            return Some(false);
        }
        patrol.derived_stats = next;
        patrol.version += 1;
        patrol.updated_at_ms = now_ms;
        Some(true)
    }

    /// Recalculates every patrol; returns the ids whose derived stats
    /// actually changed.
    pub fn recalc_all(&mut self, org_modifiers: &[StatModifier], now_ms: u64) -> Vec<String> {
        let ids = self.patrols.keys().cloned().collect::<Vec<_>>();
        ids.into_iter()
            .filter(|id| self.recalc(id, org_modifiers, now_ms) == Some(true))
            .collect()
    }

    pub fn delete(&mut self, id: &str) -> Option<Patrol> {
        self.patrols.remove(id)
    }

    /// Merges a remote patrol collection: unknown ids are inserted, known ids
    /// are replaced only when the incoming version is strictly greater, and
    /// local patrols no longer referenced by the adopted aggregate are
    /// dropped. Returns the applied changes for notification.
    pub fn adopt_remote(
        &mut self,
        incoming: Vec<Patrol>,
        referenced_ids: &[String],
    ) -> Vec<(Patrol, ChangeKind)> {
        let mut applied = Vec::new();

        for patrol in incoming {
            match self.patrols.get(&patrol.id) {
                None => {
                    self.patrols.insert(patrol.id.clone(), patrol.clone());
                    applied.push((patrol, ChangeKind::Create));
                }
                Some(existing) if patrol.version > existing.version => {
                    self.patrols.insert(patrol.id.clone(), patrol.clone());
                    applied.push((patrol, ChangeKind::Update));
                }
                Some(_) => {}
            }
        }

        let stale_ids = self
            .patrols
            .keys()
            .filter(|id| !referenced_ids.contains(id))
            .cloned()
            .collect::<Vec<_>>();
        for id in stale_ids {
            if let Some(removed) = self.patrols.remove(&id) {
                applied.push((removed, ChangeKind::Delete));
            }
        }

        applied
    }

    /// One-shot upgrade of patrols embedded in the aggregate's obsolete slot:
    /// copies them into the manager, registers missing parent references,
    /// clears the source field, and bumps the aggregate version once.
    /// Re-running after migration is a no-op.
    pub fn migrate_embedded(&mut self, organization: &mut Organization, now_ms: u64) -> usize {
        if organization.embedded_patrols.is_empty() {
            return 0;
        }

        let legacy = std::mem::take(&mut organization.embedded_patrols);
        let mut migrated = 0;
        for patrol in legacy {
            if !organization.patrol_ids.contains(&patrol.id) {
                organization.patrol_ids.push(patrol.id.clone());
            }
            if !self.patrols.contains_key(&patrol.id) {
                self.patrols.insert(patrol.id.clone(), patrol);
                migrated += 1;
            }
        }

        organization.version += 1;
        organization.updated_at_ms = now_ms;
        debug!(migrated, "migrated legacy embedded patrols");
        migrated
    }

    /// Arms (or re-arms) the debounce timer; a new mutation before the
    /// pending deadline fires resets it rather than firing twice.
    pub fn mark_dirty(&mut self, now: Instant) {
        self.dirty = true;
        self.deadline = Some(now + self.debounce);
    }

    /// True when a coalesced settle-write is due; clears the dirty flag.
    pub fn settle_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if self.dirty && now >= deadline => {
                self.dirty = false;
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Clears any pending debounce; used after an immediate persist so the
    /// same change is not written twice.
    pub fn clear_pending(&mut self) {
        self.dirty = false;
        self.deadline = None;
    }

    pub fn has_pending(&self) -> bool {
        self.dirty
    }
}

fn effects_total(effects: &[contracts::EffectInstance]) -> StatBlock {
    let mut total = StatBlock::default();
    for effect in effects {
        total = total.saturating_add(&effect.modifiers);
    }
    total
}

fn stat_delta(a: &StatBlock, b: &StatBlock) -> StatBlock {
    StatBlock {
        robustismo: a.robustismo.saturating_sub(b.robustismo),
        analitica: a.analitica.saturating_sub(b.analitica),
        subterfugio: a.subterfugio.saturating_sub(b.subterfugio),
        elocuencia: a.elocuencia.saturating_sub(b.elocuencia),
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}
