//! v1 cross-boundary contracts for the watch sync kernel, persistence, and API surface.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION_V1: &str = "1.0";

pub const STAT_MIN: i64 = -99;
pub const STAT_MAX: i64 = 99;

/// The organization is a world singleton; every client addresses the same id.
pub const DEFAULT_ORGANIZATION_ID: &str = "org:citadel-watch";

pub const DEFAULT_CHANNEL_NAME: &str = "watch-sync";
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 200;
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKey {
    Robustismo,
    Analitica,
    Subterfugio,
    Elocuencia,
}

impl StatKey {
    pub const ALL: [StatKey; 4] = [
        StatKey::Robustismo,
        StatKey::Analitica,
        StatKey::Subterfugio,
        StatKey::Elocuencia,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            StatKey::Robustismo => "robustismo",
            StatKey::Analitica => "analitica",
            StatKey::Subterfugio => "subterfugio",
            StatKey::Elocuencia => "elocuencia",
        }
    }
}

impl fmt::Display for StatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The four base stats shared by the organization and its patrols. Also used
/// as a per-stat modifier map, in which case values may fall outside the
/// playable range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatBlock {
    #[serde(default)]
    pub robustismo: i64,
    #[serde(default)]
    pub analitica: i64,
    #[serde(default)]
    pub subterfugio: i64,
    #[serde(default)]
    pub elocuencia: i64,
}

impl StatBlock {
    pub fn get(&self, key: StatKey) -> i64 {
        match key {
            StatKey::Robustismo => self.robustismo,
            StatKey::Analitica => self.analitica,
            StatKey::Subterfugio => self.subterfugio,
            StatKey::Elocuencia => self.elocuencia,
        }
    }

    pub fn saturating_add(&self, other: &StatBlock) -> StatBlock {
        StatBlock {
            robustismo: self.robustismo.saturating_add(other.robustismo),
            analitica: self.analitica.saturating_add(other.analitica),
            subterfugio: self.subterfugio.saturating_add(other.subterfugio),
            elocuencia: self.elocuencia.saturating_add(other.elocuencia),
        }
    }

    pub fn within_bounds(&self) -> bool {
        StatKey::ALL
            .iter()
            .all(|key| (STAT_MIN..=STAT_MAX).contains(&self.get(*key)))
    }

    pub fn first_out_of_bounds(&self) -> Option<(StatKey, i64)> {
        StatKey::ALL.iter().copied().find_map(|key| {
            let value = self.get(key);
            if (STAT_MIN..=STAT_MAX).contains(&value) {
                None
            } else {
                Some((key, value))
            }
        })
    }
}

/// An organization-level modifier already resolved by the caller; the kernel
/// never dereferences modifier ids itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatModifier {
    pub modifier_id: String,
    pub label: String,
    pub modifiers: StatBlock,
}

/// One applied effect on a patrol, carrying a per-stat modifier map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectInstance {
    pub effect_id: String,
    pub label: String,
    pub modifiers: StatBlock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub schema_version: String,
    pub id: String,
    pub name: String,
    pub subtitle: String,
    pub stats: StatBlock,
    #[serde(default)]
    pub active_modifier_ids: Vec<String>,
    #[serde(default)]
    pub resource_ids: Vec<String>,
    #[serde(default)]
    pub reputation_ids: Vec<String>,
    #[serde(default)]
    pub patrol_ids: Vec<String>,
    /// Sole ordering/conflict signal; strictly increasing by 1 per accepted
    /// mutation.
    pub version: u64,
    /// Advisory wall-clock stamp used only for last-write-wins tie-breaking.
    pub updated_at_ms: u64,
    /// Obsolete embedded patrol slot kept for one-shot migration of old
    /// saves; always empty after the first load.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedded_patrols: Vec<Patrol>,
}

impl Organization {
    pub fn new_default(now_ms: u64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            id: DEFAULT_ORGANIZATION_ID.to_string(),
            name: "The Citadel Watch".to_string(),
            subtitle: String::new(),
            stats: StatBlock::default(),
            active_modifier_ids: Vec::new(),
            resource_ids: Vec::new(),
            reputation_ids: Vec::new(),
            patrol_ids: Vec::new(),
            version: 1,
            updated_at_ms: now_ms,
            embedded_patrols: Vec::new(),
        }
    }
}

impl fmt::Display for Organization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} \"{}\" v{} patrols={}",
            self.id,
            self.name,
            self.version,
            self.patrol_ids.len()
        )
    }
}

/// Field-level partial update for the organization. `None` leaves the field
/// untouched; `Some` replaces it wholesale (lists included). This is the
/// declared merge precedence: patch-over-existing, per field, never deeper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrganizationPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub stats: Option<StatBlock>,
    #[serde(default)]
    pub active_modifier_ids: Option<Vec<String>>,
    #[serde(default)]
    pub resource_ids: Option<Vec<String>>,
    #[serde(default)]
    pub reputation_ids: Option<Vec<String>>,
}

impl OrganizationPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.subtitle.is_none()
            && self.stats.is_none()
            && self.active_modifier_ids.is_none()
            && self.resource_ids.is_none()
            && self.reputation_ids.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patrol {
    pub schema_version: String,
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub subtitle: String,
    pub base_stats: StatBlock,
    /// Computed: base + applicable organization modifiers + active effects.
    pub derived_stats: StatBlock,
    #[serde(default)]
    pub effects: Vec<EffectInstance>,
    #[serde(default)]
    pub last_order: Option<String>,
    #[serde(default)]
    pub officer_id: Option<String>,
    #[serde(default)]
    pub soldier_ids: Vec<String>,
    pub version: u64,
    pub updated_at_ms: u64,
}

/// Seed fields for patrol creation; everything absent defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatrolSeed {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub base_stats: Option<StatBlock>,
    #[serde(default)]
    pub effects: Vec<EffectInstance>,
    #[serde(default)]
    pub last_order: Option<String>,
    #[serde(default)]
    pub officer_id: Option<String>,
    #[serde(default)]
    pub soldier_ids: Vec<String>,
}

/// Field-level partial update for a patrol; same merge precedence as
/// [`OrganizationPatch`]. Derived stats are never writable through a patch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatrolPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub base_stats: Option<StatBlock>,
    #[serde(default)]
    pub effects: Option<Vec<EffectInstance>>,
    #[serde(default)]
    pub last_order: Option<String>,
    #[serde(default)]
    pub officer_id: Option<String>,
    #[serde(default)]
    pub soldier_ids: Option<Vec<String>>,
}

impl PatrolPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.subtitle.is_none()
            && self.base_stats.is_none()
            && self.effects.is_none()
            && self.last_order.is_none()
            && self.officer_id.is_none()
            && self.soldier_ids.is_none()
    }
}

/// Per-stat decomposition into base value plus modifier contributions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatBreakdownEntry {
    pub stat: StatKey,
    pub base: i64,
    pub modifier_total: i64,
    pub total: i64,
}

/// Wire envelope for the broadcast channel. Never persisted. Receivers must
/// drop messages carrying their own `origin_client_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub schema_version: String,
    pub channel: String,
    pub origin_client_id: String,
    /// Whether the originating client held the privileged role when the
    /// message was produced; consumed by authority-priority resolution.
    pub origin_privileged: bool,
    pub payload: SyncPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncPayload {
    UpdateAggregate {
        organization: Organization,
        #[serde(default)]
        patrols: Vec<Patrol>,
    },
    RequestAggregate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// Notification fired to collaborators exactly once per accepted mutation,
/// whether locally authored or adopted from a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeNotice {
    AggregateChanged {
        organization: Organization,
        kind: ChangeKind,
    },
    PatrolChanged {
        patrol: Patrol,
        kind: ChangeKind,
    },
    ConflictPending {
        pending_count: usize,
    },
    Warning {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictClassification {
    CleanForward,
    StaleEcho,
    Concurrent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    LastWriteWins,
    #[default]
    AuthorityPriority,
    Manual,
}

/// Ephemeral record of a concurrent edit awaiting explicit resolution.
/// Held in memory only; never survives a session restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub local: Organization,
    pub remote: Organization,
    pub remote_origin_id: String,
    pub remote_privileged: bool,
    pub detected_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Doubling delay for the given zero-based failed attempt.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.base_delay_ms.saturating_mul(1_u64 << attempt.min(16))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub schema_version: String,
    pub client_id: String,
    pub channel: String,
    #[serde(default)]
    pub strategy: ResolutionStrategy,
    pub auto_flush: bool,
    pub flush_interval_ms: u64,
    pub debounce_ms: u64,
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            client_id: "client_local_001".to_string(),
            channel: DEFAULT_CHANNEL_NAME.to_string(),
            strategy: ResolutionStrategy::default(),
            auto_flush: true,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    OrganizationNotFound,
    PatrolNotFound,
    ConflictNotFound,
    InvalidPatch,
    InvalidQuery,
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub schema_version: String,
    pub error_code: ErrorCode,
    pub message: String,
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            error_code,
            message: message.into(),
            details,
        }
    }
}
