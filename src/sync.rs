//! Offline sync engine: a durable queue of local mutations replayed against a
//! remote authority, with checksum-based conflict detection and configurable
//! resolution strategies.
//!
//! Failure reporting is two-level and the distinction is load-bearing:
//! operation-level outcomes (success, conflict, terminal failure) travel
//! in-band in the [`SyncReport`]; only call-level problems (offline at start,
//! reentrant pass) are returned as `Err`. Partial failure never aborts a pass.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::checksum::{self, Checksum};
use crate::store::{self, DurableStorage, StoreError};
use crate::UnixTimeMs;

/// Payload key carrying per-field edit timestamps, consumed by auto-merge.
pub const FIELD_TS_KEY: &str = "_field_ts";

/// Validated operation identifier - immutable after construction
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId(String);

impl OpId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, SyncError> {
        let id = id.into().trim().to_string();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), SyncError> {
        if id.is_empty() {
            return Err(SyncError::InvalidId("OpId cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(SyncError::InvalidId(format!(
                "OpId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SyncError::InvalidId(
                "OpId contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        Ok(())
    }
}

/// Conflict identifier, assigned at detection time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictId(String);

impl ConflictId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

/// Declaration order doubles as processing order: `High` sorts first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    High,
    Normal,
    Low,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Remote reported a divergent version; waits for `resolve_conflict`.
    Conflict,
    /// Retry budget exhausted; will not be retried automatically.
    RetriesExhausted,
}

/// Monotonic lifecycle: `Pending -> InFlight -> {Completed | Failed}`, with
/// the transient-retry path looping `InFlight -> Pending`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    Pending,
    InFlight,
    Completed,
    Failed { reason: FailureReason },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: OpId,
    pub kind: OpKind,
    pub target_id: String,
    pub payload: Value,
    pub created_at: UnixTimeMs,
    pub priority: Priority,
    pub retry_count: u32,
    pub status: OpStatus,
    /// Enqueue sequence number; the per-target FIFO witness.
    pub seq: u64,
    /// Earliest time this operation is eligible for a sync attempt.
    pub not_before: UnixTimeMs,
}

impl SyncOperation {
    pub fn new(
        id: OpId,
        kind: OpKind,
        target_id: impl Into<String>,
        payload: Value,
        created_at: UnixTimeMs,
        priority: Priority,
    ) -> Self {
        Self {
            id,
            kind,
            target_id: target_id.into(),
            payload,
            created_at,
            priority,
            retry_count: 0,
            status: OpStatus::Pending,
            seq: 0,
            not_before: created_at,
        }
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self.status,
            OpStatus::Failed {
                reason: FailureReason::RetriesExhausted
            }
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: ConflictId,
    pub operation_id: OpId,
    pub target_id: String,
    pub local_payload: Value,
    pub remote_payload: Value,
    pub local_checksum: String,
    pub remote_checksum: String,
    pub detected_at: UnixTimeMs,
    pub severity: Severity,
}

/// How to settle a detected conflict. Exactly one resolution per conflict.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// Push the local payload back as a high-priority corrective operation.
    UseLocal,
    /// Accept remote state; the local operation is discarded permanently.
    UseRemote,
    /// Field-by-field newer-timestamp-wins; needs `_field_ts` metadata.
    Merge,
    /// Caller-supplied payload, enqueued as a corrective operation.
    Manual { payload: Value },
}

/// Outcome of one remote apply attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum ApplyOutcome {
    Applied,
    /// Remote holds a divergent version of the target.
    Conflict { remote_payload: Value },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote timed out")]
    Timeout,

    #[error("remote unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid sync config: {0}")]
    InvalidConfig(&'static str),

    #[error("duplicate operation: {0}")]
    DuplicateOperation(String),

    #[error("sync pass already in progress")]
    SyncAlreadyInProgress,

    #[error("remote unreachable at sync start")]
    RemoteUnavailable,

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("conflict already resolved: {0}")]
    ConflictAlreadyResolved(String),

    #[error("merge not possible: {0}")]
    MergeNotPossible(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Remote authority the queue is replayed against. Transport is the
/// embedder's concern; tests use deterministic fakes.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    async fn apply(&self, op: &SyncOperation) -> Result<ApplyOutcome, RemoteError>;
}

/// Boolean "online" signal the engine reads but does not manage.
pub trait ConnectivitySignal: Send + Sync {
    fn is_online(&self) -> bool;
}

/// `ConnectivitySignal` backed by an atomic flag, for hosts that push
/// connectivity transitions.
#[derive(Debug, Default)]
pub struct SharedConnectivity(AtomicBool);

impl SharedConnectivity {
    pub fn new(online: bool) -> Self {
        Self(AtomicBool::new(online))
    }

    pub fn set_online(&self, online: bool) {
        self.0.store(online, Ordering::SeqCst);
    }
}

impl ConnectivitySignal for SharedConnectivity {
    fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Severity classification and merge-eligibility policy. These are product
/// policy knobs, not fixed algorithm.
#[derive(Clone, Debug)]
pub struct ConflictPolicy {
    /// Object fields excluded from checksums and from field diffs.
    pub volatile_fields: Vec<String>,
    /// A differing field with one of these names makes the conflict critical.
    pub permission_fields: Vec<String>,
    /// At most this many differing fields: `Low`.
    pub low_max_fields: usize,
    /// At most this many differing fields: `Medium`; more: `High`.
    pub medium_max_fields: usize,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            volatile_fields: vec![
                "updated_at".to_string(),
                "version".to_string(),
                FIELD_TS_KEY.to_string(),
            ],
            permission_fields: vec![
                "permissions".to_string(),
                "acl".to_string(),
                "owner".to_string(),
            ],
            low_max_fields: 1,
            medium_max_fields: 3,
        }
    }
}

impl ConflictPolicy {
    /// Fields whose (volatile-stripped) values differ between the payloads.
    /// Non-object payloads count as a single logical field.
    pub fn differing_fields(&self, local: &Value, remote: &Value) -> Vec<String> {
        match (local.as_object(), remote.as_object()) {
            (Some(a), Some(b)) => {
                let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
                keys.into_iter()
                    .filter(|key| !self.volatile_fields.contains(*key))
                    .filter(|key| {
                        let null = Value::Null;
                        let av = a.get(*key).unwrap_or(&null);
                        let bv = b.get(*key).unwrap_or(&null);
                        checksum::payload_checksum(av, &self.volatile_fields)
                            != checksum::payload_checksum(bv, &self.volatile_fields)
                    })
                    .cloned()
                    .collect()
            }
            _ => vec!["payload".to_string()],
        }
    }

    pub fn classify(&self, local: &Value, remote: &Value) -> Severity {
        let fields = self.differing_fields(local, remote);
        if fields.iter().any(|f| self.permission_fields.contains(f)) {
            return Severity::Critical;
        }
        if fields.len() <= self.low_max_fields {
            Severity::Low
        } else if fields.len() <= self.medium_max_fields {
            Severity::Medium
        } else {
            Severity::High
        }
    }
}

/// Compare normalized payload checksums; `None` means no real divergence
/// (key order and volatile fields never count).
pub fn payloads_diverge(local: &Value, remote: &Value, policy: &ConflictPolicy) -> Option<(Checksum, Checksum)> {
    let local_sum = checksum::payload_checksum(local, &policy.volatile_fields);
    let remote_sum = checksum::payload_checksum(remote, &policy.volatile_fields);
    if checksum::checksums_match(&local_sum, &remote_sum) {
        None
    } else {
        Some((local_sum, remote_sum))
    }
}

/// Field-by-field merge, newer `_field_ts` timestamp wins; ties go local.
/// Volatile fields are taken from the local side without a timestamp.
pub fn merge_payloads(
    local: &Value,
    remote: &Value,
    policy: &ConflictPolicy,
) -> Result<Value, SyncError> {
    let (Some(a), Some(b)) = (local.as_object(), remote.as_object()) else {
        return Err(SyncError::MergeNotPossible(
            "payloads are not objects".into(),
        ));
    };
    let a_ts = a.get(FIELD_TS_KEY).and_then(Value::as_object);
    let b_ts = b.get(FIELD_TS_KEY).and_then(Value::as_object);

    let mut merged = serde_json::Map::new();
    let mut merged_ts = serde_json::Map::new();
    let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();

    for key in keys {
        if key == FIELD_TS_KEY {
            continue;
        }
        let av = a.get(key);
        let bv = b.get(key);
        let at = a_ts.and_then(|ts| ts.get(key)).and_then(Value::as_i64);
        let bt = b_ts.and_then(|ts| ts.get(key)).and_then(Value::as_i64);

        let (winner, winner_ts) = match (av, bv) {
            (Some(av), Some(bv)) if av == bv => (av, at.max(bt)),
            (Some(av), Some(bv)) => {
                if policy.volatile_fields.contains(key) {
                    (av, at)
                } else {
                    let at = at.ok_or_else(|| {
                        SyncError::MergeNotPossible(format!(
                            "local payload has no timestamp for field '{key}'"
                        ))
                    })?;
                    let bt = bt.ok_or_else(|| {
                        SyncError::MergeNotPossible(format!(
                            "remote payload has no timestamp for field '{key}'"
                        ))
                    })?;
                    if at >= bt {
                        (av, Some(at))
                    } else {
                        (bv, Some(bt))
                    }
                }
            }
            (Some(av), None) => (av, at),
            (None, Some(bv)) => (bv, bt),
            (None, None) => continue,
        };
        merged.insert(key.clone(), winner.clone());
        if let Some(ts) = winner_ts {
            merged_ts.insert(key.clone(), Value::from(ts));
        }
    }

    if !merged_ts.is_empty() {
        merged.insert(FIELD_TS_KEY.to_string(), Value::Object(merged_ts));
    }
    Ok(Value::Object(merged))
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_max_ms: u64,
    pub apply_timeout_ms: u64,
    pub persist_debounce_ms: u64,
    pub max_entry_age_ms: u64,
    pub max_store_bytes: usize,
    /// Entries older than this are preferred victims when the byte budget
    /// overflows.
    pub eviction_grace_ms: u64,
    pub resolved_cache_size: usize,
    pub queue_key: String,
    pub conflict_policy: ConflictPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: crate::DEFAULT_MAX_RETRIES,
            base_backoff_ms: crate::BASE_RETRY_DELAY_MS,
            max_backoff_ms: crate::MAX_RETRY_DELAY_MS,
            jitter_max_ms: crate::JITTER_MAX_MS,
            apply_timeout_ms: 30_000,
            persist_debounce_ms: crate::DEFAULT_PERSIST_DEBOUNCE_MS,
            max_entry_age_ms: crate::DEFAULT_MAX_ENTRY_AGE_MS,
            max_store_bytes: crate::DEFAULT_MAX_STORE_BYTES,
            eviction_grace_ms: crate::DEFAULT_MAX_ENTRY_AGE_MS,
            resolved_cache_size: 10_000,
            queue_key: "sync-queue".to_string(),
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.max_retries == 0 {
            return Err(SyncError::InvalidConfig("max_retries must be > 0"));
        }
        if self.base_backoff_ms == 0 {
            return Err(SyncError::InvalidConfig("base_backoff_ms must be > 0"));
        }
        if self.apply_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig("apply_timeout_ms must be > 0"));
        }
        if self.resolved_cache_size == 0 {
            return Err(SyncError::InvalidConfig("resolved_cache_size must be > 0"));
        }
        if self.queue_key.is_empty() {
            return Err(SyncError::InvalidConfig("queue_key must not be empty"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncReport {
    pub succeeded: Vec<OpId>,
    /// Conflicted and terminally failed operations; transient retries are
    /// not failures and stay pending.
    pub failed: Vec<OpId>,
    pub conflicts: Vec<ConflictId>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.conflicts.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OfflineStatus {
    pub is_online: bool,
    pub queue_size: usize,
    pub pending_count: usize,
    pub error_count: usize,
}

#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub ops_enqueued: AtomicU64,
    pub ops_completed: AtomicU64,
    pub ops_failed: AtomicU64,
    pub conflicts_detected: AtomicU64,
    pub conflicts_resolved: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub storage_errors: AtomicU64,
    pub entries_evicted: AtomicU64,
}

impl SyncMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ops_enqueued: self.ops_enqueued.load(Ordering::Relaxed),
            ops_completed: self.ops_completed.load(Ordering::Relaxed),
            ops_failed: self.ops_failed.load(Ordering::Relaxed),
            conflicts_detected: self.conflicts_detected.load(Ordering::Relaxed),
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            entries_evicted: self.entries_evicted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub ops_enqueued: u64,
    pub ops_completed: u64,
    pub ops_failed: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub retries_scheduled: u64,
    pub storage_errors: u64,
    pub entries_evicted: u64,
}

/// Persisted form of the queue, sealed in the store envelope. Pending
/// conflicts ride along: a conflicted operation is useless after restart
/// unless its conflict is still resolvable.
#[derive(Serialize, Deserialize, Debug)]
struct PersistedQueue {
    ops: Vec<SyncOperation>,
    next_seq: u64,
    #[serde(default)]
    conflicts: Vec<SyncConflict>,
}

struct EngineState {
    ops: Vec<SyncOperation>,
    next_seq: u64,
    conflicts: HashMap<String, SyncConflict>,
    resolved: lru::LruCache<String, UnixTimeMs>,
    dirty: bool,
    last_persist: UnixTimeMs,
}

/// The offline sync engine. Collaborators are injected; all time flows in
/// through `now` parameters.
pub struct SyncEngine<R, S, C> {
    remote: Arc<R>,
    storage: Arc<S>,
    connectivity: Arc<C>,
    config: SyncConfig,
    state: RwLock<EngineState>,
    // At most one sync pass at a time; try_lock makes reentrancy an error,
    // not a deadlock.
    pass_gate: Mutex<()>,
    cancel_requested: AtomicBool,
    metrics: Arc<SyncMetrics>,
}

impl<R, S, C> SyncEngine<R, S, C>
where
    R: RemoteStore,
    S: DurableStorage,
    C: ConnectivitySignal,
{
    /// Build the engine, recovering any persisted queue. Stale entries are
    /// discarded, stranded in-flight entries revert to pending, and a
    /// corrupted store is treated as empty with a warning - never a fatal
    /// startup error.
    #[instrument(skip_all)]
    pub async fn new(
        remote: Arc<R>,
        storage: Arc<S>,
        connectivity: Arc<C>,
        config: SyncConfig,
        now: UnixTimeMs,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let (mut ops, next_seq, persisted_conflicts) =
            match Self::load_persisted(&*storage, &config).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!("discarding unreadable persisted queue: {e}");
                    (Vec::new(), 0, Vec::new())
                }
            };

        let before = ops.len();
        ops.retain(|op| {
            now.0.saturating_sub(op.created_at.0) <= config.max_entry_age_ms
                && op.status != OpStatus::Completed
        });
        let discarded = before - ops.len();
        if discarded > 0 {
            info!("discarded {discarded} stale persisted operations");
        }
        for op in &mut ops {
            // A crash mid-pass strands in-flight entries.
            if op.status == OpStatus::InFlight {
                op.status = OpStatus::Pending;
            }
        }

        // Conflicts whose operation aged out above are dropped with it.
        let conflicts: HashMap<String, SyncConflict> = persisted_conflicts
            .into_iter()
            .filter(|c| ops.iter().any(|op| op.id == c.operation_id))
            .map(|c| (c.id.as_str().to_string(), c))
            .collect();

        info!(
            "sync engine recovered {} queued operations, {} pending conflicts",
            ops.len(),
            conflicts.len()
        );

        let resolved_cache_size = NonZeroUsize::new(config.resolved_cache_size)
            .ok_or(SyncError::InvalidConfig("resolved_cache_size must be > 0"))?;
        Ok(Self {
            remote,
            storage,
            connectivity,
            state: RwLock::new(EngineState {
                ops,
                next_seq,
                conflicts,
                resolved: lru::LruCache::new(resolved_cache_size),
                dirty: false,
                last_persist: UnixTimeMs(0),
            }),
            config,
            pass_gate: Mutex::new(()),
            cancel_requested: AtomicBool::new(false),
            metrics: Arc::new(SyncMetrics::default()),
        })
    }

    async fn load_persisted(
        storage: &S,
        config: &SyncConfig,
    ) -> Result<(Vec<SyncOperation>, u64, Vec<SyncConflict>), SyncError> {
        let Some(bytes) = storage.load(&config.queue_key).await? else {
            return Ok((Vec::new(), 0, Vec::new()));
        };
        let payload = store::open(&bytes, config.max_store_bytes)?;
        let persisted: PersistedQueue = ciborium::from_reader(&payload[..])
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok((persisted.ops, persisted.next_seq, persisted.conflicts))
    }

    /// Record a local mutation. Persistence is debounced; call [`Self::flush`]
    /// on graceful shutdown to close the durability window.
    #[instrument(skip(self, op), fields(op_id = %op.id.as_str()))]
    pub async fn enqueue(&self, mut op: SyncOperation, now: UnixTimeMs) -> Result<(), SyncError> {
        let mut state = self.state.write().await;

        if state.ops.iter().any(|o| o.id == op.id) {
            return Err(SyncError::DuplicateOperation(op.id.as_str().to_string()));
        }

        op.seq = state.next_seq;
        state.next_seq += 1;
        op.status = OpStatus::Pending;
        if op.not_before.0 < now.0 {
            op.not_before = now;
        }
        state.ops.push(op);
        state.dirty = true;
        self.metrics.ops_enqueued.fetch_add(1, Ordering::Relaxed);

        if now.0.saturating_sub(state.last_persist.0) >= self.config.persist_debounce_ms {
            self.persist_locked(&mut state, now).await?;
        }
        Ok(())
    }

    /// Force the queue to durable storage immediately.
    pub async fn flush(&self, now: UnixTimeMs) -> Result<(), SyncError> {
        let mut state = self.state.write().await;
        if state.dirty {
            self.persist_locked(&mut state, now).await?;
        }
        Ok(())
    }

    /// Request cooperative cancellation of the running sync pass (or the next
    /// one, if none is running). Checked between operations; an in-flight
    /// remote call completes but its result is discarded and the operation
    /// reverts to pending.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    /// Replay pending operations against the remote, in priority order with
    /// per-target FIFO. Conflicts and terminal failures are in-band outcomes;
    /// unrelated targets are never blocked by them.
    #[instrument(skip(self))]
    pub async fn sync_pending(&self, now: UnixTimeMs) -> Result<SyncReport, SyncError> {
        if !self.connectivity.is_online() {
            return Err(SyncError::RemoteUnavailable);
        }
        let _pass = self
            .pass_gate
            .try_lock()
            .map_err(|_| SyncError::SyncAlreadyInProgress)?;

        let mut report = SyncReport::default();
        let mut attempted: HashSet<String> = HashSet::new();

        loop {
            if self.cancel_requested.swap(false, Ordering::SeqCst) {
                info!("sync pass cancelled before next operation");
                break;
            }

            let Some(snapshot) = self.take_next_due(&attempted, now).await else {
                break;
            };
            attempted.insert(snapshot.id.as_str().to_string());

            let applied = tokio::time::timeout(
                Duration::from_millis(self.config.apply_timeout_ms),
                self.remote.apply(&snapshot),
            )
            .await;

            let mut state = self.state.write().await;

            if self.cancel_requested.swap(false, Ordering::SeqCst) {
                if let Some(op) = state.ops.iter_mut().find(|o| o.id == snapshot.id) {
                    op.status = OpStatus::Pending;
                }
                state.dirty = true;
                info!("sync pass cancelled; in-flight result discarded");
                break;
            }

            let Some(index) = state.ops.iter().position(|o| o.id == snapshot.id) else {
                continue;
            };

            match applied {
                Ok(Ok(ApplyOutcome::Applied)) => {
                    self.complete_op(&mut state, index, &mut report);
                }
                Ok(Ok(ApplyOutcome::Conflict { remote_payload })) => {
                    match payloads_diverge(
                        &snapshot.payload,
                        &remote_payload,
                        &self.config.conflict_policy,
                    ) {
                        // Divergence was volatile-only; the payloads agree.
                        None => self.complete_op(&mut state, index, &mut report),
                        Some((local_sum, remote_sum)) => {
                            let severity = self
                                .config
                                .conflict_policy
                                .classify(&snapshot.payload, &remote_payload);
                            let conflict = SyncConflict {
                                id: ConflictId::generate(),
                                operation_id: snapshot.id.clone(),
                                target_id: snapshot.target_id.clone(),
                                local_payload: snapshot.payload.clone(),
                                remote_payload,
                                local_checksum: checksum::to_hex(&local_sum),
                                remote_checksum: checksum::to_hex(&remote_sum),
                                detected_at: now,
                                severity,
                            };
                            warn!(
                                target_id = %snapshot.target_id,
                                severity = ?severity,
                                "conflict detected"
                            );
                            state.ops[index].status = OpStatus::Failed {
                                reason: FailureReason::Conflict,
                            };
                            report.failed.push(snapshot.id.clone());
                            report.conflicts.push(conflict.id.clone());
                            state
                                .conflicts
                                .insert(conflict.id.as_str().to_string(), conflict);
                            self.metrics.conflicts_detected.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                // Remote error or timeout: the transient path.
                Ok(Err(_)) | Err(_) => {
                    let op = &mut state.ops[index];
                    op.retry_count += 1;
                    if op.retry_count >= self.config.max_retries {
                        op.status = OpStatus::Failed {
                            reason: FailureReason::RetriesExhausted,
                        };
                        warn!(op_id = %op.id.as_str(), "retry budget exhausted");
                        report.failed.push(op.id.clone());
                        self.metrics.ops_failed.fetch_add(1, Ordering::Relaxed);
                    } else {
                        op.status = OpStatus::Pending;
                        op.not_before = now.saturating_add(self.backoff_delay(op.retry_count));
                        self.metrics.retries_scheduled.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            state.dirty = true;
        }

        let mut state = self.state.write().await;
        if state.dirty {
            self.persist_locked(&mut state, now).await?;
        }
        Ok(report)
    }

    /// Settle a conflict. `MergeNotPossible` leaves the conflict pending so
    /// the caller can fall back to manual resolution; every other outcome
    /// consumes it exactly once.
    #[instrument(skip(self, resolution), fields(conflict_id = %conflict_id.as_str()))]
    pub async fn resolve_conflict(
        &self,
        conflict_id: &ConflictId,
        resolution: Resolution,
        now: UnixTimeMs,
    ) -> Result<(), SyncError> {
        let mut state = self.state.write().await;

        if state.resolved.contains(conflict_id.as_str()) {
            return Err(SyncError::ConflictAlreadyResolved(
                conflict_id.as_str().to_string(),
            ));
        }
        let Some(conflict) = state.conflicts.get(conflict_id.as_str()) else {
            return Err(SyncError::ConflictNotFound(
                conflict_id.as_str().to_string(),
            ));
        };

        let corrective_payload = match &resolution {
            Resolution::UseLocal => Some(conflict.local_payload.clone()),
            Resolution::UseRemote => None,
            Resolution::Merge => {
                if conflict.severity == Severity::Critical {
                    return Err(SyncError::MergeNotPossible(
                        "critical conflicts cannot be auto-merged".into(),
                    ));
                }
                Some(merge_payloads(
                    &conflict.local_payload,
                    &conflict.remote_payload,
                    &self.config.conflict_policy,
                )?)
            }
            Resolution::Manual { payload } => Some(payload.clone()),
        };

        // Past the fallible section: consume the conflict and its operation.
        let Some(conflict) = state.conflicts.remove(conflict_id.as_str()) else {
            return Err(SyncError::ConflictNotFound(
                conflict_id.as_str().to_string(),
            ));
        };
        state.resolved.put(conflict_id.as_str().to_string(), now);
        state.ops.retain(|op| op.id != conflict.operation_id);

        if let Some(payload) = corrective_payload {
            let mut corrective = SyncOperation::new(
                OpId::generate(),
                OpKind::Update,
                conflict.target_id.clone(),
                payload,
                now,
                Priority::High,
            );
            corrective.seq = state.next_seq;
            state.next_seq += 1;
            info!(
                target_id = %conflict.target_id,
                corrective_id = %corrective.id.as_str(),
                "conflict resolved with corrective operation"
            );
            state.ops.push(corrective);
        } else {
            info!(target_id = %conflict.target_id, "conflict resolved; remote accepted");
        }

        state.dirty = true;
        self.metrics.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
        if now.0.saturating_sub(state.last_persist.0) >= self.config.persist_debounce_ms {
            self.persist_locked(&mut state, now).await?;
        }
        Ok(())
    }

    pub async fn status(&self) -> OfflineStatus {
        let state = self.state.read().await;
        let pending = state
            .ops
            .iter()
            .filter(|op| op.status == OpStatus::Pending)
            .count();
        let errors = state
            .ops
            .iter()
            .filter(|op| matches!(op.status, OpStatus::Failed { .. }))
            .count();
        OfflineStatus {
            is_online: self.connectivity.is_online(),
            queue_size: state.ops.len(),
            pending_count: pending,
            error_count: errors,
        }
    }

    pub async fn pending_conflicts(&self) -> Vec<SyncConflict> {
        let state = self.state.read().await;
        let mut conflicts: Vec<_> = state.conflicts.values().cloned().collect();
        conflicts.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        conflicts
    }

    pub async fn operations(&self) -> Vec<SyncOperation> {
        let state = self.state.read().await;
        let mut ops = state.ops.clone();
        ops.sort_by_key(|op| op.seq);
        ops
    }

    pub async fn get_operation(&self, id: &OpId) -> Option<SyncOperation> {
        let state = self.state.read().await;
        state.ops.iter().find(|op| &op.id == id).cloned()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Pick the next due operation and mark it in-flight. Eligibility:
    /// pending, past its backoff time, not yet attempted this pass, and no
    /// earlier-seq operation for the same target still live in the queue -
    /// per-target FIFO dominates priority. A terminally failed operation is
    /// fully processed: it is surfaced in reports and retained for
    /// inspection, but it must not wedge later edits to its target.
    async fn take_next_due(
        &self,
        attempted: &HashSet<String>,
        now: UnixTimeMs,
    ) -> Option<SyncOperation> {
        let mut state = self.state.write().await;
        let ops = &state.ops;
        let due_id = ops
            .iter()
            .filter(|op| {
                op.status == OpStatus::Pending
                    && op.not_before.0 <= now.0
                    && !attempted.contains(op.id.as_str())
            })
            .filter(|op| {
                !ops.iter().any(|other| {
                    other.target_id == op.target_id
                        && other.seq < op.seq
                        && !other.is_terminal_failure()
                })
            })
            .min_by_key(|op| (op.priority, op.seq))
            .map(|op| op.id.clone())?;

        let op = state.ops.iter_mut().find(|o| o.id == due_id)?;
        op.status = OpStatus::InFlight;
        let snapshot = op.clone();
        state.dirty = true;
        Some(snapshot)
    }

    fn complete_op(&self, state: &mut EngineState, index: usize, report: &mut SyncReport) {
        let op = state.ops.remove(index);
        report.succeeded.push(op.id.clone());
        self.metrics.ops_completed.fetch_add(1, Ordering::Relaxed);
        info!(op_id = %op.id.as_str(), target_id = %op.target_id, "operation applied");
    }

    fn backoff_delay(&self, attempt: u32) -> u64 {
        use rand::Rng;
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .config
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.max_backoff_ms);
        let jitter = if self.config.jitter_max_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.config.jitter_max_ms)
        };
        base.saturating_add(jitter)
    }

    /// Serialize, enforce the byte budget (evicting oldest entries, preferring
    /// those past the grace period), seal, and save.
    async fn persist_locked(
        &self,
        state: &mut EngineState,
        now: UnixTimeMs,
    ) -> Result<(), SyncError> {
        loop {
            let persisted = PersistedQueue {
                ops: state.ops.clone(),
                next_seq: state.next_seq,
                conflicts: state.conflicts.values().cloned().collect(),
            };
            let mut payload = Vec::new();
            ciborium::into_writer(&persisted, &mut payload)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let sealed = store::seal(&payload)?;

            if sealed.len() <= self.config.max_store_bytes || state.ops.is_empty() {
                if let Err(e) = self.storage.save(&self.config.queue_key, &sealed).await {
                    self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(e.into());
                }
                state.dirty = false;
                state.last_persist = now;
                return Ok(());
            }

            let victim = Self::eviction_victim(&state.ops, now, self.config.eviction_grace_ms);
            if let Some(index) = victim {
                let evicted = state.ops.remove(index);
                state.conflicts.retain(|_, c| c.operation_id != evicted.id);
                warn!(
                    op_id = %evicted.id.as_str(),
                    "evicted queued operation to fit store byte budget"
                );
                self.metrics.entries_evicted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn eviction_victim(ops: &[SyncOperation], now: UnixTimeMs, grace_ms: u64) -> Option<usize> {
        let oldest = |indices: &mut dyn Iterator<Item = usize>| -> Option<usize> {
            indices.min_by_key(|&i| ops[i].created_at)
        };
        let mut past_grace = (0..ops.len())
            .filter(|&i| now.0.saturating_sub(ops[i].created_at.0) > grace_ms);
        oldest(&mut past_grace).or_else(|| oldest(&mut (0..ops.len())))
    }
}
