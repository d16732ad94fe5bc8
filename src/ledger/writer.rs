//! The sequenced ledger and its typed writers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::ledger::config::LedgerConfig;
use crate::ledger::entry::{LedgerEntry, LedgerEventType};
use crate::ledger::integrity::IntegrityReport;
use crate::ledger::store::{
    validate_build_id, FileLedgerStore, LedgerError, LedgerResult, LedgerStore, MemoryLedgerStore,
};
use crate::observe::{Observers, Subscriber};

/// Last assigned sequence for one build; `None` until loaded from the store.
type SequenceSlot = Arc<Mutex<Option<u64>>>;

/// Append-only, per-build sequenced event log.
///
/// Sequence assignment is serialized per build: the build's slot stays locked
/// from numbering through the durable append, so concurrent writers produce
/// contiguous sequences. After a failed append the next write re-reads the
/// store's latest sequence, so a number is consumed only if the entry landed.
pub struct AuthorityLedger {
    store: Arc<dyn LedgerStore>,
    sequences: Mutex<HashMap<String, SequenceSlot>>,
    observers: Observers<LedgerEntry>,
}

impl std::fmt::Debug for AuthorityLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorityLedger")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Default for AuthorityLedger {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl AuthorityLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            sequences: Mutex::new(HashMap::new()),
            observers: Observers::new("ledger"),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLedgerStore::new()))
    }

    /// File-backed when `config.dir` is set, in memory otherwise.
    pub fn from_config(config: &LedgerConfig) -> LedgerResult<Self> {
        match &config.dir {
            Some(dir) => Ok(Self::new(Arc::new(FileLedgerStore::new(dir)?))),
            None => Ok(Self::in_memory()),
        }
    }

    /// Subscribe to entries as they are written.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEntry> {
        self.observers.subscribe()
    }

    pub fn add_subscriber(&self, subscriber: Arc<dyn Subscriber<LedgerEntry>>) {
        self.observers.add_subscriber(subscriber);
    }

    /// Append an entry with the build's next sequence number.
    ///
    /// Errors from the store propagate; callers must not perform the guarded
    /// action when this fails.
    pub(crate) fn write(
        &self,
        build_id: &str,
        event_type: LedgerEventType,
        actor_id: Option<&str>,
        details: Value,
    ) -> LedgerResult<LedgerEntry> {
        validate_build_id(build_id)?;
        let slot = {
            let mut sequences = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(sequences.entry(build_id.to_string()).or_default())
        };
        let mut last = slot
            .lock()
            .map_err(|_| LedgerError::Poisoned(build_id.to_string()))?;

        let current = match *last {
            Some(sequence) => sequence,
            None => self.store.latest_sequence(build_id)?,
        };
        let entry = LedgerEntry::new(
            build_id,
            event_type,
            actor_id.map(str::to_string),
            details,
            current + 1,
        );
        if let Err(err) = self.store.append(&entry) {
            error!(
                build_id,
                event_type = %event_type,
                sequence = entry.sequence,
                error = %err,
                "ledger write failed"
            );
            *last = None;
            return Err(err);
        }
        *last = Some(entry.sequence);
        drop(last);

        debug!(
            build_id,
            event_type = %event_type,
            sequence = entry.sequence,
            "ledger entry written"
        );
        self.observers.publish(&entry);
        Ok(entry)
    }

    /// Full history for `build_id`, oldest first.
    pub fn read_build_ledger(&self, build_id: &str) -> LedgerResult<Vec<LedgerEntry>> {
        self.store.load(build_id)
    }

    /// Entries with a sequence strictly greater than `sequence`.
    pub fn entries_since(&self, build_id: &str, sequence: u64) -> LedgerResult<Vec<LedgerEntry>> {
        let mut entries = self.store.load(build_id)?;
        entries.retain(|entry| entry.sequence > sequence);
        Ok(entries)
    }

    /// Latest sequence for `build_id`, or 0 if nothing was written.
    pub fn latest_sequence(&self, build_id: &str) -> LedgerResult<u64> {
        let slot = {
            let sequences = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
            sequences.get(build_id).cloned()
        };
        if let Some(slot) = slot {
            let last = slot
                .lock()
                .map_err(|_| LedgerError::Poisoned(build_id.to_string()))?;
            if let Some(sequence) = *last {
                return Ok(sequence);
            }
        }
        self.store.latest_sequence(build_id)
    }

    /// Check that the build's sequences are contiguous from 1.
    pub fn verify_integrity(&self, build_id: &str) -> LedgerResult<IntegrityReport> {
        let entries = self.store.load(build_id)?;
        let report = IntegrityReport::check(build_id, &entries);
        if !report.is_valid() {
            error!(build_id, gaps = report.gaps.len(), "ledger sequence gap detected");
        }
        Ok(report)
    }

    /// Build ids with at least one stored entry.
    pub fn builds(&self) -> LedgerResult<Vec<String>> {
        self.store.builds()
    }

    /// Forget cached sequence state for a finished build. Entries are kept.
    pub fn release_build(&self, build_id: &str) {
        let mut sequences = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
        sequences.remove(build_id);
    }

    // ------------------------------------------------------------------------
    // Build lifecycle
    // ------------------------------------------------------------------------

    pub fn build_started(&self, build_id: &str, actor_id: Option<&str>, details: Value) -> LedgerResult<LedgerEntry> {
        self.write(build_id, LedgerEventType::BuildStarted, actor_id, details)
    }

    pub fn build_paused(&self, build_id: &str, actor_id: Option<&str>, reason: &str) -> LedgerResult<LedgerEntry> {
        self.write(
            build_id,
            LedgerEventType::BuildPaused,
            actor_id,
            json!({ "reason": reason }),
        )
    }

    pub fn build_resumed(&self, build_id: &str, actor_id: Option<&str>) -> LedgerResult<LedgerEntry> {
        self.write(build_id, LedgerEventType::BuildResumed, actor_id, json!({}))
    }

    pub fn build_cancelled(&self, build_id: &str, actor_id: Option<&str>, reason: &str) -> LedgerResult<LedgerEntry> {
        self.write(
            build_id,
            LedgerEventType::BuildCancelled,
            actor_id,
            json!({ "reason": reason }),
        )
    }

    pub fn build_completed(&self, build_id: &str, summary: Value) -> LedgerResult<LedgerEntry> {
        self.write(build_id, LedgerEventType::BuildCompleted, None, summary)
    }

    pub fn build_failed(&self, build_id: &str, reason: &str, summary: Value) -> LedgerResult<LedgerEntry> {
        self.write(
            build_id,
            LedgerEventType::BuildFailed,
            None,
            json!({ "reason": reason, "summary": summary }),
        )
    }

    // ------------------------------------------------------------------------
    // Phase lifecycle
    // ------------------------------------------------------------------------

    pub fn phase_started(&self, build_id: &str, phase_id: &str) -> LedgerResult<LedgerEntry> {
        self.write(
            build_id,
            LedgerEventType::PhaseStarted,
            None,
            json!({ "phase_id": phase_id }),
        )
    }

    pub fn phase_completed(&self, build_id: &str, phase_id: &str) -> LedgerResult<LedgerEntry> {
        self.write(
            build_id,
            LedgerEventType::PhaseCompleted,
            None,
            json!({ "phase_id": phase_id }),
        )
    }

    pub fn phase_failed(&self, build_id: &str, phase_id: &str, reason: &str) -> LedgerResult<LedgerEntry> {
        self.write(
            build_id,
            LedgerEventType::PhaseFailed,
            None,
            json!({ "phase_id": phase_id, "reason": reason }),
        )
    }

    // ------------------------------------------------------------------------
    // Agent lifecycle
    // ------------------------------------------------------------------------

    pub fn agent_started(&self, build_id: &str, task_id: &str, phase_id: &str) -> LedgerResult<LedgerEntry> {
        self.write(
            build_id,
            LedgerEventType::AgentStarted,
            None,
            json!({ "task_id": task_id, "phase_id": phase_id }),
        )
    }

    pub fn agent_completed(
        &self,
        build_id: &str,
        task_id: &str,
        duration: Duration,
        retries: u32,
        cost: f64,
    ) -> LedgerResult<LedgerEntry> {
        self.write(
            build_id,
            LedgerEventType::AgentCompleted,
            None,
            json!({
                "task_id": task_id,
                "duration_ms": duration.as_millis() as u64,
                "retries": retries,
                "cost": cost,
            }),
        )
    }

    pub fn agent_failed(
        &self,
        build_id: &str,
        task_id: &str,
        kind: &str,
        message: &str,
        attempts: u32,
    ) -> LedgerResult<LedgerEntry> {
        self.write(
            build_id,
            LedgerEventType::AgentFailed,
            None,
            json!({
                "task_id": task_id,
                "kind": kind,
                "message": message,
                "attempts": attempts,
            }),
        )
    }

    // ------------------------------------------------------------------------
    // Gates, artifacts, cost, errors
    // ------------------------------------------------------------------------

    pub fn gate_opened(&self, build_id: &str, gate_id: &str, details: Value) -> LedgerResult<LedgerEntry> {
        self.write(
            build_id,
            LedgerEventType::GateOpened,
            None,
            json!({ "gate_id": gate_id, "details": details }),
        )
    }

    pub fn gate_resolved(
        &self,
        build_id: &str,
        gate_id: &str,
        actor_id: &str,
        approved: bool,
        reason: &str,
    ) -> LedgerResult<LedgerEntry> {
        self.write(
            build_id,
            LedgerEventType::GateResolved,
            Some(actor_id),
            json!({ "gate_id": gate_id, "approved": approved, "reason": reason }),
        )
    }

    pub fn artifact_created(&self, build_id: &str, artifact_id: &str, details: Value) -> LedgerResult<LedgerEntry> {
        self.write(
            build_id,
            LedgerEventType::ArtifactCreated,
            None,
            json!({ "artifact_id": artifact_id, "details": details }),
        )
    }

    pub fn cost_updated(
        &self,
        build_id: &str,
        task_id: Option<&str>,
        cost: f64,
        cumulative: f64,
    ) -> LedgerResult<LedgerEntry> {
        self.write(
            build_id,
            LedgerEventType::CostUpdated,
            None,
            json!({ "task_id": task_id, "cost": cost, "cumulative": cumulative }),
        )
    }

    pub fn error(&self, build_id: &str, source: &str, message: &str) -> LedgerResult<LedgerEntry> {
        self.write(
            build_id,
            LedgerEventType::Error,
            None,
            json!({ "source": source, "message": message }),
        )
    }

    // ------------------------------------------------------------------------
    // Authority
    // ------------------------------------------------------------------------

    pub fn authorization_granted(&self, build_id: &str, actor_id: &str, details: Value) -> LedgerResult<LedgerEntry> {
        self.write(build_id, LedgerEventType::AuthorizationGranted, Some(actor_id), details)
    }

    pub fn authorization_denied(&self, build_id: &str, actor_id: &str, details: Value) -> LedgerResult<LedgerEntry> {
        self.write(build_id, LedgerEventType::AuthorizationDenied, Some(actor_id), details)
    }

    pub fn action_executed(&self, build_id: &str, actor_id: &str, details: Value) -> LedgerResult<LedgerEntry> {
        self.write(build_id, LedgerEventType::ActionExecuted, Some(actor_id), details)
    }

    pub fn trust_changed(&self, build_id: &str, details: Value) -> LedgerResult<LedgerEntry> {
        self.write(build_id, LedgerEventType::TrustChanged, None, details)
    }

    pub fn decision_recorded(&self, build_id: &str, actor_id: Option<&str>, details: Value) -> LedgerResult<LedgerEntry> {
        self.write(build_id, LedgerEventType::DecisionRecorded, actor_id, details)
    }
}
