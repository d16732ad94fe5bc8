use serde::{Deserialize, Serialize};

use crate::ledger::entry::{LedgerEntry, LedgerEventType};
use crate::ledger::integrity::IntegrityReport;
use crate::ledger::store::LedgerResult;
use crate::ledger::writer::AuthorityLedger;

/// Current export schema version.
pub const LEDGER_EXPORT_SCHEMA_VERSION: u32 = 1;

/// Build status derived from its ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// No entries.
    Unknown,
    /// Started, not yet terminated.
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Audit bundle for one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerExport {
    pub schema_version: u32,
    pub build_id: String,
    pub status: BuildStatus,
    pub integrity: IntegrityReport,
    pub entries: Vec<LedgerEntry>,
}

impl AuthorityLedger {
    /// Export a build's entries with its integrity report and derived status.
    pub fn export_build(&self, build_id: &str) -> LedgerResult<LedgerExport> {
        let entries = self.read_build_ledger(build_id)?;
        let integrity = IntegrityReport::check(build_id, &entries);
        let status = determine_build_status(&entries);

        Ok(LedgerExport {
            schema_version: LEDGER_EXPORT_SCHEMA_VERSION,
            build_id: build_id.to_string(),
            status,
            integrity,
            entries,
        })
    }
}

fn determine_build_status(entries: &[LedgerEntry]) -> BuildStatus {
    if entries.is_empty() {
        return BuildStatus::Unknown;
    }

    for entry in entries.iter().rev() {
        match entry.event_type {
            LedgerEventType::BuildCompleted => return BuildStatus::Completed,
            LedgerEventType::BuildFailed => return BuildStatus::Failed,
            LedgerEventType::BuildCancelled => return BuildStatus::Cancelled,
            _ => {}
        }
    }

    BuildStatus::Running
}
