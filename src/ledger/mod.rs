//! Append-only, per-build authority ledger.

pub mod config;
pub mod entry;
pub mod export;
pub mod integrity;
pub mod store;
pub mod writer;

pub use config::{LedgerConfig, LEDGER_DIR_ENV_VAR};
pub use entry::{LedgerEntry, LedgerEventType};
pub use export::{BuildStatus, LedgerExport, LEDGER_EXPORT_SCHEMA_VERSION};
pub use integrity::{format_integrity, IntegrityReport, SequenceGap};
pub use store::{FileLedgerStore, LedgerError, LedgerResult, LedgerStore, MemoryLedgerStore};
pub use writer::AuthorityLedger;
