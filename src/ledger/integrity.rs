use serde::{Deserialize, Serialize};

use crate::ledger::entry::LedgerEntry;

/// A break in a build's sequence numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceGap {
    /// Sequence that should have come next.
    pub expected: u64,
    /// Sequence actually found at that position.
    pub found: u64,
}

/// Result of checking one build's ledger for contiguity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub build_id: String,
    pub entries: usize,
    pub latest_sequence: u64,
    pub gaps: Vec<SequenceGap>,
}

impl IntegrityReport {
    /// Sequences run 1, 2, 3, ... with no gap, repeat or reordering.
    pub fn is_valid(&self) -> bool {
        self.gaps.is_empty()
    }

    /// Check `entries` (in stored order). Gaps are reported, never repaired.
    pub fn check(build_id: &str, entries: &[LedgerEntry]) -> Self {
        let mut gaps = Vec::new();
        let mut expected = 1;
        for entry in entries {
            if entry.sequence != expected {
                gaps.push(SequenceGap {
                    expected,
                    found: entry.sequence,
                });
            }
            expected = entry.sequence.max(expected) + 1;
        }

        Self {
            build_id: build_id.to_string(),
            entries: entries.len(),
            latest_sequence: entries.iter().map(|e| e.sequence).max().unwrap_or(0),
            gaps,
        }
    }
}

/// Format an integrity report for display.
pub fn format_integrity(report: &IntegrityReport) -> String {
    let mut output = format!("## Ledger Integrity: {}\n\n", report.build_id);
    output.push_str(&format!(
        "- **Entries**: {} (latest sequence {})\n",
        report.entries, report.latest_sequence
    ));
    if report.is_valid() {
        output.push_str("- **Status**: contiguous\n");
    } else {
        output.push_str(&format!("- **Status**: {} gap(s)\n", report.gaps.len()));
        for gap in &report.gaps {
            output.push_str(&format!(
                "  - expected {} found {}\n",
                gap.expected, gap.found
            ));
        }
    }
    output
}
