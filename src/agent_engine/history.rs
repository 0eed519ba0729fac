use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::agent_engine::state::{DecisionRecord, Outcome};
use crate::perception::types::SnapshotSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub ts: i64,
    pub cycle: u32,
    pub snapshot: SnapshotSummary,
    pub decision: DecisionRecord,
    pub outcome: Outcome,
    /// Page URL once the action settled.
    pub url_after: String,
}

/// Append-only run history, retaining only the most recent `window` entries.
pub struct RunHistory {
    pub run_id: String,
    entries: VecDeque<HistoryEntry>,
    window: usize,
    total: usize,
}

impl RunHistory {
    pub fn new(window: usize) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            entries: VecDeque::with_capacity(window.max(1)),
            window: window.max(1),
            total: 0,
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        tracing::debug!(
            run = %self.run_id,
            cycle = entry.cycle,
            kind = %entry.decision.kind,
            outcome = %entry.outcome,
            "history entry appended"
        );
        if self.entries.len() == self.window {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        self.total += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Compact text for the model's short-term memory.
    pub fn prompt_lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| {
                let target = e
                    .decision
                    .target
                    .as_ref()
                    .map(|t| format!(" on {t}"))
                    .unwrap_or_default();
                let value = e
                    .decision
                    .value
                    .as_ref()
                    .map(|v| format!(" value={v:?}"))
                    .unwrap_or_default();
                format!(
                    "step {}: {}{}{} -> {} (url: {})",
                    e.cycle, e.decision.kind, target, value, e.outcome, e.url_after
                )
            })
            .collect()
    }
}
