use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

// ---------------------------------------------------------------------------
// Usage records
// ---------------------------------------------------------------------------

/// One admission decision and its eventual settlement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    /// Cost reserved at admission time.
    pub estimated_cost: f64,
    /// Cost computed from provider-reported usage; set by reconciliation.
    pub actual_cost: Option<f64>,
    pub approved: bool,
    /// Set once, by the first reconciliation.
    pub completed: bool,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Append-ordered usage log with O(1) lookup by request id.
///
/// `order` may hold ids whose record was replaced; eviction skips those
/// tombstones. Not thread-safe on its own; the guardian serializes access.
pub(crate) struct UsageLedger {
    order: VecDeque<String>,
    records: HashMap<String, UsageRecord>,
    max_records: usize,
}

impl UsageLedger {
    pub fn new(max_records: usize) -> Self {
        Self {
            order: VecDeque::new(),
            records: HashMap::new(),
            max_records,
        }
    }

    /// Append a record, evicting oldest entries beyond the hard cap. A reused
    /// request id replaces the existing record in place.
    pub fn append(&mut self, record: UsageRecord) {
        if self.records.contains_key(&record.request_id) {
            tracing::warn!(request_id = %record.request_id, "Duplicate request id in usage ledger, replacing");
            self.records.insert(record.request_id.clone(), record);
            return;
        }

        while self.records.len() >= self.max_records {
            if !self.evict_oldest() {
                break;
            }
        }

        self.order.push_back(record.request_id.clone());
        self.records.insert(record.request_id.clone(), record);
    }

    pub fn get_mut(&mut self, request_id: &str) -> Option<&mut UsageRecord> {
        self.records.get_mut(request_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Drop records older than the cutoff, oldest first. Returns how many
    /// were removed.
    pub fn sweep_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while let Some(front_id) = self.order.front() {
            match self.records.get(front_id) {
                // Tombstone left by a replacement; discard silently.
                None => {
                    self.order.pop_front();
                }
                Some(record) if record.timestamp < cutoff => {
                    self.records.remove(front_id.as_str());
                    self.order.pop_front();
                    removed += 1;
                }
                // Records are appended in time order: the rest are young.
                Some(_) => break,
            }
        }
        removed
    }

    /// Remove the single oldest live record. False when the ledger is empty.
    fn evict_oldest(&mut self) -> bool {
        while let Some(front_id) = self.order.pop_front() {
            if self.records.remove(&front_id).is_some() {
                return true;
            }
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
