//! Durable, queryable record of every sync anomaly and its handling.
//!
//! Capacity-bounded: the log keeps the most recent events and evicts the
//! oldest first. Everything in here is operator-facing, so peers and hashes
//! are stored as hex strings and the whole log serializes to JSON.

use crate::verifier::HashDiscrepancy;
use decksync_types::{ConflictResolution, ResolutionStrategy};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DesyncEventType {
    Detected,
    Resolved,
    Ignored,
    Escalated,
}

/// Serializable mirror of a wire [ConflictResolution].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResolutionSummary {
    pub strategy: String,
    pub conflicting_sequence: u64,
    pub resolved: bool,
    pub description: String,
    pub resulting_hash: String,
}

impl From<&ConflictResolution> for ResolutionSummary {
    fn from(resolution: &ConflictResolution) -> Self {
        let strategy = match resolution.strategy {
            ResolutionStrategy::HostAuthoritative => "host-authoritative",
            ResolutionStrategy::ReplayFromCheckpoint => "replay-from-checkpoint",
        };
        Self {
            strategy: strategy.to_string(),
            conflicting_sequence: resolution.conflicting_sequence,
            resolved: resolution.resolved,
            description: resolution.description.clone(),
            resulting_hash: commonware_utils::hex(resolution.resulting_hash.as_ref()),
        }
    }
}

/// One entry in the desync log.
#[derive(Clone, Debug, Serialize)]
pub struct DesyncEvent {
    pub id: u64,
    pub timestamp: u64,
    pub event_type: DesyncEventType,
    pub local_peer: String,
    pub remote_peer: String,
    pub local_hash: String,
    pub remote_hash: String,
    /// Applied-action count when the anomaly was observed.
    pub sequence: u64,
    pub discrepancies: Vec<HashDiscrepancy>,
    pub resolution: Option<ResolutionSummary>,
    pub resolution_time_ms: Option<u64>,
    pub escalation_reason: Option<String>,
}

/// Aggregate statistics over the retained events.
#[derive(Clone, Debug, Serialize)]
pub struct DesyncStats {
    pub counts_by_type: BTreeMap<String, u64>,
    pub counts_by_peer: BTreeMap<String, u64>,
    pub average_resolution_ms: Option<f64>,
    /// Most frequent discrepancy categories, descending.
    pub top_categories: Vec<(String, u64)>,
    /// `resolved / (resolved + escalated)`, if any resolution was attempted.
    pub resolution_success_rate: Option<f64>,
}

/// Capacity-bounded append/update log of desync events.
pub struct DesyncLog {
    events: VecDeque<DesyncEvent>,
    capacity: usize,
    next_id: u64,
}

impl DesyncLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity: capacity.max(1),
            next_id: 1,
        }
    }

    fn push(&mut self, event: DesyncEvent) -> u64 {
        let id = event.id;
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
        id
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Record a hash mismatch observation. Returns the event id so a later
    /// resolution or escalation can be attached to it.
    #[allow(clippy::too_many_arguments)]
    pub fn log_detection(
        &mut self,
        timestamp: u64,
        local_peer: String,
        remote_peer: String,
        local_hash: String,
        remote_hash: String,
        sequence: u64,
        discrepancies: Vec<HashDiscrepancy>,
    ) -> u64 {
        let id = self.next_id();
        self.push(DesyncEvent {
            id,
            timestamp,
            event_type: DesyncEventType::Detected,
            local_peer,
            remote_peer,
            local_hash,
            remote_hash,
            sequence,
            discrepancies,
            resolution: None,
            resolution_time_ms: None,
            escalation_reason: None,
        })
    }

    /// Record a mismatch that was observed but deliberately not acted upon
    /// (e.g. the affected peer left before the threshold was reached).
    pub fn log_ignored(
        &mut self,
        timestamp: u64,
        local_peer: String,
        remote_peer: String,
        reason: String,
    ) -> u64 {
        let id = self.next_id();
        self.push(DesyncEvent {
            id,
            timestamp,
            event_type: DesyncEventType::Ignored,
            local_peer,
            remote_peer,
            local_hash: String::new(),
            remote_hash: String::new(),
            sequence: 0,
            discrepancies: Vec::new(),
            resolution: None,
            resolution_time_ms: None,
            escalation_reason: Some(reason),
        })
    }

    /// Attach a completed resolution to a previously detected event.
    /// Returns false when the event has already been evicted.
    pub fn log_resolution(
        &mut self,
        event_id: u64,
        resolution: ResolutionSummary,
        resolution_time_ms: u64,
    ) -> bool {
        let Some(event) = self.events.iter_mut().find(|e| e.id == event_id) else {
            return false;
        };
        event.event_type = DesyncEventType::Resolved;
        event.resolution = Some(resolution);
        event.resolution_time_ms = Some(resolution_time_ms);
        true
    }

    /// Mark a previously detected event as escalated.
    pub fn log_escalated(&mut self, event_id: u64, reason: String) -> bool {
        let Some(event) = self.events.iter_mut().find(|e| e.id == event_id) else {
            return false;
        };
        event.event_type = DesyncEventType::Escalated;
        event.escalation_reason = Some(reason);
        true
    }

    /// Attach category-level discrepancies to an existing event.
    pub fn attach_discrepancies(&mut self, event_id: u64, discrepancies: Vec<HashDiscrepancy>) {
        if let Some(event) = self.events.iter_mut().find(|e| e.id == event_id) {
            event.discrepancies = discrepancies;
        }
    }

    pub fn events(&self) -> impl Iterator<Item = &DesyncEvent> {
        self.events.iter()
    }

    pub fn get(&self, event_id: u64) -> Option<&DesyncEvent> {
        self.events.iter().find(|e| e.id == event_id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn statistics(&self) -> DesyncStats {
        let mut counts_by_type = BTreeMap::new();
        let mut counts_by_peer = BTreeMap::new();
        let mut categories: BTreeMap<String, u64> = BTreeMap::new();
        let mut resolution_times = Vec::new();
        let mut resolved = 0u64;
        let mut escalated = 0u64;

        for event in &self.events {
            let type_name = match event.event_type {
                DesyncEventType::Detected => "detected",
                DesyncEventType::Resolved => "resolved",
                DesyncEventType::Ignored => "ignored",
                DesyncEventType::Escalated => "escalated",
            };
            *counts_by_type.entry(type_name.to_string()).or_insert(0) += 1;
            *counts_by_peer.entry(event.remote_peer.clone()).or_insert(0) += 1;
            for discrepancy in &event.discrepancies {
                *categories.entry(discrepancy.category.clone()).or_insert(0) += 1;
            }
            match event.event_type {
                DesyncEventType::Resolved => {
                    resolved += 1;
                    if let Some(ms) = event.resolution_time_ms {
                        resolution_times.push(ms);
                    }
                }
                DesyncEventType::Escalated => escalated += 1,
                _ => {}
            }
        }

        let average_resolution_ms = if resolution_times.is_empty() {
            None
        } else {
            Some(resolution_times.iter().sum::<u64>() as f64 / resolution_times.len() as f64)
        };
        let resolution_success_rate = if resolved + escalated == 0 {
            None
        } else {
            Some(resolved as f64 / (resolved + escalated) as f64)
        };
        let mut top_categories: Vec<(String, u64)> = categories.into_iter().collect();
        top_categories.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        DesyncStats {
            counts_by_type,
            counts_by_peer,
            average_resolution_ms,
            top_categories,
            resolution_success_rate,
        }
    }

    /// Render one event as a human-readable report for support/debugging.
    pub fn debug_report(&self, event_id: u64) -> Option<String> {
        let event = self.get(event_id)?;
        let mut report = String::new();
        let _ = writeln!(report, "=== desync event {} ===", event.id);
        let _ = writeln!(report, "type:       {:?}", event.event_type);
        let _ = writeln!(report, "timestamp:  {} ms", event.timestamp);
        let _ = writeln!(report, "local peer: {}", event.local_peer);
        let _ = writeln!(report, "remote peer:{}", event.remote_peer);
        let _ = writeln!(report, "sequence:   {}", event.sequence);
        let _ = writeln!(report, "local hash: {}", event.local_hash);
        let _ = writeln!(report, "remote hash:{}", event.remote_hash);
        if !event.discrepancies.is_empty() {
            let _ = writeln!(report, "discrepancies:");
            for d in &event.discrepancies {
                let _ = writeln!(
                    report,
                    "  [{}] {} (local {}, remote {})",
                    d.category, d.description, d.local_value, d.remote_value
                );
            }
        }
        if let Some(resolution) = &event.resolution {
            let _ = writeln!(
                report,
                "resolution: {} at sequence {} -> {} ({})",
                resolution.strategy,
                resolution.conflicting_sequence,
                if resolution.resolved { "resolved" } else { "failed" },
                resolution.description
            );
        }
        if let Some(ms) = event.resolution_time_ms {
            let _ = writeln!(report, "resolved in {ms} ms");
        }
        if let Some(reason) = &event.escalation_reason {
            let _ = writeln!(report, "escalated:  {reason}");
        }
        Some(report)
    }

    /// Persist the retained events as JSON, keyed by session id.
    pub fn persist(&self, dir: &Path, session_id: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("desync-{session_id}.json"));
        let events: Vec<&DesyncEvent> = self.events.iter().collect();
        let json = serde_json::to_vec_pretty(&events)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}
