//! Canonical state hashing and comparison bookkeeping.
//!
//! Two peers that applied the identical ordered action prefix must produce
//! identical digests; that is the core invariant of the subsystem. The
//! verifier has no knowledge of *why* hashes differ — it is a digest
//! function plus a rolling scoreboard. Category-level diagnosis is a
//! heavier-weight operation invoked only on demand.

use crate::GameState;
use commonware_cryptography::{Hasher, Sha256};
use commonware_utils::hex;
use decksync_types::StateHash;
use std::collections::VecDeque;

/// Digest of a state's canonical byte representation.
pub fn state_hash<S: GameState>(state: &S) -> StateHash {
    let mut buf = Vec::new();
    state.canonical_write(&mut buf);
    Sha256::hash(&buf)
}

/// A human-diagnosable fragment of a state mismatch.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct HashDiscrepancy {
    /// Stable category name, e.g. "life-total" or "zone-contents:graveyard".
    pub category: String,
    pub description: String,
    pub local_value: String,
    pub remote_value: String,
}

/// Compare two states category by category.
///
/// Produces one discrepancy per section whose canonical bytes differ, plus
/// entries for sections present on only one side. Values are rendered as
/// truncated digests, not raw state, to keep reports bounded.
pub fn diagnose<S: GameState>(local: &S, remote: &S) -> Vec<HashDiscrepancy> {
    let local_sections = local.sections();
    let remote_sections = remote.sections();

    let mut discrepancies = Vec::new();
    for (category, local_bytes) in &local_sections {
        match remote_sections.iter().find(|(c, _)| c == category) {
            Some((_, remote_bytes)) if remote_bytes == local_bytes => {}
            Some((_, remote_bytes)) => discrepancies.push(HashDiscrepancy {
                category: category.clone(),
                description: format!("category {category} diverged"),
                local_value: section_label(local_bytes),
                remote_value: section_label(remote_bytes),
            }),
            None => discrepancies.push(HashDiscrepancy {
                category: category.clone(),
                description: format!("category {category} missing on remote"),
                local_value: section_label(local_bytes),
                remote_value: "<absent>".to_string(),
            }),
        }
    }
    for (category, remote_bytes) in &remote_sections {
        if !local_sections.iter().any(|(c, _)| c == category) {
            discrepancies.push(HashDiscrepancy {
                category: category.clone(),
                description: format!("category {category} missing on local"),
                local_value: "<absent>".to_string(),
                remote_value: section_label(remote_bytes),
            });
        }
    }
    discrepancies
}

fn section_label(bytes: &[u8]) -> String {
    let digest = Sha256::hash(bytes);
    hex(digest.as_ref())[..16].to_string()
}

/// One recorded hash comparison.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Comparison {
    pub is_match: bool,
    pub local_hash: StateHash,
    pub remote_hash: StateHash,
    pub timestamp: u64,
}

/// Aggregate view over the retained comparison history.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VerifierStats {
    pub total_checks: u64,
    pub mismatch_count: u64,
    pub match_rate: f64,
}

/// Rolling scoreboard of hash comparisons, bounded in memory.
#[derive(Debug)]
pub struct HashVerifier {
    history: VecDeque<Comparison>,
    capacity: usize,
}

impl HashVerifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn record_comparison(&mut self, comparison: Comparison) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(comparison);
    }

    pub fn statistics(&self) -> VerifierStats {
        let total_checks = self.history.len() as u64;
        let mismatch_count = self.history.iter().filter(|c| !c.is_match).count() as u64;
        let match_rate = if total_checks == 0 {
            1.0
        } else {
            (total_checks - mismatch_count) as f64 / total_checks as f64
        };
        VerifierStats {
            total_checks,
            mismatch_count,
            match_rate,
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{CardTable, TableRules};
    use crate::Rules;
    use bytes::Bytes;
    use commonware_cryptography::{ed25519::PrivateKey, Signer};
    use decksync_types::DeterministicAction;

    fn two_player_table() -> CardTable {
        let a = PrivateKey::from_seed(1).public_key();
        let b = PrivateKey::from_seed(2).public_key();
        CardTable::new(vec![a, b])
    }

    #[test]
    fn identical_states_hash_identically() {
        let left = two_player_table();
        let right = two_player_table();
        assert_eq!(state_hash(&left), state_hash(&right));
    }

    #[test]
    fn ephemeral_fields_do_not_affect_the_hash() {
        let mut left = two_player_table();
        let right = two_player_table();
        left.selected_card = Some(12);
        assert_eq!(state_hash(&left), state_hash(&right));
        assert!(diagnose(&left, &right).is_empty());
    }

    #[test]
    fn diagnose_names_the_diverged_category() {
        let rules = TableRules;
        let base = two_player_table();
        let peer = PrivateKey::from_seed(1).public_key();
        let drawn = rules
            .apply(
                &base,
                &DeterministicAction {
                    peer: peer.clone(),
                    sequence: 1,
                    kind: "draw-card".to_string(),
                    payload: Bytes::new(),
                    committed_at: 1,
                },
            )
            .expect("draw applies to a fresh table");

        assert_ne!(state_hash(&base), state_hash(&drawn));
        let discrepancies = diagnose(&base, &drawn);
        assert!(!discrepancies.is_empty());
        assert!(discrepancies
            .iter()
            .any(|d| d.category.starts_with("zone-contents")));
        // Life totals did not change.
        assert!(!discrepancies.iter().any(|d| d.category == "life-total"));
    }

    #[test]
    fn statistics_follow_the_bounded_history() {
        let mut verifier = HashVerifier::new(2);
        let hash = state_hash(&two_player_table());
        let comparison = |is_match| Comparison {
            is_match,
            local_hash: hash,
            remote_hash: hash,
            timestamp: 0,
        };

        verifier.record_comparison(comparison(false));
        verifier.record_comparison(comparison(true));
        verifier.record_comparison(comparison(true));

        // The mismatch was evicted by the capacity bound.
        let stats = verifier.statistics();
        assert_eq!(stats.total_checks, 2);
        assert_eq!(stats.mismatch_count, 0);
        assert_eq!(stats.match_rate, 1.0);
    }
}
