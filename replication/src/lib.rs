//! Deterministic peer-to-peer replication core.
//!
//! Every peer in a session simulates the game locally from a shared, ordered
//! log of committed actions. This crate keeps those logs consistent: the
//! [broadcaster] delivers actions reliably (ack, retry, catch-up), the
//! [engine] applies them in order exactly once and drives periodic hash
//! verification, the [verifier] produces canonical state digests, and the
//! [diagnostics] log records every anomaly for post-hoc analysis.
//!
//! The core is synchronous and runtime-free: every operation that needs time
//! takes `now_ms` from the caller, so the entire protocol can be exercised
//! deterministically in tests. The event-driven wrapper lives in
//! `decksync-session`.

use bytes::{BufMut, Bytes};
use decksync_types::{DeterministicAction, PeerId};
use std::fmt;
use thiserror::Error;

pub mod backoff;
pub mod broadcaster;
pub mod diagnostics;
pub mod engine;
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
pub mod verifier;

pub use broadcaster::Broadcaster;
pub use diagnostics::{DesyncEvent, DesyncEventType, DesyncLog};
pub use engine::{Notification, ReplicationEngine, SyncPhase, SyncVerificationResult};
pub use verifier::{HashDiscrepancy, HashVerifier};

/// Tunable knobs for the replication protocol.
///
/// Constructed explicitly and handed to [ReplicationEngine::new]; there is
/// no process-global configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Consecutive hash mismatches with one peer before conflict resolution
    /// is invoked.
    pub desync_threshold: u32,

    /// Resend attempts for an unacknowledged action before it is marked
    /// failed and the unresponsive peer flagged degraded.
    pub max_retries: u32,

    /// Cap on the retry backoff, and the unit for the resolution deadline.
    pub ack_timeout_ms: u64,

    /// First retry delay; doubles on every attempt up to `ack_timeout_ms`.
    pub retry_base_ms: u64,

    /// Bound on the verifier's comparison history.
    pub verifier_history: usize,

    /// Bound on the desync diagnostics log (oldest evicted first).
    pub diagnostics_capacity: usize,

    /// Seed for retry jitter. Jitter only spreads resend bursts; fixing the
    /// seed keeps the whole core reproducible.
    pub jitter_seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            desync_threshold: defaults::DESYNC_THRESHOLD,
            max_retries: defaults::MAX_RETRIES,
            ack_timeout_ms: defaults::ACK_TIMEOUT_MS,
            retry_base_ms: defaults::RETRY_BASE_MS,
            verifier_history: defaults::VERIFIER_HISTORY,
            diagnostics_capacity: defaults::DIAGNOSTICS_CAPACITY,
            jitter_seed: 0,
        }
    }
}

/// Default protocol constants.
pub mod defaults {
    pub const DESYNC_THRESHOLD: u32 = 3;
    pub const MAX_RETRIES: u32 = 3;
    pub const ACK_TIMEOUT_MS: u64 = 5_000;
    pub const RETRY_BASE_MS: u64 = 500;
    pub const VERIFIER_HISTORY: usize = 256;
    pub const DIAGNOSTICS_CAPACITY: usize = 100;
}

/// Failures surfaced by the replication core.
///
/// None of these abort the session; the caller logs and degrades.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed message: {0}")]
    Malformed(#[from] commonware_codec::Error),
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("no conflict outstanding with peer {0}")]
    NoConflict(String),
    #[error("failed to persist diagnostics: {0}")]
    Persist(#[from] std::io::Error),
}

/// Reason the rules engine refused an action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection(pub String);

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A simulated game state that can be fingerprinted.
///
/// Canonicalization rules, required for cross-peer interoperability:
/// exclude ephemeral fields (wall-clock timestamps, UI selection state,
/// per-session nonces), iterate unordered collections in sorted key order,
/// and encode numbers fixed-width (the `commonware-codec` integer encoding
/// satisfies this).
pub trait GameState: Clone {
    /// Write the canonical byte representation of this state.
    fn canonical_write(&self, writer: &mut impl BufMut);

    /// Split the canonical representation into named categories (e.g.
    /// "life-total", "zone-contents:graveyard") for discrepancy diagnosis.
    /// The concatenation does not need to equal [Self::canonical_write];
    /// categories only have to be individually canonical.
    fn sections(&self) -> Vec<(String, Vec<u8>)>;
}

/// The external rules engine: interprets an action against a state.
///
/// Must be a pure function of `(state, action)` on every peer for the
/// determinism invariant to hold.
pub trait Rules {
    type State: GameState;

    /// Apply `action` to `state`, returning the successor state or the
    /// reason the action is inapplicable.
    fn apply(
        &self,
        state: &Self::State,
        action: &DeterministicAction,
    ) -> Result<Self::State, Rejection>;
}

/// Point-to-point transport to one session's peers.
///
/// Sends are fire-and-forget; no ordering or delivery guarantee is assumed.
/// Reliability is layered on top via acknowledgment and retry.
pub trait Transport {
    fn send(&mut self, peer: &PeerId, bytes: Bytes);
}
