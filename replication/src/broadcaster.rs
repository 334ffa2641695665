//! Reliable action fan-out.
//!
//! Delivery guarantees are achieved purely through acknowledgment and
//! retry, never assumed from the transport. The broadcaster also owns the
//! append-only session history that backs late-joiner catch-up and
//! rollback replay.

use crate::{backoff::retry_delay, Transport};
use bytes::Bytes;
use commonware_codec::Encode;
use commonware_cryptography::{sha256::Digest, Digestible};
use decksync_types::{
    peer_label, ActionKey, DeterministicAction, Message, PeerId, MAX_SYNC_RESPONSE_ACTIONS,
};
use rand::{rngs::StdRng, SeedableRng};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// An action awaiting acknowledgment from every connected peer.
#[derive(Clone, Debug)]
pub struct QueueItem {
    pub action: DeterministicAction,
    pub acked: BTreeSet<PeerId>,
    /// Resend attempts made so far (the initial send is not an attempt).
    pub attempts: u32,
    pub enqueued_at: u64,
    pub next_attempt_at: u64,
}

/// Propagates committed actions to all connected peers and tracks receipt.
pub struct Broadcaster<T: Transport> {
    transport: T,
    local: PeerId,
    history: Vec<DeterministicAction>,
    seen: HashSet<ActionKey>,
    outstanding: HashMap<Digest, QueueItem>,
    /// Actions that exhausted their retries. Kept for introspection; the
    /// actions themselves stay in `history`.
    failed: HashSet<Digest>,
    max_retries: u32,
    retry_base_ms: u64,
    ack_timeout_ms: u64,
    rng: StdRng,
}

impl<T: Transport> Broadcaster<T> {
    pub fn new(
        transport: T,
        local: PeerId,
        max_retries: u32,
        retry_base_ms: u64,
        ack_timeout_ms: u64,
        jitter_seed: u64,
    ) -> Self {
        Self {
            transport,
            local,
            history: Vec::new(),
            seen: HashSet::new(),
            outstanding: HashMap::new(),
            failed: HashSet::new(),
            max_retries,
            retry_base_ms,
            ack_timeout_ms,
            rng: StdRng::seed_from_u64(jitter_seed),
        }
    }

    /// Append an action to the session history. Returns false when the
    /// `(peer, sequence)` key was already present.
    pub fn record(&mut self, action: &DeterministicAction) -> bool {
        if !self.seen.insert(action.key()) {
            return false;
        }
        self.history.push(action.clone());
        true
    }

    /// Broadcast a locally committed action to every connected peer.
    ///
    /// The action is recorded in history first, so it is served by catch-up
    /// even if every send is lost. Failures to an individual peer are
    /// retried independently via [Self::sweep].
    pub fn broadcast(&mut self, now: u64, action: DeterministicAction, peers: &[PeerId]) {
        let digest = action.digest();
        self.record(&action);
        if peers.is_empty() {
            return;
        }

        let message = Message::Action(action.clone());
        for peer in peers {
            self.send(peer, &message);
        }
        let delay = retry_delay(&mut self.rng, 0, self.retry_base_ms, self.ack_timeout_ms);
        self.outstanding.insert(
            digest,
            QueueItem {
                action,
                acked: BTreeSet::new(),
                attempts: 0,
                enqueued_at: now,
                next_attempt_at: now + delay,
            },
        );
    }

    /// Record an acknowledgment. The item is retired once every currently
    /// connected peer has acknowledged it. Any ack status counts: the bytes
    /// arrived, which is all the reliability layer is responsible for.
    pub fn handle_ack(&mut self, from: &PeerId, action: &Digest, peers: &[PeerId]) {
        let Some(item) = self.outstanding.get_mut(action) else {
            // Late ack for an already retired or failed item.
            return;
        };
        item.acked.insert(from.clone());
        if peers.iter().all(|peer| item.acked.contains(peer)) {
            self.outstanding.remove(action);
        }
    }

    /// Resend every due outstanding item, with exponential backoff per
    /// item. Items that exhaust `max_retries` are marked failed and
    /// removed from the outstanding set; the peers that never acknowledged
    /// them are returned so the caller can flag them degraded.
    pub fn sweep(&mut self, now: u64, peers: &[PeerId]) -> Vec<(PeerId, Digest)> {
        // A roster shrink can leave an item with no peer left to wait for;
        // retire it instead of resending to nobody until the budget runs out.
        self.outstanding
            .retain(|_, item| peers.iter().any(|peer| !item.acked.contains(peer)));

        let mut degraded = Vec::new();
        let due: Vec<Digest> = self
            .outstanding
            .iter()
            .filter(|(_, item)| item.next_attempt_at <= now)
            .map(|(digest, _)| *digest)
            .collect();

        for digest in due {
            let Some(item) = self.outstanding.get_mut(&digest) else {
                continue;
            };
            if item.attempts >= self.max_retries {
                warn!(
                    action = %commonware_utils::hex(digest.as_ref()),
                    attempts = item.attempts,
                    "action delivery abandoned after max retries"
                );
                for peer in peers {
                    if !item.acked.contains(peer) {
                        degraded.push((peer.clone(), digest));
                    }
                }
                self.outstanding.remove(&digest);
                self.failed.insert(digest);
                continue;
            }

            item.attempts += 1;
            let attempts = item.attempts;
            let message = Message::Action(item.action.clone());
            let unacked: Vec<PeerId> = peers
                .iter()
                .filter(|peer| !item.acked.contains(peer))
                .cloned()
                .collect();
            item.next_attempt_at = now
                + retry_delay(
                    &mut self.rng,
                    attempts,
                    self.retry_base_ms,
                    self.ack_timeout_ms,
                );
            debug!(
                action = %commonware_utils::hex(digest.as_ref()),
                attempts,
                peers = unacked.len(),
                "resending unacknowledged action"
            );
            for peer in &unacked {
                self.send(peer, &message);
            }
        }
        degraded
    }

    /// Ask every peer for its full ordered history.
    pub fn request_sync(&mut self, peers: &[PeerId]) {
        let message = Message::SyncRequest {
            peer: self.local.clone(),
        };
        for peer in peers {
            self.send(peer, &message);
        }
    }

    /// Ask one peer for its full ordered history.
    pub fn request_sync_from(&mut self, peer: &PeerId) {
        let message = Message::SyncRequest {
            peer: self.local.clone(),
        };
        self.send(peer, &message);
    }

    /// Serve a catch-up request with the entire history, in order. Large
    /// histories are chunked to stay within the wire bound.
    pub fn handle_sync_request(&mut self, requester: &PeerId) {
        debug!(
            peer = %peer_label(requester),
            actions = self.history.len(),
            "serving sync request"
        );
        if self.history.is_empty() {
            let message = Message::SyncResponse {
                peer: self.local.clone(),
                actions: Vec::new(),
            };
            self.send(requester, &message);
            return;
        }
        let chunks: Vec<Vec<DeterministicAction>> = self
            .history
            .chunks(MAX_SYNC_RESPONSE_ACTIONS)
            .map(|chunk| chunk.to_vec())
            .collect();
        for actions in chunks {
            let message = Message::SyncResponse {
                peer: self.local.clone(),
                actions,
            };
            self.send(requester, &message);
        }
    }

    /// Merge a catch-up response into the history. Returns the actions that
    /// were not already present, ordered by `(peer, sequence)` so the
    /// caller can replay them through the engine in per-peer order.
    pub fn merge_sync_response(
        &mut self,
        actions: Vec<DeterministicAction>,
    ) -> Vec<DeterministicAction> {
        let mut fresh: Vec<DeterministicAction> =
            actions.into_iter().filter(|a| self.record(a)).collect();
        fresh.sort_by(|a, b| a.key().cmp(&b.key()));
        fresh
    }

    /// Send an arbitrary protocol message to one peer.
    pub fn send(&mut self, peer: &PeerId, message: &Message) {
        let bytes = Bytes::from(message.encode().to_vec());
        self.transport.send(peer, bytes);
    }

    /// Full ordered session history.
    pub fn history(&self) -> &[DeterministicAction] {
        &self.history
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_failed(&self, digest: &Digest) -> bool {
        self.failed.contains(digest)
    }

    /// Earliest due time among outstanding items, if any. Lets the caller
    /// schedule the next sweep instead of polling.
    pub fn next_attempt_at(&self) -> Option<u64> {
        self.outstanding
            .values()
            .map(|item| item.next_attempt_at)
            .min()
    }

    /// Clear all outstanding acknowledgment state. Called on session reset
    /// so no retry survives teardown.
    pub fn reset(&mut self) {
        self.outstanding.clear();
        self.failed.clear();
    }

    /// Drop the session history and the dedup set. Only meaningful as part
    /// of a full session teardown; mid-session the history must survive so
    /// catch-up and rollback keep working.
    pub fn clear_history(&mut self) {
        self.history.clear();
        self.seen.clear();
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
