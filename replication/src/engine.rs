//! Deterministic replication engine.
//!
//! Owns the per-session ordered action log, applies remote actions exactly
//! once and in per-origin sequence order, drives hash verification against
//! every known peer, and reconciles sustained divergence.
//!
//! Per-peer sync state machine:
//! `InSync -> (mismatch) -> Detecting -> (threshold) -> Resolving ->
//! (success) -> InSync`, or `Resolving -> (failure) -> Escalated`.
//! `Escalated` is terminal until an operator intervenes; the session
//! continues in degraded mode with that peer flagged.

use crate::{
    broadcaster::Broadcaster,
    diagnostics::DesyncLog,
    verifier::{self, Comparison, HashVerifier, VerifierStats},
    Config, Error, GameState, Rules, Transport,
};
use bytes::Bytes;
use commonware_codec::DecodeExt;
use commonware_cryptography::{sha256::Digest, Digestible};
use decksync_types::{
    peer_label, AckStatus, ActionAck, ActionKey, ConflictResolution, DesyncAlert,
    DeterministicAction, HashReport, Message, PeerId, ResolutionStrategy, StateHash,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, info, warn};

/// Where a peer sits in the desync state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPhase {
    InSync,
    Detecting,
    Resolving,
    Escalated,
}

/// Everything the engine knows about one peer's convergence.
#[derive(Clone, Debug)]
pub struct PeerSyncRecord {
    pub last_known_sequence: u64,
    pub last_known_hash: Option<StateHash>,
    pub consecutive_mismatches: u32,
    pub phase: SyncPhase,
    /// Set when deliveries to this peer exhausted their retries.
    pub degraded: bool,
}

impl PeerSyncRecord {
    fn new() -> Self {
        Self {
            last_known_sequence: 0,
            last_known_hash: None,
            consecutive_mismatches: 0,
            phase: SyncPhase::InSync,
            degraded: false,
        }
    }
}

/// Result of one verification pass.
#[derive(Clone, Debug)]
pub struct SyncVerificationResult {
    pub is_in_sync: bool,
    pub local_hash: StateHash,
    pub remote_hashes: Vec<(PeerId, Option<StateHash>)>,
    pub timestamp: u64,
}

/// Events surfaced to observers (UI, diagnostics). Drained via
/// [ReplicationEngine::drain_notifications]; multiple observers can attach
/// downstream without overwriting each other.
#[derive(Clone, Debug)]
pub enum Notification {
    DesyncDetected {
        peer: PeerId,
        local_hash: StateHash,
        remote_hash: StateHash,
        consecutive: u32,
    },
    ConflictResolved {
        peer: PeerId,
        resolution: ConflictResolution,
    },
    ResolutionEscalated {
        peer: PeerId,
        reason: String,
    },
    PeerDegraded {
        peer: PeerId,
        action: Digest,
    },
}

/// Rollback target: the last state both sides confirmed matching.
struct Checkpoint<S> {
    state: S,
    next_expected: HashMap<PeerId, u64>,
    applied_count: u64,
}

/// An in-flight conflict resolution waiting on the network.
struct PendingResolution {
    peer: PeerId,
    strategy: ResolutionStrategy,
    started_at: u64,
    deadline: u64,
    event_id: u64,
    conflicting_sequence: u64,
}

pub struct ReplicationEngine<R: Rules, T: Transport> {
    config: Config,
    local: PeerId,
    rules: R,
    state: R::State,
    genesis: R::State,
    broadcaster: Broadcaster<T>,
    verifier: HashVerifier,
    diagnostics: DesyncLog,
    peers: Vec<PeerId>,
    host: PeerId,
    next_local_sequence: u64,
    next_expected: HashMap<PeerId, u64>,
    pending: HashMap<PeerId, BTreeMap<u64, DeterministicAction>>,
    /// In-order actions the rules engine rejected, by key, with the reason.
    /// Keeps duplicate deliveries acked with their original outcome.
    rejected: HashMap<ActionKey, String>,
    applied_count: u64,
    records: HashMap<PeerId, PeerSyncRecord>,
    last_detection: HashMap<PeerId, u64>,
    checkpoint: Checkpoint<R::State>,
    resolution: Option<PendingResolution>,
    notifications: VecDeque<Notification>,
}

impl<R: Rules, T: Transport> ReplicationEngine<R, T> {
    /// Initialize the replication subsystem for `local`.
    ///
    /// `genesis` is the agreed initial game state every peer starts from;
    /// it doubles as the rollback base before any checkpoint exists.
    pub fn new(config: Config, local: PeerId, rules: R, genesis: R::State, transport: T) -> Self {
        let broadcaster = Broadcaster::new(
            transport,
            local.clone(),
            config.max_retries,
            config.retry_base_ms,
            config.ack_timeout_ms,
            config.jitter_seed,
        );
        Self {
            verifier: HashVerifier::new(config.verifier_history),
            diagnostics: DesyncLog::new(config.diagnostics_capacity),
            state: genesis.clone(),
            checkpoint: Checkpoint {
                state: genesis.clone(),
                next_expected: HashMap::new(),
                applied_count: 0,
            },
            genesis,
            broadcaster,
            host: local.clone(),
            local,
            rules,
            config,
            peers: Vec::new(),
            next_local_sequence: 1,
            next_expected: HashMap::new(),
            pending: HashMap::new(),
            rejected: HashMap::new(),
            applied_count: 0,
            records: HashMap::new(),
            last_detection: HashMap::new(),
            resolution: None,
            notifications: VecDeque::new(),
        }
    }

    /// Connect a peer to the session.
    pub fn register_peer(&mut self, peer: PeerId) {
        if peer == self.local || self.peers.contains(&peer) {
            return;
        }
        info!(peer = %peer_label(&peer), "peer registered");
        self.peers.push(peer.clone());
        self.peers.sort();
        self.records.insert(peer, PeerSyncRecord::new());
        self.elect_host();
    }

    /// Disconnect a peer. Its committed actions stay in the history.
    pub fn unregister_peer(&mut self, now: u64, peer: &PeerId) {
        if !self.peers.contains(peer) {
            return;
        }
        info!(peer = %peer_label(peer), "peer unregistered");
        self.peers.retain(|p| p != peer);
        self.records.remove(peer);
        self.last_detection.remove(peer);
        if let Some(pending) = &self.resolution {
            if &pending.peer == peer {
                self.diagnostics.log_ignored(
                    now,
                    peer_label(&self.local),
                    peer_label(peer),
                    "peer left during conflict resolution".to_string(),
                );
                self.resolution = None;
            }
        }
        self.elect_host();
    }

    /// Host = lowest peer id across the local peer and everyone registered.
    /// Deterministic on every peer with the same roster, and re-assigns
    /// automatically when the host disconnects.
    fn elect_host(&mut self) {
        let mut host = self.local.clone();
        for peer in &self.peers {
            if *peer < host {
                host = peer.clone();
            }
        }
        if host != self.host {
            info!(host = %peer_label(&host), "session host changed");
            self.host = host;
        }
    }

    /// Commit a local player action: assign the next local sequence number,
    /// apply it, append it to the history and broadcast it to all peers.
    pub fn record_local_action(
        &mut self,
        now: u64,
        kind: String,
        payload: Bytes,
    ) -> Result<Digest, crate::Rejection> {
        let action = DeterministicAction {
            peer: self.local.clone(),
            sequence: self.next_local_sequence,
            kind,
            payload,
            committed_at: now,
        };
        let next = self.rules.apply(&self.state, &action)?;

        // The sequence number is consumed only once the action commits.
        self.next_local_sequence += 1;
        let entry = self.next_expected.entry(self.local.clone()).or_insert(1);
        *entry = self.next_local_sequence;
        self.state = next;
        self.applied_count += 1;

        let digest = action.digest();
        debug!(
            sequence = action.sequence,
            kind = %action.kind,
            "local action committed"
        );
        let peers = self.peers.clone();
        self.broadcaster.broadcast(now, action, &peers);
        Ok(digest)
    }

    /// Replace the simulated state wholesale (e.g. after an out-of-band
    /// manual resync). Does not touch the action log.
    pub fn update_game_state(&mut self, state: R::State) {
        self.state = state;
    }

    /// Deserialize and dispatch one inbound transport frame.
    ///
    /// A schema failure is returned as [Error::Malformed]; the caller logs
    /// and drops it. No inbound frame can abort the session.
    pub fn handle_message(&mut self, now: u64, from: &PeerId, raw: &[u8]) -> Result<(), Error> {
        let message = Message::decode(raw)?;
        match message {
            Message::Action(action) => self.handle_action(now, from, action),
            Message::Ack(ack) => self.handle_ack(ack),
            Message::StateHash(report) => self.handle_hash_report(now, report),
            Message::DesyncAlert(alert) => self.handle_desync_alert(now, alert),
            Message::ConflictResolution { peer, resolution } => {
                self.handle_remote_resolution(peer, resolution)
            }
            Message::SyncRequest { peer } => self.broadcaster.handle_sync_request(&peer),
            Message::SyncResponse { peer, actions } => {
                self.handle_sync_response(now, peer, actions)
            }
        }
        Ok(())
    }

    fn handle_action(&mut self, now: u64, from: &PeerId, action: DeterministicAction) {
        if action.peer == self.local {
            // Echo of our own action (e.g. relayed catch-up); nothing to do.
            return;
        }
        if !self.records.contains_key(&action.peer) {
            warn!(
                origin = %peer_label(&action.peer),
                "dropping action from unregistered peer"
            );
            return;
        }

        let expected = *self.next_expected.get(&action.peer).unwrap_or(&1);
        if action.sequence < expected {
            // Duplicate delivery is a silent no-op, but the sender may have
            // missed our ack, so repeat it with the original outcome.
            match self.rejected.get(&action.key()).cloned() {
                Some(reason) => {
                    self.send_ack(now, from, &action, AckStatus::Failed, Some(reason))
                }
                None => self.send_ack(now, from, &action, AckStatus::Applied, None),
            }
            return;
        }

        self.broadcaster.record(&action);

        let resolving = self
            .resolution
            .as_ref()
            .is_some_and(|pending| pending.peer == action.peer);
        if action.sequence > expected || resolving {
            // Out-of-order (or the origin is mid-resolution): hold it until
            // the gap fills or the resolution completes.
            self.pending
                .entry(action.peer.clone())
                .or_default()
                .insert(action.sequence, action.clone());
            self.send_ack(now, from, &action, AckStatus::Received, None);
            return;
        }

        match self.apply_in_order(&action) {
            Ok(()) => self.send_ack(now, from, &action, AckStatus::Applied, None),
            Err(rejection) => {
                self.send_ack(now, from, &action, AckStatus::Failed, Some(rejection.0));
            }
        }
        let origin = action.peer.clone();
        self.drain_ready(now, from, &origin);
    }

    /// Apply one action whose sequence number is the next expected from its
    /// origin. A rules rejection still consumes the sequence number: the
    /// origin committed it, so later sequences must not deadlock behind it.
    /// The resulting divergence is caught by hash verification.
    fn apply_in_order(&mut self, action: &DeterministicAction) -> Result<(), crate::Rejection> {
        let result = self.rules.apply(&self.state, action);
        let entry = self.next_expected.entry(action.peer.clone()).or_insert(1);
        *entry = action.sequence + 1;
        match result {
            Ok(next) => {
                // A replay from an earlier base may apply an action that was
                // rejected on first delivery.
                self.rejected.remove(&action.key());
                self.state = next;
                self.applied_count += 1;
                debug!(
                    origin = %peer_label(&action.peer),
                    sequence = action.sequence,
                    kind = %action.kind,
                    "remote action applied"
                );
                Ok(())
            }
            Err(rejection) => {
                self.rejected.insert(action.key(), rejection.0.clone());
                warn!(
                    origin = %peer_label(&action.peer),
                    sequence = action.sequence,
                    kind = %action.kind,
                    reason = %rejection,
                    "rules engine rejected action"
                );
                Err(rejection)
            }
        }
    }

    /// Apply buffered actions from `origin` that have become contiguous.
    fn drain_ready(&mut self, now: u64, from: &PeerId, origin: &PeerId) {
        if self
            .resolution
            .as_ref()
            .is_some_and(|pending| &pending.peer == origin)
        {
            return;
        }
        loop {
            let expected = *self.next_expected.get(origin).unwrap_or(&1);
            let Some(buffer) = self.pending.get_mut(origin) else {
                return;
            };
            let Some(action) = buffer.remove(&expected) else {
                if buffer.is_empty() {
                    self.pending.remove(origin);
                }
                return;
            };
            match self.apply_in_order(&action) {
                Ok(()) => self.send_ack(now, from, &action, AckStatus::Applied, None),
                Err(rejection) => {
                    self.send_ack(now, from, &action, AckStatus::Failed, Some(rejection.0))
                }
            }
        }
    }

    fn handle_ack(&mut self, ack: ActionAck) {
        if ack.status == AckStatus::Failed {
            warn!(
                peer = %peer_label(&ack.peer),
                error = ack.error.as_deref().unwrap_or("unspecified"),
                "peer rejected broadcast action"
            );
        }
        let peers = self.peers.clone();
        self.broadcaster.handle_ack(&ack.peer, &ack.action, &peers);
    }

    /// Compute the local hash, compare against every known peer's last
    /// report, and broadcast our own report.
    pub fn verify_sync(&mut self, now: u64) -> SyncVerificationResult {
        let local_hash = verifier::state_hash(&self.state);
        let mut remote_hashes = Vec::with_capacity(self.peers.len());
        let mut is_in_sync = true;
        for peer in &self.peers {
            let known = self.records.get(peer).and_then(|r| r.last_known_hash);
            if let Some(remote) = known {
                if remote != local_hash {
                    is_in_sync = false;
                }
            }
            remote_hashes.push((peer.clone(), known));
        }

        let report = Message::StateHash(HashReport {
            peer: self.local.clone(),
            state_hash: local_hash,
            sequence: self.applied_count,
        });
        let peers = self.peers.clone();
        for peer in &peers {
            self.broadcaster.send(peer, &report);
        }

        SyncVerificationResult {
            is_in_sync,
            local_hash,
            remote_hashes,
            timestamp: now,
        }
    }

    fn handle_hash_report(&mut self, now: u64, report: HashReport) {
        let local_hash = verifier::state_hash(&self.state);
        let Some(record) = self.records.get_mut(&report.peer) else {
            warn!(peer = %peer_label(&report.peer), "hash report from unregistered peer");
            return;
        };
        record.last_known_sequence = report.sequence;
        record.last_known_hash = Some(report.state_hash);
        let is_match = report.state_hash == local_hash;
        self.verifier.record_comparison(Comparison {
            is_match,
            local_hash,
            remote_hash: report.state_hash,
            timestamp: now,
        });

        if is_match {
            record.consecutive_mismatches = 0;
            if record.phase == SyncPhase::Detecting {
                record.phase = SyncPhase::InSync;
            }
            // A confirmed match at the same sequence point becomes the new
            // rollback checkpoint.
            if report.sequence == self.applied_count {
                self.checkpoint = Checkpoint {
                    state: self.state.clone(),
                    next_expected: self.next_expected.clone(),
                    applied_count: self.applied_count,
                };
            }
            return;
        }

        if matches!(record.phase, SyncPhase::Resolving | SyncPhase::Escalated) {
            debug!(
                peer = %peer_label(&report.peer),
                "mismatch while resolution in progress; not counted"
            );
            return;
        }

        record.consecutive_mismatches += 1;
        record.phase = SyncPhase::Detecting;
        let consecutive = record.consecutive_mismatches;
        warn!(
            peer = %peer_label(&report.peer),
            consecutive,
            local_sequence = self.applied_count,
            remote_sequence = report.sequence,
            "state hash mismatch"
        );
        let event_id = self.diagnostics.log_detection(
            now,
            peer_label(&self.local),
            peer_label(&report.peer),
            commonware_utils::hex(local_hash.as_ref()),
            commonware_utils::hex(report.state_hash.as_ref()),
            self.applied_count,
            Vec::new(),
        );
        self.last_detection.insert(report.peer.clone(), event_id);
        self.notifications.push_back(Notification::DesyncDetected {
            peer: report.peer.clone(),
            local_hash,
            remote_hash: report.state_hash,
            consecutive,
        });

        if consecutive >= self.config.desync_threshold {
            let alert = Message::DesyncAlert(DesyncAlert {
                peer: self.local.clone(),
                local_hash,
                remote_hash: report.state_hash,
                conflict_sequence: self.applied_count,
                timestamp: now,
            });
            self.broadcaster.send(&report.peer.clone(), &alert);
            self.begin_resolution(
                now,
                report.peer,
                ResolutionStrategy::HostAuthoritative,
                event_id,
            );
        }
    }

    fn handle_desync_alert(&mut self, now: u64, alert: DesyncAlert) {
        let Some(record) = self.records.get_mut(&alert.peer) else {
            return;
        };
        if record.phase == SyncPhase::InSync {
            record.phase = SyncPhase::Detecting;
        }
        let local_hash = verifier::state_hash(&self.state);
        let event_id = self.diagnostics.log_detection(
            now,
            peer_label(&self.local),
            peer_label(&alert.peer),
            commonware_utils::hex(local_hash.as_ref()),
            commonware_utils::hex(alert.local_hash.as_ref()),
            alert.conflict_sequence,
            Vec::new(),
        );
        self.last_detection.insert(alert.peer.clone(), event_id);
        info!(
            peer = %peer_label(&alert.peer),
            "peer reported sustained desync"
        );

        // The host answers an alert with its authoritative resolution; the
        // alerting peer is expected to catch up via sync-request.
        if self.local == self.host {
            let resolution = ConflictResolution {
                strategy: ResolutionStrategy::HostAuthoritative,
                conflicting_sequence: alert.conflict_sequence,
                resolved: true,
                description: "host state is authoritative".to_string(),
                resulting_hash: local_hash,
            };
            let message = Message::ConflictResolution {
                peer: self.local.clone(),
                resolution,
            };
            self.broadcaster.send(&alert.peer, &message);
        }
    }

    fn handle_remote_resolution(&mut self, peer: PeerId, resolution: ConflictResolution) {
        debug!(
            peer = %peer_label(&peer),
            resolved = resolution.resolved,
            "peer reported conflict resolution"
        );
        if let Some(record) = self.records.get_mut(&peer) {
            if resolution.resolved {
                // The sender's resulting hash is its post-resolution truth;
                // remember it so our own completion check can use it.
                record.last_known_hash = Some(resolution.resulting_hash);
            }
        }
    }

    fn handle_sync_response(
        &mut self,
        now: u64,
        peer: PeerId,
        actions: Vec<DeterministicAction>,
    ) {
        let merged = self.broadcaster.merge_sync_response(actions);
        debug!(
            peer = %peer_label(&peer),
            merged = merged.len(),
            "merged sync response"
        );

        if self.resolution.is_some() {
            // Mid-resolution the full history is rebuilt from scratch, so
            // individual merge results do not need replaying here.
            self.try_complete_resolution(now);
            return;
        }

        // Plain catch-up: replay merged actions through the normal ordered
        // path. `merged` is already in per-peer sequence order.
        for action in merged {
            let from = action.peer.clone();
            self.handle_action(now, &from, action);
        }
    }

    /// Invoke conflict resolution for `peer` (operator entry point, also
    /// used internally once the desync threshold is reached).
    pub fn resolve_desync(
        &mut self,
        now: u64,
        peer: &PeerId,
        strategy: Option<ResolutionStrategy>,
    ) -> Result<(), Error> {
        let Some(existing) = self.records.get(peer) else {
            return Err(Error::UnknownPeer(peer_label(peer)));
        };
        if existing.phase == SyncPhase::InSync && existing.consecutive_mismatches == 0 {
            return Err(Error::NoConflict(peer_label(peer)));
        }
        let event_id = match self.last_detection.get(peer) {
            Some(id) => *id,
            None => {
                let local_hash = verifier::state_hash(&self.state);
                let record = &self.records[peer];
                let remote = record
                    .last_known_hash
                    .map(|h| commonware_utils::hex(h.as_ref()))
                    .unwrap_or_default();
                self.diagnostics.log_detection(
                    now,
                    peer_label(&self.local),
                    peer_label(peer),
                    commonware_utils::hex(local_hash.as_ref()),
                    remote,
                    self.applied_count,
                    Vec::new(),
                )
            }
        };
        if let Some(record) = self.records.get_mut(peer) {
            record.phase = SyncPhase::Resolving;
        }
        self.begin_resolution(
            now,
            peer.clone(),
            strategy.unwrap_or(ResolutionStrategy::HostAuthoritative),
            event_id,
        );
        Ok(())
    }

    fn begin_resolution(
        &mut self,
        now: u64,
        peer: PeerId,
        strategy: ResolutionStrategy,
        event_id: u64,
    ) {
        if let Some(record) = self.records.get_mut(&peer) {
            record.phase = SyncPhase::Resolving;
        }
        let conflicting_sequence = self.applied_count;
        info!(
            peer = %peer_label(&peer),
            ?strategy,
            sequence = conflicting_sequence,
            "conflict resolution started"
        );

        match strategy {
            ResolutionStrategy::HostAuthoritative if self.local == self.host => {
                // We are ground truth: our state stands, the peer converges
                // to it by replaying our history.
                let resulting_hash = verifier::state_hash(&self.state);
                let resolution = ConflictResolution {
                    strategy,
                    conflicting_sequence,
                    resolved: true,
                    description: "host state is authoritative".to_string(),
                    resulting_hash,
                };
                let message = Message::ConflictResolution {
                    peer: self.local.clone(),
                    resolution: resolution.clone(),
                };
                let peers = self.peers.clone();
                for to in &peers {
                    self.broadcaster.send(to, &message);
                }
                self.finish_resolution(now, peer, resolution, event_id, now);
            }
            ResolutionStrategy::HostAuthoritative => {
                // Rebuild from the host's history. Pending until the
                // sync-response arrives; escalated if it never does.
                let host = self.host.clone();
                self.resolution = Some(PendingResolution {
                    peer,
                    strategy,
                    started_at: now,
                    deadline: now + 2 * self.config.ack_timeout_ms,
                    event_id,
                    conflicting_sequence,
                });
                self.broadcaster.request_sync_from(&host);
            }
            ResolutionStrategy::ReplayFromCheckpoint => {
                let pre = self.state.clone();
                let base_state = self.checkpoint.state.clone();
                let base_expected = self.checkpoint.next_expected.clone();
                let base_count = self.checkpoint.applied_count;
                self.replay(base_state, base_expected, base_count);
                let resulting_hash = verifier::state_hash(&self.state);
                self.diagnostics
                    .attach_discrepancies(event_id, verifier::diagnose(&pre, &self.state));

                let expected = self.records.get(&peer).and_then(|r| r.last_known_hash);
                let resolved = expected == Some(resulting_hash);
                let resolution = ConflictResolution {
                    strategy,
                    conflicting_sequence,
                    resolved,
                    description: if resolved {
                        "replayed log from last confirmed checkpoint".to_string()
                    } else {
                        "replayed state still diverges from peer".to_string()
                    },
                    resulting_hash,
                };
                let message = Message::ConflictResolution {
                    peer: self.local.clone(),
                    resolution: resolution.clone(),
                };
                let peers = self.peers.clone();
                for to in &peers {
                    self.broadcaster.send(to, &message);
                }
                if resolved {
                    self.finish_resolution(now, peer, resolution, event_id, now);
                } else {
                    self.escalate(&peer, event_id, resolution.description.clone());
                }
            }
        }
    }

    /// Complete a pending network-dependent resolution if the rebuilt
    /// history now converges. Called on every sync-response while a
    /// resolution is outstanding (responses may arrive chunked).
    fn try_complete_resolution(&mut self, now: u64) {
        let Some(pending) = &self.resolution else {
            return;
        };
        let peer = pending.peer.clone();
        let strategy = pending.strategy;
        let started_at = pending.started_at;
        let event_id = pending.event_id;
        let conflicting_sequence = pending.conflicting_sequence;

        // Discard local state and rebuild from genesis over the merged
        // history; determinism makes this reproduce the host's state.
        self.replay(self.genesis.clone(), HashMap::new(), 0);
        let resulting_hash = verifier::state_hash(&self.state);
        let expected = self.records.get(&peer).and_then(|r| r.last_known_hash);

        if expected == Some(resulting_hash) {
            self.resolution = None;
            let resolution = ConflictResolution {
                strategy,
                conflicting_sequence,
                resolved: true,
                description: "rebuilt state from host history".to_string(),
                resulting_hash,
            };
            let message = Message::ConflictResolution {
                peer: self.local.clone(),
                resolution: resolution.clone(),
            };
            let peers = self.peers.clone();
            for to in &peers {
                self.broadcaster.send(to, &message);
            }
            self.finish_resolution(now, peer, resolution, event_id, started_at);
        } else {
            debug!(
                peer = %peer_label(&peer),
                "rebuilt state does not converge yet; awaiting more history"
            );
        }
    }

    fn finish_resolution(
        &mut self,
        now: u64,
        peer: PeerId,
        resolution: ConflictResolution,
        event_id: u64,
        started_at: u64,
    ) {
        if let Some(record) = self.records.get_mut(&peer) {
            record.consecutive_mismatches = 0;
            record.phase = SyncPhase::InSync;
            record.last_known_hash = Some(resolution.resulting_hash);
        }
        self.diagnostics.log_resolution(
            event_id,
            (&resolution).into(),
            now.saturating_sub(started_at),
        );
        info!(
            peer = %peer_label(&peer),
            strategy = ?resolution.strategy,
            "conflict resolved"
        );
        self.notifications.push_back(Notification::ConflictResolved {
            peer: peer.clone(),
            resolution,
        });
        // Actions buffered while resolving are applicable again.
        let from = peer.clone();
        self.drain_ready(now, &from, &peer);
    }

    fn escalate(&mut self, peer: &PeerId, event_id: u64, reason: String) {
        if let Some(record) = self.records.get_mut(peer) {
            record.phase = SyncPhase::Escalated;
        }
        self.diagnostics.log_escalated(event_id, reason.clone());
        warn!(
            peer = %peer_label(peer),
            reason = %reason,
            "conflict resolution escalated; operator intervention required"
        );
        self.notifications
            .push_back(Notification::ResolutionEscalated {
                peer: peer.clone(),
                reason,
            });
    }

    /// Drive time-based work: due retries and the resolution deadline.
    pub fn tick(&mut self, now: u64) {
        let peers = self.peers.clone();
        let degraded = self.broadcaster.sweep(now, &peers);
        for (peer, action) in degraded {
            if let Some(record) = self.records.get_mut(&peer) {
                record.degraded = true;
            }
            warn!(peer = %peer_label(&peer), "peer flagged degraded after delivery failure");
            self.notifications
                .push_back(Notification::PeerDegraded { peer, action });
        }

        if let Some(pending) = &self.resolution {
            if now >= pending.deadline {
                let peer = pending.peer.clone();
                let event_id = pending.event_id;
                self.resolution = None;
                self.escalate(
                    &peer,
                    event_id,
                    "resolution timed out waiting for host history".to_string(),
                );
            }
        }
    }

    /// Ask every peer for its full history (late-joiner catch-up).
    pub fn request_sync(&mut self) {
        let peers = self.peers.clone();
        self.broadcaster.request_sync(&peers);
    }

    /// Rebuild state from `base` by re-applying the session history in
    /// canonical replay order: `(committed_at, origin, sequence)`. Identical
    /// on every peer holding the same action set.
    fn replay(
        &mut self,
        base_state: R::State,
        base_expected: HashMap<PeerId, u64>,
        base_count: u64,
    ) {
        self.state = base_state;
        self.next_expected = base_expected;
        self.applied_count = base_count;
        self.pending.clear();

        let mut actions: Vec<DeterministicAction> = self.broadcaster.history().to_vec();
        actions.sort_by(|a, b| {
            (a.committed_at, &a.peer, a.sequence).cmp(&(b.committed_at, &b.peer, b.sequence))
        });
        for action in actions {
            let expected = *self.next_expected.get(&action.peer).unwrap_or(&1);
            if action.sequence < expected {
                continue;
            }
            if action.sequence > expected {
                self.pending
                    .entry(action.peer.clone())
                    .or_default()
                    .insert(action.sequence, action);
                continue;
            }
            let _ = self.apply_in_order(&action);
            // A filled gap may unlock buffered successors.
            let origin = action.peer.clone();
            loop {
                let expected = *self.next_expected.get(&origin).unwrap_or(&1);
                let Some(buffer) = self.pending.get_mut(&origin) else {
                    break;
                };
                let Some(next) = buffer.remove(&expected) else {
                    break;
                };
                let _ = self.apply_in_order(&next);
            }
        }
        // Local sequence assignment is never rewound: numbers are unique for
        // the session lifetime even across rollbacks.
        debug!(applied = self.applied_count, "replay complete");
    }

    fn send_ack(
        &mut self,
        now: u64,
        to: &PeerId,
        action: &DeterministicAction,
        status: AckStatus,
        error: Option<String>,
    ) {
        let ack = Message::Ack(ActionAck {
            action: action.digest(),
            peer: self.local.clone(),
            received_at: now,
            status,
            error,
        });
        self.broadcaster.send(to, &ack);
    }

    /// Tear the session down: clear all outstanding acknowledgment and
    /// retry state, drop the history and rewind to genesis. The diagnostics
    /// log is kept for post-hoc analysis.
    pub fn reset(&mut self) {
        self.state = self.genesis.clone();
        self.checkpoint = Checkpoint {
            state: self.genesis.clone(),
            next_expected: HashMap::new(),
            applied_count: 0,
        };
        self.next_local_sequence = 1;
        self.next_expected.clear();
        self.pending.clear();
        self.rejected.clear();
        self.applied_count = 0;
        self.resolution = None;
        self.notifications.clear();
        self.last_detection.clear();
        for record in self.records.values_mut() {
            *record = PeerSyncRecord::new();
        }
        self.verifier.reset();
        self.broadcaster.reset();
        self.broadcaster.clear_history();
        info!("session reset");
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }

    /// Earliest instant at which [Self::tick] has work to do, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        let retry = self.broadcaster.next_attempt_at();
        let resolution = self.resolution.as_ref().map(|p| p.deadline);
        match (retry, resolution) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn state(&self) -> &R::State {
        &self.state
    }

    pub fn local_hash(&self) -> StateHash {
        verifier::state_hash(&self.state)
    }

    pub fn host(&self) -> &PeerId {
        &self.host
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.peers
    }

    pub fn record(&self, peer: &PeerId) -> Option<&PeerSyncRecord> {
        self.records.get(peer)
    }

    pub fn history(&self) -> &[DeterministicAction] {
        self.broadcaster.history()
    }

    pub fn applied_count(&self) -> u64 {
        self.applied_count
    }

    pub fn diagnostics(&self) -> &DesyncLog {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut DesyncLog {
        &mut self.diagnostics
    }

    pub fn verifier_statistics(&self) -> VerifierStats {
        self.verifier.statistics()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.broadcaster.transport_mut()
    }
}
