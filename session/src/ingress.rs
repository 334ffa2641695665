use bytes::Bytes;
use commonware_cryptography::sha256::Digest;
use decksync_replication::{
    diagnostics::DesyncStats, verifier::VerifierStats, Error, Notification, Rejection,
    SyncVerificationResult,
};
use decksync_types::{PeerId, ResolutionStrategy};
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use std::path::PathBuf;
use tracing::warn;

/// Per-subscriber notification buffer. A subscriber that stops draining
/// loses its feed rather than stalling the session.
const SUBSCRIBER_BUFFER: usize = 64;

pub enum Message<S> {
    RegisterPeer {
        peer: PeerId,
    },
    UnregisterPeer {
        peer: PeerId,
    },
    CommitAction {
        kind: String,
        payload: Bytes,
        response: oneshot::Sender<Result<Digest, Rejection>>,
    },
    UpdateGameState {
        state: S,
    },
    Inbound {
        from: PeerId,
        frame: Bytes,
    },
    CheckSync {
        response: oneshot::Sender<SyncVerificationResult>,
    },
    ResolveDesync {
        peer: PeerId,
        strategy: Option<ResolutionStrategy>,
        response: oneshot::Sender<Result<(), Error>>,
    },
    Subscribe {
        notifications: mpsc::Sender<Notification>,
    },
    Statistics {
        response: oneshot::Sender<SessionStats>,
    },
    DebugReport {
        event_id: u64,
        response: oneshot::Sender<Option<String>>,
    },
    PersistDiagnostics {
        dir: PathBuf,
        session_id: String,
        response: oneshot::Sender<Result<PathBuf, Error>>,
    },
    Reset,
}

/// Point-in-time view of a session's health.
#[derive(Clone, Debug)]
pub struct SessionStats {
    pub applied_actions: u64,
    pub peers: usize,
    pub host: PeerId,
    pub verifier: VerifierStats,
    pub desync: DesyncStats,
}

/// Control surface for a running session actor.
pub struct Mailbox<S> {
    sender: mpsc::Sender<Message<S>>,
}

impl<S> Clone for Mailbox<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S> Mailbox<S> {
    pub(crate) fn new(sender: mpsc::Sender<Message<S>>) -> Self {
        Self { sender }
    }

    pub async fn register_peer(&mut self, peer: PeerId) {
        if self
            .sender
            .send(Message::RegisterPeer { peer })
            .await
            .is_err()
        {
            warn!("session mailbox closed; register dropped");
        }
    }

    pub async fn unregister_peer(&mut self, peer: PeerId) {
        if self
            .sender
            .send(Message::UnregisterPeer { peer })
            .await
            .is_err()
        {
            warn!("session mailbox closed; unregister dropped");
        }
    }

    /// Commit a local player action and broadcast it to the session.
    pub async fn commit_action(
        &mut self,
        kind: String,
        payload: Bytes,
    ) -> Result<Digest, Rejection> {
        let (response, receiver) = oneshot::channel();
        if self
            .sender
            .send(Message::CommitAction {
                kind,
                payload,
                response,
            })
            .await
            .is_err()
        {
            warn!("session mailbox closed; action not committed");
            return Err(Rejection("session stopped".to_string()));
        }
        receiver
            .await
            .unwrap_or_else(|_| Err(Rejection("session stopped".to_string())))
    }

    /// Replace the simulated state wholesale.
    pub async fn update_game_state(&mut self, state: S) {
        if self
            .sender
            .send(Message::UpdateGameState { state })
            .await
            .is_err()
        {
            warn!("session mailbox closed; state update dropped");
        }
    }

    /// Hand one inbound transport frame to the session.
    pub async fn deliver(&mut self, from: PeerId, frame: Bytes) {
        if self
            .sender
            .send(Message::Inbound { from, frame })
            .await
            .is_err()
        {
            warn!("session mailbox closed; inbound frame dropped");
        }
    }

    /// Run a verification pass now and return the result.
    pub async fn check_sync(&mut self) -> Option<SyncVerificationResult> {
        let (response, receiver) = oneshot::channel();
        if self
            .sender
            .send(Message::CheckSync { response })
            .await
            .is_err()
        {
            warn!("session mailbox closed; check skipped");
            return None;
        }
        receiver.await.ok()
    }

    /// Invoke conflict resolution for `peer` with an optional strategy
    /// override.
    pub async fn resolve_desync(
        &mut self,
        peer: PeerId,
        strategy: Option<ResolutionStrategy>,
    ) -> Result<(), Error> {
        let (response, receiver) = oneshot::channel();
        if self
            .sender
            .send(Message::ResolveDesync {
                peer,
                strategy,
                response,
            })
            .await
            .is_err()
        {
            warn!("session mailbox closed; nothing to resolve");
            return Ok(());
        }
        receiver.await.unwrap_or(Ok(()))
    }

    /// Subscribe to session notifications. The feed ends when the session
    /// stops or this subscriber falls too far behind.
    pub async fn subscribe(&mut self) -> mpsc::Receiver<Notification> {
        let (notifications, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        if self
            .sender
            .send(Message::Subscribe { notifications })
            .await
            .is_err()
        {
            warn!("session mailbox closed; subscription is inert");
        }
        receiver
    }

    pub async fn statistics(&mut self) -> Option<SessionStats> {
        let (response, receiver) = oneshot::channel();
        if self
            .sender
            .send(Message::Statistics { response })
            .await
            .is_err()
        {
            warn!("session mailbox closed; statistics unavailable");
            return None;
        }
        receiver.await.ok()
    }

    /// Human-readable report for one diagnostics event.
    pub async fn debug_report(&mut self, event_id: u64) -> Option<String> {
        let (response, receiver) = oneshot::channel();
        if self
            .sender
            .send(Message::DebugReport { event_id, response })
            .await
            .is_err()
        {
            warn!("session mailbox closed; report unavailable");
            return None;
        }
        receiver.await.ok().flatten()
    }

    /// Write the diagnostics log to `dir` as JSON, keyed by `session_id`.
    pub async fn persist_diagnostics(
        &mut self,
        dir: PathBuf,
        session_id: String,
    ) -> Result<PathBuf, Error> {
        let (response, receiver) = oneshot::channel();
        if self
            .sender
            .send(Message::PersistDiagnostics {
                dir,
                session_id,
                response,
            })
            .await
            .is_err()
        {
            warn!("session mailbox closed; diagnostics not persisted");
            return Err(Error::Persist(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "session stopped",
            )));
        }
        receiver.await.unwrap_or_else(|_| {
            Err(Error::Persist(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "session stopped",
            )))
        })
    }

    /// Tear the session down to genesis, clearing all in-flight state.
    pub async fn reset(&mut self) {
        if self.sender.send(Message::Reset).await.is_err() {
            warn!("session mailbox closed; reset dropped");
        }
    }
}
