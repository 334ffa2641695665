use crate::{
    ingress::{Mailbox, Message, SessionStats},
    Config,
};
use commonware_macros::select;
use commonware_runtime::{Clock, Handle, Metrics, Spawner};
use decksync_replication::{Notification, ReplicationEngine, Rules, Transport};
use decksync_types::peer_label;
use futures::{channel::mpsc, StreamExt};
use prometheus_client::metrics::counter::Counter;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Session actor: single owner of the replication engine.
pub struct Actor<E, R, T>
where
    E: Clock + Spawner + Metrics,
    R: Rules,
    T: Transport,
{
    context: E,
    mailbox: mpsc::Receiver<Message<R::State>>,
    engine: ReplicationEngine<R, T>,
    verify_interval: Duration,
    tick_interval: Duration,
    subscribers: Vec<mpsc::Sender<Notification>>,
}

impl<E, R, T> Actor<E, R, T>
where
    E: Clock + Spawner + Metrics,
    R: Rules + Send + 'static,
    R::State: Send + 'static,
    T: Transport + Send + 'static,
{
    pub fn new(context: E, config: Config<R, T>) -> (Self, Mailbox<R::State>) {
        let (sender, mailbox) = mpsc::channel(config.mailbox_size);
        let mut engine = ReplicationEngine::new(
            config.replication,
            config.local,
            config.rules,
            config.genesis,
            config.transport,
        );
        for peer in config.peers {
            engine.register_peer(peer);
        }
        (
            Self {
                context,
                mailbox,
                engine,
                verify_interval: config.verify_interval,
                tick_interval: config.tick_interval,
                subscribers: Vec::new(),
            },
            Mailbox::new(sender),
        )
    }

    pub fn start(self) -> Handle<()> {
        self.context.clone().spawn(|_| self.run())
    }

    async fn run(mut self) {
        let actions_committed: Counter = Counter::default();
        let frames_received: Counter = Counter::default();
        let malformed_frames: Counter = Counter::default();
        let desyncs_detected: Counter = Counter::default();
        let conflicts_resolved: Counter = Counter::default();
        let resolutions_escalated: Counter = Counter::default();
        let peers_degraded: Counter = Counter::default();
        self.context.register(
            "actions_committed",
            "Number of locally committed actions",
            actions_committed.clone(),
        );
        self.context.register(
            "frames_received",
            "Number of inbound protocol frames",
            frames_received.clone(),
        );
        self.context.register(
            "malformed_frames",
            "Number of inbound frames dropped as undecodable",
            malformed_frames.clone(),
        );
        self.context.register(
            "desyncs_detected",
            "Number of state hash mismatches observed",
            desyncs_detected.clone(),
        );
        self.context.register(
            "conflicts_resolved",
            "Number of desync conflicts resolved",
            conflicts_resolved.clone(),
        );
        self.context.register(
            "resolutions_escalated",
            "Number of conflict resolutions escalated to the operator",
            resolutions_escalated.clone(),
        );
        self.context.register(
            "peers_degraded",
            "Number of peers flagged degraded after delivery failure",
            peers_degraded.clone(),
        );

        let mut next_verify = self.context.current() + self.verify_interval;
        let mut next_tick = self.context.current() + self.tick_interval;
        loop {
            // Absolute deadlines, so bursts of mailbox traffic cannot starve
            // the timers.
            let now = self.context.current();
            let until_verify = next_verify
                .duration_since(now)
                .unwrap_or(Duration::default());
            let until_tick = next_tick.duration_since(now).unwrap_or(Duration::default());
            select! {
                message = self.mailbox.next() => {
                    let Some(message) = message else {
                        debug!("session mailbox closed; shutting down");
                        return;
                    };
                    let now = system_time_ms(self.context.current());
                    match message {
                        Message::RegisterPeer { peer } => self.engine.register_peer(peer),
                        Message::UnregisterPeer { peer } => self.engine.unregister_peer(now, &peer),
                        Message::CommitAction { kind, payload, response } => {
                            let result = self.engine.record_local_action(now, kind, payload);
                            if result.is_ok() {
                                actions_committed.inc();
                            }
                            let _ = response.send(result);
                        }
                        Message::UpdateGameState { state } => self.engine.update_game_state(state),
                        Message::Inbound { from, frame } => {
                            frames_received.inc();
                            if let Err(err) = self.engine.handle_message(now, &from, frame.as_ref()) {
                                malformed_frames.inc();
                                warn!(?err, peer = %peer_label(&from), "dropping inbound frame");
                            }
                        }
                        Message::CheckSync { response } => {
                            let _ = response.send(self.engine.verify_sync(now));
                        }
                        Message::ResolveDesync { peer, strategy, response } => {
                            let _ = response.send(self.engine.resolve_desync(now, &peer, strategy));
                        }
                        Message::Subscribe { notifications } => {
                            self.subscribers.push(notifications);
                        }
                        Message::Statistics { response } => {
                            let _ = response.send(SessionStats {
                                applied_actions: self.engine.applied_count(),
                                peers: self.engine.peers().len(),
                                host: self.engine.host().clone(),
                                verifier: self.engine.verifier_statistics(),
                                desync: self.engine.diagnostics().statistics(),
                            });
                        }
                        Message::DebugReport { event_id, response } => {
                            let _ = response.send(self.engine.diagnostics().debug_report(event_id));
                        }
                        Message::PersistDiagnostics { dir, session_id, response } => {
                            let result = self
                                .engine
                                .diagnostics()
                                .persist(&dir, &session_id)
                                .map_err(Into::into);
                            let _ = response.send(result);
                        }
                        Message::Reset => self.engine.reset(),
                    }
                },
                _ = self.context.sleep(until_verify) => {
                    let now = system_time_ms(self.context.current());
                    self.engine.verify_sync(now);
                    next_verify = self.context.current() + self.verify_interval;
                },
                _ = self.context.sleep(until_tick) => {
                    let now = system_time_ms(self.context.current());
                    self.engine.tick(now);
                    next_tick = self.context.current() + self.tick_interval;
                },
            }

            // Fan out whatever the engine surfaced to every live subscriber.
            for notification in self.engine.drain_notifications() {
                match &notification {
                    Notification::DesyncDetected { .. } => {
                        desyncs_detected.inc();
                    }
                    Notification::ConflictResolved { .. } => {
                        conflicts_resolved.inc();
                    }
                    Notification::ResolutionEscalated { .. } => {
                        resolutions_escalated.inc();
                    }
                    Notification::PeerDegraded { .. } => {
                        peers_degraded.inc();
                    }
                }
                // A full or closed subscriber is dropped; it must never
                // backpressure the session.
                self.subscribers
                    .retain_mut(|subscriber| subscriber.try_send(notification.clone()).is_ok());
            }
        }
    }
}

fn system_time_ms(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
