use super::*;
use bytes::Bytes;
use commonware_codec::DecodeExt;
use commonware_cryptography::{ed25519::PrivateKey, Signer};
use commonware_macros::test_traced;
use commonware_runtime::{
    deterministic::{self, Runner},
    Clock, Metrics, Runner as _, Spawner,
};
use decksync_replication::{
    mocks::{CardTable, TableRules},
    Notification, Transport,
};
use decksync_types::{Message as WireMessage, PeerId};
use futures::{channel::mpsc, StreamExt};
use std::time::Duration;

type SessionMailbox = Mailbox<CardTable>;

/// Transport that hands frames to the test's router task.
struct ChannelTransport {
    outbox: mpsc::UnboundedSender<(PeerId, Bytes)>,
}

impl Transport for ChannelTransport {
    fn send(&mut self, peer: &PeerId, bytes: Bytes) {
        // A closed router behaves like a lossy network; the retry layer
        // tolerates it.
        let _ = self.outbox.unbounded_send((peer.clone(), bytes));
    }
}

fn peer(seed: u64) -> PeerId {
    PrivateKey::from_seed(seed).public_key()
}

fn session_config(
    local: &PeerId,
    roster: &[PeerId],
    transport: ChannelTransport,
) -> Config<TableRules, ChannelTransport> {
    Config {
        local: local.clone(),
        peers: roster.iter().filter(|p| *p != local).cloned().collect(),
        rules: TableRules,
        genesis: CardTable::new(roster.to_vec()),
        transport,
        replication: decksync_replication::Config::default(),
        mailbox_size: 128,
        verify_interval: Duration::from_secs(1),
        tick_interval: Duration::from_millis(250),
    }
}

/// Forward frames from one session's transport to its peer's mailbox,
/// dropping any frame `lossy` rejects.
fn route(
    context: &deterministic::Context,
    label: &'static str,
    mut outbox: mpsc::UnboundedReceiver<(PeerId, Bytes)>,
    from: PeerId,
    to: PeerId,
    mut destination: SessionMailbox,
    lossy: impl Fn(&WireMessage) -> bool + Send + 'static,
) {
    context.with_label(label).spawn(move |_| async move {
        while let Some((addressee, frame)) = outbox.next().await {
            if addressee != to {
                continue;
            }
            if let Ok(message) = WireMessage::decode(frame.as_ref()) {
                if lossy(&message) {
                    continue;
                }
            }
            destination.deliver(from.clone(), frame).await;
        }
    });
}

#[test_traced("INFO")]
fn two_peer_session_converges() {
    let cfg = deterministic::Config::default().with_seed(42);
    let executor = Runner::from(cfg);
    executor.start(|context| async move {
        let a_id = peer(1);
        let b_id = peer(2);
        let roster = vec![a_id.clone(), b_id.clone()];

        let (a_out, a_rx) = mpsc::unbounded();
        let (b_out, b_rx) = mpsc::unbounded();
        let (a_actor, mut a_mailbox) = Actor::new(
            context.with_label("peer_a"),
            session_config(&a_id, &roster, ChannelTransport { outbox: a_out }),
        );
        let (b_actor, mut b_mailbox) = Actor::new(
            context.with_label("peer_b"),
            session_config(&b_id, &roster, ChannelTransport { outbox: b_out }),
        );
        let _a_handle = a_actor.start();
        let _b_handle = b_actor.start();

        route(
            &context,
            "route_a_b",
            a_rx,
            a_id.clone(),
            b_id.clone(),
            b_mailbox.clone(),
            |_| false,
        );
        route(
            &context,
            "route_b_a",
            b_rx,
            b_id.clone(),
            a_id.clone(),
            a_mailbox.clone(),
            |_| false,
        );

        a_mailbox
            .commit_action("draw-card".to_string(), Bytes::new())
            .await
            .expect("draw commits");
        b_mailbox
            .commit_action("pass-turn".to_string(), Bytes::new())
            .await
            .expect("pass commits");

        // A few verification rounds.
        context.sleep(Duration::from_secs(3)).await;

        let a_sync = a_mailbox.check_sync().await.expect("session running");
        let b_sync = b_mailbox.check_sync().await.expect("session running");
        assert!(a_sync.is_in_sync);
        assert!(b_sync.is_in_sync);
        assert_eq!(a_sync.local_hash, b_sync.local_hash);

        let stats = a_mailbox.statistics().await.expect("session running");
        assert_eq!(stats.applied_actions, 2);
        assert_eq!(stats.peers, 1);
        assert_eq!(stats.verifier.mismatch_count, 0);
        assert!(stats.verifier.total_checks > 0);
    });
}

#[test_traced("INFO")]
fn lost_action_frames_are_retried() {
    let cfg = deterministic::Config::default().with_seed(7);
    let executor = Runner::from(cfg);
    executor.start(|context| async move {
        let a_id = peer(1);
        let b_id = peer(2);
        let roster = vec![a_id.clone(), b_id.clone()];

        let (a_out, a_rx) = mpsc::unbounded();
        let (b_out, b_rx) = mpsc::unbounded();
        let (a_actor, mut a_mailbox) = Actor::new(
            context.with_label("peer_a"),
            session_config(&a_id, &roster, ChannelTransport { outbox: a_out }),
        );
        let (b_actor, mut b_mailbox) = Actor::new(
            context.with_label("peer_b"),
            session_config(&b_id, &roster, ChannelTransport { outbox: b_out }),
        );
        let _a_handle = a_actor.start();
        let _b_handle = b_actor.start();

        // The first action frame from a is lost; retries must recover it.
        let dropped = std::sync::atomic::AtomicBool::new(false);
        route(
            &context,
            "route_a_b",
            a_rx,
            a_id.clone(),
            b_id.clone(),
            b_mailbox.clone(),
            move |message| {
                matches!(message, WireMessage::Action(_))
                    && !dropped.swap(true, std::sync::atomic::Ordering::Relaxed)
            },
        );
        route(
            &context,
            "route_b_a",
            b_rx,
            b_id.clone(),
            a_id.clone(),
            a_mailbox.clone(),
            |_| false,
        );

        a_mailbox
            .commit_action("draw-card".to_string(), Bytes::new())
            .await
            .expect("draw commits");

        // Enough for the backoff to fire and a verification round to pass.
        context.sleep(Duration::from_secs(15)).await;

        let stats = b_mailbox.statistics().await.expect("session running");
        assert_eq!(stats.applied_actions, 1);
        let b_sync = b_mailbox.check_sync().await.expect("session running");
        assert!(b_sync.is_in_sync);
    });
}

#[test_traced("INFO")]
fn sustained_divergence_recovers_from_host_history() {
    let cfg = deterministic::Config::default().with_seed(11);
    let executor = Runner::from(cfg);
    executor.start(|context| async move {
        // The host is the lowest peer id; make roles explicit.
        let mut ids = vec![peer(1), peer(2)];
        ids.sort();
        let host_id = ids[0].clone();
        let follower_id = ids[1].clone();
        let roster = ids.clone();

        let (host_out, host_rx) = mpsc::unbounded();
        let (follower_out, follower_rx) = mpsc::unbounded();
        let (host_actor, mut host_mailbox) = Actor::new(
            context.with_label("host"),
            session_config(&host_id, &roster, ChannelTransport { outbox: host_out }),
        );
        let (follower_actor, mut follower_mailbox) = Actor::new(
            context.with_label("follower"),
            session_config(
                &follower_id,
                &roster,
                ChannelTransport {
                    outbox: follower_out,
                },
            ),
        );
        let _host_handle = host_actor.start();
        let _follower_handle = follower_actor.start();

        let mut notifications = follower_mailbox.subscribe().await;

        // Every action frame from the host is lost, so the follower can only
        // converge by pulling the host's history during resolution.
        route(
            &context,
            "route_host_follower",
            host_rx,
            host_id.clone(),
            follower_id.clone(),
            follower_mailbox.clone(),
            |message| matches!(message, WireMessage::Action(_)),
        );
        route(
            &context,
            "route_follower_host",
            follower_rx,
            follower_id.clone(),
            host_id.clone(),
            host_mailbox.clone(),
            |_| false,
        );

        host_mailbox
            .commit_action("draw-card".to_string(), Bytes::new())
            .await
            .expect("draw commits");

        // Three mismatching verification rounds trip the threshold, then
        // the catch-up round trip completes.
        context.sleep(Duration::from_secs(10)).await;

        let stats = follower_mailbox.statistics().await.expect("session running");
        assert_eq!(stats.applied_actions, 1);
        assert_eq!(stats.desync.counts_by_type.get("resolved"), Some(&1));
        let follower_sync = follower_mailbox.check_sync().await.expect("session running");
        assert!(follower_sync.is_in_sync);
        let host_sync = host_mailbox.check_sync().await.expect("session running");
        assert_eq!(follower_sync.local_hash, host_sync.local_hash);

        // The subscriber observed the detection and the recovery.
        let mut detected = 0;
        let mut resolved = false;
        while let Ok(Some(notification)) = notifications.try_next() {
            match notification {
                Notification::DesyncDetected { .. } => detected += 1,
                Notification::ConflictResolved { .. } => resolved = true,
                _ => {}
            }
        }
        assert!(detected >= 3);
        assert!(resolved);
    });
}

#[test_traced("INFO")]
fn rules_rejections_surface_to_the_committer() {
    let executor = Runner::from(deterministic::Config::default().with_seed(3));
    executor.start(|context| async move {
        let a_id = peer(1);
        let (outbox, _inbox) = mpsc::unbounded();
        let (actor, mut mailbox) = Actor::new(
            context.with_label("solo"),
            session_config(&a_id, &[a_id.clone()], ChannelTransport { outbox }),
        );
        let _handle = actor.start();

        let err = mailbox
            .commit_action("banish-card".to_string(), Bytes::new())
            .await
            .expect_err("unknown kind is rejected");
        assert!(err.0.contains("unknown action kind"));

        mailbox
            .commit_action("draw-card".to_string(), Bytes::new())
            .await
            .expect("draw commits");
        let stats = mailbox.statistics().await.expect("session running");
        assert_eq!(stats.applied_actions, 1);
    });
}

#[test_traced("INFO")]
fn reset_returns_the_session_to_genesis() {
    let executor = Runner::from(deterministic::Config::default().with_seed(5));
    executor.start(|context| async move {
        let a_id = peer(1);
        let (outbox, _inbox) = mpsc::unbounded();
        let (actor, mut mailbox) = Actor::new(
            context.with_label("solo"),
            session_config(&a_id, &[a_id.clone()], ChannelTransport { outbox }),
        );
        let _handle = actor.start();

        mailbox
            .commit_action("draw-card".to_string(), Bytes::new())
            .await
            .expect("draw commits");
        mailbox
            .commit_action("pass-turn".to_string(), Bytes::new())
            .await
            .expect("pass commits");
        let stats = mailbox.statistics().await.expect("session running");
        assert_eq!(stats.applied_actions, 2);

        mailbox.reset().await;
        let stats = mailbox.statistics().await.expect("session running");
        assert_eq!(stats.applied_actions, 0);
        assert_eq!(stats.verifier.total_checks, 0);
    });
}
