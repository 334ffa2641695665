//! Event-driven wrapper around the replication core.
//!
//! The [Actor] owns a `decksync-replication` engine and drives it from a
//! single mailbox: peer membership, local commits, inbound frames, and the
//! periodic verification and retry timers all funnel through one loop, so
//! the core never needs interior mutability. Observers subscribe for
//! [decksync_replication::Notification]s through the [Mailbox]; any number
//! of subscribers can attach without displacing each other.

mod actor;
mod ingress;
#[cfg(test)]
mod tests;

pub use actor::Actor;
pub use ingress::{Mailbox, Message, SessionStats};

use decksync_replication::{Rules, Transport};
use decksync_types::PeerId;
use std::time::Duration;

/// Session actor configuration.
pub struct Config<R: Rules, T: Transport> {
    /// Our peer identity within the session.
    pub local: PeerId,

    /// Peers already connected when the session starts. Later joiners are
    /// added through [Mailbox::register_peer].
    pub peers: Vec<PeerId>,

    /// The game's rules engine.
    pub rules: R,

    /// Agreed initial game state shared by every peer.
    pub genesis: R::State,

    /// Outbound transport to the session's peers.
    pub transport: T,

    /// Protocol tuning for the replication core.
    pub replication: decksync_replication::Config,

    /// Backlog of control messages before senders block.
    pub mailbox_size: usize,

    /// How often to hash the local state and exchange reports.
    pub verify_interval: Duration,

    /// How often to sweep retries and resolution deadlines.
    pub tick_interval: Duration,
}
