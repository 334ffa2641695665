//! Wire-level types shared between decksync peers.
//!
//! Everything that crosses the transport boundary lives here: committed
//! actions, acknowledgments, hash reports and the [Message] union over the
//! seven message kinds. All wire types carry explicit read bounds so a
//! malformed or hostile buffer can never allocate unbounded memory.

use commonware_cryptography::ed25519;

pub mod action;
pub mod codec;
pub mod message;

pub use action::{ActionKey, DeterministicAction, MAX_ACTION_KIND_LEN, MAX_ACTION_PAYLOAD_LEN};
pub use message::{
    AckStatus, ActionAck, ConflictResolution, DesyncAlert, HashReport, Message,
    ResolutionStrategy, MAX_SYNC_RESPONSE_ACTIONS,
};

/// Stable identifier for a session participant.
///
/// Public keys are unique for the lifetime of a session and totally ordered,
/// which the replication layer leans on for deterministic host selection.
pub type PeerId = ed25519::PublicKey;

/// Canonical digest type used for state hashes and action ids.
pub type StateHash = commonware_cryptography::sha256::Digest;

/// Short hex rendering of a peer id for log lines and reports.
pub fn peer_label(peer: &PeerId) -> String {
    commonware_utils::hex(peer.as_ref())[..16].to_string()
}
