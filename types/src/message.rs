use crate::{
    codec::{
        option_string_encode_size, read_option_string, read_string, string_encode_size,
        write_option_string, write_string,
    },
    DeterministicAction, PeerId,
};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error, Read, ReadExt, ReadRangeExt, Write};
use commonware_cryptography::sha256::Digest;

/// Upper bound on the number of actions in a single sync response.
pub const MAX_SYNC_RESPONSE_ACTIONS: usize = 4096;

/// Upper bound on free-form error/description strings on the wire.
const MAX_TEXT_LEN: usize = 512;

/// Outcome of delivering an action to a peer.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckStatus {
    /// Accepted and held (e.g. buffered until an earlier sequence arrives).
    Received = 0,
    /// Applied to the simulated state.
    Applied = 1,
    /// Rejected by the rules engine.
    Failed = 2,
}

impl TryFrom<u8> for AckStatus {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AckStatus::Received),
            1 => Ok(AckStatus::Applied),
            2 => Ok(AckStatus::Failed),
            _ => Err(()),
        }
    }
}

impl Write for AckStatus {
    fn write(&self, writer: &mut impl BufMut) {
        (*self as u8).write(writer);
    }
}

impl Read for AckStatus {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let value = u8::read(reader)?;
        AckStatus::try_from(value).map_err(|_| Error::InvalidEnum(value))
    }
}

impl EncodeSize for AckStatus {
    fn encode_size(&self) -> usize {
        1
    }
}

/// Acknowledgment for a delivered action. One per (action, peer) pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionAck {
    /// Digest of the acknowledged action.
    pub action: Digest,
    /// The acknowledging peer.
    pub peer: PeerId,
    /// Receipt time at the acknowledging peer, in milliseconds since the epoch.
    pub received_at: u64,
    pub status: AckStatus,
    /// Rejection reason when `status` is [AckStatus::Failed].
    pub error: Option<String>,
}

impl Write for ActionAck {
    fn write(&self, writer: &mut impl BufMut) {
        self.action.write(writer);
        self.peer.write(writer);
        self.received_at.write(writer);
        self.status.write(writer);
        write_option_string(&self.error, writer);
    }
}

impl Read for ActionAck {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            action: Digest::read(reader)?,
            peer: PeerId::read(reader)?,
            received_at: u64::read(reader)?,
            status: AckStatus::read(reader)?,
            error: read_option_string(reader, MAX_TEXT_LEN)?,
        })
    }
}

impl EncodeSize for ActionAck {
    fn encode_size(&self) -> usize {
        self.action.encode_size()
            + self.peer.encode_size()
            + self.received_at.encode_size()
            + self.status.encode_size()
            + option_string_encode_size(&self.error)
    }
}

/// Periodic state-hash report exchanged between peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashReport {
    pub peer: PeerId,
    pub state_hash: Digest,
    /// Number of actions the sender had applied when it derived the hash.
    pub sequence: u64,
}

impl Write for HashReport {
    fn write(&self, writer: &mut impl BufMut) {
        self.peer.write(writer);
        self.state_hash.write(writer);
        self.sequence.write(writer);
    }
}

impl Read for HashReport {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            peer: PeerId::read(reader)?,
            state_hash: Digest::read(reader)?,
            sequence: u64::read(reader)?,
        })
    }
}

impl EncodeSize for HashReport {
    fn encode_size(&self) -> usize {
        self.peer.encode_size() + self.state_hash.encode_size() + self.sequence.encode_size()
    }
}

/// Notice that the sender has observed a sustained hash mismatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesyncAlert {
    pub peer: PeerId,
    pub local_hash: Digest,
    pub remote_hash: Digest,
    pub conflict_sequence: u64,
    pub timestamp: u64,
}

impl Write for DesyncAlert {
    fn write(&self, writer: &mut impl BufMut) {
        self.peer.write(writer);
        self.local_hash.write(writer);
        self.remote_hash.write(writer);
        self.conflict_sequence.write(writer);
        self.timestamp.write(writer);
    }
}

impl Read for DesyncAlert {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            peer: PeerId::read(reader)?,
            local_hash: Digest::read(reader)?,
            remote_hash: Digest::read(reader)?,
            conflict_sequence: u64::read(reader)?,
            timestamp: u64::read(reader)?,
        })
    }
}

impl EncodeSize for DesyncAlert {
    fn encode_size(&self) -> usize {
        self.peer.encode_size()
            + self.local_hash.encode_size()
            + self.remote_hash.encode_size()
            + self.conflict_sequence.encode_size()
            + self.timestamp.encode_size()
    }
}

/// How a sustained desync gets reconciled.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionStrategy {
    /// The session host's state is ground truth; everyone else converges to it.
    HostAuthoritative = 0,
    /// Roll back to the last confirmed-matching checkpoint and replay the log.
    ReplayFromCheckpoint = 1,
}

impl TryFrom<u8> for ResolutionStrategy {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResolutionStrategy::HostAuthoritative),
            1 => Ok(ResolutionStrategy::ReplayFromCheckpoint),
            _ => Err(()),
        }
    }
}

impl Write for ResolutionStrategy {
    fn write(&self, writer: &mut impl BufMut) {
        (*self as u8).write(writer);
    }
}

impl Read for ResolutionStrategy {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let value = u8::read(reader)?;
        ResolutionStrategy::try_from(value).map_err(|_| Error::InvalidEnum(value))
    }
}

impl EncodeSize for ResolutionStrategy {
    fn encode_size(&self) -> usize {
        1
    }
}

/// Terminal record of one escalated desync and its outcome.
///
/// Never mutated after creation, only superseded by a newer record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConflictResolution {
    pub strategy: ResolutionStrategy,
    /// Applied-action count at which the conflict was declared.
    pub conflicting_sequence: u64,
    pub resolved: bool,
    pub description: String,
    /// State hash after the resolution ran.
    pub resulting_hash: Digest,
}

impl Write for ConflictResolution {
    fn write(&self, writer: &mut impl BufMut) {
        self.strategy.write(writer);
        self.conflicting_sequence.write(writer);
        self.resolved.write(writer);
        write_string(&self.description, writer);
        self.resulting_hash.write(writer);
    }
}

impl Read for ConflictResolution {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            strategy: ResolutionStrategy::read(reader)?,
            conflicting_sequence: u64::read(reader)?,
            resolved: bool::read(reader)?,
            description: read_string(reader, MAX_TEXT_LEN)?,
            resulting_hash: Digest::read(reader)?,
        })
    }
}

impl EncodeSize for ConflictResolution {
    fn encode_size(&self) -> usize {
        self.strategy.encode_size()
            + self.conflicting_sequence.encode_size()
            + self.resolved.encode_size()
            + string_encode_size(&self.description)
            + self.resulting_hash.encode_size()
    }
}

/// Everything one peer can say to another.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Message {
    /// A committed action being propagated.
    Action(DeterministicAction),
    /// Delivery acknowledgment for a previously sent action.
    Ack(ActionAck),
    /// Periodic consistency fingerprint.
    StateHash(HashReport),
    /// Sustained mismatch observed; conflict resolution is starting.
    DesyncAlert(DesyncAlert),
    /// Outcome of a conflict resolution at the sender.
    ConflictResolution {
        peer: PeerId,
        resolution: ConflictResolution,
    },
    /// Request for the sender's full ordered action history.
    SyncRequest { peer: PeerId },
    /// Full ordered action history, for catch-up.
    SyncResponse {
        peer: PeerId,
        actions: Vec<DeterministicAction>,
    },
}

impl Write for Message {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Message::Action(action) => {
                0u8.write(writer);
                action.write(writer);
            }
            Message::Ack(ack) => {
                1u8.write(writer);
                ack.write(writer);
            }
            Message::StateHash(report) => {
                2u8.write(writer);
                report.write(writer);
            }
            Message::DesyncAlert(alert) => {
                3u8.write(writer);
                alert.write(writer);
            }
            Message::ConflictResolution { peer, resolution } => {
                4u8.write(writer);
                peer.write(writer);
                resolution.write(writer);
            }
            Message::SyncRequest { peer } => {
                5u8.write(writer);
                peer.write(writer);
            }
            Message::SyncResponse { peer, actions } => {
                6u8.write(writer);
                peer.write(writer);
                actions.write(writer);
            }
        }
    }
}

impl Read for Message {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let kind = u8::read(reader)?;
        match kind {
            0 => Ok(Message::Action(DeterministicAction::read(reader)?)),
            1 => Ok(Message::Ack(ActionAck::read(reader)?)),
            2 => Ok(Message::StateHash(HashReport::read(reader)?)),
            3 => Ok(Message::DesyncAlert(DesyncAlert::read(reader)?)),
            4 => Ok(Message::ConflictResolution {
                peer: PeerId::read(reader)?,
                resolution: ConflictResolution::read(reader)?,
            }),
            5 => Ok(Message::SyncRequest {
                peer: PeerId::read(reader)?,
            }),
            6 => Ok(Message::SyncResponse {
                peer: PeerId::read(reader)?,
                actions: Vec::read_range(reader, 0..=MAX_SYNC_RESPONSE_ACTIONS)?,
            }),
            _ => Err(Error::InvalidEnum(kind)),
        }
    }
}

impl EncodeSize for Message {
    fn encode_size(&self) -> usize {
        1 + match self {
            Message::Action(action) => action.encode_size(),
            Message::Ack(ack) => ack.encode_size(),
            Message::StateHash(report) => report.encode_size(),
            Message::DesyncAlert(alert) => alert.encode_size(),
            Message::ConflictResolution { peer, resolution } => {
                peer.encode_size() + resolution.encode_size()
            }
            Message::SyncRequest { peer } => peer.encode_size(),
            Message::SyncResponse { peer, actions } => peer.encode_size() + actions.encode_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use commonware_codec::{DecodeExt, Encode};
    use commonware_cryptography::{ed25519::PrivateKey, Digestible, Hasher, Sha256, Signer};

    fn peer(seed: u64) -> PeerId {
        PrivateKey::from_seed(seed).public_key()
    }

    fn action(seed: u64, sequence: u64) -> DeterministicAction {
        DeterministicAction {
            peer: peer(seed),
            sequence,
            kind: "draw-card".to_string(),
            payload: Bytes::new(),
            committed_at: 10,
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = Message::decode([9u8].as_ref()).expect_err("tag 9 is unassigned");
        assert!(matches!(err, Error::InvalidEnum(9)));
    }

    #[test]
    fn ack_round_trips_with_error_text() {
        let a = action(1, 1);
        let ack = Message::Ack(ActionAck {
            action: a.digest(),
            peer: peer(2),
            received_at: 99,
            status: AckStatus::Failed,
            error: Some("not your turn".to_string()),
        });
        let decoded = Message::decode(ack.encode().as_ref()).expect("valid ack decodes");
        assert_eq!(decoded, ack);
    }

    #[test]
    fn sync_response_rejects_oversized_history() {
        // Hand-build a response claiming more actions than the bound allows.
        let mut buf = Vec::new();
        6u8.write(&mut buf);
        peer(1).write(&mut buf);
        ((MAX_SYNC_RESPONSE_ACTIONS + 1) as u32).write(&mut buf);
        assert!(Message::decode(buf.as_ref()).is_err());
    }

    #[test]
    fn truncated_action_is_rejected() {
        let encoded = Message::Action(action(1, 5)).encode();
        let truncated = &encoded.as_ref()[..encoded.len() - 3];
        assert!(Message::decode(truncated).is_err());
    }

    #[test]
    fn resolution_round_trips() {
        let message = Message::ConflictResolution {
            peer: peer(3),
            resolution: ConflictResolution {
                strategy: ResolutionStrategy::HostAuthoritative,
                conflicting_sequence: 12,
                resolved: true,
                description: "host state adopted".to_string(),
                resulting_hash: Sha256::hash(b"state"),
            },
        };
        let decoded = Message::decode(message.encode().as_ref()).expect("valid message decodes");
        assert_eq!(decoded, message);
    }
}
