use crate::{
    codec::{
        bytes_encode_size, read_bytes, read_string, string_encode_size, write_bytes, write_string,
    },
    PeerId,
};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Error, Read, ReadExt, Write};
use commonware_cryptography::{sha256::Digest, Digestible, Hasher, Sha256};

/// Upper bound on the action kind discriminator.
pub const MAX_ACTION_KIND_LEN: usize = 64;

/// Upper bound on an action payload.
pub const MAX_ACTION_PAYLOAD_LEN: usize = 64 * 1024;

/// Dedup key for an action: actions are unique per `(origin, sequence)`.
pub type ActionKey = (PeerId, u64);

/// A committed, ordered, replayable unit of game input.
///
/// Created and owned by the originating peer; immutable once broadcast.
/// Sequence numbers are scoped per originating peer, assigned exactly once
/// at commit time and never reused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeterministicAction {
    /// The peer that committed this action.
    pub peer: PeerId,
    /// Position in the originating peer's local log.
    pub sequence: u64,
    /// Action discriminator interpreted by the rules engine (e.g. "draw-card").
    pub kind: String,
    /// Opaque payload interpreted by the rules engine.
    pub payload: Bytes,
    /// Wall-clock commit time at the origin, in milliseconds since the epoch.
    pub committed_at: u64,
}

impl DeterministicAction {
    /// Dedup key for this action.
    pub fn key(&self) -> ActionKey {
        (self.peer.clone(), self.sequence)
    }
}

impl Digestible for DeterministicAction {
    type Digest = Digest;

    fn digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(self.peer.as_ref());
        hasher.update(self.sequence.to_be_bytes().as_ref());
        hasher.update(self.kind.as_bytes());
        hasher.update(self.payload.as_ref());
        hasher.update(self.committed_at.to_be_bytes().as_ref());
        hasher.finalize()
    }
}

impl Write for DeterministicAction {
    fn write(&self, writer: &mut impl BufMut) {
        self.peer.write(writer);
        self.sequence.write(writer);
        write_string(&self.kind, writer);
        write_bytes(&self.payload, writer);
        self.committed_at.write(writer);
    }
}

impl Read for DeterministicAction {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let peer = PeerId::read(reader)?;
        let sequence = u64::read(reader)?;
        let kind = read_string(reader, MAX_ACTION_KIND_LEN)?;
        let payload = read_bytes(reader, MAX_ACTION_PAYLOAD_LEN)?;
        let committed_at = u64::read(reader)?;

        Ok(Self {
            peer,
            sequence,
            kind,
            payload,
            committed_at,
        })
    }
}

impl EncodeSize for DeterministicAction {
    fn encode_size(&self) -> usize {
        self.peer.encode_size()
            + self.sequence.encode_size()
            + string_encode_size(&self.kind)
            + bytes_encode_size(&self.payload)
            + self.committed_at.encode_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::{DecodeExt, Encode};
    use commonware_cryptography::{ed25519::PrivateKey, Signer};

    fn action(seed: u64, sequence: u64) -> DeterministicAction {
        DeterministicAction {
            peer: PrivateKey::from_seed(seed).public_key(),
            sequence,
            kind: "draw-card".to_string(),
            payload: Bytes::from_static(&[1, 2, 3]),
            committed_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn digest_is_stable_across_copies() {
        let a = action(1, 7);
        let b = a.clone();
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn digest_covers_every_field() {
        let base = action(1, 7);
        let mut other = base.clone();
        other.sequence += 1;
        assert_ne!(base.digest(), other.digest());

        let mut other = base.clone();
        other.kind = "play-card".to_string();
        assert_ne!(base.digest(), other.digest());

        let mut other = base.clone();
        other.committed_at += 1;
        assert_ne!(base.digest(), other.digest());
    }

    #[test]
    fn decode_rejects_oversized_kind() {
        let mut oversized = action(1, 1);
        oversized.kind = "x".repeat(MAX_ACTION_KIND_LEN + 1);
        let encoded = oversized.encode();
        assert!(DeterministicAction::decode(encoded.as_ref()).is_err());
    }

    #[test]
    fn round_trip_preserves_key() {
        let a = action(3, 42);
        let decoded =
            DeterministicAction::decode(a.encode().as_ref()).expect("valid encoding decodes");
        assert_eq!(decoded.key(), a.key());
        assert_eq!(decoded, a);
    }
}
