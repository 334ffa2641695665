//! In-memory collaborators for tests: a capturing transport and a small
//! card-table rules engine with just enough behavior to exercise the
//! replication protocol.

use crate::{GameState, Rejection, Rules, Transport};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::DecodeExt;
use decksync_types::{DeterministicAction, Message, PeerId};
use std::collections::BTreeMap;

/// Transport that records every send for later inspection.
#[derive(Default)]
pub struct MemoryTransport {
    sent: Vec<(PeerId, Bytes)>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain every captured frame, decoded.
    pub fn drain(&mut self) -> Vec<(PeerId, Message)> {
        self.sent
            .drain(..)
            .map(|(peer, bytes)| {
                let message = Message::decode(bytes.as_ref()).expect("engine sent valid frame");
                (peer, message)
            })
            .collect()
    }

    /// Drain frames addressed to one peer, decoded.
    pub fn drain_for(&mut self, peer: &PeerId) -> Vec<Message> {
        let mut kept = Vec::new();
        let mut out = Vec::new();
        for (to, bytes) in self.sent.drain(..) {
            if &to == peer {
                out.push(Message::decode(bytes.as_ref()).expect("engine sent valid frame"));
            } else {
                kept.push((to, bytes));
            }
        }
        self.sent = kept;
        out
    }

    pub fn sent_len(&self) -> usize {
        self.sent.len()
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, peer: &PeerId, bytes: Bytes) {
        self.sent.push((peer.clone(), bytes));
    }
}

/// One player's side of the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerBoard {
    pub life: i64,
    pub library: Vec<u16>,
    pub hand: Vec<u16>,
    pub graveyard: Vec<u16>,
}

impl PlayerBoard {
    fn fresh() -> Self {
        Self {
            life: 20,
            library: (1..=30).collect(),
            hand: Vec::new(),
            graveyard: Vec::new(),
        }
    }
}

/// A tiny two-plus-player card table.
///
/// `selected_card` is deliberately ephemeral UI state: it never enters the
/// canonical serialization, so two tables that differ only in selection
/// still hash identically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CardTable {
    pub players: BTreeMap<PeerId, PlayerBoard>,
    pub turn: u64,
    pub selected_card: Option<u16>,
}

impl CardTable {
    pub fn new(players: Vec<PeerId>) -> Self {
        Self {
            players: players
                .into_iter()
                .map(|peer| (peer, PlayerBoard::fresh()))
                .collect(),
            turn: 0,
            selected_card: None,
        }
    }

    fn write_zone(zone: &[u16], writer: &mut impl BufMut) {
        writer.put_u32(zone.len() as u32);
        for card in zone {
            writer.put_u16(*card);
        }
    }
}

impl GameState for CardTable {
    fn canonical_write(&self, writer: &mut impl BufMut) {
        writer.put_u64(self.turn);
        // BTreeMap iteration is already sorted by peer id.
        for (peer, board) in &self.players {
            writer.put_slice(peer.as_ref());
            writer.put_i64(board.life);
            Self::write_zone(&board.library, writer);
            Self::write_zone(&board.hand, writer);
            Self::write_zone(&board.graveyard, writer);
        }
    }

    fn sections(&self) -> Vec<(String, Vec<u8>)> {
        let mut turn = Vec::new();
        turn.put_u64(self.turn);

        let mut life = Vec::new();
        let mut library = Vec::new();
        let mut hand = Vec::new();
        let mut graveyard = Vec::new();
        for (peer, board) in &self.players {
            life.put_slice(peer.as_ref());
            life.put_i64(board.life);
            for (zone, buf) in [
                (&board.library, &mut library),
                (&board.hand, &mut hand),
                (&board.graveyard, &mut graveyard),
            ] {
                buf.put_slice(peer.as_ref());
                Self::write_zone(zone, buf);
            }
        }

        vec![
            ("turn".to_string(), turn),
            ("life-total".to_string(), life),
            ("zone-contents:library".to_string(), library),
            ("zone-contents:hand".to_string(), hand),
            ("zone-contents:graveyard".to_string(), graveyard),
        ]
    }
}

/// Rules engine for [CardTable].
///
/// Pure: the same `(state, action)` pair always yields the same result.
#[derive(Clone, Copy, Debug, Default)]
pub struct TableRules;

impl Rules for TableRules {
    type State = CardTable;

    fn apply(
        &self,
        state: &CardTable,
        action: &DeterministicAction,
    ) -> Result<CardTable, Rejection> {
        let mut next = state.clone();
        let board = next
            .players
            .get_mut(&action.peer)
            .ok_or_else(|| Rejection("unknown player".to_string()))?;

        match action.kind.as_str() {
            "draw-card" => {
                let card = board
                    .library
                    .pop()
                    .ok_or_else(|| Rejection("library is empty".to_string()))?;
                board.hand.push(card);
            }
            "play-card" => {
                let mut payload = action.payload.clone();
                if payload.len() != 2 {
                    return Err(Rejection("play-card expects a 2-byte card id".to_string()));
                }
                let card = payload.get_u16();
                let index = board
                    .hand
                    .iter()
                    .position(|c| *c == card)
                    .ok_or_else(|| Rejection(format!("card {card} is not in hand")))?;
                board.hand.remove(index);
                board.graveyard.push(card);
            }
            "adjust-life" => {
                let mut payload = action.payload.clone();
                if payload.len() != 8 {
                    return Err(Rejection("adjust-life expects an 8-byte delta".to_string()));
                }
                board.life += payload.get_i64();
            }
            "pass-turn" => {
                next.turn += 1;
            }
            other => return Err(Rejection(format!("unknown action kind {other}"))),
        }

        // Any successful action clears transient selection.
        next.selected_card = None;
        Ok(next)
    }
}
