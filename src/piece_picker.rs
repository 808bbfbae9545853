//! Piece availability bookkeeping and selection.
//!
//! Tracks, for every piece in the torrent, how many connected peers have it
//! and whether we have it ourselves, and picks the next piece a session
//! should start downloading: rarest-first once we have a handful of pieces
//! to reciprocate with, random-first before that so we quickly have
//! something to offer.

use rand::seq::IteratorRandom;

use crate::{Bitfield, PieceIndex, Result};

/// The minimum number of pieces we need to have before switching from
/// random-first to rarest-first piece selection.
const RANDOM_FIRST_PIECE_COUNT: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PieceState {
    /// Nobody is currently downloading this piece.
    Missing,
    /// Some session has started downloading this piece.
    Pending,
    /// The piece is downloaded, verified, and written to disk.
    Have,
}

/// Owns the piece availability table shared by all of a torrent's sessions.
pub(crate) struct PiecePicker {
    /// Per piece, how many connected peers are known to have it.
    availability: Vec<u16>,
    /// Per piece download state, from our own point of view.
    states: Vec<PieceState>,
    /// The number of pieces we have. Cached so `pick_piece` doesn't have to
    /// scan `states` to decide whether to pick randomly or by rarity.
    have_count: usize,
}

impl PiecePicker {
    pub fn new(piece_count: usize) -> Self {
        Self {
            availability: vec![0; piece_count],
            states: vec![PieceState::Missing; piece_count],
            have_count: 0,
        }
    }

    /// Registers a peer's bitfield, incrementing the availability count of
    /// every piece it has.
    ///
    /// Returns whether we are interested in this peer, i.e. whether it has
    /// at least one piece we don't have yet.
    pub fn register_availability(
        &mut self,
        bitfield: &Bitfield,
    ) -> Result<bool> {
        let mut interested = false;
        for (index, has_piece) in bitfield.iter().enumerate() {
            if !*has_piece {
                continue;
            }
            self.availability[index] += 1;
            if self.states[index] != PieceState::Have {
                interested = true;
            }
        }
        Ok(interested)
    }

    /// Marks a single piece as newly available from some peer, e.g. in
    /// response to a `Have` message.
    pub fn register_piece_availability(&mut self, index: PieceIndex) {
        self.availability[index] += 1;
    }

    /// Picks the next piece to download: rarest-first once we have at least
    /// [`RANDOM_FIRST_PIECE_COUNT`] pieces, random-first before that.
    ///
    /// Only considers pieces `peer_pieces` marks as held, so a session is
    /// never told to request a piece its peer doesn't actually have.
    ///
    /// The returned piece is immediately marked `Pending` so concurrent
    /// callers don't pick the same piece twice.
    pub fn pick_piece(&mut self, peer_pieces: &Bitfield) -> Option<PieceIndex> {
        let peer_has: Vec<bool> =
            peer_pieces.iter().map(|has_piece| *has_piece).collect();
        let candidates = (0..self.states.len())
            .filter(|&i| {
                self.states[i] == PieceState::Missing
                    && self.availability[i] > 0
                    && peer_has.get(i).copied().unwrap_or(false)
            })
            .collect::<Vec<_>>();

        let picked = if self.have_count < RANDOM_FIRST_PIECE_COUNT {
            candidates.into_iter().choose(&mut rand::thread_rng())
        } else {
            candidates
                .into_iter()
                .min_by_key(|&i| (self.availability[i], i))
        };

        if let Some(index) = picked {
            self.states[index] = PieceState::Pending;
        }
        picked
    }

    /// Marks a piece as fully downloaded and verified.
    pub fn received_piece(&mut self, index: PieceIndex) {
        if self.states[index] != PieceState::Have {
            self.states[index] = PieceState::Have;
            self.have_count += 1;
        }
    }

    /// Resets a piece back to `Missing` after it failed verification,
    /// discarding whatever progress was made on it.
    pub fn reset_piece(&mut self, index: PieceIndex) {
        if self.states[index] == PieceState::Have {
            self.have_count -= 1;
        }
        self.states[index] = PieceState::Missing;
    }

    /// Returns true once every piece has been received and verified.
    pub fn is_complete(&self) -> bool {
        self.have_count == self.states.len()
    }

    /// Returns the number of pieces received and verified so far.
    pub fn have_count(&self) -> usize {
        self.have_count
    }

    /// Builds a bitfield reflecting the pieces we currently have, for
    /// sending to a newly connected peer.
    pub fn to_bitfield(&self) -> Bitfield {
        let mut bitfield = Bitfield::new();
        for state in &self.states {
            bitfield.push(*state == PieceState::Have);
        }
        bitfield
    }

    /// Returns whether the given piece has already been downloaded and
    /// verified.
    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.states[index] == PieceState::Have
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    fn bitfield(pieces: &[usize], len: usize) -> Bitfield {
        let mut bf = bitvec![Msb0, u8; 0; len];
        for &i in pieces {
            bf.set(i, true);
        }
        bf
    }

    #[test]
    fn becomes_interested_when_peer_has_missing_piece() {
        let mut picker = PiecePicker::new(4);
        let interested =
            picker.register_availability(&bitfield(&[0, 2], 4)).unwrap();
        assert!(interested);
    }

    #[test]
    fn not_interested_once_everything_is_had() {
        let mut picker = PiecePicker::new(2);
        picker.received_piece(0);
        picker.received_piece(1);
        let interested =
            picker.register_availability(&bitfield(&[0, 1], 2)).unwrap();
        assert!(!interested);
    }

    #[test]
    fn picks_rarest_piece_first_after_warmup() {
        let mut picker = PiecePicker::new(3);
        picker.have_count = RANDOM_FIRST_PIECE_COUNT;
        picker.availability = vec![5, 1, 3];
        picker.states = vec![PieceState::Missing; 3];
        let peer_has = bitfield(&[0, 1, 2], 3);
        let picked = picker.pick_piece(&peer_has);
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn pending_pieces_are_not_picked_twice() {
        let mut picker = PiecePicker::new(2);
        picker.have_count = RANDOM_FIRST_PIECE_COUNT;
        picker.availability = vec![1, 1];
        let peer_has = bitfield(&[0, 1], 2);
        let first = picker.pick_piece(&peer_has);
        assert!(first.is_some());
        let second = picker.pick_piece(&peer_has);
        assert_ne!(first, second);
    }

    #[test]
    fn does_not_pick_a_piece_the_peer_lacks() {
        let mut picker = PiecePicker::new(3);
        picker.have_count = RANDOM_FIRST_PIECE_COUNT;
        picker.availability = vec![1, 1, 1];
        let peer_has = bitfield(&[1], 3);
        let picked = picker.pick_piece(&peer_has);
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn to_bitfield_reflects_have_pieces() {
        let mut picker = PiecePicker::new(3);
        picker.received_piece(1);
        assert_eq!(picker.to_bitfield(), bitfield(&[1], 3));
    }

    #[test]
    fn reset_piece_returns_it_to_missing() {
        let mut picker = PiecePicker::new(1);
        picker.received_piece(0);
        assert!(picker.is_complete());
        picker.reset_piece(0);
        assert!(!picker.is_complete());
    }
}
