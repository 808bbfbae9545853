//! Tracks an in-progress download of a single piece: which blocks have
//! been requested and which have arrived.

use crate::{block_count, block_len, BlockInfo, PieceIndex, BLOCK_LEN};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockStatus {
    /// Not yet requested from any peer.
    Free,
    /// Requested, awaiting delivery.
    Requested,
    /// Received and buffered, pending the piece-level hash check.
    Received,
}

/// A single piece's block-level request/delivery pipeline, owned by the
/// session that started downloading it.
pub(crate) struct PieceDownload {
    /// The index of the piece being downloaded.
    index: PieceIndex,
    /// The length of this piece (may be shorter than the nominal piece
    /// length if this is the torrent's last piece).
    piece_len: u32,
    /// Status of each block in the piece.
    blocks: Vec<BlockStatus>,
}

impl PieceDownload {
    pub fn new(index: PieceIndex, piece_len: u32) -> Self {
        Self {
            index,
            piece_len,
            blocks: vec![BlockStatus::Free; block_count(piece_len)],
        }
    }

    pub fn piece_index(&self) -> PieceIndex {
        self.index
    }

    /// Picks up to `count` free blocks and marks them `Requested`, pushing
    /// their [`BlockInfo`] onto `out`.
    pub fn pick_blocks(&mut self, count: usize, out: &mut Vec<BlockInfo>) {
        let mut picked = 0;
        for (i, status) in self.blocks.iter_mut().enumerate() {
            if picked == count {
                break;
            }
            if *status == BlockStatus::Free {
                *status = BlockStatus::Requested;
                out.push(BlockInfo {
                    piece_index: self.index,
                    offset: i as u32 * BLOCK_LEN,
                    len: block_len(self.piece_len, i),
                });
                picked += 1;
            }
        }
    }

    /// Marks the block described by `block_info` as received.
    pub fn received_block(&mut self, block_info: BlockInfo) {
        let i = block_info.index_in_piece();
        if i < self.blocks.len() {
            self.blocks[i] = BlockStatus::Received;
        }
    }

    /// Frees a previously requested block, e.g. after its request timed out,
    /// so it can be requested again (possibly from a different peer).
    pub fn free_block(&mut self, block_info: BlockInfo) {
        let i = block_info.index_in_piece();
        if i < self.blocks.len() && self.blocks[i] == BlockStatus::Requested {
            self.blocks[i] = BlockStatus::Free;
        }
    }

    /// The number of blocks not yet received.
    pub fn count_missing_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|s| **s != BlockStatus::Received)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_all_blocks_of_a_small_piece() {
        let mut download = PieceDownload::new(0, BLOCK_LEN);
        let mut blocks = Vec::new();
        download.pick_blocks(10, &mut blocks);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len, BLOCK_LEN);
    }

    #[test]
    fn does_not_repick_requested_blocks() {
        let mut download = PieceDownload::new(0, 2 * BLOCK_LEN);
        let mut first = Vec::new();
        download.pick_blocks(1, &mut first);
        let mut second = Vec::new();
        download.pick_blocks(10, &mut second);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].offset, second[0].offset);
    }

    #[test]
    fn completes_once_all_blocks_received() {
        let mut download = PieceDownload::new(0, BLOCK_LEN);
        let mut blocks = Vec::new();
        download.pick_blocks(1, &mut blocks);
        assert_eq!(download.count_missing_blocks(), 1);
        download.received_block(blocks[0]);
        assert_eq!(download.count_missing_blocks(), 0);
    }

    #[test]
    fn freeing_a_block_makes_it_pickable_again() {
        let mut download = PieceDownload::new(0, BLOCK_LEN);
        let mut blocks = Vec::new();
        download.pick_blocks(1, &mut blocks);
        download.free_block(blocks[0]);
        let mut again = Vec::new();
        download.pick_blocks(1, &mut again);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0], blocks[0]);
    }
}
