//! Global piece/block indexes shared between the leecher and the requester.

use std::collections::HashSet;

use crate::{
    bitfield::Bitfield,
    error::{Error, Result},
    metainfo::Metainfo,
    storage_info::StorageInfo,
    PieceIndex, Sha1Hash,
};

use super::{
    block::{BlockInfo, BlockStatus},
    piece::Piece,
};

/// Owns every [`Piece`] plus the three collections that partition all
/// `(piece, block)` pairs by status: `missing_blocks`, `requested_blocks`,
/// and each piece's own block statuses (AVAILABLE is implicit: neither
/// missing nor requested).
pub struct PieceManager {
    pieces: Vec<Piece>,
    missing_blocks: Vec<BlockInfo>,
    requested_blocks: HashSet<(PieceIndex, u32)>,
    availability_counter: Vec<u32>,
    local_bitfield: Bitfield,
    sort_by_rarity: bool,
}

/// The outcome of completing a piece's final block.
pub enum PieceOutcome {
    /// All blocks verified; here is the assembled piece to flush to disk.
    Verified(Vec<u8>),
    /// SHA-1 did not match; the piece's blocks were reset to MISSING and
    /// re-queued.
    HashMismatch,
}

impl PieceManager {
    pub fn new(metainfo: &Metainfo, storage: &StorageInfo, sort_by_rarity: bool) -> Result<Self> {
        let piece_count = storage.piece_count;
        if piece_count == 0 {
            return Err(Error::Fatal("torrent has no pieces".into()));
        }
        if metainfo.pieces_hash.len() != piece_count * 20 {
            return Err(Error::Fatal(
                "pieces hash length does not match declared piece count".into(),
            ));
        }

        let mut pieces = Vec::with_capacity(piece_count);
        let mut missing_blocks = Vec::new();
        for index in 0..piece_count {
            let len = storage.piece_len(index)?;
            let is_last = index == piece_count - 1;
            let piece = Piece::new(index, len, is_last);
            for block in &piece.blocks {
                missing_blocks.push(block.info(index));
            }
            pieces.push(piece);
        }

        Ok(Self {
            pieces,
            missing_blocks,
            requested_blocks: HashSet::new(),
            availability_counter: vec![0; piece_count],
            local_bitfield: Bitfield::new(piece_count),
            sort_by_rarity,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn local_bitfield(&self) -> &Bitfield {
        &self.local_bitfield
    }

    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.local_bitfield.has(index)
    }

    pub fn requested_count(&self) -> usize {
        self.requested_blocks.len()
    }

    /// Whether every piece has been downloaded and verified.
    pub fn is_complete(&self) -> bool {
        self.local_bitfield.is_full()
    }

    /// Ordered rarest-first (when `sort_by_rarity`) view of missing blocks,
    /// for the requester to pick candidates from.
    pub fn missing_blocks(&self) -> &[BlockInfo] {
        &self.missing_blocks
    }

    pub fn is_requested(&self, index: PieceIndex, begin: u32) -> bool {
        self.requested_blocks.contains(&(index, begin))
    }

    pub fn block_status(&self, index: PieceIndex, begin: u32) -> Option<BlockStatus> {
        self.pieces.get(index)?.block(begin).map(|b| b.status)
    }

    /// A peer announced `have(index)`. Ignores out-of-range indices.
    pub fn record_have(&mut self, index: PieceIndex) {
        if let Some(count) = self.availability_counter.get_mut(index) {
            *count += 1;
        }
        self.resort_missing_by_rarity();
    }

    /// A peer announced a bitfield: bump the availability counter for every
    /// set bit.
    pub fn record_bitfield(&mut self, bitfield: &Bitfield) {
        for index in bitfield.iter_set() {
            if let Some(count) = self.availability_counter.get_mut(index) {
                *count += 1;
            }
        }
        self.resort_missing_by_rarity();
    }

    /// Re-establishes rarest-first order across the whole queue. Without
    /// this, a block inserted while its piece was still rare keeps that
    /// position even after later peers make the piece common, since
    /// `insert_missing` only orders relative to counts at insertion time.
    fn resort_missing_by_rarity(&mut self) {
        if !self.sort_by_rarity {
            return;
        }
        let availability_counter = &self.availability_counter;
        self.missing_blocks.sort_by_key(|b| {
            availability_counter.get(b.index).copied().unwrap_or(0)
        });
    }

    /// Moves a block from MISSING to REQUESTED. No-op if it isn't currently
    /// missing (the caller is expected to have checked via
    /// [`missing_blocks`](Self::missing_blocks)).
    pub fn mark_requested(&mut self, info: BlockInfo) {
        if let Some(pos) = self
            .missing_blocks
            .iter()
            .position(|b| b.key() == info.key())
        {
            self.missing_blocks.remove(pos);
            self.requested_blocks.insert(info.key());
            if let Some(piece) = self.pieces.get_mut(info.index) {
                if let Some(block) = piece.block_mut(info.begin) {
                    block.status = BlockStatus::Requested;
                }
            }
        }
    }

    /// Reverts a REQUESTED block back to MISSING, e.g. after a timeout.
    pub fn revert_to_missing(&mut self, index: PieceIndex, begin: u32) {
        if !self.requested_blocks.remove(&(index, begin)) {
            return;
        }
        if let Some(piece) = self.pieces.get_mut(index) {
            if let Some(block) = piece.block_mut(begin) {
                block.status = BlockStatus::Missing;
                self.insert_missing(block.info(index));
            }
        }
    }

    /// Writes a received block's payload. Accepts blocks regardless of
    /// whether they were requested; the caller (the leecher) is responsible
    /// for the `accept_unrequested_blocks` policy check before calling this.
    pub fn write_block(&mut self, index: PieceIndex, begin: u32, data: &[u8]) -> Result<()> {
        self.requested_blocks.remove(&(index, begin));
        let piece = self
            .pieces
            .get_mut(index)
            .ok_or(Error::InvalidPieceIndex)?;
        piece.write_block(begin, data)
    }

    pub fn is_piece_complete(&self, index: PieceIndex) -> bool {
        self.pieces.get(index).map(|p| p.is_complete()).unwrap_or(false)
    }

    /// Verifies a now-fully-AVAILABLE piece against its expected hash. On a
    /// hash match, returns the assembled buffer and the caller is expected
    /// to flush it to disk and then call [`mark_complete`](Self::mark_complete).
    /// On mismatch, the piece's blocks are reset and re-queued as missing.
    pub fn finish_piece(&mut self, index: PieceIndex, expected: &Sha1Hash) -> Result<PieceOutcome> {
        let piece = self
            .pieces
            .get_mut(index)
            .ok_or(Error::InvalidPieceIndex)?;
        if piece.verify(expected) {
            let buffer = piece
                .take_buffer()
                .expect("verified piece must still hold its buffer");
            Ok(PieceOutcome::Verified(buffer))
        } else {
            let infos: Vec<_> = piece.blocks.iter().map(|b| b.info(index)).collect();
            for info in infos {
                self.requested_blocks.remove(&info.key());
                self.insert_missing(info);
            }
            Ok(PieceOutcome::HashMismatch)
        }
    }

    /// Marks a piece as locally complete after its bytes have been flushed
    /// to disk.
    pub fn mark_complete(&mut self, index: PieceIndex) {
        self.local_bitfield.set(index);
    }

    fn insert_missing(&mut self, info: BlockInfo) {
        if self.sort_by_rarity {
            let rarity = self.availability_counter.get(info.index).copied().unwrap_or(0);
            let availability_counter = &self.availability_counter;
            let pos = self
                .missing_blocks
                .partition_point(|b| availability_counter.get(b.index).copied().unwrap_or(0) <= rarity);
            self.missing_blocks.insert(pos, info);
        } else {
            self.missing_blocks.push(info);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::storage_info::{FileInfo, FsStructure};

    fn manager(piece_len: u32, download_len: u64, sort_by_rarity: bool) -> PieceManager {
        let piece_count = ((download_len + piece_len as u64 - 1) / piece_len as u64) as usize;
        let last_piece_len =
            (download_len - piece_len as u64 * (piece_count as u64 - 1)) as u32;
        let metainfo = Metainfo {
            name: "t".into(),
            info_hash: [0; 20],
            piece_len,
            pieces_hash: vec![0u8; piece_count * 20],
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("t"),
                len: download_len,
                torrent_offset: 0,
            }),
            trackers: vec![],
            private: false,
        };
        let storage = StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir: PathBuf::from("/tmp"),
            structure: metainfo.structure.clone(),
        };
        PieceManager::new(&metainfo, &storage, sort_by_rarity).unwrap()
    }

    #[test]
    fn starts_with_every_block_missing() {
        let mgr = manager(32768, 32768, true);
        assert_eq!(mgr.missing_blocks().len(), 2);
        assert_eq!(mgr.piece_count(), 1);
    }

    #[test]
    fn mark_requested_moves_block_out_of_missing() {
        let mut mgr = manager(16384, 16384, true);
        let info = mgr.missing_blocks()[0];
        mgr.mark_requested(info);
        assert!(mgr.missing_blocks().is_empty());
        assert!(mgr.is_requested(info.index, info.begin));
        assert_eq!(
            mgr.block_status(info.index, info.begin),
            Some(BlockStatus::Requested)
        );
    }

    #[test]
    fn revert_to_missing_requeues_block() {
        let mut mgr = manager(16384, 16384, true);
        let info = mgr.missing_blocks()[0];
        mgr.mark_requested(info);
        mgr.revert_to_missing(info.index, info.begin);
        assert_eq!(mgr.missing_blocks().len(), 1);
        assert!(!mgr.is_requested(info.index, info.begin));
    }

    #[test]
    fn rarity_ordering_prefers_lower_availability() {
        let mut mgr = manager(16384, 3 * 16384, true);
        // piece 0 -> availability 3, piece 1 -> 1, piece 2 -> 2
        for _ in 0..3 {
            mgr.record_have(0);
        }
        mgr.record_have(1);
        for _ in 0..2 {
            mgr.record_have(2);
        }
        // re-derive ordering by reverting and re-inserting through the
        // public API, since availability is recorded after construction
        let blocks: Vec<_> = mgr.missing_blocks().to_vec();
        for b in &blocks {
            mgr.mark_requested(*b);
        }
        for b in &blocks {
            mgr.revert_to_missing(b.index, b.begin);
        }
        let ordered: Vec<_> = mgr.missing_blocks().iter().map(|b| b.index).collect();
        assert_eq!(ordered, vec![1, 2, 0]);
    }

    #[test]
    fn hash_mismatch_requeues_all_blocks_in_piece() {
        let mut mgr = manager(16384, 16384, true);
        let info = mgr.missing_blocks()[0];
        mgr.mark_requested(info);
        mgr.write_block(info.index, info.begin, &vec![1u8; 16384]).unwrap();
        assert!(mgr.is_piece_complete(0));
        let bogus = [0u8; 20];
        match mgr.finish_piece(0, &bogus).unwrap() {
            PieceOutcome::HashMismatch => {}
            PieceOutcome::Verified(_) => panic!("expected hash mismatch"),
        }
        assert_eq!(mgr.missing_blocks().len(), 1);
        assert!(!mgr.has_piece(0));
    }
}
