//! A single piece: its blocks and the arena buffer they're assembled into.

use sha1::{Digest, Sha1};

use crate::{
    block_count, block_len,
    error::{Error, Result},
    PieceIndex, Sha1Hash, BLOCK_LEN,
};

use super::block::{Block, BlockStatus};

/// A piece and the blocks it's divided into.
///
/// The assembled bytes live in a single buffer allocated on first block
/// receipt and freed again on hash mismatch or once the piece is flushed to
/// disk, rather than each block carrying its own heap allocation.
#[derive(Debug)]
pub struct Piece {
    pub index: PieceIndex,
    pub is_last: bool,
    pub len: u32,
    pub blocks: Vec<Block>,
    buffer: Option<Vec<u8>>,
}

impl Piece {
    pub fn new(index: PieceIndex, len: u32, is_last: bool) -> Self {
        let count = block_count(len);
        let blocks = (0..count)
            .map(|i| Block::new(i as u32 * BLOCK_LEN, block_len(len, i)))
            .collect();
        Self {
            index,
            is_last,
            len,
            blocks,
            buffer: None,
        }
    }

    pub fn block_mut(&mut self, begin: u32) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.begin == begin)
    }

    pub fn block(&self, begin: u32) -> Option<&Block> {
        self.blocks.iter().find(|b| b.begin == begin)
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| b.status == BlockStatus::Available)
    }

    /// Writes `data` at `begin`, allocating the arena buffer on first call.
    /// Marks the block AVAILABLE. Fails if there's no block at `begin` or if
    /// `data`'s length doesn't match the block's declared length.
    pub fn write_block(&mut self, begin: u32, data: &[u8]) -> Result<()> {
        let len = self.len;
        let index = self.index;
        let block = self.block_mut(begin).ok_or_else(|| {
            Error::Fatal(format!("no block at begin {} in piece {}", begin, index))
        })?;
        if data.len() as u32 != block.length {
            return Err(Error::Fatal(format!(
                "piece {} block {} expected {} bytes, got {}",
                index,
                begin,
                block.length,
                data.len()
            )));
        }
        let buffer = self.buffer.get_or_insert_with(|| vec![0; len as usize]);
        let start = begin as usize;
        buffer[start..start + data.len()].copy_from_slice(data);
        block.status = BlockStatus::Available;
        Ok(())
    }

    /// Computes the SHA-1 of the assembled buffer and compares it to
    /// `expected`. On mismatch, resets every block to MISSING and frees the
    /// buffer.
    ///
    /// # Panics
    ///
    /// Panics if called before every block is AVAILABLE, since the buffer
    /// would not yet hold a complete piece.
    pub fn verify(&mut self, expected: &Sha1Hash) -> bool {
        assert!(self.is_complete(), "verify called on an incomplete piece");
        let buffer = self
            .buffer
            .as_ref()
            .expect("complete piece must have an arena buffer");
        let digest = Sha1::digest(buffer);
        if digest.as_slice() == expected {
            true
        } else {
            self.reset();
            false
        }
    }

    /// Resets every block to MISSING and frees the arena buffer.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.status = BlockStatus::Missing;
        }
        self.buffer = None;
    }

    /// Takes ownership of the verified buffer, freeing the arena.
    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        self.buffer.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_blocks_for_exact_multiple_piece() {
        let piece = Piece::new(0, 2 * BLOCK_LEN, false);
        assert_eq!(piece.blocks.len(), 2);
        assert_eq!(piece.blocks[0].begin, 0);
        assert_eq!(piece.blocks[1].begin, BLOCK_LEN);
    }

    #[test]
    fn builds_blocks_for_short_last_piece() {
        let piece = Piece::new(4, BLOCK_LEN + 100, true);
        assert_eq!(piece.blocks.len(), 2);
        assert_eq!(piece.blocks[1].length, 100);
    }

    #[test]
    fn write_block_rejects_length_mismatch() {
        let mut piece = Piece::new(0, BLOCK_LEN, false);
        let err = piece.write_block(0, &[0; 10]);
        assert!(err.is_err());
    }

    #[test]
    fn verify_resets_piece_on_mismatch() {
        let mut piece = Piece::new(0, BLOCK_LEN, false);
        piece
            .write_block(0, &vec![0xAB; BLOCK_LEN as usize])
            .unwrap();
        assert!(piece.is_complete());
        let bogus_hash = [0u8; 20];
        assert!(!piece.verify(&bogus_hash));
        assert!(!piece.is_complete());
        assert!(piece.take_buffer().is_none());
    }

    #[test]
    fn verify_accepts_matching_hash() {
        let mut piece = Piece::new(0, BLOCK_LEN, false);
        let data = vec![0x42; BLOCK_LEN as usize];
        piece.write_block(0, &data).unwrap();
        let digest = Sha1::digest(&data);
        let mut expected = [0u8; 20];
        expected.copy_from_slice(&digest);
        assert!(piece.verify(&expected));
        assert_eq!(piece.take_buffer(), Some(data));
    }
}
