//! Decoding of the bencoded metadata (".torrent") file.
//!
//! This module only concerns itself with turning the bencoded bytes into a
//! validated, typed [`Metainfo`]. Deriving per-piece and per-file storage
//! details from it is [`storage_info`](crate::storage_info)'s job.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    storage_info::{FileInfo, FsStructure},
    PieceIndex, Sha1Hash,
};

const SHA1_HASH_LEN: usize = 20;

/// A fully parsed and validated torrent metainfo.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The name of the torrent. Used as the download directory name for
    /// multi-file torrents, and as the file name for single-file ones.
    pub name: String,
    /// SHA-1 of the bencoded `info` dictionary; the content identifier.
    pub info_hash: Sha1Hash,
    /// The nominal length of a piece. The last piece may be shorter.
    pub piece_len: u32,
    /// The concatenation of each piece's 20 byte SHA-1 hash, in piece order.
    pub pieces_hash: Vec<u8>,
    /// The file(s) that make up the torrent's content.
    pub structure: FsStructure,
    /// Tracker tiers, preserved in announce-list order. A torrent with only
    /// a flat `announce` field is represented as a single one-element tier.
    pub trackers: Vec<Vec<String>>,
    /// Whether the torrent is marked private (no DHT/PEX, irrelevant here
    /// since neither is implemented, but kept for completeness).
    pub private: bool,
}

impl Metainfo {
    /// Parses and validates a metainfo file's raw bencoded bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;
        raw.into_metainfo()
    }

    /// Returns the number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.pieces_hash.len() / SHA1_HASH_LEN
    }

    /// Returns the expected SHA-1 hash of the piece at `index`.
    pub fn piece_hash(&self, index: PieceIndex) -> Result<Sha1Hash> {
        let start = index
            .checked_mul(SHA1_HASH_LEN)
            .filter(|&start| start + SHA1_HASH_LEN <= self.pieces_hash.len())
            .ok_or(Error::InvalidPieceIndex)?;
        let mut hash = [0; SHA1_HASH_LEN];
        hash.copy_from_slice(&self.pieces_hash[start..start + SHA1_HASH_LEN]);
        Ok(hash)
    }
}

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    info: RawInfo,
    announce: Option<String>,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u32,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    length: u64,
    path: Vec<String>,
}

impl RawMetainfo {
    fn into_metainfo(self) -> Result<Metainfo> {
        if self.info.pieces.len() % SHA1_HASH_LEN != 0 {
            return Err(Error::Fatal(format!(
                "pieces field length {} is not a multiple of {}",
                self.info.pieces.len(),
                SHA1_HASH_LEN
            )));
        }
        if self.info.pieces.is_empty() {
            return Err(Error::Fatal("torrent has zero pieces".into()));
        }

        let info_bytes = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info_bytes);
        let mut info_hash = [0; SHA1_HASH_LEN];
        info_hash.copy_from_slice(&digest);

        let structure = match (self.info.length, self.info.files) {
            (Some(len), None) => FsStructure::File(FileInfo {
                path: PathBuf::from(&self.info.name),
                len,
                torrent_offset: 0,
            }),
            (None, Some(files)) => {
                if files.is_empty() {
                    return Err(Error::Fatal("archive torrent lists no files".into()));
                }
                let mut torrent_offset = 0;
                let files = files
                    .into_iter()
                    .map(|file| {
                        let info = FileInfo {
                            path: file.path.iter().collect::<PathBuf>(),
                            len: file.length,
                            torrent_offset,
                        };
                        torrent_offset += file.length;
                        info
                    })
                    .collect();
                FsStructure::Archive { files }
            }
            (Some(_), Some(_)) => {
                return Err(Error::Fatal(
                    "metainfo carries both `length` and `files`".into(),
                ))
            }
            (None, None) => {
                return Err(Error::Fatal(
                    "metainfo carries neither `length` nor `files`".into(),
                ))
            }
        };

        let trackers = match self.announce_list {
            Some(tiers) if !tiers.is_empty() => tiers,
            _ => self.announce.into_iter().map(|url| vec![url]).collect(),
        };

        Ok(Metainfo {
            name: self.info.name,
            info_hash,
            piece_len: self.info.piece_length,
            pieces_hash: self.info.pieces,
            structure,
            trackers,
            private: self.info.private.unwrap_or(0) != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bencode_single_file(piece_hashes: usize) -> Vec<u8> {
        let pieces = vec![7u8; piece_hashes * SHA1_HASH_LEN];
        let mut out = Vec::new();
        out.extend_from_slice(b"d8:announce3:foo4:infod6:lengthi1024e4:name3:foo12:piece lengthi512e6:pieces");
        out.extend_from_slice(format!("{}:", pieces.len()).as_bytes());
        out.extend_from_slice(&pieces);
        out.extend_from_slice(b"ee");
        out
    }

    #[test]
    fn parses_single_file_torrent() {
        let buf = bencode_single_file(2);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.name, "foo");
        assert_eq!(metainfo.piece_len, 512);
        assert_eq!(metainfo.piece_count(), 2);
        assert!(!metainfo.structure.is_archive());
        assert_eq!(metainfo.trackers, vec![vec!["foo".to_string()]]);
    }

    #[test]
    fn rejects_truncated_pieces_field() {
        let mut buf = bencode_single_file(1);
        // truncate the last byte of the `pieces` string to break the 20 byte
        // multiple invariant
        buf.pop();
        assert!(Metainfo::from_bytes(&buf).is_err());
    }

    #[test]
    fn piece_hash_rejects_out_of_range_index() {
        let buf = bencode_single_file(1);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert!(metainfo.piece_hash(0).is_ok());
        assert!(metainfo.piece_hash(1).is_err());
    }
}
