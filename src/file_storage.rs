//! Maps piece bytes onto a single- or multi-file layout on disk.

use std::io::SeekFrom;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::{
    error::{Error, Result},
    storage_info::{FileInfo, FsStructure, StorageInfo},
    PieceIndex,
};

/// Writes verified pieces to their place in a single- or multi-file
/// download, creating parent directories and files lazily.
pub struct FileStorage {
    info: StorageInfo,
}

impl FileStorage {
    pub fn new(info: StorageInfo) -> Self {
        Self { info }
    }

    /// Writes a complete, already-verified piece's bytes to disk, splitting
    /// them across every file the piece's byte range intersects.
    pub async fn write_piece(&self, index: PieceIndex, bytes: &[u8]) -> Result<()> {
        let piece_len = self.info.piece_len(index)?;
        if bytes.len() as u32 != piece_len {
            return Err(Error::Fatal(format!(
                "piece {} expected {} bytes, got {}",
                index,
                piece_len,
                bytes.len()
            )));
        }
        let piece_start = index as u64 * self.info.piece_len as u64;

        match &self.info.structure {
            FsStructure::File(file) => self.write_into_file(file, piece_start, bytes).await,
            FsStructure::Archive { files } => {
                let range = self.info.files_intersecting_piece(index)?;
                for file in &files[range] {
                    self.write_into_file(file, piece_start, bytes).await?;
                }
                Ok(())
            }
        }
    }

    /// Writes the slice of `piece_bytes` that overlaps `file`'s byte range
    /// into `file`, at the appropriate offset.
    async fn write_into_file(
        &self,
        file: &FileInfo,
        piece_start: u64,
        piece_bytes: &[u8],
    ) -> Result<()> {
        let piece_end = piece_start + piece_bytes.len() as u64;
        let start = piece_start.max(file.torrent_offset);
        if start >= piece_end || start >= file.torrent_end_offset() {
            // piece and file ranges don't actually overlap
            return Ok(());
        }
        let remaining_piece_len = piece_end - start;
        let slice = file.get_slice(start, remaining_piece_len);

        let data_start = (start - piece_start) as usize;
        let data = &piece_bytes[data_start..data_start + slice.len as usize];

        let path = self.info.download_dir.join(&file.path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .await?;
        handle.seek(SeekFrom::Start(slice.offset)).await?;
        handle.write_all(data).await?;
        log::debug!(
            "wrote {} bytes to {:?} at offset {}",
            data.len(),
            path,
            slice.offset
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[tokio::test]
    async fn writes_single_file_piece_at_correct_offset() {
        let dir = tempfile_dir();
        let info = StorageInfo {
            piece_count: 2,
            piece_len: 4,
            last_piece_len: 4,
            download_len: 8,
            download_dir: dir.clone(),
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("out.bin"),
                len: 8,
                torrent_offset: 0,
            }),
        };
        let storage = FileStorage::new(info);
        storage.write_piece(1, b"BBBB").await.unwrap();
        storage.write_piece(0, b"AAAA").await.unwrap();

        let contents = std::fs::read(dir.join("out.bin")).unwrap();
        assert_eq!(&contents, b"AAAABBBB");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn writes_multi_file_piece_spanning_two_files() {
        let dir = tempfile_dir();
        let files = vec![
            FileInfo {
                path: PathBuf::from("a.bin"),
                len: 3,
                torrent_offset: 0,
            },
            FileInfo {
                path: PathBuf::from("sub/b.bin"),
                len: 5,
                torrent_offset: 3,
            },
        ];
        let info = StorageInfo {
            piece_count: 1,
            piece_len: 8,
            last_piece_len: 8,
            download_len: 8,
            download_dir: dir.clone(),
            structure: FsStructure::Archive { files },
        };
        let storage = FileStorage::new(info);
        storage.write_piece(0, b"ABCDEFGH").await.unwrap();

        assert_eq!(std::fs::read(dir.join("a.bin")).unwrap(), b"ABC");
        assert_eq!(std::fs::read(dir.join("sub/b.bin")).unwrap(), b"DEFGH");

        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempfile_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("bitleech-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
