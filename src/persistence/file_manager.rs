use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use sha1::{Digest, Sha1};
use size::Size;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error on {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("piece {piece_idx} (len {len}) is out of range, total pieces: {total_pieces}")]
    OutOfRange {
        piece_idx: usize,
        len: usize,
        total_pieces: usize,
    },
    #[error("refusing to write outside of the download directory: {0}")]
    InvalidPath(String),
}

/// Where verified pieces end up.
pub trait PieceStorage: Send {
    fn read_piece(&mut self, piece_idx: usize) -> Result<Vec<u8>, StorageError>;
    fn write_piece(&mut self, piece_idx: usize, data: &[u8]) -> Result<(), StorageError>;
    fn shutdown(&mut self) -> Result<(), StorageError>;
}

#[derive(Debug)]
pub struct FileManager {
    file_path: PathBuf,
    file: File,
    total_length: u64,
    piece_length: u64,
    piece_hashes: Vec<[u8; 20]>, // piece identified by position in array -> hash
    preexisting: bool,
}

impl FileManager {
    pub fn new(
        base_path: &Path,
        file_name: &str,
        total_length: u64,
        piece_length: u64,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Result<FileManager, StorageError> {
        let file_name_path = Path::new(file_name);
        if file_name.is_empty()
            || file_name_path.is_absolute()
            || file_name_path
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidPath(file_name.to_string()));
        }
        let file_path = base_path.join(file_name_path);
        let io_err = |source| StorageError::Io {
            path: file_path.clone(),
            source,
        };

        if let Some(dir) = file_path.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let preexisting = match fs::metadata(&file_path) {
            Ok(m) => m.len() > 0,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(io_err(e)),
        };
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&file_path)
            .map_err(io_err)?;
        let current_len = file.metadata().map_err(io_err)?.len();
        if current_len != total_length {
            file.set_len(total_length).map_err(io_err)?;
        }

        log::debug!(
            "storing {} in {:#?}",
            Size::from_bytes(total_length),
            file_path
        );
        Ok(FileManager {
            file_path,
            file,
            total_length,
            piece_length,
            piece_hashes,
            preexisting,
        })
    }

    /// Hashes whatever is already on disk, so a previous run can be resumed.
    pub fn verify_existing_pieces(&mut self) -> Vec<bool> {
        let total_pieces = self.piece_hashes.len();
        let mut piece_completion_status = vec![false; total_pieces];
        if !self.preexisting {
            return piece_completion_status;
        }

        log::info!("checking pieces already downloaded...");
        let progress_step = (total_pieces / 10).max(1);
        for idx in 0..total_pieces {
            if idx % progress_step == 0 {
                log::info!(
                    "{}%...",
                    f64::round((idx as f64 * 100.0) / total_pieces as f64)
                );
            }
            let piece_data = match self.read_piece(idx) {
                Ok(data) => data,
                Err(e) => {
                    log::debug!("could not read piece {idx}: {e}");
                    continue;
                }
            };
            piece_completion_status[idx] = Sha1::digest(&piece_data)[..] == self.piece_hashes[idx];
        }

        let total_completed = piece_completion_status.iter().filter(|c| **c).count();
        log::info!(
            "checking pieces already downloaded completed: {} out of {} ({}%) pieces already completed",
            total_completed,
            total_pieces,
            total_completed * 100 / total_pieces.max(1)
        );
        piece_completion_status
    }

    fn piece_bounds(&self, piece_idx: usize) -> Result<(u64, usize), StorageError> {
        let start = piece_idx as u64 * self.piece_length;
        if piece_idx >= self.piece_hashes.len() || start >= self.total_length {
            return Err(StorageError::OutOfRange {
                piece_idx,
                len: 0,
                total_pieces: self.piece_hashes.len(),
            });
        }
        let len = self.piece_length.min(self.total_length - start) as usize;
        Ok((start, len))
    }

    fn io_err(&self, source: io::Error) -> StorageError {
        StorageError::Io {
            path: self.file_path.clone(),
            source,
        }
    }
}

impl PieceStorage for FileManager {
    fn read_piece(&mut self, piece_idx: usize) -> Result<Vec<u8>, StorageError> {
        let (start, len) = self.piece_bounds(piece_idx)?;
        let mut piece_buf: Vec<u8> = vec![0; len];
        self.file
            .seek(SeekFrom::Start(start))
            .map_err(|e| self.io_err(e))?;
        self.file
            .read_exact(&mut piece_buf)
            .map_err(|e| self.io_err(e))?;
        Ok(piece_buf)
    }

    fn write_piece(&mut self, piece_idx: usize, data: &[u8]) -> Result<(), StorageError> {
        let (start, len) = self.piece_bounds(piece_idx)?;
        if data.len() != len {
            return Err(StorageError::OutOfRange {
                piece_idx,
                len: data.len(),
                total_pieces: self.piece_hashes.len(),
            });
        }
        self.file
            .seek(SeekFrom::Start(start))
            .map_err(|e| self.io_err(e))?;
        self.file.write_all(data).map_err(|e| self.io_err(e))
    }

    fn shutdown(&mut self) -> Result<(), StorageError> {
        self.file.sync_all().map_err(|e| self.io_err(e))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use sha1::{Digest, Sha1};

    use super::*;

    fn temp_dir(test_name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "swarmfetch-{test_name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn hash(data: &[u8]) -> [u8; 20] {
        let mut h = [0; 20];
        h.copy_from_slice(&Sha1::digest(data));
        h
    }

    #[test]
    fn rejects_paths_escaping_base_dir() {
        let dir = temp_dir("paths");
        for name in ["../evil", "/etc/passwd", "a/../../b", ""] {
            assert_matches!(
                FileManager::new(&dir, name, 4, 4, vec![[0; 20]]),
                Err(StorageError::InvalidPath(_))
            );
        }
    }

    #[test]
    fn write_read_and_resume() {
        let dir = temp_dir("resume");
        let data = b"0123456789";
        let hashes = vec![hash(&data[0..4]), hash(&data[4..8]), hash(&data[8..10])];

        let mut fm = FileManager::new(&dir, "f.bin", 10, 4, hashes.clone()).unwrap();
        assert_eq!(fs::metadata(dir.join("f.bin")).unwrap().len(), 10);
        assert_eq!(fm.verify_existing_pieces(), vec![false, false, false]);

        fm.write_piece(0, &data[0..4]).unwrap();
        fm.write_piece(2, &data[8..10]).unwrap();
        assert_eq!(fm.read_piece(2).unwrap(), b"89");
        assert_matches!(
            fm.write_piece(1, &data[4..7]),
            Err(StorageError::OutOfRange { .. })
        );
        assert_matches!(fm.read_piece(3), Err(StorageError::OutOfRange { .. }));
        fm.shutdown().unwrap();
        drop(fm);

        let mut fm = FileManager::new(&dir, "f.bin", 10, 4, hashes).unwrap();
        assert_eq!(fm.verify_existing_pieces(), vec![true, false, true]);
        let _ = fs::remove_dir_all(&dir);
    }
}
