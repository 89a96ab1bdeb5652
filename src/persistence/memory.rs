use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use crate::persistence::file_manager::{PieceStorage, StorageError};

/// In-memory storage for tests; clones share the same pieces.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    pub pieces: Arc<Mutex<HashMap<usize, Vec<u8>>>>,
    pub fail_writes: bool,
    pub shut_down: Arc<Mutex<bool>>,
}

impl MemoryStorage {
    pub fn failing() -> Self {
        MemoryStorage {
            fail_writes: true,
            ..Default::default()
        }
    }

    pub fn written(&self) -> Vec<usize> {
        let mut written: Vec<usize> = self.pieces.lock().unwrap().keys().copied().collect();
        written.sort();
        written
    }
}

impl PieceStorage for MemoryStorage {
    fn read_piece(&mut self, piece_idx: usize) -> Result<Vec<u8>, StorageError> {
        self.pieces
            .lock()
            .unwrap()
            .get(&piece_idx)
            .cloned()
            .ok_or(StorageError::OutOfRange {
                piece_idx,
                len: 0,
                total_pieces: 0,
            })
    }

    fn write_piece(&mut self, piece_idx: usize, data: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Io {
                path: PathBuf::from("memory"),
                source: io::Error::other("disk full"),
            });
        }
        self.pieces.lock().unwrap().insert(piece_idx, data.to_vec());
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), StorageError> {
        *self.shut_down.lock().unwrap() = true;
        Ok(())
    }
}
