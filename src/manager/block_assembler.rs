use std::{fmt, sync::Arc};

use sha1::{Digest, Sha1};

use crate::{
    manager::{
        peer::PeerError,
        piece_scheduler::{CommitOutcome, PieceScheduler},
    },
    torrent_protocol::wire_protocol::{BLOCK_SIZE, BlockRequest},
};

pub const REQUEST_WINDOW: usize = 5; // outstanding block requests per peer

#[derive(Debug, PartialEq)]
pub enum BlockOutcome {
    Ignored,                     // block for another piece or one we already have
    Requests(Vec<BlockRequest>), // block stored, these requests should go out next (possibly none)
    Completed,                   // piece verified and committed
    Stale,                       // piece verified but it was already completed elsewhere
    Corrupted,                   // hash mismatch, piece given back to the scheduler
}

/// Reassembles one piece from its blocks. Dropping an unsettled assembler releases the piece.
pub struct BlockAssembler {
    piece_idx: usize,
    buffer: Vec<u8>,
    next_offset: u32,
    outstanding: usize,
    received: Vec<bool>,
    received_count: usize,
    expected_hash: [u8; 20],
    scheduler: Arc<PieceScheduler>,
    settled: bool,
}

impl fmt::Debug for BlockAssembler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "BlockAssembler {{ piece: {}, received: {}/{}, outstanding: {} }}",
            self.piece_idx,
            self.received_count,
            self.received.len(),
            self.outstanding
        )
    }
}

impl BlockAssembler {
    pub fn new(
        piece_idx: usize,
        piece_len: u64,
        expected_hash: [u8; 20],
        scheduler: Arc<PieceScheduler>,
    ) -> Self {
        let total_blocks = piece_len.div_ceil(BLOCK_SIZE as u64) as usize;
        BlockAssembler {
            piece_idx,
            buffer: vec![0; piece_len as usize],
            next_offset: 0,
            outstanding: 0,
            received: vec![false; total_blocks],
            received_count: 0,
            expected_hash,
            scheduler,
            settled: false,
        }
    }

    #[cfg(test)]
    pub fn piece_idx(&self) -> usize {
        self.piece_idx
    }

    fn block_len(&self, offset: u32) -> u32 {
        BLOCK_SIZE.min(self.buffer.len() as u32 - offset)
    }

    /// Requests for the next blocks, up to the window size.
    pub fn enqueue_requests(&mut self) -> Vec<BlockRequest> {
        let mut requests = Vec::new();
        while self.outstanding < REQUEST_WINDOW && (self.next_offset as usize) < self.buffer.len() {
            let data_len = self.block_len(self.next_offset);
            requests.push(BlockRequest {
                piece_idx: self.piece_idx as u32,
                block_begin: self.next_offset,
                data_len,
            });
            self.next_offset += data_len;
            self.outstanding += 1;
        }
        requests
    }

    pub fn receive_block(
        &mut self,
        piece_idx: u32,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<BlockOutcome, PeerError> {
        if piece_idx as usize != self.piece_idx || self.settled {
            return Ok(BlockOutcome::Ignored);
        }
        if offset % BLOCK_SIZE != 0 || offset >= self.next_offset {
            return Err(PeerError::ProtocolViolation(format!(
                "received block at offset {offset} of piece {piece_idx} that was never requested"
            )));
        }
        let block_idx = (offset / BLOCK_SIZE) as usize;
        if data.len() != self.block_len(offset) as usize {
            return Err(PeerError::ProtocolViolation(format!(
                "block at offset {offset} of piece {piece_idx} is {} bytes, requested {}",
                data.len(),
                self.block_len(offset)
            )));
        }
        if self.received[block_idx] {
            return Ok(BlockOutcome::Ignored);
        }

        let start = offset as usize;
        self.buffer[start..start + data.len()].copy_from_slice(&data);
        self.received[block_idx] = true;
        self.received_count += 1;
        self.outstanding = self.outstanding.saturating_sub(1);

        if self.received_count < self.received.len() {
            if self.outstanding == 0 {
                return Ok(BlockOutcome::Requests(self.enqueue_requests()));
            }
            return Ok(BlockOutcome::Requests(Vec::new()));
        }

        self.settled = true;
        if Sha1::digest(&self.buffer)[..] != self.expected_hash {
            log::warn!("piece {} failed hash verification", self.piece_idx);
            self.scheduler.release(self.piece_idx);
            return Ok(BlockOutcome::Corrupted);
        }
        match self.scheduler.commit(self.piece_idx, &self.buffer)? {
            CommitOutcome::Committed => Ok(BlockOutcome::Completed),
            CommitOutcome::Stale => Ok(BlockOutcome::Stale),
        }
    }
}

impl Drop for BlockAssembler {
    fn drop(&mut self) {
        if !self.settled {
            log::trace!("abandoning piece {}", self.piece_idx);
            self.scheduler.release(self.piece_idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use sha1::{Digest, Sha1};

    use super::*;
    use crate::{
        manager::piece_scheduler::{FirstAvailable, PieceState},
        persistence::memory::MemoryStorage,
        torrent_protocol::bitfield::Bitfield,
    };

    const PIECE_LEN: u64 = BLOCK_SIZE as u64 * 6 + 100; // 7 blocks, the last one short

    fn piece_data() -> Vec<u8> {
        (0..PIECE_LEN).map(|i| (i % 251) as u8).collect()
    }

    fn hash(data: &[u8]) -> [u8; 20] {
        let mut h = [0; 20];
        h.copy_from_slice(&Sha1::digest(data));
        h
    }

    fn assigned(storage: MemoryStorage) -> (Arc<PieceScheduler>, usize) {
        let scheduler = Arc::new(PieceScheduler::new(
            PIECE_LEN,
            PIECE_LEN * 2,
            vec![false; 2],
            Box::new(FirstAvailable),
            Box::new(storage),
        ));
        let mut bitfield = Bitfield::new(2);
        bitfield.set(0);
        let idx = scheduler.assign_piece(&bitfield).unwrap();
        (scheduler, idx)
    }

    fn block(data: &[u8], r: &BlockRequest) -> Vec<u8> {
        data[r.block_begin as usize..(r.block_begin + r.data_len) as usize].to_vec()
    }

    #[test]
    fn pipelined_download_of_a_piece() {
        let storage = MemoryStorage::default();
        let (scheduler, idx) = assigned(storage.clone());
        let data = piece_data();
        let mut assembler = BlockAssembler::new(idx, PIECE_LEN, hash(&data), scheduler.clone());

        let first = assembler.enqueue_requests();
        assert_eq!(first.len(), REQUEST_WINDOW);
        assert!(assembler.enqueue_requests().is_empty());

        for r in &first[..4] {
            assert_eq!(
                assembler.receive_block(0, r.block_begin, block(&data, r)).unwrap(),
                BlockOutcome::Requests(vec![])
            );
        }
        // window drained: the remaining two blocks are requested
        let rest = match assembler
            .receive_block(0, first[4].block_begin, block(&data, &first[4]))
            .unwrap()
        {
            BlockOutcome::Requests(r) => r,
            other => panic!("unexpected outcome {other:?}"),
        };
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].data_len, 100);

        assert_eq!(
            assembler.receive_block(0, rest[1].block_begin, block(&data, &rest[1])).unwrap(),
            BlockOutcome::Requests(vec![])
        );
        assert_eq!(
            assembler.receive_block(0, rest[0].block_begin, block(&data, &rest[0])).unwrap(),
            BlockOutcome::Completed
        );
        assert_eq!(scheduler.piece_state(0), Some(PieceState::Complete));
        assert_eq!(storage.pieces.lock().unwrap()[&0], data);

        drop(assembler);
        assert_eq!(scheduler.piece_state(0), Some(PieceState::Complete));
    }

    #[test]
    fn hash_mismatch_releases_instead_of_committing() {
        let storage = MemoryStorage::default();
        let (scheduler, idx) = assigned(storage.clone());
        let data = piece_data();
        let mut assembler = BlockAssembler::new(idx, PIECE_LEN, [0; 20], scheduler.clone());

        let mut outcome = BlockOutcome::Ignored;
        let mut pending = assembler.enqueue_requests();
        while let Some(r) = pending.pop() {
            outcome = assembler.receive_block(0, r.block_begin, block(&data, &r)).unwrap();
            if let BlockOutcome::Requests(more) = &outcome {
                pending.extend(more.iter().cloned());
            }
        }
        assert_eq!(outcome, BlockOutcome::Corrupted);
        assert_eq!(scheduler.piece_state(0), Some(PieceState::Missing));
        assert!(storage.written().is_empty());
    }

    #[test]
    fn ignores_other_pieces_and_duplicates() {
        let (scheduler, idx) = assigned(MemoryStorage::default());
        let data = piece_data();
        let mut assembler = BlockAssembler::new(idx, PIECE_LEN, hash(&data), scheduler);
        let requests = assembler.enqueue_requests();
        let b = block(&data, &requests[0]);

        assert_eq!(assembler.receive_block(1, 0, b.clone()).unwrap(), BlockOutcome::Ignored);
        assert_eq!(
            assembler.receive_block(0, 0, b.clone()).unwrap(),
            BlockOutcome::Requests(vec![])
        );
        assert_eq!(assembler.receive_block(0, 0, b).unwrap(), BlockOutcome::Ignored);
    }

    #[test]
    fn rejects_unrequested_or_wrong_sized_blocks() {
        let (scheduler, idx) = assigned(MemoryStorage::default());
        let mut assembler = BlockAssembler::new(idx, PIECE_LEN, [0; 20], scheduler);
        assert_matches!(
            assembler.receive_block(0, 0, vec![0; BLOCK_SIZE as usize]),
            Err(PeerError::ProtocolViolation(_))
        );
        assembler.enqueue_requests();
        assert_matches!(
            assembler.receive_block(0, 0, vec![0; 10]),
            Err(PeerError::ProtocolViolation(_))
        );
        assert_matches!(
            assembler.receive_block(0, 3, vec![0; 10]),
            Err(PeerError::ProtocolViolation(_))
        );
    }

    #[test]
    fn dropping_an_unfinished_piece_releases_it() {
        let (scheduler, idx) = assigned(MemoryStorage::default());
        let mut assembler = BlockAssembler::new(idx, PIECE_LEN, [0; 20], scheduler.clone());
        assembler.enqueue_requests();
        assert_eq!(scheduler.piece_state(0), Some(PieceState::Pending));
        drop(assembler);
        assert_eq!(scheduler.piece_state(0), Some(PieceState::Missing));
    }

    #[test]
    fn storage_failure_is_fatal() {
        let (scheduler, idx) = assigned(MemoryStorage::failing());
        let data = piece_data();
        let mut assembler = BlockAssembler::new(idx, PIECE_LEN, hash(&data), scheduler);
        let mut result = Ok(BlockOutcome::Ignored);
        let mut pending = assembler.enqueue_requests();
        while let Some(r) = pending.pop() {
            result = assembler.receive_block(0, r.block_begin, block(&data, &r));
            if let Ok(BlockOutcome::Requests(more)) = &result {
                pending.extend(more.iter().cloned());
            }
        }
        assert_matches!(result, Err(e) if e.is_fatal());
    }
}
