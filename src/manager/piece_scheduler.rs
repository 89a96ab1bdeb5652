use std::sync::Mutex;

use tokio::sync::watch;

use crate::{
    persistence::file_manager::{PieceStorage, StorageError},
    torrent_protocol::bitfield::Bitfield,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Missing,
    Pending,
    Complete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransferStats {
    pub downloaded_pieces: usize, // completed pieces, resumed ones included
    pub total_pieces: usize,
    pub downloaded_bytes: u64, // bytes downloaded in this run
    pub uploaded_bytes: u64,
    pub left_bytes: u64,
}

#[derive(Debug, PartialEq)]
pub enum CommitOutcome {
    Committed,
    Stale, // the piece was not pending anymore: completed by someone else or released
}

/// Picks one piece among the missing ones a peer has. Candidates come in ascending index order.
pub trait PieceSelector: Send {
    fn select(
        &self,
        candidates: &mut dyn Iterator<Item = usize>,
        availability: &[u32],
    ) -> Option<usize>;
    fn name(&self) -> &'static str;
}

pub struct FirstAvailable;

impl PieceSelector for FirstAvailable {
    fn select(
        &self,
        candidates: &mut dyn Iterator<Item = usize>,
        _availability: &[u32],
    ) -> Option<usize> {
        candidates.next()
    }

    fn name(&self) -> &'static str {
        "first available"
    }
}

pub struct RarestFirst;

impl PieceSelector for RarestFirst {
    fn select(
        &self,
        candidates: &mut dyn Iterator<Item = usize>,
        availability: &[u32],
    ) -> Option<usize> {
        // min_by_key keeps the first minimum, so ties go to the lowest index
        candidates.min_by_key(|idx| availability[*idx])
    }

    fn name(&self) -> &'static str {
        "rarest first"
    }
}

struct SchedulerState {
    pieces: Vec<PieceState>,
    holders: Vec<u32>,      // sessions currently working on each pending piece
    availability: Vec<u32>, // connected peers advertising each piece
    first_incomplete: usize, // every piece before this index is complete
    completed: usize,
    completed_bytes: u64,
    downloaded_bytes: u64,
    endgame: bool,
    selector: Box<dyn PieceSelector>,
}

impl SchedulerState {
    fn no_missing_left(&self) -> bool {
        self.pieces[self.first_incomplete..]
            .iter()
            .all(|s| *s != PieceState::Missing)
    }

    fn pick(&self, bitfield: &Bitfield) -> Option<usize> {
        let mut missing = (self.first_incomplete..self.pieces.len())
            .filter(|idx| self.pieces[*idx] == PieceState::Missing && bitfield.has(*idx));
        if let Some(idx) = self.selector.select(&mut missing, &self.availability) {
            return Some(idx);
        }
        if !self.no_missing_left() {
            return None;
        }
        // end-game: share the pending piece with the fewest sessions on it
        (self.first_incomplete..self.pieces.len())
            .filter(|idx| self.pieces[*idx] == PieceState::Pending && bitfield.has(*idx))
            .min_by_key(|idx| self.holders[*idx])
    }

    fn advance_cursor(&mut self) {
        while self.first_incomplete < self.pieces.len()
            && self.pieces[self.first_incomplete] == PieceState::Complete
        {
            self.first_incomplete += 1;
        }
    }
}

/// Shared record of which pieces are missing, pending or complete, used by every peer session.
pub struct PieceScheduler {
    state: Mutex<SchedulerState>,
    storage: Mutex<Box<dyn PieceStorage>>, // never locked while holding `state`
    total_length: u64,
    completion_tx: watch::Sender<bool>,
}

impl PieceScheduler {
    pub fn new(
        piece_length: u64,
        total_length: u64,
        already_completed: Vec<bool>,
        selector: Box<dyn PieceSelector>,
        storage: Box<dyn PieceStorage>,
    ) -> Self {
        let total_pieces = already_completed.len();
        let pieces: Vec<PieceState> = already_completed
            .iter()
            .map(|c| {
                if *c {
                    PieceState::Complete
                } else {
                    PieceState::Missing
                }
            })
            .collect();
        let mut state = SchedulerState {
            pieces,
            holders: vec![0; total_pieces],
            availability: vec![0; total_pieces],
            first_incomplete: 0,
            completed: 0,
            completed_bytes: 0,
            downloaded_bytes: 0,
            endgame: false,
            selector,
        };
        for idx in 0..total_pieces {
            if state.pieces[idx] == PieceState::Complete {
                state.completed += 1;
                state.completed_bytes += piece_size(piece_length, total_length, idx);
            }
        }
        state.advance_cursor();
        log::debug!(
            "piece scheduler: {} of {total_pieces} pieces already complete, selection strategy: {}",
            state.completed,
            state.selector.name()
        );
        let (completion_tx, _) = watch::channel(state.completed == total_pieces);
        PieceScheduler {
            state: Mutex::new(state),
            storage: Mutex::new(storage),
            total_length,
            completion_tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state
            .lock()
            .expect("another user panicked while holding the lock")
    }

    #[cfg(test)]
    pub fn piece_count(&self) -> usize {
        self.lock().pieces.len()
    }

    /// Marks a piece the peer has as pending and hands it out, `None` if the peer has nothing we need.
    pub fn assign_piece(&self, bitfield: &Bitfield) -> Option<usize> {
        let mut state = self.lock();
        let picked = state.pick(bitfield);
        if !state.endgame && state.completed < state.pieces.len() && state.no_missing_left() {
            state.endgame = true;
            log::info!("every missing piece has been requested, entering end-game");
        }
        if let Some(idx) = picked {
            state.pieces[idx] = PieceState::Pending;
            state.holders[idx] += 1;
        }
        picked
    }

    /// Same answer as `assign_piece` would give, without taking the piece.
    pub fn wants_any(&self, bitfield: &Bitfield) -> bool {
        self.lock().pick(bitfield).is_some()
    }

    /// Gives a pending piece back. The piece turns missing again once its last holder releases it.
    pub fn release(&self, piece_idx: usize) {
        let mut state = self.lock();
        if state.pieces.get(piece_idx) != Some(&PieceState::Pending) {
            return;
        }
        state.holders[piece_idx] = state.holders[piece_idx].saturating_sub(1);
        if state.holders[piece_idx] == 0 {
            state.pieces[piece_idx] = PieceState::Missing;
            log::trace!("piece {piece_idx} released");
        }
    }

    /// Persists a verified piece and marks it complete. Only a pending piece can be committed.
    /// The write happens outside the state lock, so other sessions keep scheduling meanwhile.
    pub fn commit(&self, piece_idx: usize, data: &[u8]) -> Result<CommitOutcome, StorageError> {
        if self.lock().pieces.get(piece_idx) != Some(&PieceState::Pending) {
            log::debug!("piece {piece_idx} is not pending anymore, ignoring completion");
            return Ok(CommitOutcome::Stale);
        }

        let written = self
            .storage
            .lock()
            .expect("another user panicked while holding the lock")
            .write_piece(piece_idx, data);

        let mut state = self.lock();
        if let Err(e) = written {
            if state.pieces[piece_idx] == PieceState::Pending {
                state.holders[piece_idx] = state.holders[piece_idx].saturating_sub(1);
                if state.holders[piece_idx] == 0 {
                    state.pieces[piece_idx] = PieceState::Missing;
                }
            }
            return Err(e);
        }
        // an end-game twin may have committed the same bytes while we were writing
        if state.pieces[piece_idx] == PieceState::Complete {
            return Ok(CommitOutcome::Stale);
        }
        state.pieces[piece_idx] = PieceState::Complete;
        state.holders[piece_idx] = 0;
        state.completed += 1;
        state.completed_bytes += data.len() as u64;
        state.downloaded_bytes += data.len() as u64;
        state.advance_cursor();
        log::debug!(
            "piece {piece_idx} completed ({}/{})",
            state.completed,
            state.pieces.len()
        );
        if state.completed == state.pieces.len() {
            log::info!("all {} pieces downloaded", state.pieces.len());
            self.completion_tx.send_replace(true);
        }
        Ok(CommitOutcome::Committed)
    }

    pub fn peer_has(&self, piece_idx: usize) {
        if let Some(a) = self.lock().availability.get_mut(piece_idx) {
            *a += 1;
        }
    }

    pub fn peer_bitfield(&self, bitfield: &Bitfield) {
        let mut state = self.lock();
        for idx in bitfield.iter_set() {
            if let Some(a) = state.availability.get_mut(idx) {
                *a += 1;
            }
        }
    }

    pub fn peer_gone(&self, bitfield: &Bitfield) {
        let mut state = self.lock();
        for idx in bitfield.iter_set() {
            if let Some(a) = state.availability.get_mut(idx) {
                *a = a.saturating_sub(1);
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        *self.completion_tx.borrow()
    }

    pub fn completion(&self) -> watch::Receiver<bool> {
        self.completion_tx.subscribe()
    }

    pub async fn wait_complete(&self) {
        let mut rx = self.completion();
        // the sender lives as long as self, wait_for cannot fail
        let _ = rx.wait_for(|complete| *complete).await;
    }

    #[cfg(test)]
    pub fn piece_state(&self, piece_idx: usize) -> Option<PieceState> {
        self.lock().pieces.get(piece_idx).copied()
    }

    pub fn in_endgame(&self) -> bool {
        self.lock().endgame
    }

    pub fn transfer_stats(&self) -> TransferStats {
        let state = self.lock();
        TransferStats {
            downloaded_pieces: state.completed,
            total_pieces: state.pieces.len(),
            downloaded_bytes: state.downloaded_bytes,
            uploaded_bytes: 0,
            left_bytes: self.total_length.saturating_sub(state.completed_bytes),
        }
    }

    pub fn shutdown_storage(&self) -> Result<(), StorageError> {
        self.storage
            .lock()
            .expect("another user panicked while holding the lock")
            .shutdown()
    }
}

fn piece_size(piece_length: u64, total_length: u64, piece_idx: usize) -> u64 {
    let start = piece_idx as u64 * piece_length;
    piece_length.min(total_length.saturating_sub(start))
}
