use std::{net::SocketAddr, sync::Arc};

use crate::{
    manager::{
        block_assembler::{BlockAssembler, BlockOutcome},
        peer::PeerError,
        piece_scheduler::PieceScheduler,
    },
    metadata::metainfo::Metainfo,
    torrent_protocol::{bitfield::Bitfield, wire_protocol::Message},
};

/// Choke/interest state of a session. Only an unchoked, interested session can hold a piece.
#[derive(Debug)]
pub enum SessionState {
    ChokedNotInterested,
    ChokedInterested,
    UnchokedNotInterested,
    UnchokedInterested(Option<BlockAssembler>),
}

pub struct PeerSession {
    peer_addr: SocketAddr,
    state: SessionState,
    bitfield: Bitfield,
    got_first_message: bool,
    scheduler: Arc<PieceScheduler>,
    metainfo: Arc<Metainfo>,
}

impl PeerSession {
    pub fn new(
        peer_addr: SocketAddr,
        scheduler: Arc<PieceScheduler>,
        metainfo: Arc<Metainfo>,
    ) -> Self {
        PeerSession {
            peer_addr,
            state: SessionState::ChokedNotInterested,
            bitfield: Bitfield::new(metainfo.piece_count()),
            got_first_message: false,
            scheduler,
            metainfo,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    #[cfg(test)]
    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// Applies an inbound message, returning what has to be sent back right away.
    pub fn handle_message(&mut self, message: Message) -> Result<Vec<Message>, PeerError> {
        if message == Message::KeepAlive {
            return Ok(Vec::new());
        }
        let first_message = !self.got_first_message;
        self.got_first_message = true;

        match message {
            Message::KeepAlive => {}
            Message::Bitfield(bytes) => {
                if !first_message {
                    return Err(PeerError::ProtocolViolation(
                        "bitfield received after other messages".to_string(),
                    ));
                }
                let bitfield = Bitfield::from_bytes(&bytes, self.metainfo.piece_count())
                    .map_err(|e| PeerError::ProtocolViolation(e.to_string()))?;
                self.scheduler.peer_gone(&self.bitfield);
                self.scheduler.peer_bitfield(&bitfield);
                log::trace!(
                    "peer {}: has {}/{} pieces",
                    self.peer_addr,
                    bitfield.count(),
                    bitfield.len()
                );
                self.bitfield = bitfield;
            }
            Message::Have(piece_idx) => {
                if self.bitfield.set(piece_idx as usize) {
                    self.scheduler.peer_has(piece_idx as usize);
                }
            }
            Message::Choke => {
                self.state = match std::mem::replace(&mut self.state, SessionState::ChokedNotInterested) {
                    // dropping the assembler gives its piece back
                    SessionState::UnchokedInterested(_) | SessionState::ChokedInterested => {
                        SessionState::ChokedInterested
                    }
                    SessionState::UnchokedNotInterested | SessionState::ChokedNotInterested => {
                        SessionState::ChokedNotInterested
                    }
                };
            }
            Message::Unchoke => {
                self.state = match std::mem::replace(&mut self.state, SessionState::ChokedNotInterested) {
                    SessionState::ChokedInterested => SessionState::UnchokedInterested(None),
                    SessionState::ChokedNotInterested => SessionState::UnchokedNotInterested,
                    unchoked => unchoked,
                };
            }
            Message::Piece(piece_idx, begin, data) => {
                let SessionState::UnchokedInterested(Some(assembler)) = &mut self.state else {
                    log::trace!(
                        "peer {}: dropping block of piece {piece_idx}, no piece in progress",
                        self.peer_addr
                    );
                    return Ok(Vec::new());
                };
                match assembler.receive_block(piece_idx, begin, data)? {
                    BlockOutcome::Ignored => {}
                    BlockOutcome::Requests(requests) => {
                        return Ok(requests.into_iter().map(Message::Request).collect());
                    }
                    BlockOutcome::Completed => {
                        log::debug!("peer {}: piece {piece_idx} completed", self.peer_addr);
                        self.state = SessionState::UnchokedInterested(None);
                    }
                    BlockOutcome::Stale => {
                        self.state = SessionState::UnchokedInterested(None);
                    }
                    BlockOutcome::Corrupted => {
                        log::debug!(
                            "peer {}: piece {piece_idx} was corrupted, given back",
                            self.peer_addr
                        );
                        self.state = SessionState::UnchokedInterested(None);
                    }
                }
            }
            // no upload side: interest, requests and cancels from the peer need no action
            Message::Interested
            | Message::NotInterested
            | Message::Request(_)
            | Message::Cancel(_) => {}
        }
        Ok(Vec::new())
    }

    /// Decides what to do next given the current state, returning the messages to send.
    pub fn tick(&mut self) -> Vec<Message> {
        match &self.state {
            SessionState::ChokedNotInterested => {
                if self.scheduler.wants_any(&self.bitfield) {
                    self.state = SessionState::ChokedInterested;
                    return vec![Message::Interested];
                }
                Vec::new()
            }
            SessionState::ChokedInterested => Vec::new(),
            SessionState::UnchokedInterested(Some(_)) => Vec::new(),
            SessionState::UnchokedNotInterested => match self.start_piece() {
                Some(mut messages) => {
                    messages.insert(0, Message::Interested);
                    messages
                }
                None => Vec::new(),
            },
            SessionState::UnchokedInterested(None) => match self.start_piece() {
                Some(messages) => messages,
                None => {
                    self.state = SessionState::UnchokedNotInterested;
                    vec![Message::NotInterested]
                }
            },
        }
    }

    fn start_piece(&mut self) -> Option<Vec<Message>> {
        let piece_idx = self.scheduler.assign_piece(&self.bitfield)?;
        log::trace!("peer {}: assigned piece {piece_idx}", self.peer_addr);
        let mut assembler = BlockAssembler::new(
            piece_idx,
            self.metainfo.piece_size(piece_idx),
            self.metainfo.pieces[piece_idx],
            self.scheduler.clone(),
        );
        let requests = assembler.enqueue_requests();
        self.state = SessionState::UnchokedInterested(Some(assembler));
        Some(requests.into_iter().map(Message::Request).collect())
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.scheduler.peer_gone(&self.bitfield);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        manager::{
            piece_scheduler::PieceState,
            testing::{metainfo, piece_data, scheduler},
        },
        persistence::memory::MemoryStorage,
        torrent_protocol::wire_protocol::{BLOCK_SIZE, BlockRequest},
    };

    fn setup(pieces: usize) -> (Arc<PieceScheduler>, Arc<Metainfo>, MemoryStorage) {
        let storage = MemoryStorage::default();
        let metainfo = metainfo(pieces);
        (scheduler(&metainfo, storage.clone()), metainfo, storage)
    }

    fn addr() -> SocketAddr {
        "10.0.0.1:6881".parse().unwrap()
    }

    fn step(session: &mut PeerSession, message: Message) -> Vec<Message> {
        let mut out = session.handle_message(message).unwrap();
        out.extend(session.tick());
        out
    }

    fn request(piece_idx: u32, block_begin: u32) -> Message {
        Message::Request(BlockRequest {
            piece_idx,
            block_begin,
            data_len: BLOCK_SIZE,
        })
    }

    #[test]
    fn downloads_a_piece_then_loses_interest() {
        let (scheduler, metainfo, storage) = setup(4);
        let mut session = PeerSession::new(addr(), scheduler.clone(), metainfo);

        assert!(session.tick().is_empty());
        assert_eq!(
            step(&mut session, Message::Bitfield(vec![0b10000000])),
            vec![Message::Interested]
        );
        assert_matches!(session.state(), SessionState::ChokedInterested);
        assert_eq!(scheduler.piece_state(0), Some(PieceState::Missing));

        assert_eq!(
            step(&mut session, Message::Unchoke),
            vec![request(0, 0), request(0, BLOCK_SIZE)]
        );
        assert_eq!(scheduler.piece_state(0), Some(PieceState::Pending));

        let data = piece_data(0);
        assert!(step(&mut session, Message::Piece(0, 0, data[..BLOCK_SIZE as usize].to_vec())).is_empty());
        assert_eq!(
            step(&mut session, Message::Piece(0, BLOCK_SIZE, data[BLOCK_SIZE as usize..].to_vec())),
            vec![Message::NotInterested]
        );
        assert_matches!(session.state(), SessionState::UnchokedNotInterested);
        assert_eq!(scheduler.piece_state(0), Some(PieceState::Complete));
        assert_eq!(storage.written(), vec![0]);

        // a have for a piece we need makes the session interested and busy again
        assert_eq!(
            step(&mut session, Message::Have(3)),
            vec![Message::Interested, request(3, 0), request(3, BLOCK_SIZE)]
        );
        assert_matches!(session.state(), SessionState::UnchokedInterested(Some(a)) if a.piece_idx() == 3);
    }

    #[test]
    fn choke_releases_the_piece_in_progress() {
        let (scheduler, metainfo, _) = setup(4);
        let mut session = PeerSession::new(addr(), scheduler.clone(), metainfo);
        step(&mut session, Message::Bitfield(vec![0b11110000]));
        step(&mut session, Message::Unchoke);
        assert_eq!(scheduler.piece_state(0), Some(PieceState::Pending));

        assert!(step(&mut session, Message::Choke).is_empty());
        assert_matches!(session.state(), SessionState::ChokedInterested);
        assert_eq!(scheduler.piece_state(0), Some(PieceState::Missing));

        // late block after the choke is dropped
        assert!(step(&mut session, Message::Piece(0, 0, vec![0; BLOCK_SIZE as usize])).is_empty());
    }

    #[test]
    fn dropping_the_session_releases_its_piece() {
        let (scheduler, metainfo, _) = setup(2);
        let mut session = PeerSession::new(addr(), scheduler.clone(), metainfo);
        step(&mut session, Message::Bitfield(vec![0b11000000]));
        step(&mut session, Message::Unchoke);
        assert_eq!(scheduler.piece_state(0), Some(PieceState::Pending));
        drop(session);
        assert_eq!(scheduler.piece_state(0), Some(PieceState::Missing));
    }

    #[test]
    fn bitfield_must_come_first_and_fit() {
        let (scheduler, metainfo, _) = setup(4);
        let mut session = PeerSession::new(addr(), scheduler.clone(), metainfo.clone());
        step(&mut session, Message::KeepAlive);
        step(&mut session, Message::Have(1));
        assert_matches!(
            session.handle_message(Message::Bitfield(vec![0b11110000])),
            Err(PeerError::ProtocolViolation(_))
        );

        let mut session = PeerSession::new(addr(), scheduler, metainfo);
        assert_matches!(
            session.handle_message(Message::Bitfield(vec![0xff, 0xff])),
            Err(PeerError::ProtocolViolation(_))
        );
    }

    #[test]
    fn out_of_range_have_is_ignored() {
        let (scheduler, metainfo, _) = setup(4);
        let mut session = PeerSession::new(addr(), scheduler, metainfo);
        assert!(step(&mut session, Message::Have(99)).is_empty());
        assert_eq!(session.bitfield().count(), 0);
    }

    #[test]
    fn unchoked_peer_with_nothing_useful_stays_not_interested() {
        let (scheduler, metainfo, _) = setup(4);
        let mut session = PeerSession::new(addr(), scheduler, metainfo);
        assert!(step(&mut session, Message::Unchoke).is_empty());
        assert_matches!(session.state(), SessionState::UnchokedNotInterested);
        assert!(step(&mut session, Message::Interested).is_empty());
        assert!(step(&mut session, Message::Request(BlockRequest {
            piece_idx: 0,
            block_begin: 0,
            data_len: BLOCK_SIZE
        })).is_empty());
    }

    #[test]
    fn corrupted_piece_is_given_back() {
        let (scheduler, metainfo, storage) = setup(1);
        let mut session = PeerSession::new(addr(), scheduler.clone(), metainfo);
        step(&mut session, Message::Bitfield(vec![0b10000000]));
        step(&mut session, Message::Unchoke);
        step(&mut session, Message::Piece(0, 0, vec![9; BLOCK_SIZE as usize]));
        // the piece is released then immediately assigned again to the same session
        assert_eq!(
            step(&mut session, Message::Piece(0, BLOCK_SIZE, vec![9; BLOCK_SIZE as usize])),
            vec![request(0, 0), request(0, BLOCK_SIZE)]
        );
        assert!(storage.written().is_empty());
        assert_eq!(scheduler.piece_state(0), Some(PieceState::Pending));
    }
}
