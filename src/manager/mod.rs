pub mod block_assembler;
pub mod peer;
pub mod peer_session;
pub mod piece_scheduler;
pub mod torrent_manager;

#[cfg(test)]
pub mod testing;
