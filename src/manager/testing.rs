use std::{sync::Arc, time::Duration};

use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    manager::piece_scheduler::{FirstAvailable, PieceScheduler},
    metadata::metainfo::Metainfo,
    persistence::memory::MemoryStorage,
    torrent_protocol::{
        bitfield::Bitfield,
        tcp_wire_protocol::PeerLink,
        wire_protocol::{BLOCK_SIZE, Message},
    },
};

pub const PIECE_LEN: u64 = BLOCK_SIZE as u64 * 2;

pub fn piece_data(piece_idx: usize) -> Vec<u8> {
    (0..PIECE_LEN as usize)
        .map(|i| (i * 7 + piece_idx) as u8)
        .collect()
}

pub fn metainfo(pieces: usize) -> Arc<Metainfo> {
    Arc::new(Metainfo {
        announce: "http://tracker.example/announce".to_string(),
        name: "file.bin".to_string(),
        length: PIECE_LEN * pieces as u64,
        piece_length: PIECE_LEN,
        pieces: (0..pieces)
            .map(|i| {
                let mut h = [0; 20];
                h.copy_from_slice(&Sha1::digest(piece_data(i)));
                h
            })
            .collect(),
        info_hash: [7; 20],
    })
}

pub fn scheduler(metainfo: &Metainfo, storage: MemoryStorage) -> Arc<PieceScheduler> {
    Arc::new(PieceScheduler::new(
        metainfo.piece_length,
        metainfo.length,
        vec![false; metainfo.piece_count()],
        Box::new(FirstAvailable),
        Box::new(storage),
    ))
}

/// Remote peer that has every piece and answers every request until the link goes away.
pub async fn seed<S>(mut link: PeerLink<S>, pieces: usize)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut bitfield = Bitfield::new(pieces);
    for i in 0..pieces {
        bitfield.set(i);
    }
    if link.send(&Message::Bitfield(bitfield.to_bytes())).await.is_err()
        || link.send(&Message::Unchoke).await.is_err()
    {
        return;
    }
    while let Ok(Some(message)) = link.next_message(Duration::from_secs(5)).await {
        if let Message::Request(r) = message {
            let data = piece_data(r.piece_idx as usize);
            let block =
                data[r.block_begin as usize..(r.block_begin + r.data_len) as usize].to_vec();
            if link
                .send(&Message::Piece(r.piece_idx, r.block_begin, block))
                .await
                .is_err()
            {
                break;
            }
        }
    }
}
