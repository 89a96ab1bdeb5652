use std::{net::SocketAddr, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    select,
    sync::watch,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::{
    manager::peer_session::PeerSession,
    persistence::file_manager::StorageError,
    torrent_protocol::tcp_wire_protocol::{LinkError, PeerLink},
    util::force_string,
};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl PeerError {
    /// Only storage failures outlive the peer that hit them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PeerError::Storage(_))
    }
}

#[derive(Debug, PartialEq)]
pub enum SessionEnd {
    Cancelled,
    TorrentComplete,
    PeerClosed,
}

pub async fn connect_to_peer(
    peer_addr: SocketAddr,
    info_hash: [u8; 20],
    own_peer_id: [u8; 20],
    connect_timeout: Duration,
    handshake_timeout: Duration,
) -> Result<PeerLink<TcpStream>, LinkError> {
    let mut link = PeerLink::connect(peer_addr, connect_timeout).await?;
    let result = match timeout(handshake_timeout, link.handshake(own_peer_id, info_hash)).await {
        Err(_elapsed) => Err(LinkError::HandshakeTimeout),
        Ok(result) => result,
    };
    match result {
        Ok(handshake) => {
            log::trace!(
                "peer {peer_addr}: handshake completed, peer id: {}",
                force_string(&handshake.peer_id)
            );
            Ok(link)
        }
        Err(e) => {
            link.close().await;
            Err(e)
        }
    }
}

pub async fn accept_peer<S>(
    stream: S,
    peer_addr: SocketAddr,
    info_hash: [u8; 20],
    own_peer_id: [u8; 20],
    handshake_timeout: Duration,
) -> Result<PeerLink<S>, LinkError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut link = PeerLink::from_stream(stream, peer_addr);
    let result = match timeout(
        handshake_timeout,
        link.accept_handshake(own_peer_id, info_hash),
    )
    .await
    {
        Err(_elapsed) => Err(LinkError::HandshakeTimeout),
        Ok(result) => result,
    };
    match result {
        Ok(handshake) => {
            log::trace!(
                "peer {peer_addr}: accepted, peer id: {}",
                force_string(&handshake.peer_id)
            );
            Ok(link)
        }
        Err(e) => {
            link.close().await;
            Err(e)
        }
    }
}

/// Runs the read, dispatch and tick loop for one peer until the torrent completes,
/// the peer goes away or the run is cancelled. The session is dropped, giving back
/// any piece it holds, before the link is closed.
pub async fn drive_session<S>(
    mut link: PeerLink<S>,
    mut session: PeerSession,
    cancel: CancellationToken,
    mut completion: watch::Receiver<bool>,
    read_timeout: Duration,
) -> Result<SessionEnd, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let result = session_loop(
        &mut link,
        &mut session,
        &cancel,
        &mut completion,
        read_timeout,
    )
    .await;
    drop(session);
    link.close().await;
    result
}

async fn session_loop<S>(
    link: &mut PeerLink<S>,
    session: &mut PeerSession,
    cancel: &CancellationToken,
    completion: &mut watch::Receiver<bool>,
    read_timeout: Duration,
) -> Result<SessionEnd, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let peer_addr = link.peer_addr();
    let mut outbound = session.tick();
    loop {
        for message in outbound.drain(..) {
            select! {
                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                result = link.send(&message) => result?,
            }
        }

        let message = select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            Ok(_) = completion.wait_for(|complete| *complete) => {
                return Ok(SessionEnd::TorrentComplete)
            }
            message = link.next_message(read_timeout) => message?,
        };
        let Some(message) = message else {
            log::trace!("peer {peer_addr}: connection closed by peer");
            return Ok(SessionEnd::PeerClosed);
        };
        log::trace!("peer {peer_addr}: received {message}");

        outbound = session.handle_message(message)?;
        outbound.extend(session.tick());
    }
}
