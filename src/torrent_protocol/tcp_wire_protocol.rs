use std::{fmt, io, net::SocketAddr, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream},
    join,
    net::TcpStream,
    time::timeout,
};

use crate::torrent_protocol::wire_protocol::{HANDSHAKE_LEN, Handshake, Message, ProtocolError};

// a piece message carries at most one block, bitfields of very large torrents are the next biggest frame
pub const MAX_FRAME_LEN: u32 = 1 << 21;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connection timed out")]
    ConnectTimeout,
    #[error("connection refused")]
    ConnectRefused,
    #[error("could not connect: {0}")]
    Connect(io::Error),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("peer handshake is for info hash {}", hex::encode(.0))]
    HandshakeMismatch([u8; 20]),
    #[error("no message received for {0:?}")]
    ReadTimeout(Duration),
    #[error("read failed: {0}")]
    Read(io::Error),
    #[error("write failed: {0}")]
    WriteFailed(io::Error),
    #[error("frame of {0} bytes exceeds the maximum allowed length")]
    FrameTooLarge(u32),
    #[error("link already closed")]
    Closed,
    #[error(transparent)]
    Malformed(#[from] ProtocolError),
}

/// One connection to a remote peer: handshake, framing and timeouts, no protocol semantics.
pub struct PeerLink<S = TcpStream> {
    peer_addr: SocketAddr,
    stream: Option<BufStream<S>>,
}

impl<S> fmt::Debug for PeerLink<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "PeerLink {{ peer: {}, open: {} }}",
            self.peer_addr,
            self.stream.is_some()
        )
    }
}

impl PeerLink<TcpStream> {
    pub async fn connect(peer_addr: SocketAddr, connect_timeout: Duration) -> Result<Self, LinkError> {
        log::trace!("peer {peer_addr}: initiating connection");
        match timeout(connect_timeout, TcpStream::connect(peer_addr)).await {
            Err(_elapsed) => Err(LinkError::ConnectTimeout),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                Err(LinkError::ConnectRefused)
            }
            Ok(Err(e)) => Err(LinkError::Connect(e)),
            Ok(Ok(stream)) => Ok(PeerLink::from_stream(stream, peer_addr)),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> PeerLink<S> {
    pub fn from_stream(stream: S, peer_addr: SocketAddr) -> Self {
        PeerLink {
            peer_addr,
            stream: Some(BufStream::new(stream)),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Initiator side: sends our handshake while reading the remote one, then checks the info hash.
    pub async fn handshake(
        &mut self,
        own_peer_id: [u8; 20],
        info_hash: [u8; 20],
    ) -> Result<Handshake, LinkError> {
        let peer_addr = self.peer_addr;
        let stream = self.stream.as_mut().ok_or(LinkError::Closed)?;
        log::trace!("peer {peer_addr}: performing handshake");

        let (mut read, mut write) = tokio::io::split(stream);
        let (write_result, read_result) = join!(
            async {
                write_handshake(&mut write, &Handshake::new(info_hash, own_peer_id)).await?;
                log::trace!("peer {peer_addr}: full handshake sent");
                Ok::<(), LinkError>(())
            },
            async {
                let handshake = read_handshake(&mut read).await?;
                log::trace!("peer {peer_addr}: full handshake received");
                Ok::<Handshake, LinkError>(handshake)
            }
        );
        write_result?;
        let handshake = read_result?;
        if handshake.info_hash != info_hash {
            return Err(LinkError::HandshakeMismatch(handshake.info_hash));
        }
        Ok(handshake)
    }

    /// Receiver side: the remote handshake must name our info hash before we answer with ours.
    pub async fn accept_handshake(
        &mut self,
        own_peer_id: [u8; 20],
        info_hash: [u8; 20],
    ) -> Result<Handshake, LinkError> {
        let peer_addr = self.peer_addr;
        let stream = self.stream.as_mut().ok_or(LinkError::Closed)?;
        log::trace!("peer {peer_addr}: waiting for incoming handshake");
        let handshake = read_handshake(stream).await?;
        if handshake.info_hash != info_hash {
            return Err(LinkError::HandshakeMismatch(handshake.info_hash));
        }
        write_handshake(stream, &Handshake::new(info_hash, own_peer_id)).await?;
        log::trace!("peer {peer_addr}: incoming handshake completed");
        Ok(handshake)
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), LinkError> {
        let stream = self.stream.as_mut().ok_or(LinkError::Closed)?;
        log::trace!("peer {}: sending {message}", self.peer_addr);
        stream
            .write_all(&message.encode())
            .await
            .map_err(LinkError::WriteFailed)?;
        stream.flush().await.map_err(LinkError::WriteFailed)
    }

    /// Waits for the next complete frame. `Ok(None)` means the peer closed the connection between two frames.
    pub async fn next_message(
        &mut self,
        read_timeout: Duration,
    ) -> Result<Option<Message>, LinkError> {
        let stream = self.stream.as_mut().ok_or(LinkError::Closed)?;
        match timeout(read_timeout, read_frame(stream)).await {
            Err(_elapsed) => Err(LinkError::ReadTimeout(read_timeout)),
            Ok(result) => result,
        }
    }

    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                log::trace!("peer {}: error closing connection: {e}", self.peer_addr);
            }
        }
    }
}

async fn write_handshake<W: AsyncWrite + Unpin>(
    write: &mut W,
    handshake: &Handshake,
) -> Result<(), LinkError> {
    write
        .write_all(&handshake.encode())
        .await
        .map_err(LinkError::WriteFailed)?;
    write.flush().await.map_err(LinkError::WriteFailed)
}

async fn read_handshake<R: AsyncRead + Unpin>(read: &mut R) -> Result<Handshake, LinkError> {
    let mut buf: [u8; HANDSHAKE_LEN] = [0; HANDSHAKE_LEN];
    read.read_exact(&mut buf).await.map_err(LinkError::Read)?;
    Ok(Handshake::decode(&buf)?)
}

async fn read_frame<R: AsyncRead + Unpin>(read: &mut R) -> Result<Option<Message>, LinkError> {
    // get size of message, eof before the first byte is a clean close
    let mut size_message_buf: [u8; 4] = [0; 4];
    let mut filled = 0;
    while filled < size_message_buf.len() {
        let n = read
            .read(&mut size_message_buf[filled..])
            .await
            .map_err(LinkError::Read)?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(LinkError::Read(io::ErrorKind::UnexpectedEof.into()))
            };
        }
        filled += n;
    }
    let size_message = u32::from_be_bytes(size_message_buf);
    if size_message == 0 {
        return Ok(Some(Message::KeepAlive));
    }
    if size_message > MAX_FRAME_LEN {
        return Err(LinkError::FrameTooLarge(size_message));
    }

    let mut body = vec![0; size_message as usize];
    read.read_exact(&mut body).await.map_err(LinkError::Read)?;
    Ok(Some(Message::decode(body[0], &body[1..])?))
}
