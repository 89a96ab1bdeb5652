use std::fmt;

use thiserror::Error;

pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;
pub const BLOCK_SIZE: u32 = 16384; // 16 KiB

const CHOKE: u8 = 0;
const UNCHOKE: u8 = 1;
const INTERESTED: u8 = 2;
const NOT_INTERESTED: u8 = 3;
const HAVE: u8 = 4;
const BITFIELD: u8 = 5;
const REQUEST: u8 = 6;
const PIECE: u8 = 7;
const CANCEL: u8 = 8;

#[derive(Eq, PartialEq, Hash, Clone, Debug)]
pub struct BlockRequest {
    pub piece_idx: u32,
    pub block_begin: u32,
    pub data_len: u32,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),          // piece index
    Bitfield(Vec<u8>), // raw bytes, the high bit in the first byte corresponds to piece index 0
    Request(BlockRequest),
    Piece(u32, u32, Vec<u8>), // index, begin, block of data
    Cancel(BlockRequest),
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep-alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have(piece_idx) => write!(f, "have piece id {piece_idx}"),
            Message::Bitfield(bytes) => {
                let total_have: u32 = bytes.iter().map(|b| b.count_ones()).sum();
                write!(
                    f,
                    "bitfield have {total_have} in {} bytes (number of pieces could be less)",
                    bytes.len()
                )
            }
            Message::Request(block_request) => write!(
                f,
                "request: piece idx: {}, begin: {}, length: {}",
                block_request.piece_idx, block_request.block_begin, block_request.data_len
            ),
            Message::Piece(piece_idx, begin, data) => write!(
                f,
                "piece: piece idx: {piece_idx}, begin: {begin}, data len: {}",
                data.len()
            ),
            Message::Cancel(block_request) => write!(
                f,
                "cancel: piece idx: {}, begin: {}, length: {}",
                block_request.piece_idx, block_request.block_begin, block_request.data_len
            ),
        }
    }
}

impl Message {
    pub fn op_code(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(CHOKE),
            Message::Unchoke => Some(UNCHOKE),
            Message::Interested => Some(INTERESTED),
            Message::NotInterested => Some(NOT_INTERESTED),
            Message::Have(_) => Some(HAVE),
            Message::Bitfield(_) => Some(BITFIELD),
            Message::Request(_) => Some(REQUEST),
            Message::Piece(_, _, _) => Some(PIECE),
            Message::Cancel(_) => Some(CANCEL),
        }
    }

    /// Encodes the message as a complete frame, length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let Some(op_code) = self.op_code() else {
            return vec![0; 4];
        };
        let mut payload: Vec<u8> = Vec::new();
        match self {
            Message::Have(piece_idx) => payload.extend_from_slice(&piece_idx.to_be_bytes()),
            Message::Bitfield(bytes) => payload.extend_from_slice(bytes),
            Message::Request(block_request) | Message::Cancel(block_request) => {
                payload.extend_from_slice(&block_request.piece_idx.to_be_bytes());
                payload.extend_from_slice(&block_request.block_begin.to_be_bytes());
                payload.extend_from_slice(&block_request.data_len.to_be_bytes());
            }
            Message::Piece(piece_idx, begin, block) => {
                payload.extend_from_slice(&piece_idx.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
            }
            _ => {}
        }
        let mut buf = Vec::with_capacity(5 + payload.len());
        buf.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
        buf.push(op_code);
        buf.extend_from_slice(&payload);
        buf
    }

    /// Decodes the body of a non-empty frame, given its op code and the bytes following it.
    pub fn decode(op_code: u8, payload: &[u8]) -> Result<Message, ProtocolError> {
        let expect_len = |len: usize| {
            if payload.len() == len {
                Ok(())
            } else {
                Err(ProtocolError::MalformedMessage {
                    op_code,
                    expected: len,
                    actual: payload.len(),
                })
            }
        };
        match op_code {
            CHOKE => expect_len(0).map(|_| Message::Choke),
            UNCHOKE => expect_len(0).map(|_| Message::Unchoke),
            INTERESTED => expect_len(0).map(|_| Message::Interested),
            NOT_INTERESTED => expect_len(0).map(|_| Message::NotInterested),
            HAVE => {
                expect_len(4)?;
                Ok(Message::Have(read_u32(payload, 0)))
            }
            BITFIELD => Ok(Message::Bitfield(payload.to_vec())),
            REQUEST => {
                expect_len(12)?;
                Ok(Message::Request(read_block_request(payload)))
            }
            PIECE => {
                if payload.len() < 8 {
                    return Err(ProtocolError::MalformedMessage {
                        op_code,
                        expected: 8,
                        actual: payload.len(),
                    });
                }
                Ok(Message::Piece(
                    read_u32(payload, 0),
                    read_u32(payload, 4),
                    payload[8..].to_vec(),
                ))
            }
            CANCEL => {
                expect_len(12)?;
                Ok(Message::Cancel(read_block_request(payload)))
            }
            unknown => Err(ProtocolError::UnknownOpCode(unknown)),
        }
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_block_request(buf: &[u8]) -> BlockRequest {
    BlockRequest {
        piece_idx: read_u32(buf, 0),
        block_begin: read_u32(buf, 4),
        data_len: read_u32(buf, 8),
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf: [u8; HANDSHAKE_LEN] = [0; HANDSHAKE_LEN];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    pub fn decode(buf: &[u8; HANDSHAKE_LEN]) -> Result<Self, ProtocolError> {
        if buf[0] != 19 || &buf[1..20] != PROTOCOL_STRING {
            return Err(ProtocolError::MalformedHandshake(
                String::from_utf8_lossy(&buf[1..20]).to_string(),
            ));
        }
        let mut handshake = Handshake::new([0; 20], [0; 20]);
        handshake.reserved.copy_from_slice(&buf[20..28]);
        handshake.info_hash.copy_from_slice(&buf[28..48]);
        handshake.peer_id.copy_from_slice(&buf[48..68]);
        Ok(handshake)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("malformed message with op code {op_code}: expected payload of {expected} bytes, got {actual}")]
    MalformedMessage {
        op_code: u8,
        expected: usize,
        actual: usize,
    },
    #[error("could not parse message type id: {0}")]
    UnknownOpCode(u8),
    #[error("malformed handshake, protocol string: {0}")]
    MalformedHandshake(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_frame(frame: &[u8]) -> Message {
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4, "length prefix must cover the body");
        if len == 0 {
            return Message::KeepAlive;
        }
        Message::decode(frame[4], &frame[5..]).unwrap()
    }

    #[test]
    fn every_message_survives_encode_decode() {
        let block_request = BlockRequest {
            piece_idx: 3,
            block_begin: 16384,
            data_len: 16384,
        };
        let messages = vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have(0xdeadbeef),
            Message::Bitfield(vec![0b10100000]),
            Message::Request(block_request.clone()),
            Message::Piece(3, 16384, vec![1, 2, 3, 4, 5]),
            Message::Cancel(block_request),
        ];
        for m in messages {
            assert_eq!(decode_frame(&m.encode()), m);
        }
    }

    #[test]
    fn encode_have_layout() {
        assert_eq!(Message::Have(1).encode(), vec![0, 0, 0, 5, 4, 0, 0, 0, 1]);
        assert_eq!(Message::KeepAlive.encode(), vec![0, 0, 0, 0]);
        assert_eq!(Message::Unchoke.encode(), vec![0, 0, 0, 1, 1]);
    }

    #[test]
    fn decode_rejects_wrong_lengths() {
        assert_matches!(
            Message::decode(4, &[0, 0, 1]),
            Err(ProtocolError::MalformedMessage {
                op_code: 4,
                expected: 4,
                actual: 3
            })
        );
        assert_matches!(
            Message::decode(0, &[1]),
            Err(ProtocolError::MalformedMessage { .. })
        );
        assert_matches!(
            Message::decode(6, &[0; 11]),
            Err(ProtocolError::MalformedMessage { .. })
        );
        assert_matches!(
            Message::decode(7, &[0; 7]),
            Err(ProtocolError::MalformedMessage { .. })
        );
    }

    #[test]
    fn decode_rejects_unknown_op_code() {
        assert_eq!(Message::decode(20, &[]), Err(ProtocolError::UnknownOpCode(20)));
    }

    #[test]
    fn handshake_layout() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let buf = handshake.encode();
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], b"BitTorrent protocol");
        assert_eq!(buf[20..28], [0; 8]);
        assert_eq!(buf[28..48], [1; 20]);
        assert_eq!(buf[48..68], [2; 20]);
        assert_eq!(Handshake::decode(&buf), Ok(handshake));
    }

    #[test]
    fn handshake_rejects_other_protocols() {
        let mut buf = Handshake::new([1; 20], [2; 20]).encode();
        buf[1] = b'b';
        assert_matches!(
            Handshake::decode(&buf),
            Err(ProtocolError::MalformedHandshake(_))
        );
    }
}
