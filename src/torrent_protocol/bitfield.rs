use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
#[error("bitfield is {actual_bytes} bytes long, expected {expected_bytes}")]
pub struct BitfieldLengthError {
    pub expected_bytes: usize,
    pub actual_bytes: usize,
}

/// The set of pieces a single remote peer claims to have.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitfield {
    pieces: Vec<bool>,
}

impl Bitfield {
    pub fn new(piece_count: usize) -> Self {
        Bitfield {
            pieces: vec![false; piece_count],
        }
    }

    /// Decodes wire bytes, which must be exactly `ceil(piece_count / 8)` long. Spare trailing bits are ignored.
    pub fn from_bytes(buf: &[u8], piece_count: usize) -> Result<Self, BitfieldLengthError> {
        let expected_bytes = piece_count.div_ceil(8);
        if buf.len() != expected_bytes {
            return Err(BitfieldLengthError {
                expected_bytes,
                actual_bytes: buf.len(),
            });
        }
        let mut pieces = decode_bitfield(buf);
        pieces.truncate(piece_count);
        Ok(Bitfield { pieces })
    }

    #[cfg(test)]
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_bitfield(&self.pieces)
    }

    pub fn has(&self, piece_idx: usize) -> bool {
        self.pieces.get(piece_idx).copied().unwrap_or(false)
    }

    /// Sets the bit for `piece_idx`; returns true if it was not set before. Out of range indexes are ignored.
    pub fn set(&mut self, piece_idx: usize) -> bool {
        match self.pieces.get_mut(piece_idx) {
            Some(bit) if !*bit => {
                *bit = true;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn count(&self) -> usize {
        self.pieces.iter().filter(|b| **b).count()
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.pieces
            .iter()
            .enumerate()
            .filter_map(|(i, has)| has.then_some(i))
    }
}

fn decode_bitfield(buf: &[u8]) -> Vec<bool> {
    let mut bitfield = vec![false; buf.len() * 8];
    for i in 0..buf.len() {
        let mut mask: u8 = 0b10000000;
        for j in 0..8 {
            bitfield[i * 8 + j] = (buf[i] & mask) != 0;
            mask >>= 1;
        }
    }
    bitfield
}

#[cfg(test)]
fn encode_bitfield(bitfield: &[bool]) -> Vec<u8> {
    let mut buf = vec![0; bitfield.len().div_ceil(8)];
    for (i, byte) in buf.iter_mut().enumerate() {
        let mut mask: u8 = 0b10000000;
        for j in 0..8 {
            if bitfield.len() <= i * 8 + j {
                break;
            }
            if bitfield[i * 8 + j] {
                *byte |= mask;
            }
            mask >>= 1;
        }
    }
    buf
}
