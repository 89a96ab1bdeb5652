use crate::{bencoding::Value, util::pretty_info_hash};
use anyhow::{Result, bail};
use sha1::{Digest, Sha1};
use size::{Size, Style};
use std::{fmt, str};

use super::infodict;

#[derive(PartialEq, Debug)]
pub struct Metainfo {
    pub announce: String,
    pub name: String,
    pub length: u64,           // total length of the file in bytes
    pub piece_length: u64,     // number of bytes in each piece (integer)
    pub pieces: Vec<[u8; 20]>, // 20-byte SHA1 of each piece
    pub info_hash: [u8; 20], // 20-byte SHA1 hash of the value of the info key from the Metainfo file
}

impl fmt::Display for Metainfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "announce: {}\nfile: {} ({})\npiece_length: {}\nn. pieces: {}\ninfo_hash: {}",
            self.announce,
            self.name,
            Size::from_bytes(self.length),
            Size::from_bytes(self.piece_length)
                .format()
                .with_style(Style::Abbreviated),
            self.pieces.len(),
            pretty_info_hash(self.info_hash),
        )
    }
}

impl Metainfo {
    pub fn new(v: &Value, source: &[u8]) -> Result<Self> {
        let torrent_map = match v {
            Value::Dict(m, _, _) => m,
            _ => bail!("The .torrent file is invalid: it does not contain a dict"),
        };

        // announce, falling back to the first http tracker of announce-list
        let mut announces = Vec::new();
        if let Some(Value::Str(announce_vec)) = torrent_map.get(&b"announce".to_vec()) {
            match str::from_utf8(announce_vec) {
                Ok(a) => announces.push(a.to_string()),
                _ => bail!("The .torrent file \"announce\" is not an UTF8 string"),
            }
        }
        if let Some(Value::List(tiers)) = torrent_map.get(&b"announce-list".to_vec()) {
            for tier in tiers {
                if let Value::List(urls) = tier {
                    for url in urls {
                        if let Value::Str(url) = url {
                            if let Ok(a) = str::from_utf8(url) {
                                announces.push(a.to_string());
                            }
                        }
                    }
                }
            }
        }
        let announce = match announces.into_iter().find(|a| is_http(a)) {
            Some(a) => a,
            None => bail!("The .torrent file does not contain an http or https announce url"),
        };

        // info dict
        let (info_dict, info_hash) = match torrent_map.get(&b"info".to_vec()) {
            Some(Value::Dict(a, s, e)) => {
                let mut info_hash: [u8; 20] = [0; 20];
                info_hash.copy_from_slice(&Sha1::digest(&source[*s..*e]));
                (a, info_hash)
            }
            _ => bail!("The .torrent file does not contain a valid \"info\""),
        };

        let (piece_length, pieces, file) = infodict::get_infodict(info_dict)?;

        Ok(Metainfo {
            announce,
            name: file.name,
            length: file.length,
            piece_length,
            pieces,
            info_hash,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Length of a piece, the last one may be shorter than `piece_length`.
    pub fn piece_size(&self, piece_idx: usize) -> u64 {
        let start = piece_idx as u64 * self.piece_length;
        self.piece_length.min(self.length.saturating_sub(start))
    }
}

fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
