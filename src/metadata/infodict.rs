use std::collections::HashMap;

use crate::bencoding::Value;
use anyhow::{Result, bail};
use std::str;

#[derive(PartialEq, Debug)]
pub struct MetainfoSingleFile {
    pub name: String, // the filename. This is purely advisory. (string)
    pub length: u64,  // length of the file in bytes. (integer)
}

pub fn get_infodict(
    info_dict: &HashMap<Vec<u8>, Value>,
) -> Result<(u64, Vec<[u8; 20]>, MetainfoSingleFile)> {
    // file name
    let name_string = match info_dict.get(&b"name".to_vec()) {
        Some(Value::Str(name_vec)) => match str::from_utf8(name_vec) {
            Ok(a) => a.to_string(),
            _ => bail!("The .torrent file \"info.name\" kv is not an UTF8 string"),
        },
        _ => bail!("The .torrent file does not contain a valid \"info.name\""),
    };

    // piece length
    let piece_length = match info_dict.get(&b"piece length".to_vec()) {
        Some(Value::Int(a)) if *a > 0 => *a as u64,
        Some(Value::Int(_)) => bail!("The .torrent file \"info.piece length\" kv must be > 0"),
        _ => bail!("The .torrent file does not contain a valid \"info.piece length\""),
    };

    // pieces
    let pieces_vec = match info_dict.get(&b"pieces".to_vec()) {
        Some(Value::Str(pieces_byte_vec)) => {
            if pieces_byte_vec.len() % 20 != 0 {
                bail!(
                    "The .torrent file contains \"info.pieces\" that is not a string of length divisible by 20"
                );
            }
            pieces_byte_vec
                .chunks_exact(20)
                .map(|c| {
                    let mut piece: [u8; 20] = [0; 20];
                    piece.copy_from_slice(c);
                    piece
                })
                .collect::<Vec<_>>()
        }
        _ => bail!("The .torrent file does not contain a valid \"info.pieces\""),
    };

    // file
    if info_dict.contains_key(&b"files".to_vec()) {
        bail!("The .torrent file describes multiple files, only single file torrents are supported");
    }
    let length = match info_dict.get(&b"length".to_vec()) {
        Some(Value::Int(a)) if *a >= 0 => *a as u64,
        Some(Value::Int(_)) => bail!("The .torrent file \"info.length\" kv cannot be < 0"),
        _ => bail!("The .torrent file does not contain a valid \"info.length\""),
    };

    let expected_pieces = length.div_ceil(piece_length);
    if pieces_vec.len() as u64 != expected_pieces {
        bail!(
            "The .torrent file has {} piece hashes, but a length of {length} with piece length {piece_length} needs {expected_pieces}",
            pieces_vec.len()
        );
    }

    Ok((
        piece_length,
        pieces_vec,
        MetainfoSingleFile {
            name: name_string,
            length,
        },
    ))
}
