use core::str;
use std::ascii;

use rand::Rng;

const PEER_ID_PREFIX: &str = "-SF0001-";

pub fn force_string(v: &[u8]) -> String {
    match str::from_utf8(v) {
        Ok(s) => s.to_string(),
        Err(_) => format!(
            "<non_utf-8>{}",
            v.iter()
                .flat_map(|b| ascii::escape_default(*b))
                .map(char::from)
                .collect::<String>()
        ),
    }
}

pub fn pretty_info_hash(info_hash: [u8; 20]) -> String {
    hex::encode(info_hash)
}

// azureus-style peer id: client tag and version, then random digits
pub fn generate_peer_id() -> [u8; 20] {
    let mut rng = rand::rng();
    let mut peer_id: [u8; 20] = [0; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX.as_bytes());
    for b in peer_id[8..].iter_mut() {
        *b = b'0' + rng.random_range(0..10);
    }
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_format() {
        let peer_id = generate_peer_id();
        assert_eq!(&peer_id[..8], b"-SF0001-");
        assert!(peer_id[8..].iter().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn force_string_escapes_binary() {
        assert_eq!(force_string(b"abc"), "abc");
        assert_eq!(force_string(&[0xff, b'a']), "<non_utf-8>\\xffa");
    }

    #[test]
    fn info_hash_is_lowercase_hex() {
        let mut h = [0; 20];
        h[0] = 0xab;
        h[19] = 0x01;
        assert_eq!(pretty_info_hash(h), format!("ab{}01", "00".repeat(18)));
    }
}
