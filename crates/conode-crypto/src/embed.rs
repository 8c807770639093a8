//! Embedding short byte strings into Ristretto points.
//!
//! Layout of the 32-byte encoding: byte 0 is random with the low bit
//! cleared, byte 1 holds the length, the data follows, and the remaining
//! bytes are random with the top bit of byte 31 cleared. Candidates are
//! drawn until one decodes to a canonical point.

use curve25519_dalek::ristretto::CompressedRistretto;
use rand::RngCore;

use crate::{CryptoError, CryptoResult, Point};

/// Maximum number of data bytes a single point can carry.
pub const EMBED_LEN: usize = 29;

const MAX_ATTEMPTS: usize = 1000;

pub fn embed(data: &[u8]) -> CryptoResult<Point> {
    if data.len() > EMBED_LEN {
        return Err(CryptoError::EmbedTooLong(data.len()));
    }
    let mut rng = rand::rngs::OsRng;
    let mut buf = [0u8; 32];
    for _ in 0..MAX_ATTEMPTS {
        rng.fill_bytes(&mut buf);
        buf[0] &= 0xfe;
        buf[1] = data.len() as u8;
        buf[2..2 + data.len()].copy_from_slice(data);
        buf[31] &= 0x7f;
        if let Some(point) = CompressedRistretto(buf).decompress() {
            return Ok(point);
        }
    }
    Err(CryptoError::EmbedFailed)
}

pub fn extract(point: &Point) -> CryptoResult<Vec<u8>> {
    let bytes = point.compress().to_bytes();
    let len = bytes[1] as usize;
    if len > EMBED_LEN {
        return Err(CryptoError::EmbedTooLong(len));
    }
    Ok(bytes[2..2 + len].to_vec())
}

/// Splits `data` into as many points as needed.
pub fn embed_all(data: &[u8]) -> CryptoResult<Vec<Point>> {
    if data.is_empty() {
        return Ok(vec![embed(&[])?]);
    }
    data.chunks(EMBED_LEN).map(embed).collect()
}

pub fn extract_all(points: &[Point]) -> CryptoResult<Vec<u8>> {
    let mut out = Vec::new();
    for p in points {
        out.extend(extract(p)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embed_extract() {
        let key = [7u8; 24];
        let p = embed(&key).unwrap();
        assert_eq!(extract(&p).unwrap(), key.to_vec());
    }

    #[test]
    fn test_embed_all_long_data() {
        let data: Vec<u8> = (0..70u8).collect();
        let points = embed_all(&data).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(extract_all(&points).unwrap(), data);
    }

    #[test]
    fn test_too_long() {
        assert_eq!(embed(&[0u8; 30]), Err(CryptoError::EmbedTooLong(30)));
    }
}
