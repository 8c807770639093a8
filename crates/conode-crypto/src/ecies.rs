//! Public-key encryption for point-to-point payloads such as DKG deals.
//!
//! An ephemeral Diffie-Hellman secret is stretched with HKDF-SHA256 into an
//! AES-256-GCM key. `context` is bound as associated data.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{base_mul, point_to_bytes, random_scalar, CryptoError, CryptoResult, Point, Scalar};

const HKDF_INFO: &[u8] = b"conode-ecies-v1";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    pub ephemeral: Point,
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

fn derive_key(shared: &Point, ephemeral: &Point) -> CryptoResult<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(&point_to_bytes(ephemeral)[..]), &point_to_bytes(shared));
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(okm)
}

pub fn seal(recipient: &Point, context: &[u8], plaintext: &[u8]) -> CryptoResult<Sealed> {
    let eph_secret = random_scalar();
    let ephemeral = base_mul(&eph_secret);
    let key = derive_key(&(recipient * eph_secret), &ephemeral)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

    let mut nonce = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: context,
            },
        )
        .map_err(|_| CryptoError::Encryption)?;

    Ok(Sealed {
        ephemeral,
        nonce,
        ciphertext,
    })
}

pub fn open(secret: &Scalar, context: &[u8], sealed: &Sealed) -> CryptoResult<Vec<u8>> {
    let key = derive_key(&(sealed.ephemeral * secret), &sealed.ephemeral)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    cipher
        .decrypt(
            Nonce::from_slice(&sealed.nonce),
            Payload {
                msg: &sealed.ciphertext,
                aad: context,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}
