//! Challenge-response authentication for the connection handshake.
//!
//! The accepting side sends a random challenge; the connecting side answers
//! with `hex(sha256(challenge || secret))`. The secret never crosses the wire.

use rand::RngCore;
use sha2::Digest;
use sha2::Sha256;

pub fn challenge() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn respond(challenge: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(challenge.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn verify(challenge: &str, secret: &str, response: &str) -> bool {
    let expected = respond(challenge, secret);
    // Compare every byte regardless of where the first mismatch is.
    expected.len() == response.len()
        && expected
            .bytes()
            .zip(response.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}
