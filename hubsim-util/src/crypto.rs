use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use thiserror::Error;

/// Uppercase and lowercase letters plus digits.
pub const ALPHA_NUM: &[u8; 62] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Returns a string of the given length that is the result of pseudo-randomly
/// choosing characters from the given character set.
pub fn pseudorandom_string(charset: &[u8], len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| charset[rng.random_range(0..charset.len())] as char)
        .collect()
}

/// Generate a base64 encoded 256 bit key, the format used by the hub for
/// symmetric device keys.
pub fn random_key() -> String {
    let mut buf = [0u8; 32];
    rand::rng().fill(&mut buf);
    BASE64.encode(buf)
}

#[derive(Debug, Error)]
#[error("invalid signing key: {0}")]
pub struct InvalidKeyError(String);

/// Sign `message` with HMAC-SHA256 using a base64 encoded key, returning the
/// base64 encoded signature.
pub fn hmac_sha256_base64(key: &str, message: &str) -> Result<String, InvalidKeyError> {
    let key = BASE64
        .decode(key)
        .map_err(|e| InvalidKeyError(e.to_string()))?;
    let mut mac =
        Hmac::<Sha256>::new_from_slice(&key).map_err(|e| InvalidKeyError(e.to_string()))?;
    mac.update(message.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}
