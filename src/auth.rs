//! Server password: plaintext or an iterated, salted SHA-256 string of the
//! form `es1$<iterations>$<salt-hex>$<digest-hex>`. The stored string carries
//! its own salt, so one config value suffices. Verification is constant-time.

use rand::RngCore;
use sha2::{Digest, Sha256};

const HASH_PREFIX: &str = "es1$";
const DEFAULT_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;

#[derive(Debug, Clone)]
pub enum Auth {
    /// No password configured; every session starts authenticated.
    Open,
    Plain(String),
    Hash(StoredHash),
}

#[derive(Debug, Clone)]
pub struct StoredHash {
    iterations: u32,
    salt: Vec<u8>,
    digest: Vec<u8>,
}

impl Auth {
    /// Interpret a configured secret: values carrying the hash prefix take
    /// the hash path, everything else is a plaintext password.
    pub fn from_secret(secret: Option<&str>) -> Auth {
        match secret {
            None | Some("") => Auth::Open,
            Some(s) => match parse_hash(s) {
                Some(hash) => Auth::Hash(hash),
                None => Auth::Plain(s.to_string()),
            },
        }
    }

    pub fn required(&self) -> bool {
        !matches!(self, Auth::Open)
    }

    pub fn verify(&self, password: &str) -> bool {
        match self {
            Auth::Open => true,
            // Digest both sides first so the comparison leaks neither
            // content nor length.
            Auth::Plain(expected) => constant_time_eq(
                &Sha256::digest(expected.as_bytes()),
                &Sha256::digest(password.as_bytes()),
            ),
            Auth::Hash(stored) => {
                let derived = derive(password.as_bytes(), &stored.salt, stored.iterations);
                constant_time_eq(&derived, &stored.digest)
            }
        }
    }
}

/// Produce a storable hash string for `plain`.
pub fn hash_password(plain: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let digest = derive(plain.as_bytes(), &salt, DEFAULT_ITERATIONS);
    format!(
        "{}{}${}${}",
        HASH_PREFIX,
        DEFAULT_ITERATIONS,
        hex_encode(&salt),
        hex_encode(&digest)
    )
}

fn parse_hash(s: &str) -> Option<StoredHash> {
    let rest = s.strip_prefix(HASH_PREFIX)?;
    let mut parts = rest.splitn(3, '$');
    let iterations: u32 = parts.next()?.parse().ok()?;
    let salt = hex_decode(parts.next()?)?;
    let digest = hex_decode(parts.next()?)?;
    if iterations == 0 || salt.is_empty() || digest.len() != 32 {
        return None;
    }
    Some(StoredHash { iterations, salt, digest })
}

fn derive(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut h = Sha256::new();
    h.update(salt);
    h.update(password);
    let mut digest = h.finalize();
    for _ in 1..iterations {
        digest = Sha256::digest(&digest);
    }
    digest.to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_accepts_anything() {
        let auth = Auth::from_secret(None);
        assert!(!auth.required());
        assert!(auth.verify("whatever"));
    }

    #[test]
    fn plain_matches_exactly() {
        let auth = Auth::from_secret(Some("hunter2"));
        assert!(auth.required());
        assert!(auth.verify("hunter2"));
        assert!(!auth.verify("hunter3"));
        assert!(!auth.verify(""));
    }

    #[test]
    fn hash_roundtrip() {
        let stored = hash_password("correct horse");
        assert!(stored.starts_with(HASH_PREFIX));
        let auth = Auth::from_secret(Some(&stored));
        assert!(matches!(auth, Auth::Hash(_)));
        assert!(auth.verify("correct horse"));
        assert!(!auth.verify("battery staple"));
    }

    #[test]
    fn two_hashes_of_same_password_differ() {
        // Fresh salt each time
        assert_ne!(hash_password("pw"), hash_password("pw"));
    }

    #[test]
    fn malformed_hash_string_is_plaintext() {
        let auth = Auth::from_secret(Some("es1$not$a$hash"));
        assert!(matches!(auth, Auth::Plain(_)));
        assert!(auth.verify("es1$not$a$hash"));
    }

    #[test]
    fn hex_roundtrip() {
        let bytes = [0u8, 1, 0xab, 0xff];
        assert_eq!(hex_decode(&hex_encode(&bytes)).unwrap(), bytes);
        assert!(hex_decode("xyz").is_none());
        assert!(hex_decode("abc").is_none());
    }
}
