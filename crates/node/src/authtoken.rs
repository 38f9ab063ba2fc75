//! Local control channel shared secret.
//!
//! A 24-character alphanumeric token stored in `authtoken.secret`. The
//! control channel key is simply SHA-256 of the raw token bytes, so any
//! out-of-process client holding the file can derive it independently.

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

use crate::constants::AUTH_TOKEN_LENGTH;
use crate::identity::lock_down;

const TOKEN_CHARSET: &[u8; 62] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Read `authtoken.secret`, generating it on first run. Write failure is an
/// error the caller treats as unrecoverable.
pub fn init_from_home(home: &Path) -> Result<String> {
    let path = home.join("authtoken.secret");

    let token = match fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let token = generate_token();
            fs::write(&path, &token)
                .context("could not write authtoken.secret (home path not writable?)")?;
            token
        }
        Err(e) => return Err(e).with_context(|| format!("could not read {:?}", path)),
    };

    lock_down(&path)?;
    Ok(token)
}

fn generate_token() -> String {
    let mut token = String::with_capacity(AUTH_TOKEN_LENGTH);
    for _ in 0..AUTH_TOKEN_LENGTH {
        let mut r = [0u8; 4];
        OsRng.fill_bytes(&mut r);
        let idx = u32::from_le_bytes(r) as usize % TOKEN_CHARSET.len();
        token.push(TOKEN_CHARSET[idx] as char);
    }
    token
}

/// Derive the 32-byte symmetric key authenticating local control packets.
pub fn control_key(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_stable_across_restarts() {
        let home = tempfile::tempdir().unwrap();
        let first = init_from_home(home.path()).unwrap();
        let second = init_from_home(home.path()).unwrap();
        assert_eq!(first, second);

        assert_eq!(first.len(), AUTH_TOKEN_LENGTH);
        assert!(first.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn key_is_sha256_of_token() {
        let key = control_key("abc");
        let expected: [u8; 32] = Sha256::digest(b"abc").into();
        assert_eq!(key, expected);
    }
}
