use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64_URL;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::Connection;
use sha2::{Digest, Sha256};

use crate::crypto::{derive_key, KdfParams};
use crate::db;

/// A key import string did not parse. Rejected synchronously, no state change.
#[derive(Debug)]
pub struct InvalidKeyFormat;

impl std::fmt::Display for InvalidKeyFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid sync key format")
    }
}

impl std::error::Error for InvalidKeyFormat {}

const EXPORT_PREFIX: &str = "dhk1.";
const PASSPHRASE_SALT: &[u8; 16] = b"devhub-sync.key1";
const KV_SYNC_KEY: &str = "sync.key";

/// The shared symmetric key sealing operation payloads end to end; the remote
/// store never holds it.
#[derive(Clone, PartialEq, Eq)]
pub struct SyncKey([u8; 32]);

impl std::fmt::Debug for SyncKey {
    // Key material stays out of logs; only the fingerprint is printable.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SyncKey({})", self.fingerprint())
    }
}

impl SyncKey {
    pub fn generate() -> SyncKey {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        SyncKey(bytes)
    }

    /// Argon2id with a fixed salt so every device derives the same key.
    pub fn from_passphrase(passphrase: &str, params: &KdfParams) -> Result<SyncKey> {
        Ok(SyncKey(derive_key(passphrase, PASSPHRASE_SALT, params)?))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> SyncKey {
        SyncKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn export(&self) -> String {
        format!("{EXPORT_PREFIX}{}", B64_URL.encode(self.0))
    }

    pub fn import(s: &str) -> Result<SyncKey> {
        let Some(encoded) = s.trim().strip_prefix(EXPORT_PREFIX) else {
            return Err(InvalidKeyFormat.into());
        };
        let decoded = B64_URL.decode(encoded).map_err(|_| InvalidKeyFormat)?;
        if decoded.len() != 32 {
            return Err(InvalidKeyFormat.into());
        }

        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        Ok(SyncKey(bytes))
    }

    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        let mut out = String::with_capacity(8);
        for b in &digest[..4] {
            use std::fmt::Write;
            let _ = write!(&mut out, "{:02x}", b);
        }
        out
    }
}

pub fn store(conn: &Connection, key: &SyncKey) -> Result<()> {
    db::kv_set_string(conn, KV_SYNC_KEY, &key.export())
}

pub fn load(conn: &Connection) -> Result<Option<SyncKey>> {
    match db::kv_get_string(conn, KV_SYNC_KEY)? {
        Some(exported) => Ok(Some(SyncKey::import(&exported)?)),
        None => Ok(None),
    }
}

pub fn clear(conn: &Connection) -> Result<()> {
    db::kv_delete(conn, KV_SYNC_KEY)
}

/// Local half of a rotation: swap the key, discard the cursor, flip every op
/// back to pending. [`crate::sync::rotate_key`] wraps this with the remote
/// reset and re-push. Irreversible.
pub fn rotate(conn: &Connection, new_key: &SyncKey) -> Result<u64> {
    db::with_immediate_transaction(conn, || {
        db::kv_set_string(conn, KV_SYNC_KEY, &new_key.export())?;
        db::clear_cursor(conn)?;
        let repush = db::mark_all_unsynced(conn)?;
        tracing::warn!(repush, fingerprint = %new_key.fingerprint(), "sync key rotated");
        Ok(repush)
    })
}
