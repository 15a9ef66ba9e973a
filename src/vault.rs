// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Vault: authenticated encryption of plaintext values under a
//! master-key-derived sub-key, persisted in an indexed keyed store.
//!
//! Storage is an embedded SQLite database (single writer, many readers,
//! atomic at the row level) opened with owner-only (`0600`) permissions.
//!
//! ## Salt persistence (design decision, see DESIGN.md)
//!
//! Each row stores its own 32-byte PBKDF2 salt alongside its ciphertext,
//! IV, and auth tag, and the salt is reloaded on retrieve rather than
//! re-derived fresh. A fresh salt per retrieve can never match the salt
//! used at store time, so nothing would ever decrypt; persisting the salt
//! per row is what option (a) of the open design question calls for, and
//! it additionally leaves room for per-row key rotation later.

use crate::error::{CoreError, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::Utc;
use fs2::FileExt;
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use zeroize::Zeroize;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const SALT_LEN: usize = 32;
const PBKDF2_ROUNDS: u32 = 100_000;

/// How long `open` waits for the cross-process exclusive lock before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Acquire an exclusive advisory lock on `path`'s `.lock` sibling, retrying
/// until `timeout` elapses. This is the cross-process half of "single
/// writer": the in-process `Mutex<Connection>` alone does not stop a second
/// process from opening the same database file concurrently.
fn acquire_exclusive_lock(path: &Path, timeout: Duration) -> Result<File> {
    let lock_path = path.with_extension("lock");
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let lock_file = OpenOptions::new().read(true).write(true).create(true).open(&lock_path)?;

    let start = Instant::now();
    loop {
        match lock_file.try_lock_exclusive() {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    return Err(CoreError::internal("timed out waiting for exclusive vault lock"));
                }
                std::thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Observable vault lifecycle states (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultState {
    Uninitialized,
    Open,
    Closed,
}

/// One persisted, independently decryptable row.
#[derive(Debug, Clone)]
pub struct VaultEntry {
    pub id: i64,
    pub token: String,
    pub category: String,
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub salt: Vec<u8>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

/// An owned master key. Zeroized on drop; never logged, never serialized.
pub struct MasterKey(Vec<u8>);

impl MasterKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

fn derive_key(master_key: &[u8], salt: &[u8]) -> zeroize::Zeroizing<[u8; 32]> {
    let mut key = zeroize::Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(master_key, salt, PBKDF2_ROUNDS, &mut *key);
    key
}

pub struct Vault {
    conn: Mutex<Option<Connection>>,
    master_key: MasterKey,
    state: Mutex<VaultState>,
    _lock_file: File,
}

impl Vault {
    /// Open (creating if absent) the vault file at `path`, creating the
    /// schema and indexes if this is a fresh database.
    pub fn open(path: &Path, master_key: MasterKey) -> Result<Self> {
        Self::open_with_lock_timeout(path, master_key, LOCK_TIMEOUT)
    }

    /// Same as `open`, but with an explicit wait for the cross-process lock.
    /// Exposed so tests can exercise lock contention without waiting out the
    /// production timeout.
    pub fn open_with_lock_timeout(path: &Path, master_key: MasterKey, lock_timeout: Duration) -> Result<Self> {
        let lock_file = acquire_exclusive_lock(path, lock_timeout)?;
        let fresh = !path.exists();
        let conn = Connection::open(path).map_err(|e| CoreError::internal(&e.to_string()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS vault_entries (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                token       TEXT NOT NULL,
                category    TEXT NOT NULL,
                ciphertext  BLOB NOT NULL,
                iv          BLOB NOT NULL,
                auth_tag    BLOB NOT NULL,
                salt        BLOB NOT NULL,
                created_at  INTEGER NOT NULL,
                expires_at  INTEGER
            )",
            [],
        )?;
        conn.execute("CREATE INDEX IF NOT EXISTS idx_vault_token ON vault_entries(token)", [])?;
        conn.execute("CREATE INDEX IF NOT EXISTS idx_vault_category ON vault_entries(category)", [])?;
        conn.execute("CREATE INDEX IF NOT EXISTS idx_vault_expires_at ON vault_entries(expires_at)", [])?;

        if fresh {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = std::fs::metadata(path)?.permissions();
                perms.set_mode(0o600);
                std::fs::set_permissions(path, perms)?;
            }
        }

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            master_key,
            state: Mutex::new(VaultState::Open),
            _lock_file: lock_file,
        })
    }

    pub fn state(&self) -> VaultState {
        *self.state.lock().expect("vault state mutex poisoned")
    }

    fn require_open(&self) -> Result<()> {
        if self.state() != VaultState::Open {
            return Err(CoreError::internal("vault is not open"));
        }
        Ok(())
    }

    /// Encrypt and persist `value`. Returns the new row id.
    pub fn store(&self, token: &str, category: &str, value: &[u8], ttl_secs: Option<i64>) -> Result<i64> {
        self.require_open()?;

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        let key_bytes = derive_key(&self.master_key.0, &salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(&iv);

        let sealed = cipher
            .encrypt(nonce, Payload { msg: value, aad: &[] })
            .map_err(|_| CoreError::encryption_failure("aead seal failed"))?;

        if sealed.len() < TAG_LEN {
            return Err(CoreError::encryption_failure("sealed output shorter than tag length"));
        }
        let (ciphertext, auth_tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let created_at = Utc::now().timestamp_millis();
        let expires_at = ttl_secs.map(|s| created_at + s * 1000);

        let guard = self.conn.lock().expect("vault connection mutex poisoned");
        let conn = guard.as_ref().ok_or_else(|| CoreError::internal("vault connection closed"))?;
        conn.execute(
            "INSERT INTO vault_entries (token, category, ciphertext, iv, auth_tag, salt, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![token, category, ciphertext, iv.to_vec(), auth_tag.to_vec(), salt.to_vec(), created_at, expires_at],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Return the most recently inserted, non-expired value for `(token, category)`.
    pub fn retrieve(&self, token: &str, category: &str) -> Result<Option<Vec<u8>>> {
        self.require_open()?;

        let now = Utc::now().timestamp_millis();
        let guard = self.conn.lock().expect("vault connection mutex poisoned");
        let conn = guard.as_ref().ok_or_else(|| CoreError::internal("vault connection closed"))?;

        let row: Option<(Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>)> = conn
            .query_row(
                "SELECT ciphertext, iv, auth_tag, salt FROM vault_entries
                 WHERE token = ?1 AND category = ?2 AND (expires_at IS NULL OR expires_at > ?3)
                 ORDER BY created_at DESC LIMIT 1",
                params![token, category, now],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((ciphertext, iv, auth_tag, salt)) = row else {
            return Ok(None);
        };

        if iv.len() != IV_LEN {
            return Err(CoreError::vault_corruption("iv length mismatch on retrieve"));
        }

        let key_bytes = derive_key(&self.master_key.0, &salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(&iv);

        let mut sealed = ciphertext.clone();
        sealed.extend_from_slice(&auth_tag);

        let plaintext = cipher
            .decrypt(nonce, Payload { msg: &sealed, aad: &[] })
            .map_err(|_| CoreError::encryption_failure("aead authentication failed on retrieve"))?;

        Ok(Some(plaintext))
    }

    /// Delete rows whose `expires_at` is in the past. Returns the count removed.
    pub fn cleanup_expired(&self) -> Result<usize> {
        self.require_open()?;
        let now = Utc::now().timestamp_millis();
        let guard = self.conn.lock().expect("vault connection mutex poisoned");
        let conn = guard.as_ref().ok_or_else(|| CoreError::internal("vault connection closed"))?;
        let count = conn.execute(
            "DELETE FROM vault_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        Ok(count)
    }

    pub fn close(&self) {
        let mut guard = self.conn.lock().expect("vault connection mutex poisoned");
        *guard = None;
        let mut state = self.state.lock().expect("vault state mutex poisoned");
        *state = VaultState::Closed;
        let _ = FileExt::unlock(&self._lock_file);
    }

    /// Fetch every row for backup/repair. `since` filters to `created_at >
    /// since` for incremental backups.
    pub fn all_entries(&self, since: Option<i64>) -> Result<Vec<VaultEntry>> {
        self.require_open()?;
        let guard = self.conn.lock().expect("vault connection mutex poisoned");
        let conn = guard.as_ref().ok_or_else(|| CoreError::internal("vault connection closed"))?;

        let sql = "SELECT id, token, category, ciphertext, iv, auth_tag, salt, created_at, expires_at
                    FROM vault_entries WHERE created_at > ?1 ORDER BY id ASC";
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![since.unwrap_or(i64::MIN)], |row| {
            Ok(VaultEntry {
                id: row.get(0)?,
                token: row.get(1)?,
                category: row.get(2)?,
                ciphertext: row.get(3)?,
                iv: row.get(4)?,
                auth_tag: row.get(5)?,
                salt: row.get(6)?,
                created_at: row.get(7)?,
                expires_at: row.get(8)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Insert a raw entry as-is (used by restore). Returns the new row id.
    pub fn insert_raw(&self, entry: &VaultEntry) -> Result<i64> {
        self.require_open()?;
        let guard = self.conn.lock().expect("vault connection mutex poisoned");
        let conn = guard.as_ref().ok_or_else(|| CoreError::internal("vault connection closed"))?;
        conn.execute(
            "INSERT INTO vault_entries (token, category, ciphertext, iv, auth_tag, salt, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.token,
                entry.category,
                entry.ciphertext,
                entry.iv,
                entry.auth_tag,
                entry.salt,
                entry.created_at,
                entry.expires_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn delete_entry(&self, id: i64) -> Result<()> {
        self.require_open()?;
        let guard = self.conn.lock().expect("vault connection mutex poisoned");
        let conn = guard.as_ref().ok_or_else(|| CoreError::internal("vault connection closed"))?;
        conn.execute("DELETE FROM vault_entries WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn update_created_at(&self, id: i64, created_at: i64) -> Result<()> {
        self.require_open()?;
        let guard = self.conn.lock().expect("vault connection mutex poisoned");
        let conn = guard.as_ref().ok_or_else(|| CoreError::internal("vault connection closed"))?;
        conn.execute("UPDATE vault_entries SET created_at = ?1 WHERE id = ?2", params![created_at, id])?;
        Ok(())
    }

    /// Most recent `created_at` among all rows (including expired) for
    /// `token`, or `None` if the destination has no row yet. Used by merge
    /// restore to decide whether an incoming backup row is newer.
    pub fn latest_created_at_for_token(&self, token: &str) -> Result<Option<i64>> {
        self.require_open()?;
        let guard = self.conn.lock().expect("vault connection mutex poisoned");
        let conn = guard.as_ref().ok_or_else(|| CoreError::internal("vault connection closed"))?;
        conn.query_row(
            "SELECT MAX(created_at) FROM vault_entries WHERE token = ?1",
            params![token],
            |r| r.get(0),
        )
        .map_err(CoreError::from)
    }

    /// GDPR-style value-scoped export: every live row for `token`, decrypted.
    /// Used for a data-subject access request against a single token.
    pub fn export_by_token(&self, token: &str) -> Result<Vec<(VaultEntry, Vec<u8>)>> {
        self.require_open()?;
        let rows = self.rows_for_token(token)?;
        let now = Utc::now().timestamp_millis();
        let mut out = Vec::new();
        for entry in rows {
            if entry.expires_at.map(|e| e <= now).unwrap_or(false) {
                continue;
            }
            let plaintext = self.decrypt_entry(&entry)?;
            out.push((entry, plaintext));
        }
        Ok(out)
    }

    /// GDPR-style value-scoped delete: remove every row (live or expired)
    /// stored under `token`. Returns the number of rows removed.
    pub fn delete_by_token(&self, token: &str) -> Result<usize> {
        self.require_open()?;
        let guard = self.conn.lock().expect("vault connection mutex poisoned");
        let conn = guard.as_ref().ok_or_else(|| CoreError::internal("vault connection closed"))?;
        let count = conn.execute("DELETE FROM vault_entries WHERE token = ?1", params![token])?;
        Ok(count)
    }

    fn rows_for_token(&self, token: &str) -> Result<Vec<VaultEntry>> {
        let guard = self.conn.lock().expect("vault connection mutex poisoned");
        let conn = guard.as_ref().ok_or_else(|| CoreError::internal("vault connection closed"))?;
        let sql = "SELECT id, token, category, ciphertext, iv, auth_tag, salt, created_at, expires_at
                    FROM vault_entries WHERE token = ?1 ORDER BY created_at DESC";
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![token], |row| {
            Ok(VaultEntry {
                id: row.get(0)?,
                token: row.get(1)?,
                category: row.get(2)?,
                ciphertext: row.get(3)?,
                iv: row.get(4)?,
                auth_tag: row.get(5)?,
                salt: row.get(6)?,
                created_at: row.get(7)?,
                expires_at: row.get(8)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn decrypt_entry(&self, entry: &VaultEntry) -> Result<Vec<u8>> {
        if entry.iv.len() != IV_LEN {
            return Err(CoreError::vault_corruption("iv length mismatch on export"));
        }
        let key_bytes = derive_key(&self.master_key.0, &entry.salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(&entry.iv);

        let mut sealed = entry.ciphertext.clone();
        sealed.extend_from_slice(&entry.auth_tag);

        cipher
            .decrypt(nonce, Payload { msg: &sealed, aad: &[] })
            .map_err(|_| CoreError::encryption_failure("aead authentication failed on export"))
    }
}
