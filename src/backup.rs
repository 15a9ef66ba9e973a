// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Backup / Restore / Repair for the Vault.
//!
//! Backup is a line-delimited file: a metadata record followed by one
//! record per `VaultEntry`. Restore supports `force`, `merge`, and the
//! default fail-if-destination-exists mode. Repair classifies each row as
//! a critical defect (deleted) or a non-critical one (rewritten in place).

use crate::error::{CoreError, Result};
use crate::vault::{Vault, VaultEntry};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub version: u32,
    pub timestamp: i64,
    #[serde(rename = "entryCount")]
    pub entry_count: usize,
    pub checksum: String,
    pub incremental: bool,
    #[serde(rename = "previousBackupTimestamp", skip_serializing_if = "Option::is_none")]
    pub previous_backup_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEntryRecord {
    pub id: i64,
    pub token: String,
    pub category: String,
    #[serde(rename = "encrypted_value")]
    pub encrypted_value: String,
    pub iv: String,
    pub auth_tag: String,
    /// The per-row PBKDF2 salt (spec §9 design decision (a)). Not part of
    /// the literal spec.md wire format, which predates the salt-persistence
    /// fix; carrying it here is required for a restored row to ever decrypt
    /// again. See DESIGN.md.
    pub salt: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

impl BackupEntryRecord {
    fn from_entry(entry: &VaultEntry) -> Self {
        Self {
            id: entry.id,
            token: entry.token.clone(),
            category: entry.category.clone(),
            encrypted_value: BASE64.encode(&entry.ciphertext),
            iv: BASE64.encode(&entry.iv),
            auth_tag: BASE64.encode(&entry.auth_tag),
            salt: BASE64.encode(&entry.salt),
            created_at: entry.created_at,
            expires_at: entry.expires_at,
        }
    }

    fn into_entry(self) -> Result<VaultEntry> {
        Ok(VaultEntry {
            id: self.id,
            token: self.token,
            category: self.category,
            ciphertext: BASE64.decode(&self.encrypted_value).map_err(|e| CoreError::internal(&e.to_string()))?,
            iv: BASE64.decode(&self.iv).map_err(|e| CoreError::internal(&e.to_string()))?,
            auth_tag: BASE64.decode(&self.auth_tag).map_err(|e| CoreError::internal(&e.to_string()))?,
            salt: BASE64.decode(&self.salt).map_err(|e| CoreError::internal(&e.to_string()))?,
            created_at: self.created_at,
            expires_at: self.expires_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    Force,
    Merge,
    FailIfExists,
}

#[derive(Debug, Clone, Default)]
pub struct RepairReport {
    pub unrecoverable_count: usize,
    pub repaired_count: usize,
    pub surviving_rows: usize,
}

fn checksum_entries(records: &[BackupEntryRecord]) -> String {
    let joined = records
        .iter()
        .map(|r| format!("{}:{}:{}", r.id, r.token, r.encrypted_value))
        .collect::<Vec<_>>()
        .join("\n");
    hex::encode(Sha256::digest(joined.as_bytes()))
}

/// Write a backup of `vault`'s entries to `path`. `since` filters to
/// `created_at > since` for incremental backups.
pub fn backup(vault: &Vault, path: &Path, since: Option<i64>, previous_backup_timestamp: Option<i64>) -> Result<()> {
    let entries = vault.all_entries(since)?;
    let records: Vec<BackupEntryRecord> = entries.iter().map(BackupEntryRecord::from_entry).collect();
    let checksum = checksum_entries(&records);

    let metadata = BackupMetadata {
        version: 1,
        timestamp: Utc::now().timestamp_millis(),
        entry_count: records.len(),
        checksum,
        incremental: since.is_some(),
        previous_backup_timestamp,
    };

    let mut out = String::new();
    out.push_str(&serde_json::to_string(&serde_json::json!({ "metadata": metadata }))
        .map_err(|e| CoreError::internal(&e.to_string()))?);
    out.push('\n');
    for record in &records {
        out.push_str(
            &serde_json::to_string(&serde_json::json!({ "entry": record })).map_err(|e| CoreError::internal(&e.to_string()))?,
        );
        out.push('\n');
    }

    fs::write(path, out)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

fn read_backup(path: &Path) -> Result<(BackupMetadata, Vec<BackupEntryRecord>)> {
    let content = fs::read_to_string(path)?;
    let mut lines = content.lines();

    let metadata_line = lines.next().ok_or_else(|| CoreError::internal("backup file is empty"))?;
    let metadata_value: serde_json::Value =
        serde_json::from_str(metadata_line).map_err(|e| CoreError::internal(&e.to_string()))?;
    let metadata: BackupMetadata =
        serde_json::from_value(metadata_value["metadata"].clone()).map_err(|e| CoreError::internal(&e.to_string()))?;

    let mut records = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(line).map_err(|e| CoreError::internal(&e.to_string()))?;
        let record: BackupEntryRecord =
            serde_json::from_value(value["entry"].clone()).map_err(|e| CoreError::internal(&e.to_string()))?;
        records.push(record);
    }

    let recomputed = checksum_entries(&records);
    if recomputed != metadata.checksum {
        return Err(CoreError::vault_corruption("backup checksum mismatch"));
    }

    Ok((metadata, records))
}

/// Restore `path`'s backup into `vault` under `mode`. Rows carry their
/// original salt (see `BackupEntryRecord::salt`), so a restored row decrypts
/// under the same master key it was sealed with.
pub fn restore(vault: &Vault, path: &Path, mode: RestoreMode, destination_has_data: bool) -> Result<usize> {
    let (_metadata, records) = read_backup(path)?;

    if mode == RestoreMode::FailIfExists && destination_has_data {
        return Err(CoreError::internal("restore destination already has vault data"));
    }

    let mut restored = 0usize;
    for record in records {
        if mode == RestoreMode::Merge {
            // Insert unconditionally if the destination has no row for this
            // token yet; otherwise only insert when the backup's row is
            // strictly newer than the destination's most recent row.
            if let Some(existing_created_at) = vault.latest_created_at_for_token(&record.token)? {
                if record.created_at <= existing_created_at {
                    continue;
                }
            }
        }
        let entry = record.into_entry()?;
        vault.insert_raw(&entry)?;
        restored += 1;
    }

    Ok(restored)
}

/// Repair enumerates every row and classifies it: critical defects (empty
/// ciphertext, IV length != 12, auth tag length != 16) are deleted;
/// non-critical (invalid `created_at`, i.e. <= 0) are rewritten in place.
pub fn repair(vault: &Vault) -> Result<RepairReport> {
    let entries = vault.all_entries(None)?;
    let mut report = RepairReport::default();

    for entry in entries {
        let critical = entry.ciphertext.is_empty() || entry.iv.len() != 12 || entry.auth_tag.len() != 16;
        if critical {
            vault.delete_entry(entry.id)?;
            report.unrecoverable_count += 1;
            continue;
        }

        if entry.created_at <= 0 {
            vault.update_created_at(entry.id, Utc::now().timestamp_millis())?;
            report.repaired_count += 1;
        }

        report.surviving_rows += 1;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::MasterKey;
    use tempfile::tempdir;

    fn open_vault(dir: &tempfile::TempDir, name: &str) -> Vault {
        Vault::open(&dir.path().join(name), MasterKey::new(b"key".to_vec())).unwrap()
    }

    #[test]
    fn backup_then_restore_round_trips_row_count() {
        let dir = tempdir().unwrap();
        let source = open_vault(&dir, "source.db");
        source.store("EMAIL_aaaaaaaa", "PII", b"a@example.com", None).unwrap();
        source.store("EMAIL_bbbbbbbb", "PII", b"b@example.com", None).unwrap();

        let backup_path = dir.path().join("backup.jsonl");
        backup(&source, &backup_path, None, None).unwrap();

        let destination = open_vault(&dir, "destination.db");
        let restored = restore(&destination, &backup_path, RestoreMode::Force, false).unwrap();
        assert_eq!(restored, 2);
    }

    #[test]
    fn restored_rows_decrypt_under_the_original_master_key() {
        let dir = tempdir().unwrap();
        let source = open_vault(&dir, "source.db");
        source.store("EMAIL_aaaaaaaa", "PII", b"a@example.com", None).unwrap();
        let backup_path = dir.path().join("backup.jsonl");
        backup(&source, &backup_path, None, None).unwrap();

        let destination = open_vault(&dir, "destination.db");
        restore(&destination, &backup_path, RestoreMode::Force, false).unwrap();
        let value = destination.retrieve("EMAIL_aaaaaaaa", "PII").unwrap().unwrap();
        assert_eq!(value, b"a@example.com");
    }

    #[test]
    fn merge_mode_skips_rows_not_newer_than_destination() {
        let dir = tempdir().unwrap();
        let source = open_vault(&dir, "source.db");
        source.store("EMAIL_aaaaaaaa", "PII", b"old@example.com", None).unwrap();
        let backup_path = dir.path().join("backup.jsonl");
        backup(&source, &backup_path, None, None).unwrap();

        let destination = open_vault(&dir, "destination.db");
        std::thread::sleep(std::time::Duration::from_millis(5));
        destination.store("EMAIL_aaaaaaaa", "PII", b"newer@example.com", None).unwrap();

        let restored = restore(&destination, &backup_path, RestoreMode::Merge, true).unwrap();
        assert_eq!(restored, 0);
        let value = destination.retrieve("EMAIL_aaaaaaaa", "PII").unwrap().unwrap();
        assert_eq!(value, b"newer@example.com");
    }

    #[test]
    fn merge_mode_inserts_rows_for_tokens_destination_lacks() {
        let dir = tempdir().unwrap();
        let source = open_vault(&dir, "source.db");
        source.store("EMAIL_aaaaaaaa", "PII", b"a@example.com", None).unwrap();
        let backup_path = dir.path().join("backup.jsonl");
        backup(&source, &backup_path, None, None).unwrap();

        let destination = open_vault(&dir, "destination.db");
        let restored = restore(&destination, &backup_path, RestoreMode::Merge, false).unwrap();
        assert_eq!(restored, 1);
    }

    #[test]
    fn restore_fails_closed_when_destination_has_data_and_not_forced() {
        let dir = tempdir().unwrap();
        let source = open_vault(&dir, "source.db");
        source.store("EMAIL_aaaaaaaa", "PII", b"a@example.com", None).unwrap();
        let backup_path = dir.path().join("backup.jsonl");
        backup(&source, &backup_path, None, None).unwrap();

        let destination = open_vault(&dir, "destination.db");
        let err = restore(&destination, &backup_path, RestoreMode::FailIfExists, true).unwrap_err();
        assert!(matches!(err, CoreError::InternalError { .. }));
    }

    #[test]
    fn tampered_backup_checksum_is_rejected() {
        let dir = tempdir().unwrap();
        let source = open_vault(&dir, "source.db");
        source.store("EMAIL_aaaaaaaa", "PII", b"a@example.com", None).unwrap();
        let backup_path = dir.path().join("backup.jsonl");
        backup(&source, &backup_path, None, None).unwrap();

        let mut content = fs::read_to_string(&backup_path).unwrap();
        content = content.replace("EMAIL_aaaaaaaa", "EMAIL_tampered");
        fs::write(&backup_path, content).unwrap();

        let destination = open_vault(&dir, "destination.db");
        let err = restore(&destination, &backup_path, RestoreMode::Force, false).unwrap_err();
        assert!(matches!(err, CoreError::VaultCorruption { .. }));
    }

    #[test]
    fn repair_classifies_critical_and_noncritical_defects() {
        let dir = tempdir().unwrap();
        let vault = open_vault(&dir, "vault.db");
        vault.store("EMAIL_aaaaaaaa", "PII", b"a@example.com", None).unwrap();

        let bad_iv = VaultEntry {
            id: 0,
            token: "EMAIL_bbbbbbbb".into(),
            category: "PII".into(),
            ciphertext: vec![1, 2, 3],
            iv: vec![0; 5],
            auth_tag: vec![0; 16],
            salt: vec![0; 32],
            created_at: 1,
            expires_at: None,
        };
        vault.insert_raw(&bad_iv).unwrap();

        let bad_timestamp = VaultEntry {
            id: 0,
            token: "EMAIL_cccccccc".into(),
            category: "PII".into(),
            ciphertext: vec![1, 2, 3],
            iv: vec![0; 12],
            auth_tag: vec![0; 16],
            salt: vec![0; 32],
            created_at: 0,
            expires_at: None,
        };
        vault.insert_raw(&bad_timestamp).unwrap();

        let report = repair(&vault).unwrap();
        assert_eq!(report.unrecoverable_count, 1);
        assert_eq!(report.repaired_count, 1);
        assert_eq!(report.surviving_rows, 2);
    }
}
