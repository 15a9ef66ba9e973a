// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Audit Log: an append-only, HMAC-signed JSON-line file.
//!
//! Every entry is signed independently — there is no hash chain. The
//! `signature` field is the tamper detector; `verify()`'s `checksum` is only
//! an ordering witness over the surviving entries, not a MAC. Appends are
//! serialized by a single writer behind a bounded admission semaphore so a
//! burst of callers fails fast with `QueueFull` instead of backing up
//! unbounded memory.
//!
//! `details` must never carry a raw detected value — only category names,
//! counts, and references. `OperationDetails` enforces this by construction:
//! every variant takes a category string or count, never user data.

use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use subtle::ConstantTimeEq;
use tokio::sync::Semaphore;

type HmacSha256 = Hmac<Sha256>;

/// Default bound on in-flight admitted entries before `log()` fails with
/// `AuditWriteQueueFull`.
pub const MAX_QUEUE_SIZE: usize = 1000;

/// Retention/compaction configuration (spec §4.4's `apply_retention_policy`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub max_file_size_mb: u64,
    pub max_age_days: u64,
    pub max_queue_size: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { max_file_size_mb: 100, max_age_days: 365, max_queue_size: MAX_QUEUE_SIZE }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Mask,
    Unmask,
    VaultStore,
    VaultRetrieve,
    VaultCleanup,
    Cli,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mask => "mask",
            Self::Unmask => "unmask",
            Self::VaultStore => "vault_store",
            Self::VaultRetrieve => "vault_retrieve",
            Self::VaultCleanup => "vault_cleanup",
            Self::Cli => "cli",
        }
    }

    /// Unrecognized operation names fall back to `Cli` rather than failing
    /// the write — an audit entry with an approximate label beats a dropped one.
    pub fn parse(s: &str) -> Self {
        match s {
            "mask" => Self::Mask,
            "unmask" => Self::Unmask,
            "vault_store" => Self::VaultStore,
            "vault_retrieve" => Self::VaultRetrieve,
            "vault_cleanup" => Self::VaultCleanup,
            _ => Self::Cli,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// Typed, categorical-only details payload. No variant accepts a raw value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OperationDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl OperationDetails {
    pub fn mask(category: &str, token_count: u32) -> Self {
        Self { category: Some(category.to_string()), token_count: Some(token_count), ..Default::default() }
    }

    pub fn error(category: &str, reference: &str) -> Self {
        Self { category: Some(category.to_string()), reference: Some(reference.to_string()), ..Default::default() }
    }

    pub fn vault(count: usize) -> Self {
        Self { count: Some(count), ..Default::default() }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

/// Fields signed together; `signature` itself is never part of its own input.
#[derive(Serialize)]
struct SignablePayload<'a> {
    sequence: u64,
    timestamp: DateTime<Utc>,
    operation: Operation,
    #[serde(rename = "sessionId")]
    session_id: &'a str,
    level: Level,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<u64>,
    details: &'a OperationDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub level: Level,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    pub details: OperationDetails,
    pub signature: String,
}

impl AuditEntry {
    fn payload(&self) -> SignablePayload<'_> {
        SignablePayload {
            sequence: self.sequence,
            timestamp: self.timestamp,
            operation: self.operation,
            session_id: &self.session_id,
            level: self.level,
            success: self.success,
            duration: self.duration,
            details: &self.details,
        }
    }
}

/// Raw HMAC-SHA256 bytes over `payload`, keyed by `key`. Kept separate from
/// the hex-encoded form so `verify` can compare MACs as bytes in constant
/// time rather than comparing their hex encodings with `==`.
fn sign_raw(key: &[u8], payload: &SignablePayload<'_>) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(payload).map_err(|e| CoreError::internal(&e.to_string()))?;
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|_| CoreError::audit_integrity_failure("hmac key init failed"))?;
    mac.update(&bytes);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sign(key: &[u8], payload: &SignablePayload<'_>) -> Result<String> {
    Ok(hex::encode(sign_raw(key, payload)?))
}

/// Constant-time comparison of a recomputed MAC against the hex-encoded
/// signature stored on an entry. A malformed (non-hex) stored signature is
/// treated as a mismatch rather than a parse error — it is tamper evidence
/// either way.
fn signature_matches(expected_raw: &[u8], stored_hex: &str) -> bool {
    match hex::decode(stored_hex) {
        Ok(stored_raw) => expected_raw.ct_eq(&stored_raw).into(),
        Err(_) => false,
    }
}

/// A filter applied by `query`, `export`, and `follow`.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub session_id: Option<String>,
    pub operations: Option<HashSet<Operation>>,
    pub level: Option<Level>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub categories: Option<HashSet<String>>,
}

impl AuditFilter {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(session_id) = &self.session_id {
            if &entry.session_id != session_id {
                return false;
            }
        }
        if let Some(operations) = &self.operations {
            if !operations.contains(&entry.operation) {
                return false;
            }
        }
        if let Some(level) = self.level {
            if entry.level != level {
                return false;
            }
        }
        if let Some(start) = self.start {
            if entry.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if entry.timestamp > end {
                return false;
            }
        }
        if let Some(categories) = &self.categories {
            match &entry.details.category {
                Some(category) if categories.contains(category) => {}
                _ => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditStats {
    pub total: usize,
    pub successes: usize,
    pub by_operation: std::collections::BTreeMap<String, usize>,
    pub by_category: std::collections::BTreeMap<String, usize>,
    pub by_session: std::collections::BTreeMap<String, usize>,
    pub success_rate: f64,
    pub mean_duration_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub valid: bool,
    pub sequence_gaps: Vec<(u64, u64)>,
    pub duplicate_sequences: Vec<u64>,
    pub corrupted_lines: usize,
    pub invalid_signatures: Vec<u64>,
    pub checksum: String,
}

struct WriterState {
    file: File,
    next_sequence: u64,
}

/// Append-only audit trail. One file, one writer, many readers.
pub struct AuditLogger {
    log_path: PathBuf,
    audit_key: Vec<u8>,
    config: AuditConfig,
    writer: Mutex<WriterState>,
    admission: Semaphore,
}

impl AuditLogger {
    /// Open (creating if absent) the log at `path`, scanning its last line
    /// to learn the highest persisted sequence so appends continue from there.
    pub fn open(path: &Path, audit_key: Vec<u8>, config: AuditConfig) -> Result<Self> {
        let next_sequence = Self::scan_last_sequence(path)?.map(|s| s + 1).unwrap_or(1);

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file.metadata()?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(Self {
            log_path: path.to_path_buf(),
            audit_key,
            admission: Semaphore::new(config.max_queue_size),
            config,
            writer: Mutex::new(WriterState { file, next_sequence }),
        })
    }

    fn scan_last_sequence(path: &Path) -> Result<Option<u64>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let last = content.lines().rev().find(|l| !l.trim().is_empty());
        match last {
            Some(line) => match serde_json::from_str::<AuditEntry>(line) {
                Ok(entry) => Ok(Some(entry.sequence)),
                Err(_) => Ok(None),
            },
            None => Ok(None),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Assign a sequence, sign, and append synchronously. Used internally by
    /// modules that already hold their own error to propagate and only need
    /// a best-effort audit trail alongside it.
    pub(crate) fn log_sync(&self, operation: &str, session_id: &str, success: bool, details: OperationDetails) {
        let level = if success { Level::Info } else { Level::Warn };
        if let Err(err) = self.append(Operation::parse(operation), session_id, level, success, None, details) {
            tracing::error!(detail = %err, "failed to append audit entry");
        }
    }

    fn append(
        &self,
        operation: Operation,
        session_id: &str,
        level: Level,
        success: bool,
        duration: Option<u64>,
        details: OperationDetails,
    ) -> Result<u64> {
        let mut state = self.writer.lock().map_err(|_| CoreError::internal("audit writer mutex poisoned"))?;
        let sequence = state.next_sequence;

        let mut entry = AuditEntry {
            sequence,
            timestamp: Utc::now(),
            operation,
            session_id: session_id.to_string(),
            level,
            success,
            duration,
            details,
            signature: String::new(),
        };
        entry.signature = sign(&self.audit_key, &entry.payload())?;

        let line = serde_json::to_string(&entry).map_err(|e| CoreError::internal(&e.to_string()))?;
        writeln!(state.file, "{line}")?;
        state.file.flush()?;
        state.next_sequence += 1;
        Ok(sequence)
    }

    /// `log(partial)`: non-blocking except for the admission check. The
    /// actual append is performed on a blocking-pool task so the caller's
    /// async task is never held on disk I/O.
    pub async fn log(
        &self,
        operation: Operation,
        session_id: &str,
        level: Level,
        success: bool,
        duration: Option<u64>,
        details: OperationDetails,
    ) -> Result<u64> {
        let _permit = self
            .admission
            .try_acquire()
            .map_err(|_| CoreError::audit_write_queue_full())?;
        self.append(operation, session_id, level, success, duration, details)
    }

    fn read_entries(&self) -> Result<(Vec<AuditEntry>, usize)> {
        if !self.log_path.exists() {
            return Ok((Vec::new(), 0));
        }
        let file = File::open(&self.log_path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut corrupted = 0usize;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(_) => corrupted += 1,
            }
        }
        Ok((entries, corrupted))
    }

    /// `query(filter, limit)`: drops malformed lines, applies predicates,
    /// returns up to `limit` entries sorted by `sequence`.
    pub fn query(&self, filter: &AuditFilter, limit: usize) -> Result<Vec<AuditEntry>> {
        let (mut entries, _corrupted) = self.read_entries()?;
        entries.retain(|e| filter.matches(e));
        entries.sort_by_key(|e| e.sequence);
        entries.truncate(limit);
        Ok(entries)
    }

    /// `stats(period?)`: aggregates counts by operation, category, session;
    /// computes success rate and mean duration over the matched window.
    pub fn stats(&self, period: Option<(DateTime<Utc>, DateTime<Utc>)>) -> Result<AuditStats> {
        let (entries, _corrupted) = self.read_entries()?;
        let mut stats = AuditStats::default();
        let mut duration_sum = 0u64;
        let mut duration_count = 0u64;

        for entry in entries.iter().filter(|e| match period {
            Some((start, end)) => e.timestamp >= start && e.timestamp <= end,
            None => true,
        }) {
            stats.total += 1;
            if entry.success {
                stats.successes += 1;
            }
            *stats.by_operation.entry(entry.operation.as_str().to_string()).or_insert(0) += 1;
            *stats.by_session.entry(entry.session_id.clone()).or_insert(0) += 1;
            if let Some(category) = &entry.details.category {
                *stats.by_category.entry(category.clone()).or_insert(0) += 1;
            }
            if let Some(duration) = entry.duration {
                duration_sum += duration;
                duration_count += 1;
            }
        }

        stats.success_rate = if stats.total > 0 { stats.successes as f64 / stats.total as f64 } else { 0.0 };
        stats.mean_duration_ms = if duration_count > 0 { Some(duration_sum as f64 / duration_count as f64) } else { None };
        Ok(stats)
    }

    /// `verify(range?)`: enumerates sequence gaps, duplicates, corrupted
    /// lines, and signature mismatches. `checksum` is an ordering witness,
    /// not a tamper-proof MAC — the per-entry `signature` fields are that.
    pub fn verify(&self, range: Option<(u64, u64)>) -> Result<VerifyReport> {
        let (mut entries, corrupted_lines) = self.read_entries()?;
        entries.sort_by_key(|e| e.sequence);
        if let Some((start, end)) = range {
            entries.retain(|e| e.sequence >= start && e.sequence <= end);
        }

        let mut sequence_gaps = Vec::new();
        let mut duplicate_sequences = Vec::new();
        let mut invalid_signatures = Vec::new();
        let mut seen = HashSet::new();
        let mut checksum_input = String::new();

        let mut previous: Option<u64> = None;
        for entry in &entries {
            if !seen.insert(entry.sequence) {
                duplicate_sequences.push(entry.sequence);
            }
            if let Some(prev) = previous {
                if entry.sequence > prev + 1 {
                    sequence_gaps.push((prev, entry.sequence));
                }
            }
            previous = Some(entry.sequence);

            let expected_raw = sign_raw(&self.audit_key, &entry.payload())?;
            if !signature_matches(&expected_raw, &entry.signature) {
                invalid_signatures.push(entry.sequence);
            } else {
                if !checksum_input.is_empty() {
                    checksum_input.push('|');
                }
                checksum_input.push_str(&format!(
                    "{}:{}:{}:{}",
                    entry.sequence,
                    entry.timestamp.to_rfc3339(),
                    entry.operation.as_str(),
                    entry.session_id
                ));
            }
        }

        let checksum = hex::encode(Sha256::digest(checksum_input.as_bytes()));
        let valid = sequence_gaps.is_empty()
            && duplicate_sequences.is_empty()
            && corrupted_lines == 0
            && invalid_signatures.is_empty();

        Ok(VerifyReport { valid, sequence_gaps, duplicate_sequences, corrupted_lines, invalid_signatures, checksum })
    }

    /// `tail(n)`: best-effort return of the last `n` entries; tolerates a missing file.
    pub fn tail(&self, n: usize) -> Result<Vec<AuditEntry>> {
        let (mut entries, _corrupted) = self.read_entries()?;
        entries.sort_by_key(|e| e.sequence);
        let start = entries.len().saturating_sub(n);
        Ok(entries.split_off(start))
    }

    /// `export(filter, format)`: eagerly materializes the filtered records in
    /// the requested serialization; "lazy" in the operation's name refers to
    /// filtering, not buffering the whole file twice.
    pub fn export(&self, filter: &AuditFilter, format: ExportFormat) -> Result<String> {
        let entries = self.query(filter, usize::MAX)?;
        match format {
            ExportFormat::Json => serde_json::to_string_pretty(&entries).map_err(|e| CoreError::internal(&e.to_string())),
            ExportFormat::Csv => {
                let mut out = String::from("sequence,timestamp,operation,session_id,level,success,duration\n");
                for entry in &entries {
                    out.push_str(&format!(
                        "{},{},{},{},{},{},{}\n",
                        entry.sequence,
                        entry.timestamp.to_rfc3339(),
                        entry.operation.as_str(),
                        entry.session_id,
                        match entry.level {
                            Level::Info => "info",
                            Level::Warn => "warn",
                            Level::Error => "error",
                        },
                        entry.success,
                        entry.duration.map(|d| d.to_string()).unwrap_or_default(),
                    ));
                }
                Ok(out)
            }
        }
    }

    /// `follow(filter)`: poll the file for newly appended entries and yield
    /// them on a channel. Dropping the returned handle (or calling `stop`)
    /// cancels the background poller.
    pub fn follow(&self, filter: AuditFilter) -> FollowHandle {
        let (tx, rx) = tokio::sync::mpsc::channel(128);
        let (cancel_tx, mut cancel_rx) = tokio::sync::watch::channel(false);
        let path = self.log_path.clone();

        let task = tokio::spawn(async move {
            let mut last_sequence = 0u64;
            loop {
                if *cancel_rx.borrow() {
                    break;
                }
                if let Ok(content) = fs::read_to_string(&path) {
                    for line in content.lines() {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if let Ok(entry) = serde_json::from_str::<AuditEntry>(line) {
                            if entry.sequence > last_sequence {
                                last_sequence = entry.sequence;
                                if filter.matches(&entry) && tx.send(entry).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {}
                    _ = cancel_rx.changed() => {}
                }
            }
        });

        FollowHandle { receiver: rx, cancel: cancel_tx, task }
    }

    /// `apply_retention_policy()`: if the file exceeds `max_file_size_mb`,
    /// drop entries older than `max_age_days` by rewriting the file in
    /// place. Survivors keep their original `sequence` — the resulting gap
    /// is what `verify` reports, not a forged contiguous renumbering.
    pub fn apply_retention_policy(&self) -> Result<usize> {
        let mut state = self.writer.lock().map_err(|_| CoreError::internal("audit writer mutex poisoned"))?;

        let size = fs::metadata(&self.log_path).map(|m| m.len()).unwrap_or(0);
        let max_size = self.config.max_file_size_mb * 1024 * 1024;
        if size <= max_size {
            return Ok(0);
        }

        let cutoff = Utc::now() - chrono::Duration::days(self.config.max_age_days as i64);
        let (entries, _corrupted) = self.read_entries()?;
        let before = entries.len();
        let survivors: Vec<_> = entries.into_iter().filter(|e| e.timestamp >= cutoff).collect();
        let removed = before - survivors.len();

        let tmp_path = self.log_path.with_extension("log.compact");
        {
            let mut tmp = File::create(&tmp_path)?;
            for entry in &survivors {
                writeln!(tmp, "{}", serde_json::to_string(entry).map_err(|e| CoreError::internal(&e.to_string()))?)?;
            }
            tmp.flush()?;
        }
        fs::rename(&tmp_path, &self.log_path)?;

        state.file = OpenOptions::new().append(true).open(&self.log_path)?;
        tracing::info!(removed, "audit log retention compaction complete");
        Ok(removed)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ExportFormat {
    Json,
    Csv,
}

pub struct FollowHandle {
    receiver: tokio::sync::mpsc::Receiver<AuditEntry>,
    cancel: tokio::sync::watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl FollowHandle {
    pub async fn next(&mut self) -> Option<AuditEntry> {
        self.receiver.recv().await
    }

    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }
}

impl Drop for FollowHandle {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_test_logger() -> (tempfile::TempDir, AuditLogger) {
        let dir = tempdir().unwrap();
        let logger = AuditLogger::open(&dir.path().join("audit.log"), b"test-audit-key".to_vec(), AuditConfig::default())
            .unwrap();
        (dir, logger)
    }

    #[test]
    fn sequence_starts_at_one_and_increments() {
        let (_dir, logger) = open_test_logger();
        logger.log_sync("mask", "sess-1", true, OperationDetails::mask("EMAIL", 1));
        logger.log_sync("mask", "sess-1", true, OperationDetails::mask("EMAIL", 1));
        let entries = logger.query(&AuditFilter::default(), 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(entries[1].sequence, 2);
    }

    #[test]
    fn reopen_continues_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        {
            let logger = AuditLogger::open(&path, b"key".to_vec(), AuditConfig::default()).unwrap();
            logger.log_sync("mask", "sess-1", true, OperationDetails::mask("EMAIL", 1));
        }
        let logger = AuditLogger::open(&path, b"key".to_vec(), AuditConfig::default()).unwrap();
        logger.log_sync("mask", "sess-1", true, OperationDetails::mask("EMAIL", 1));
        let entries = logger.query(&AuditFilter::default(), 10).unwrap();
        assert_eq!(entries[1].sequence, 2);
    }

    #[test]
    fn details_never_carry_raw_value() {
        let details = OperationDetails::mask("EMAIL", 3);
        let json = serde_json::to_string(&details).unwrap();
        assert!(!json.contains("@"));
        assert!(json.contains("EMAIL"));
    }

    #[test]
    fn verify_detects_tampered_signature() {
        let (_dir, logger) = open_test_logger();
        logger.log_sync("mask", "sess-1", true, OperationDetails::mask("EMAIL", 1));

        let path = logger.log_path().to_path_buf();
        let mut content = fs::read_to_string(&path).unwrap();
        content = content.replace("\"success\":true", "\"success\":false");
        fs::write(&path, content).unwrap();

        let report = logger.verify(None).unwrap();
        assert!(!report.valid);
        assert_eq!(report.invalid_signatures, vec![1]);
    }

    #[test]
    fn verify_detects_sequence_gap_after_retention() {
        let (_dir, logger) = open_test_logger();
        for _ in 0..3 {
            logger.log_sync("mask", "sess-1", true, OperationDetails::mask("EMAIL", 1));
        }
        let path = logger.log_path().to_path_buf();
        let content = fs::read_to_string(&path).unwrap();
        let kept: Vec<&str> = content.lines().filter(|l| l.contains("\"sequence\":1") || l.contains("\"sequence\":3")).collect();
        fs::write(&path, kept.join("\n") + "\n").unwrap();

        let report = logger.verify(None).unwrap();
        assert_eq!(report.sequence_gaps, vec![(1, 3)]);
    }

    #[test]
    fn query_filters_by_session() {
        let (_dir, logger) = open_test_logger();
        logger.log_sync("mask", "sess-1", true, OperationDetails::mask("EMAIL", 1));
        logger.log_sync("mask", "sess-2", true, OperationDetails::mask("EMAIL", 1));

        let filter = AuditFilter { session_id: Some("sess-2".to_string()), ..Default::default() };
        let entries = logger.query(&filter, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].session_id, "sess-2");
    }

    #[test]
    fn stats_computes_success_rate() {
        let (_dir, logger) = open_test_logger();
        logger.log_sync("mask", "sess-1", true, OperationDetails::mask("EMAIL", 1));
        logger.log_sync("mask", "sess-1", false, OperationDetails::error("EMAIL", "ERR-1"));
        let stats = logger.stats(None).unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.success_rate, 0.5);
    }

    #[test]
    fn tail_tolerates_missing_file() {
        let dir = tempdir().unwrap();
        let logger = AuditLogger::open(&dir.path().join("nonexistent.log"), b"key".to_vec(), AuditConfig::default()).unwrap();
        fs::remove_file(logger.log_path()).ok();
        let entries = logger.tail(5).unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn admission_queue_rejects_when_full() {
        let dir = tempdir().unwrap();
        let config = AuditConfig { max_queue_size: 0, ..AuditConfig::default() };
        let logger = AuditLogger::open(&dir.path().join("audit.log"), b"key".to_vec(), config).unwrap();
        let err = logger
            .log(Operation::Mask, "sess-1", Level::Info, true, None, OperationDetails::mask("EMAIL", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AuditWriteQueueFull { .. }));
    }

    #[tokio::test]
    async fn follow_yields_newly_appended_entries() {
        let (_dir, logger) = open_test_logger();
        let mut handle = logger.follow(AuditFilter::default());
        logger.log_sync("mask", "sess-1", true, OperationDetails::mask("EMAIL", 1));
        let entry = tokio::time::timeout(std::time::Duration::from_secs(2), handle.next()).await;
        assert!(entry.is_ok());
        handle.stop();
    }
}
