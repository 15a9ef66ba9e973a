// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! tokenvault — the mask/unmask pipeline with its cryptographic substrate.
//!
//! Intercepts free-form text flowing between a user and an autonomous agent,
//! detects sensitive substrings, replaces each with a stable opaque token,
//! persists the original under authenticated encryption, and restores
//! original values on reverse traffic. Every masking/unmasking decision is
//! recorded in a tamper-evident, signed audit log.
//!
//! # Core modules
//!
//! - [`pattern`] — declarative detection patterns (category, confidence, validator)
//! - [`detector`] — scans text, emits ordered, deduplicated [`detector::Detection`]s
//! - [`session`] — per-session HMAC keys, bounded by capacity and TTL
//! - [`tokenizer`] — `(value, category, session) -> token`, backed by the vault
//! - [`vault`] — AEAD-protected, indexed, persistent token -> value storage
//! - [`audit`] — append-only, HMAC-signed JSON-line ledger
//! - [`streaming`] — chunk-boundary-safe masking for streamed input
//! - [`hooks`] — the three host-runtime interception points
//! - [`backup`] — vault snapshot, restore, and structural repair
//! - [`error`] — the flat `CoreError` taxonomy
//! - [`config`] — in-process configuration surface (no env/file loading)
//! - [`locks`] — poison-resilient `RwLock` access helpers
//!
//! # Not a global singleton
//!
//! Per the design note in spec §9 ("Global state... model as a singleton
//! capability passed explicitly"), this crate never reaches for ambient
//! statics. [`MaskVaultBuilder`] constructs a [`MaskVault`] — an explicit
//! capability bundling the vault, audit logger, tokenizer, session registry,
//! and hook pipeline — that the host owns and threads through its own code.

pub mod audit;
pub mod backup;
pub mod config;
pub mod detector;
pub mod error;
pub mod hooks;
pub mod locks;
pub mod pattern;
pub mod session;
pub mod streaming;
pub mod tokenizer;
pub mod vault;

pub use audit::{AuditConfig, AuditEntry, AuditFilter, AuditLogger, AuditStats, ExportFormat, Level, Operation, OperationDetails, VerifyReport};
pub use backup::{RepairReport, RestoreMode};
pub use config::MaskVaultConfig;
pub use detector::{Detection, Detector};
pub use error::{CoreError, Result};
pub use hooks::HookPipeline;
pub use pattern::{Category, PatternType};
pub use session::{Session, SessionRegistry};
pub use streaming::StreamingCoordinator;
pub use tokenizer::Tokenizer;
pub use vault::{MasterKey, Vault, VaultEntry, VaultState};

use std::path::Path;
use std::sync::Arc;

/// Decrypted rows returned by [`MaskVault::gdpr_export`]: one `(category,
/// plaintext)` pair per live vault row stored under the requested token.
pub type GdprExport = Vec<(String, Vec<u8>)>;

/// Optional, explicitly-invoked `tracing-subscriber` installer for hosts
/// that have no logging setup of their own. This crate never calls it
/// itself — installing a global subscriber is a host decision, not an
/// ambient side effect a library should impose.
pub fn init_tracing_subscriber() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Builds a [`MaskVault`] capability from an explicit [`MaskVaultConfig`],
/// master key, and audit signing key. Construction is fallible: opening the
/// vault or audit log can fail (bad permissions, a held cross-process lock,
/// a corrupt file).
pub struct MaskVaultBuilder {
    config: MaskVaultConfig,
    master_key: MasterKey,
    audit_key: Vec<u8>,
}

impl MaskVaultBuilder {
    pub fn new(config: MaskVaultConfig, master_key: MasterKey, audit_key: Vec<u8>) -> Self {
        Self { config, master_key, audit_key }
    }

    pub fn build(self) -> Result<MaskVault> {
        let vault = Arc::new(Vault::open(&self.config.vault_path, self.master_key)?);
        let audit = Arc::new(AuditLogger::open(&self.config.audit_log_path, self.audit_key, self.config.audit.clone())?);
        let sessions = Arc::new(SessionRegistry::with_capacity(self.config.max_sessions));
        let detector = Detector::with_limits(self.config.max_input_length, self.config.min_confidence);
        let tokenizer = Tokenizer::new(sessions.clone(), vault.clone(), audit.clone());
        let hooks = HookPipeline::new(sessions.clone(), Detector::with_limits(self.config.max_input_length, self.config.min_confidence), Tokenizer::new(sessions.clone(), vault.clone(), audit.clone()));

        Ok(MaskVault {
            vault,
            audit,
            sessions,
            detector,
            tokenizer,
            hooks,
            streaming_buffer_size: self.config.streaming_buffer_size,
        })
    }
}

/// The capability a host constructs once (via [`MaskVaultBuilder`]) and
/// threads explicitly through its own code. Bundles every subsystem named
/// in the component design: detector, tokenizer, vault, audit log, session
/// registry, hook pipeline, and the custodial operations (backup, restore,
/// repair, retention, GDPR-style export/delete).
pub struct MaskVault {
    vault: Arc<Vault>,
    audit: Arc<AuditLogger>,
    sessions: Arc<SessionRegistry>,
    detector: Detector,
    tokenizer: Tokenizer,
    hooks: HookPipeline,
    streaming_buffer_size: usize,
}

impl MaskVault {
    /// `before_agent_start(prompt, session_id?)`.
    pub fn before_agent_start(&self, prompt: &str, session_id: Option<String>) -> Result<(String, String)> {
        self.hooks.before_agent_start(prompt, session_id)
    }

    /// `message_sending(content, session_id)`.
    pub fn message_sending(&self, content: &str, session_id: &str) -> Result<String> {
        self.hooks.message_sending(content, session_id)
    }

    /// `agent_end(session_id)`.
    pub fn agent_end(&self, session_id: &str) {
        self.hooks.agent_end(session_id)
    }

    /// Detect sensitive substrings without masking them.
    pub fn detect(&self, text: &str) -> Result<Vec<Detection>> {
        self.detector.detect(text)
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    /// A chunk-boundary-safe streaming masker scoped to one session.
    pub fn streaming_coordinator(&self, session_id: String) -> StreamingCoordinator<'_> {
        StreamingCoordinator::with_buffer_size(&self.detector, &self.tokenizer, session_id, self.streaming_buffer_size)
    }

    /// Delete expired vault rows, logging a `vault_cleanup` audit entry with
    /// the removed count (never the removed values).
    pub fn cleanup_expired(&self) -> Result<usize> {
        let removed = self.vault.cleanup_expired()?;
        self.audit.log_sync("vault_cleanup", "system", true, OperationDetails::vault(removed));
        Ok(removed)
    }

    /// Rewrite the audit log to drop entries past `max_age_days`, if it has
    /// grown past `max_file_size_mb`. Sequence gaps this introduces are
    /// reported by `audit().verify()`, not hidden.
    pub fn apply_audit_retention(&self) -> Result<usize> {
        self.audit.apply_retention_policy()
    }

    /// Snapshot the vault's entries to `path`. `since` restricts the
    /// snapshot to an incremental backup (`created_at > since`).
    pub fn backup(&self, path: &Path, since: Option<i64>, previous_backup_timestamp: Option<i64>) -> Result<()> {
        let result = backup::backup(&self.vault, path, since, previous_backup_timestamp);
        self.audit.log_sync("cli", "system", result.is_ok(), OperationDetails::none());
        result
    }

    /// Restore a snapshot written by [`MaskVault::backup`] into this vault.
    pub fn restore(&self, path: &Path, mode: RestoreMode, destination_has_data: bool) -> Result<usize> {
        let result = backup::restore(&self.vault, path, mode, destination_has_data);
        self.audit.log_sync("cli", "system", result.is_ok(), OperationDetails::none());
        result
    }

    /// Enumerate and classify every vault row, deleting structurally
    /// corrupt ones and rewriting salvageable defects in place.
    pub fn repair(&self) -> Result<RepairReport> {
        let result = backup::repair(&self.vault);
        self.audit.log_sync("cli", "system", result.is_ok(), OperationDetails::none());
        result
    }

    /// GDPR-style value-scoped export: every live, decrypted row stored
    /// under `token`, for a data-subject access request. The audit entry
    /// records only the category and count, never the exported value.
    pub fn gdpr_export(&self, token: &str) -> Result<GdprExport> {
        let rows = self.vault.export_by_token(token)?;
        let category = rows.first().map(|(entry, _)| entry.category.clone()).unwrap_or_default();
        self.audit.log_sync("vault_retrieve", "gdpr", true, OperationDetails::mask(&category, rows.len() as u32));
        Ok(rows.into_iter().map(|(entry, plaintext)| (entry.category, plaintext)).collect())
    }

    /// GDPR-style value-scoped delete (right to erasure): remove every row
    /// stored under `token`, live or expired. Returns the number removed.
    pub fn gdpr_delete(&self, token: &str) -> Result<usize> {
        let removed = self.vault.delete_by_token(token)?;
        self.audit.log_sync("vault_cleanup", "gdpr", true, OperationDetails::vault(removed));
        Ok(removed)
    }

    /// Release the vault's underlying handles. The vault and audit log
    /// cannot be used after this; session keys are unaffected (they live in
    /// the in-process session registry, not the vault).
    pub fn close(&self) {
        self.vault.close();
    }
}
