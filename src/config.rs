// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration surface consumed by `MaskVaultBuilder`.
//!
//! This module only defines the shape of configuration; reading it from
//! environment variables, a file, or a host's own config system is the
//! host's job, not this crate's. `MASTER_KEY`, `VAULT_PATH`, `AUDIT_KEY`,
//! and `AUDIT_LOG_DIR` name the environment variables a host typically
//! reads to populate this struct, but this crate never calls `std::env`
//! itself.

use crate::audit::AuditConfig;
use crate::detector::{MAX_INPUT_LENGTH, MIN_CONFIDENCE};
use crate::session::MAX_SESSIONS;
use crate::streaming::DEFAULT_BUFFER_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskVaultConfig {
    pub vault_path: PathBuf,
    pub audit_log_path: PathBuf,
    #[serde(default = "default_max_input_length")]
    pub max_input_length: usize,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_streaming_buffer_size")]
    pub streaming_buffer_size: usize,
    #[serde(default)]
    pub audit: AuditConfig,
}

fn default_max_input_length() -> usize {
    MAX_INPUT_LENGTH
}

fn default_min_confidence() -> f64 {
    MIN_CONFIDENCE
}

fn default_max_sessions() -> usize {
    MAX_SESSIONS
}

fn default_streaming_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl MaskVaultConfig {
    pub fn new(vault_path: impl Into<PathBuf>, audit_log_path: impl Into<PathBuf>) -> Self {
        Self {
            vault_path: vault_path.into(),
            audit_log_path: audit_log_path.into(),
            max_input_length: default_max_input_length(),
            min_confidence: default_min_confidence(),
            max_sessions: default_max_sessions(),
            streaming_buffer_size: default_streaming_buffer_size(),
            audit: AuditConfig::default(),
        }
    }

    /// Resolve `vault.db`/`audit.log` under the platform data directory
    /// (`$XDG_DATA_HOME/tokenvault` or equivalent), for hosts that read
    /// `VAULT_PATH`/`AUDIT_LOG_DIR` from the environment but want a sane
    /// fallback when those are unset. The crate itself never touches
    /// `std::env` or the filesystem here — this only computes a path.
    pub fn with_default_paths() -> Result<Self, DefaultPathError> {
        let data_dir = dirs::data_dir().ok_or(DefaultPathError::NoDataDir)?.join("tokenvault");
        Ok(Self::new(data_dir.join("vault.db"), data_dir.join("audit.log")))
    }
}

/// Raised when the host platform exposes no standard data directory
/// (`dirs::data_dir()` returns `None`, e.g. a minimal container image with
/// no `HOME` set). Hosts should fall back to an explicit `VAULT_PATH`/
/// `AUDIT_LOG_DIR` in that case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultPathError {
    NoDataDir,
}

impl std::fmt::Display for DefaultPathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no platform data directory is available; set VAULT_PATH/AUDIT_LOG_DIR explicitly")
    }
}

impl std::error::Error for DefaultPathError {}
