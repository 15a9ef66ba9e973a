// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tokenizer: maps `(value, category, session)` to a stable opaque token,
//! stores the original in the Vault, and validates token shape.

use crate::audit::{AuditLogger, OperationDetails};
use crate::error::{CoreError, Result};
use crate::pattern::PatternType;
use crate::session::{Session, SessionRegistry};
use crate::vault::Vault;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::Sha256;
use std::sync::Arc;
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// Values larger than this are rejected before tokenization.
pub const MAX_VALUE_LEN: usize = 10 * 1024 * 1024;

/// Token wire grammar: `^([A-Z_]+)_([0-9a-f]{8})$`, case-insensitive on input.
static TOKEN_GRAMMAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^([A-Z_]+)_([0-9a-f]{8})$").expect("token grammar regex"));

/// Token literal scanner used by `message_sending` egress scanning.
pub static TOKEN_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z_]+_[0-9a-f]{8})\b").expect("token literal regex"));

pub struct Tokenizer {
    sessions: Arc<SessionRegistry>,
    vault: Arc<Vault>,
    audit: Arc<AuditLogger>,
}

impl Tokenizer {
    pub fn new(sessions: Arc<SessionRegistry>, vault: Arc<Vault>, audit: Arc<AuditLogger>) -> Self {
        Self { sessions, vault, audit }
    }

    pub fn generate_session(&self) -> Session {
        self.sessions.generate_session()
    }

    fn require_session(&self, session_id: &str) -> Result<Session> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| CoreError::invalid_session(&format!("session {session_id} absent or expired")))
    }

    /// Compute the 8-hex token suffix: first 4 bytes of
    /// `HMAC-SHA256(session.key, category_bytes || value_bytes)`. The HMAC
    /// digest buffer is zeroized after the suffix is extracted.
    fn compute_suffix(session_key: &[u8; 32], category: &str, value: &[u8]) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(session_key)
            .map_err(|_| CoreError::encryption_failure("hmac key init failed"))?;
        mac.update(category.as_bytes());
        mac.update(value);
        let mut digest = mac.finalize().into_bytes();
        let suffix = hex::encode(&digest[0..4]);
        digest.zeroize();
        Ok(suffix)
    }

    /// `tokenize(value, category, session_id) -> token`.
    pub fn tokenize(&self, value: &[u8], pattern_type: PatternType, session_id: &str) -> Result<String> {
        if value.is_empty() {
            let err = CoreError::internal("tokenize called with empty value");
            self.audit.log_mask_error(session_id, pattern_type, &err);
            return Err(err);
        }
        if value.len() > MAX_VALUE_LEN {
            let err = CoreError::value_too_large(MAX_VALUE_LEN);
            self.audit.log_mask_error(session_id, pattern_type, &err);
            return Err(err);
        }

        let session = match self.require_session(session_id) {
            Ok(s) => s,
            Err(err) => {
                self.audit.log_mask_error(session_id, pattern_type, &err);
                return Err(err);
            }
        };

        let category = pattern_type.as_str();
        let suffix = match Self::compute_suffix(session.key(), category, value) {
            Ok(s) => s,
            Err(err) => {
                self.audit.log_mask_error(session_id, pattern_type, &err);
                return Err(err);
            }
        };
        let token = format!("{category}_{suffix}");

        if let Err(err) = self.vault.store(&token, category, value, None) {
            self.audit.log_mask_error(session_id, pattern_type, &err);
            return Err(err);
        }

        self.audit.log_mask_success(session_id, pattern_type, 1);
        Ok(token)
    }

    /// Sequential, order-preserving batch tokenize; duplicate values yield
    /// identical tokens.
    pub fn tokenize_batch(&self, values: &[(Vec<u8>, PatternType)], session_id: &str) -> Result<Vec<String>> {
        values.iter().map(|(value, pattern_type)| self.tokenize(value, *pattern_type, session_id)).collect()
    }

    /// `detokenize(token, session_id) -> value`.
    pub fn detokenize(&self, token: &str, session_id: &str) -> Result<Vec<u8>> {
        let (prefix, _suffix) = match Self::parse_token(token) {
            Some(parts) => parts,
            None => {
                let err = CoreError::invalid_token_shape();
                self.audit.log_unmask_error(session_id, &err);
                return Err(err);
            }
        };

        if PatternType::from_prefix(&prefix).is_none() {
            let err = CoreError::invalid_token_shape();
            self.audit.log_unmask_error(session_id, &err);
            return Err(err);
        }

        if let Err(err) = self.require_session(session_id) {
            self.audit.log_unmask_error(session_id, &err);
            return Err(err);
        }

        let category = prefix.to_ascii_uppercase();
        match self.vault.retrieve(token, &category) {
            Ok(Some(value)) => {
                self.audit.log_unmask_success(session_id, &category);
                Ok(value)
            }
            Ok(None) => {
                let err = CoreError::token_not_found();
                self.audit.log_unmask_error(session_id, &err);
                Err(err)
            }
            Err(err) => {
                self.audit.log_unmask_error(session_id, &err);
                Err(err)
            }
        }
    }

    /// `^([A-Z_]+)_([0-9a-f]{8})$`, case-insensitive; the prefix must match
    /// a registered pattern type.
    pub fn is_valid_token(candidate: &str) -> bool {
        Self::parse_token(candidate)
            .map(|(prefix, _)| PatternType::from_prefix(&prefix).is_some())
            .unwrap_or(false)
    }

    fn parse_token(candidate: &str) -> Option<(String, String)> {
        let caps = TOKEN_GRAMMAR.captures(candidate)?;
        Some((caps[1].to_string(), caps[2].to_string()))
    }

    pub fn clear_session(&self, session_id: &str) {
        self.sessions.clear_session(session_id);
    }

    pub fn clear_all_sessions(&self) {
        self.sessions.clear_all_sessions();
    }
}

impl AuditLogger {
    fn log_mask_success(&self, session_id: &str, pattern_type: PatternType, token_count: u32) {
        self.log_sync(
            "mask",
            session_id,
            true,
            OperationDetails::mask(pattern_type.as_str(), token_count),
        );
    }

    fn log_mask_error(&self, session_id: &str, pattern_type: PatternType, err: &CoreError) {
        self.log_sync(
            "mask",
            session_id,
            false,
            OperationDetails::error(pattern_type.as_str(), err.reference()),
        );
    }

    fn log_unmask_success(&self, session_id: &str, category: &str) {
        self.log_sync("unmask", session_id, true, OperationDetails::mask(category, 1));
    }

    fn log_unmask_error(&self, session_id: &str, err: &CoreError) {
        self.log_sync("unmask", session_id, false, OperationDetails::error("unknown", err.reference()));
    }
}
