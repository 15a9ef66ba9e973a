// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Hooks: the three cooperative interception points a host agent runtime
//! calls into. The core never calls back into the host synchronously — it
//! only returns a replacement string (or an error) for each callback.

use crate::detector::Detector;
use crate::error::{CoreError, Result};
use crate::session::SessionRegistry;
use crate::tokenizer::{Tokenizer, TOKEN_LITERAL};
use std::sync::Arc;

pub struct HookPipeline {
    sessions: Arc<SessionRegistry>,
    detector: Detector,
    tokenizer: Tokenizer,
}

impl HookPipeline {
    pub fn new(sessions: Arc<SessionRegistry>, detector: Detector, tokenizer: Tokenizer) -> Self {
        Self { sessions, detector, tokenizer }
    }

    /// `before_agent_start(prompt, session_id?)`: generate a session if
    /// absent, detect, mask each detected span in order, return the masked
    /// prompt for the agent to consume.
    pub fn before_agent_start(&self, prompt: &str, session_id: Option<String>) -> Result<(String, String)> {
        let session_id = match session_id {
            Some(id) => id,
            None => self.tokenizer.generate_session().id,
        };

        let detections = self.detector.detect(prompt)?;
        let mut masked = String::with_capacity(prompt.len());
        let mut cursor = 0usize;

        for detection in &detections {
            if detection.start < cursor {
                continue;
            }
            masked.push_str(&prompt[cursor..detection.start]);
            let token = self.tokenizer.tokenize(detection.text.as_bytes(), detection.pattern_type, &session_id)?;
            masked.push_str(&token);
            cursor = detection.end;
        }
        masked.push_str(&prompt[cursor..]);

        Ok((masked, session_id))
    }

    /// `message_sending(content, session_id)`: scan for token literals,
    /// detokenize each, substitute back in place. A token that fails to
    /// resolve is a fatal `DetokenizationError` — it is never silently
    /// dropped or left as an opaque token in the restored text.
    pub fn message_sending(&self, content: &str, session_id: &str) -> Result<String> {
        let mut restored = String::with_capacity(content.len());
        let mut cursor = 0usize;

        for m in TOKEN_LITERAL.find_iter(content) {
            restored.push_str(&content[cursor..m.start()]);
            let value = self.tokenizer.detokenize(m.as_str(), session_id).map_err(|err| match err {
                CoreError::TokenNotFound { .. } | CoreError::InvalidTokenShape { .. } => {
                    CoreError::internal(&format!("detokenization failed for a token literal: {}", err.reference()))
                }
                other => other,
            })?;
            restored.push_str(&String::from_utf8_lossy(&value));
            cursor = m.end();
        }
        restored.push_str(&content[cursor..]);

        Ok(restored)
    }

    /// `agent_end(session_id)`: clear the tokenizer's session key and remove
    /// the session from the registry.
    pub fn agent_end(&self, session_id: &str) {
        self.tokenizer.clear_session(session_id);
        self.sessions.clear_session(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::{MasterKey, Vault};
    use tempfile::tempdir;

    fn test_pipeline() -> (tempfile::TempDir, HookPipeline) {
        let dir = tempdir().unwrap();
        let vault = Arc::new(Vault::open(&dir.path().join("vault.db"), MasterKey::new(b"key".to_vec())).unwrap());
        let audit = Arc::new(
            crate::audit::AuditLogger::open(
                &dir.path().join("audit.log"),
                b"audit-key".to_vec(),
                crate::audit::AuditConfig::default(),
            )
            .unwrap(),
        );
        let sessions = Arc::new(SessionRegistry::new());
        let tokenizer = Tokenizer::new(sessions.clone(), vault, audit);
        (dir, HookPipeline::new(sessions, Detector::new(), tokenizer))
    }

    #[test]
    fn before_agent_start_masks_and_allocates_session() {
        let (_dir, pipeline) = test_pipeline();
        let (masked, session_id) = pipeline.before_agent_start("contact me at alice@example.com", None).unwrap();
        assert!(masked.starts_with("contact me at EMAIL_"));
        assert!(!session_id.is_empty());
    }

    #[test]
    fn round_trip_through_mask_and_restore() {
        let (_dir, pipeline) = test_pipeline();
        let (masked, session_id) = pipeline.before_agent_start("email: alice@example.com", None).unwrap();
        let restored = pipeline.message_sending(&masked, &session_id).unwrap();
        assert_eq!(restored, "email: alice@example.com");
    }

    #[test]
    fn message_sending_passes_through_text_without_tokens() {
        let (_dir, pipeline) = test_pipeline();
        let (_, session_id) = pipeline.before_agent_start("no sensitive content here", None).unwrap();
        let restored = pipeline.message_sending("no sensitive content here", &session_id).unwrap();
        assert_eq!(restored, "no sensitive content here");
    }

    #[test]
    fn unresolvable_token_is_a_fatal_error() {
        let (_dir, pipeline) = test_pipeline();
        let (_, session_id) = pipeline.before_agent_start("hello", None).unwrap();
        let err = pipeline.message_sending("ref EMAIL_deadbeef here", &session_id).unwrap_err();
        assert!(matches!(err, CoreError::InternalError { .. }));
    }

    #[test]
    fn agent_end_clears_session() {
        let (_dir, pipeline) = test_pipeline();
        let (_, session_id) = pipeline.before_agent_start("hello", None).unwrap();
        pipeline.agent_end(&session_id);
        assert!(pipeline.sessions.get(&session_id).is_none());
    }
}
