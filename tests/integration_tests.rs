// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end scenarios exercised through the public `MaskVault` capability
//! rather than individual module internals.

use std::fs;
use tempfile::tempdir;
use tokenvault::{MaskVaultBuilder, MaskVaultConfig, MasterKey, RestoreMode};

fn build_vault(dir: &tempfile::TempDir) -> tokenvault::MaskVault {
    let config = MaskVaultConfig::new(dir.path().join("vault.db"), dir.path().join("audit.log"));
    MaskVaultBuilder::new(config, MasterKey::new(b"integration-master-key".to_vec()), b"integration-audit-key".to_vec())
        .build()
        .unwrap()
}

#[test]
fn single_email_single_session() {
    let dir = tempdir().unwrap();
    let vault = build_vault(&dir);

    let detections = vault.detect("contact me at alice@example.com").unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].confidence, 0.95);
    assert_eq!(detections[0].text, "alice@example.com");

    let (masked, session_id) = vault.before_agent_start("contact me at alice@example.com", None).unwrap();
    let re = regex::Regex::new(r"^contact me at EMAIL_[0-9a-f]{8}$").unwrap();
    assert!(re.is_match(&masked), "masked output {masked:?} did not match token grammar");

    let restored = vault.message_sending(&masked, &session_id).unwrap();
    assert_eq!(restored, "contact me at alice@example.com");
}

#[test]
fn credit_card_luhn_gate() {
    let dir = tempdir().unwrap();
    let vault = build_vault(&dir);

    let detections = vault.detect("4111 1111 1111 1111 and 1234 5678 9012 3456").unwrap();
    let cards: Vec<_> = detections.iter().filter(|d| d.pattern_type == tokenvault::PatternType::CreditCard).collect();
    assert_eq!(cards.len(), 1, "only the Luhn-valid card should clear the confidence floor");
    assert_eq!(cards[0].confidence, 0.9);
}

#[test]
fn cross_session_independence() {
    let dir = tempdir().unwrap();
    let vault = build_vault(&dir);

    let (masked_1, _s1) = vault.before_agent_start("user@example.com", None).unwrap();
    let (masked_2, _s2) = vault.before_agent_start("user@example.com", None).unwrap();

    let suffix = |masked: &str| masked.rsplit('_').next().unwrap().to_string();
    assert_ne!(suffix(&masked_1), suffix(&masked_2));
}

#[test]
fn audit_tamper_detection() {
    let dir = tempdir().unwrap();
    let vault = build_vault(&dir);

    for i in 0..3 {
        vault.before_agent_start(&format!("email test{i}@example.com"), None).unwrap();
    }

    let log_path = dir.path().join("audit.log");
    let content = fs::read_to_string(&log_path).unwrap();
    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    assert!(lines.len() >= 2);

    let second: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
    let mut signature = second["signature"].as_str().unwrap().to_string();
    let flipped_char = if signature.as_bytes()[0] == b'0' { '1' } else { '0' };
    signature.replace_range(0..1, &flipped_char.to_string());
    let mut tampered = second.clone();
    tampered["signature"] = serde_json::Value::String(signature);
    lines[1] = serde_json::to_string(&tampered).unwrap();
    fs::write(&log_path, lines.join("\n") + "\n").unwrap();

    let report = vault.audit().verify(None).unwrap();
    assert!(!report.valid);
    assert_eq!(report.invalid_signatures, vec![second["sequence"].as_u64().unwrap()]);
}

#[test]
fn streaming_boundary_matches_single_shot() {
    let dir = tempdir().unwrap();
    let vault = build_vault(&dir);

    let whole = "my email is alice@example.com end";
    let (single_shot, session_id) = vault.before_agent_start(whole, None).unwrap();

    let mut coordinator = vault.streaming_coordinator(session_id);
    let mut streamed = String::new();
    streamed.push_str(&coordinator.process_chunk("my email is ", false).unwrap());
    streamed.push_str(&coordinator.process_chunk("alice@exa", false).unwrap());
    streamed.push_str(&coordinator.process_chunk("mple.com end", true).unwrap());

    assert_eq!(streamed, single_shot);
    assert!(!streamed.contains("alice@example.com"));
}

#[test]
fn vault_repair_classifies_defects() {
    let dir = tempdir().unwrap();
    let vault = build_vault(&dir);

    vault.before_agent_start("email good@example.com", None).unwrap();

    let bad_iv = tokenvault::VaultEntry {
        id: 0,
        token: "EMAIL_deadbeef".into(),
        category: "EMAIL".into(),
        ciphertext: vec![1, 2, 3],
        iv: vec![0; 5],
        auth_tag: vec![0; 16],
        salt: vec![0; 32],
        created_at: 1,
        expires_at: None,
    };
    vault.vault().insert_raw(&bad_iv).unwrap();

    let bad_timestamp = tokenvault::VaultEntry {
        id: 0,
        token: "EMAIL_cafebabe".into(),
        category: "EMAIL".into(),
        ciphertext: vec![1, 2, 3],
        iv: vec![0; 12],
        auth_tag: vec![0; 16],
        salt: vec![0; 32],
        created_at: 0,
        expires_at: None,
    };
    vault.vault().insert_raw(&bad_timestamp).unwrap();

    let report = vault.repair().unwrap();
    assert_eq!(report.unrecoverable_count, 1);
    assert_eq!(report.repaired_count, 1);
    assert_eq!(report.surviving_rows, 2);

    let verify = vault.audit().verify(None).unwrap();
    assert!(verify.invalid_signatures.is_empty());
}

#[test]
fn backup_then_restore_preserves_decryptability() {
    let dir = tempdir().unwrap();
    let source = build_vault(&dir);
    let (masked, _session_id) = source.before_agent_start("email alice@example.com", None).unwrap();
    let token = masked.strip_prefix("email ").unwrap().to_string();

    let backup_path = dir.path().join("snapshot.jsonl");
    source.backup(&backup_path, None, None).unwrap();

    let dest_dir = tempdir().unwrap();
    let destination = build_vault(&dest_dir);
    let restored = destination.restore(&backup_path, RestoreMode::Force, false).unwrap();
    assert_eq!(restored, 1);

    let value = destination.vault().retrieve(&token, "EMAIL").unwrap().unwrap();
    assert_eq!(value, b"alice@example.com");
}

#[test]
fn gdpr_export_and_delete_round_trip() {
    let dir = tempdir().unwrap();
    let vault = build_vault(&dir);

    let (masked, _session_id) = vault.before_agent_start("email alice@example.com", None).unwrap();
    let token = masked.strip_prefix("email ").unwrap();

    let export = vault.gdpr_export(token).unwrap();
    assert_eq!(export.len(), 1);
    assert_eq!(export[0].1, b"alice@example.com");

    let deleted = vault.gdpr_delete(token).unwrap();
    assert_eq!(deleted, 1);
    assert!(vault.gdpr_export(token).unwrap().is_empty());
}
