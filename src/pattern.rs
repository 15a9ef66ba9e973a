// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pattern Library: declarative regex patterns with category, base
//! confidence, and an optional post-match validator (Luhn, range checks).
//! Patterns are immutable after registration.

use once_cell::sync::Lazy;
use regex::Regex;

/// Broad classification of a pattern's match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Pii,
    Secrets,
    Network,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pii => "PII",
            Self::Secrets => "SECRETS",
            Self::Network => "NETWORK",
        }
    }
}

/// The registered pattern type, used as the token prefix (`UPPER_TYPE_...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternType {
    Email,
    Phone,
    Ssn,
    CreditCard,
    ApiKey,
    BearerToken,
    PemBlock,
    Ipv4,
    Ipv6,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Phone => "PHONE",
            Self::Ssn => "SSN",
            Self::CreditCard => "CREDIT_CARD",
            Self::ApiKey => "API_KEY",
            Self::BearerToken => "BEARER_TOKEN",
            Self::PemBlock => "PEM_BLOCK",
            Self::Ipv4 => "IPV4",
            Self::Ipv6 => "IPV6",
        }
    }

    /// Resolve the upper-cased token prefix back to a pattern type. Used by
    /// the tokenizer's `is_valid_token` grammar check.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_uppercase().as_str() {
            "EMAIL" => Some(Self::Email),
            "PHONE" => Some(Self::Phone),
            "SSN" => Some(Self::Ssn),
            "CREDIT_CARD" => Some(Self::CreditCard),
            "API_KEY" => Some(Self::ApiKey),
            "BEARER_TOKEN" => Some(Self::BearerToken),
            "PEM_BLOCK" => Some(Self::PemBlock),
            "IPV4" => Some(Self::Ipv4),
            "IPV6" => Some(Self::Ipv6),
            _ => None,
        }
    }
}

/// Result of running a pattern's validator against a raw match.
pub struct ValidationResult {
    pub valid: bool,
    pub multiplier: f64,
}

type Validator = fn(&str) -> ValidationResult;

/// A single declarative detection pattern. Immutable once built.
pub struct Pattern {
    pub pattern_type: PatternType,
    pub category: Category,
    pub regex: Regex,
    pub base_confidence: f64,
    pub validator: Option<Validator>,
}

/// Luhn checksum validator for CREDIT_CARD. Strips separators before summing.
fn validate_luhn(raw: &str) -> ValidationResult {
    let digits: Vec<u32> = raw.chars().filter(|c| c.is_ascii_digit()).filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 12 {
        return ValidationResult { valid: false, multiplier: 0.0 };
    }

    let mut sum = 0u32;
    for (i, digit) in digits.iter().rev().enumerate() {
        let mut d = *digit;
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }

    if sum % 10 == 0 {
        ValidationResult { valid: true, multiplier: 3.0 }
    } else {
        ValidationResult { valid: true, multiplier: 1.0 }
    }
}

/// SSN validator: rejects area `000`/`666`/`9xx`, group `00`, serial `0000`.
fn validate_ssn(raw: &str) -> ValidationResult {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() != 9 {
        return ValidationResult { valid: false, multiplier: 0.0 };
    }
    let area = &digits[0..3];
    let group = &digits[3..5];
    let serial = &digits[5..9];

    let area_num: u32 = area.parse().unwrap_or(0);
    if area == "000" || area == "666" || area_num >= 900 || group == "00" || serial == "0000" {
        return ValidationResult { valid: false, multiplier: 0.0 };
    }
    ValidationResult { valid: true, multiplier: 1.0 }
}

/// IPv4 octet-bounds validator (the regex matches digit groups; this rejects octets > 255).
fn validate_ipv4(raw: &str) -> ValidationResult {
    let ok = raw
        .split('.')
        .all(|octet| octet.parse::<u32>().map(|n| n <= 255).unwrap_or(false));
    ValidationResult { valid: ok, multiplier: if ok { 1.0 } else { 0.0 } }
}

/// Registered pattern library. Compiled once; `Detector` caches this table
/// rather than recompiling regexes per call.
pub static PATTERNS: Lazy<Vec<Pattern>> = Lazy::new(|| {
    vec![
        Pattern {
            pattern_type: PatternType::Email,
            category: Category::Pii,
            regex: Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("email regex"),
            base_confidence: 0.95,
            validator: None,
        },
        Pattern {
            pattern_type: PatternType::Phone,
            category: Category::Pii,
            regex: Regex::new(r"\b(?:\+?\d{1,3}[-.\s]?)?\(?\d{2,4}\)?[-.\s]?\d{3,4}[-.\s]?\d{3,4}\b")
                .expect("phone regex"),
            base_confidence: 0.85,
            validator: None,
        },
        Pattern {
            pattern_type: PatternType::Ssn,
            category: Category::Pii,
            regex: Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn regex"),
            base_confidence: 0.95,
            validator: Some(validate_ssn),
        },
        Pattern {
            pattern_type: PatternType::CreditCard,
            category: Category::Pii,
            regex: Regex::new(r"\b(?:\d[ -]?){13,16}\b").expect("credit card regex"),
            base_confidence: 0.3,
            validator: Some(validate_luhn),
        },
        Pattern {
            pattern_type: PatternType::ApiKey,
            category: Category::Secrets,
            regex: Regex::new(
                r"\b(?:sk-|ghp_|github_pat_|xox[baprs]-|xapp-|gsk_|AIza|pplx-|npm_)[A-Za-z0-9_-]{16,}\b",
            )
            .expect("api key regex"),
            base_confidence: 0.9,
            validator: None,
        },
        Pattern {
            pattern_type: PatternType::BearerToken,
            category: Category::Secrets,
            regex: Regex::new(r"(?i)(?:authorization:\s*)?bearer\s+[a-zA-Z0-9\-._~+/]+=*")
                .expect("bearer regex"),
            base_confidence: 0.85,
            validator: None,
        },
        Pattern {
            pattern_type: PatternType::PemBlock,
            category: Category::Secrets,
            regex: Regex::new(
                r"-----BEGIN (?:RSA )?(?:PRIVATE KEY|CERTIFICATE|PUBLIC KEY)-----[\s\S]+?-----END (?:RSA )?(?:PRIVATE KEY|CERTIFICATE|PUBLIC KEY)-----",
            )
            .expect("pem regex"),
            base_confidence: 1.0,
            validator: None,
        },
        Pattern {
            pattern_type: PatternType::Ipv4,
            category: Category::Network,
            regex: Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("ipv4 regex"),
            base_confidence: 0.8,
            validator: Some(validate_ipv4),
        },
        Pattern {
            pattern_type: PatternType::Ipv6,
            category: Category::Network,
            regex: Regex::new(
                r"\b(?:[0-9a-fA-F]{1,4}:){2,7}[0-9a-fA-F]{1,4}(?:%[0-9a-zA-Z]+)?\b|\b::(?:ffff:)?(?:\d{1,3}\.){3}\d{1,3}\b",
            )
            .expect("ipv6 regex"),
            base_confidence: 0.8,
            validator: None,
        },
    ]
});
