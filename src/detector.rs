// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Detector: scans text against the pattern library and emits ordered,
//! deduplicated detection records with confidence adjusted per validator.

use crate::error::{CoreError, Result};
use crate::pattern::{Category, PatternType, PATTERNS};
use std::collections::HashSet;

/// Default cap on detector input size: 1 MiB.
pub const MAX_INPUT_LENGTH: usize = 1024 * 1024;

/// Matches below this confidence are dropped.
pub const MIN_CONFIDENCE: f64 = 0.5;

/// A located, categorized substring match with a confidence score.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub category: Category,
    pub pattern_type: PatternType,
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
}

pub struct Detector {
    max_input_length: usize,
    min_confidence: f64,
}

impl Detector {
    pub fn new() -> Self {
        Self { max_input_length: MAX_INPUT_LENGTH, min_confidence: MIN_CONFIDENCE }
    }

    pub fn with_limits(max_input_length: usize, min_confidence: f64) -> Self {
        Self { max_input_length, min_confidence }
    }

    /// Scan `text`, returning detections ordered by `start` ascending; ties
    /// preserve insertion (pattern registration) order.
    pub fn detect(&self, text: &str) -> Result<Vec<Detection>> {
        if text.len() > self.max_input_length {
            return Err(CoreError::input_too_large(self.max_input_length));
        }

        let mut detections = Vec::new();
        let mut seen: HashSet<(usize, String)> = HashSet::new();

        for pattern in PATTERNS.iter() {
            for m in pattern.regex.find_iter(text) {
                let matched = m.as_str();
                let confidence = match pattern.validator {
                    Some(validator) => {
                        let result = validator(matched);
                        if !result.valid || result.multiplier == 0.0 {
                            continue;
                        }
                        round3((pattern.base_confidence * result.multiplier).min(1.0))
                    }
                    None => round3(pattern.base_confidence.min(1.0)),
                };

                if confidence < self.min_confidence {
                    continue;
                }

                let key = (m.start(), matched.to_string());
                if !seen.insert(key) {
                    continue;
                }

                detections.push(Detection {
                    category: pattern.category,
                    pattern_type: pattern.pattern_type,
                    text: matched.to_string(),
                    start: m.start(),
                    end: m.end(),
                    confidence,
                });
            }
        }

        detections.sort_by(|a, b| a.start.cmp(&b.start));
        Ok(detections)
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
