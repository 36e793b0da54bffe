//! Inferred complexity classification.
//!
//! When a submission names no tier, the classifier scores the task's shape
//! and picks one. The signals and the confidence travel with the task so
//! routing decisions stay explainable.

use crate::domain::models::task::{
    ComplexityTier, FileHint, InferredComplexity, VerificationStep,
};

/// Description length below which a task leans trivial.
const SHORT_DESCRIPTION_CHARS: usize = 80;
/// Description length above which a task leans complex.
const LONG_DESCRIPTION_CHARS: usize = 600;
/// File-hint count above which a task leans complex.
const MANY_FILES: usize = 5;

const COMPLEX_KEYWORDS: &[&str] = &[
    "refactor",
    "architecture",
    "migrate",
    "migration",
    "redesign",
    "concurrency",
    "security",
];

const TRIVIAL_KEYWORDS: &[&str] = &["typo", "rename", "bump", "comment", "whitespace", "format"];

/// Classify a task's complexity from its submitted shape.
pub fn classify(
    description: &str,
    file_hints: &[FileHint],
    verification_steps: &[VerificationStep],
) -> InferredComplexity {
    let mut signals = Vec::new();
    // Score > 0 leans complex, < 0 leans trivial.
    let mut score: i32 = 0;

    let lower = description.to_lowercase();
    let len = description.trim().len();

    if len < SHORT_DESCRIPTION_CHARS {
        score -= 1;
        signals.push("short_description".to_string());
    } else if len > LONG_DESCRIPTION_CHARS {
        score += 1;
        signals.push("long_description".to_string());
    }

    if file_hints.len() > MANY_FILES {
        score += 1;
        signals.push("many_file_hints".to_string());
    } else if file_hints.len() == 1 {
        score -= 1;
        signals.push("single_file_hint".to_string());
    }

    if verification_steps.len() > 3 {
        score += 1;
        signals.push("many_verification_steps".to_string());
    }

    for keyword in COMPLEX_KEYWORDS {
        if lower.contains(keyword) {
            score += 2;
            signals.push(format!("keyword:{keyword}"));
            break;
        }
    }
    for keyword in TRIVIAL_KEYWORDS {
        if lower.contains(keyword) {
            score -= 2;
            signals.push(format!("keyword:{keyword}"));
            break;
        }
    }

    let tier = if score >= 2 {
        ComplexityTier::Complex
    } else if score <= -2 {
        ComplexityTier::Trivial
    } else {
        ComplexityTier::Standard
    };

    // Confidence grows with signal agreement, capped below certainty.
    let confidence = (0.5 + 0.1 * f64::from(score.unsigned_abs().min(4))).min(0.9);

    InferredComplexity { tier, confidence, signals }
}
