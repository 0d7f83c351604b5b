//! Backend failure classification.
//!
//! Gemini reports safety blocks and quota exhaustion only through free-text
//! error messages, so this is a substring heuristic. Anything unrecognised is
//! a generic failure.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    SafetyBlock,
    QuotaExceeded,
    Generic,
}

const QUOTA_MARKERS: &[&str] = &["quota", "rate limit", "resource_exhausted"];

/// Classify a failure detail. Safety wins over quota when both appear.
pub fn classify_failure(detail: &str) -> FailureClass {
    let detail = detail.to_ascii_lowercase();
    if detail.contains("safety") {
        return FailureClass::SafetyBlock;
    }
    if QUOTA_MARKERS.iter().any(|marker| detail.contains(marker)) {
        return FailureClass::QuotaExceeded;
    }
    FailureClass::Generic
}
