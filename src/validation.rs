//! Mandate content validation: the one piece of user-supplied text the
//! gateway accepts before handing it off to a worker. Length-bounded and
//! checked against an allowlist plus a small blocklist of patterns that
//! have no business in a natural-language mandate.

use std::collections::HashSet;

use regex::Regex;

use crate::error::SubstrateError;
use crate::Result;

const SAFE_MANDATE_PATTERN: &str =
    r"^[\p{L}\p{N}\s\.,!?:;()\[\]{}\-_+=@#$%^&*|\\/<>'`~\n\r\t]+$";

static DANGEROUS_PATTERNS: &[&str] = &[
    "<script",
    "javascript:",
    "data:text/html",
    "vbscript:",
    "$(rm",
    "`rm",
    "drop table",
    "union select",
    "../../",
    "file://",
];

#[derive(Clone)]
pub struct MandateValidator {
    safe_content_regex: Regex,
    dangerous_patterns: HashSet<String>,
}

impl MandateValidator {
    pub fn new() -> Result<Self> {
        let safe_content_regex = Regex::new(SAFE_MANDATE_PATTERN)
            .map_err(|e| SubstrateError::ConfigurationError(format!("invalid mandate regex: {e}")))?;

        let dangerous_patterns = DANGEROUS_PATTERNS.iter().map(|s| s.to_lowercase()).collect();

        Ok(Self {
            safe_content_regex,
            dangerous_patterns,
        })
    }

    /// Rejects mandates that are empty, over `max_length`, contain
    /// characters outside the safe allowlist, or match a known dangerous
    /// pattern.
    pub fn validate(&self, mandate: &str, max_length: usize) -> std::result::Result<(), String> {
        let trimmed = mandate.trim();
        if trimmed.is_empty() {
            return Err("mandate must not be empty".to_string());
        }
        if mandate.len() > max_length {
            return Err(format!(
                "mandate exceeds maximum length of {max_length} characters"
            ));
        }
        if !self.safe_content_regex.is_match(mandate) {
            return Err("mandate contains characters outside the allowed set".to_string());
        }

        let lowered = mandate.to_lowercase();
        for pattern in &self.dangerous_patterns {
            if lowered.contains(pattern.as_str()) {
                return Err(format!("mandate contains a disallowed pattern: {pattern}"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> MandateValidator {
        MandateValidator::new().expect("validator builds")
    }

    #[test]
    fn accepts_an_ordinary_mandate() {
        assert!(validator()
            .validate("Summarize the open PRs in this repo.", 1000)
            .is_ok());
    }

    #[test]
    fn rejects_empty_mandate() {
        assert!(validator().validate("   ", 1000).is_err());
    }

    #[test]
    fn rejects_oversized_mandate() {
        let mandate = "a".repeat(20);
        assert!(validator().validate(&mandate, 10).is_err());
    }

    #[test]
    fn rejects_script_injection_attempt() {
        assert!(validator()
            .validate("<script>alert(1)</script>", 1000)
            .is_err());
    }

    #[test]
    fn rejects_shell_command_substitution() {
        assert!(validator()
            .validate("run $(rm -rf /) please", 1000)
            .is_err());
    }
}
