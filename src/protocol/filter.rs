use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{AppError, Result};

/// Scripts the device firmware cannot echo back byte-for-byte.
pub const DEFAULT_UNSUPPORTED_PATTERN: &str =
    r"[\p{Han}\p{Hiragana}\p{Katakana}\p{Hangul}\x{3000}-\x{303F}\x{FF00}-\x{FFEF}]";

static DEFAULT_FILTER: Lazy<Regex> = Lazy::new(|| Regex::new(DEFAULT_UNSUPPORTED_PATTERN).unwrap());

/// Rejects outgoing text that would corrupt the tagged command framing.
#[derive(Clone, Debug)]
pub struct InputFilter {
    pattern: Option<Regex>,
}

impl Default for InputFilter {
    fn default() -> Self {
        Self {
            pattern: Some(DEFAULT_FILTER.clone()),
        }
    }
}

impl InputFilter {
    /// An empty pattern disables filtering.
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Ok(Self { pattern: None });
        }
        let regex = Regex::new(pattern).map_err(|e| {
            AppError::ConfigError(format!("Invalid unsupported input pattern: {e}"))
        })?;
        Ok(Self {
            pattern: Some(regex),
        })
    }

    pub fn rejects(&self, text: &str) -> bool {
        self.pattern
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_rejects_wide_glyphs() {
        let filter = InputFilter::default();
        assert!(filter.rejects("print('你好')"));
        assert!(filter.rejects("ｆｕｌｌｗｉｄｔｈ"));
        assert!(!filter.rejects("print('hello')\r\n"));
        assert!(!filter.rejects("café"));
    }

    #[test]
    fn test_empty_pattern_disables_filter() {
        let filter = InputFilter::new("").unwrap();
        assert!(!filter.rejects("你好"));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        assert!(matches!(
            InputFilter::new("(unclosed"),
            Err(AppError::ConfigError(_))
        ));
    }
}
