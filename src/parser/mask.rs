//! Sensitive data masking
//!
//! Ordered `(pattern, replacement)` rules run over messages, traces and
//! string values inside decoded context. Replacements may reference capture
//! groups (`$1`).

use regex::Regex;
use serde_json::Value;

use crate::config::MaskingConfig;
use crate::error::NotifierResult;

#[derive(Debug, Clone)]
pub struct MaskRule {
    pattern: Regex,
    replacement: String,
}

impl MaskRule {
    pub fn new(pattern: &str, replacement: impl Into<String>) -> NotifierResult<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement: replacement.into(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Masker {
    rules: Vec<MaskRule>,
}

impl Masker {
    pub fn new(rules: Vec<MaskRule>) -> Self {
        Self { rules }
    }

    /// Compile the configured rules; an invalid pattern is a config error
    pub fn from_config(config: &MaskingConfig) -> NotifierResult<Self> {
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                let replacement = rule
                    .replacement
                    .clone()
                    .unwrap_or_else(|| config.replacement.clone());
                MaskRule::new(&rule.pattern, replacement)
            })
            .collect::<NotifierResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn mask(&self, text: &str) -> String {
        let mut masked = text.to_string();
        for rule in &self.rules {
            if rule.pattern.is_match(&masked) {
                masked = rule
                    .pattern
                    .replace_all(&masked, rule.replacement.as_str())
                    .into_owned();
            }
        }
        masked
    }

    /// Mask every string leaf of a JSON value in place
    pub fn mask_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => *s = self.mask(s),
            Value::Array(items) => items.iter_mut().for_each(|v| self.mask_value(v)),
            Value::Object(map) => map.values_mut().for_each(|v| self.mask_value(v)),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn default_masker() -> Masker {
        Masker::from_config(&MaskingConfig::default()).unwrap()
    }

    #[test]
    fn test_masks_password_assignment() {
        let masked = default_masker().mask("login failed password=supersecret123 for bob");
        assert_eq!(masked, "login failed [REDACTED] for bob");
    }

    #[test]
    fn test_masks_quoted_api_key_case_insensitive() {
        let masked = default_masker().mask(r#"{"API_KEY": "abc123"}"#);
        assert!(!masked.contains("abc123"));
        assert!(masked.contains("[REDACTED]"));
    }

    #[test]
    fn test_rules_apply_in_order() {
        let masker = Masker::new(vec![
            MaskRule::new(r"card=(\d{4})\d+", "card=$1****").unwrap(),
            MaskRule::new(r"\*{4}", "[masked]").unwrap(),
        ]);
        assert_eq!(masker.mask("card=12345678"), "card=1234[masked]");
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let config = MaskingConfig {
            replacement: "x".into(),
            rules: vec![crate::config::MaskRuleConfig {
                pattern: "(unclosed".into(),
                replacement: None,
            }],
        };
        assert!(Masker::from_config(&config).is_err());
    }

    #[test]
    fn test_mask_value_walks_nested_strings() {
        let mut value = json!({"user": {"token": "token=abc"}, "list": ["secret=x", 3]});
        default_masker().mask_value(&mut value);
        assert_eq!(value["user"]["token"], "[REDACTED]");
        assert_eq!(value["list"][0], "[REDACTED]");
        assert_eq!(value["list"][1], 3);
    }

    #[test]
    fn test_text_without_secrets_is_unchanged() {
        let text = "Undefined variable $user in /app/Http/Kernel.php:12";
        assert_eq!(default_masker().mask(text), text);
    }
}
