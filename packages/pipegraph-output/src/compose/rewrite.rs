//! Regex rewrites with numbered back-references
//!
//! Application is two-phase: the first match of `search` is replaced with
//! the replacement text taken literally, then every `$1`..`$9` token in the
//! result is substituted with the corresponding capture group of that same
//! match. Groups that did not participate substitute as empty text.

use once_cell::sync::Lazy;
use regex::{Captures, NoExpand, Regex};

use crate::config::{ConfigError, ConfigResult, RewriteRule};

static BACKREF: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$([1-9])").expect("valid regex"));

#[derive(Debug, Clone)]
pub struct Rewrite {
    search: Regex,
    replacement: String,
}

impl Rewrite {
    pub fn new(rule: &RewriteRule) -> ConfigResult<Self> {
        let search = Regex::new(&rule.search)
            .map_err(|e| ConfigError::invalid_pattern(rule.search.as_str(), e))?;
        Ok(Self {
            search,
            replacement: rule.replacement.clone(),
        })
    }

    /// Apply to `input`; unchanged when the pattern doesn't match
    pub fn apply(&self, input: &str) -> String {
        let Some(captures) = self.search.captures(input) else {
            return input.to_string();
        };

        let replaced = self
            .search
            .replacen(input, 1, NoExpand(&self.replacement))
            .into_owned();

        BACKREF
            .replace_all(&replaced, |token: &Captures<'_>| {
                let group: usize = token[1].parse().unwrap_or(0);
                captures
                    .get(group)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default()
            })
            .into_owned()
    }
}

/// Apply each rewrite in order
pub fn apply_all(rewrites: &[Rewrite], input: &str) -> String {
    rewrites
        .iter()
        .fold(input.to_string(), |acc, rewrite| rewrite.apply(&acc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rewrite(search: &str, replacement: &str) -> Rewrite {
        Rewrite::new(&RewriteRule::new(search, replacement)).unwrap()
    }

    #[test]
    fn test_backreference_substitution() {
        assert_eq!(rewrite(r"(\w+)_raw", "$1_clean").apply("sample_raw"), "sample_clean");
    }

    #[test]
    fn test_only_first_match_is_replaced() {
        assert_eq!(rewrite("a", "b").apply("banana"), "bbnana");
    }

    #[test]
    fn test_no_match_is_identity() {
        assert_eq!(rewrite("xyz", "q").apply("sample"), "sample");
    }

    #[test]
    fn test_missing_group_is_empty() {
        assert_eq!(rewrite(r"(a)|(b)", "[$2]").apply("a"), "[]");
        assert_eq!(rewrite(r"(a)", "$1$5").apply("abc"), "abc");
    }

    #[test]
    fn test_replacement_can_add_separators() {
        assert_eq!(rewrite(r"^(HG)(\d+)$", "$1/$2").apply("HG002"), "HG/002");
    }

    #[test]
    fn test_ordered_application() {
        let rules = vec![rewrite("raw", "clean"), rewrite("clean", "final")];
        assert_eq!(apply_all(&rules, "x_raw"), "x_final");
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(Rewrite::new(&RewriteRule::new("(", "x")).is_err());
    }

    proptest! {
        #[test]
        fn prop_literal_replacement_without_tokens(input in "[a-z_]{0,20}", replacement in "[A-Z]{0,5}") {
            let rule = rewrite("_", &replacement);
            let expected = input.replacen('_', &replacement, 1);
            prop_assert_eq!(rule.apply(&input), expected);
        }

        #[test]
        fn prop_group_one_echoes_the_match(word in "[a-z]{1,10}") {
            let rule = rewrite("([a-z]+)", "<$1>");
            prop_assert_eq!(rule.apply(&word), format!("<{}>", word));
        }
    }
}
