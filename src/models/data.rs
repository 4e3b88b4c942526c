use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Describes how a data line is validated and sliced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordlistType {
    pub name: String,
    /// Regex the whole line must match when `verify` is set
    pub regex: String,
    pub verify: bool,
    pub separator: String,
    /// Variable names assigned to the slices, in order
    pub slices: Vec<String>,
}

impl Default for WordlistType {
    fn default() -> Self {
        Self {
            name: "Default".to_string(),
            regex: "^.*$".to_string(),
            verify: false,
            separator: ":".to_string(),
            slices: vec!["DATA".to_string()],
        }
    }
}

impl WordlistType {
    /// `user:pass` style credentials
    pub fn credentials() -> Self {
        Self {
            name: "Credentials".to_string(),
            regex: "^.*:.*$".to_string(),
            verify: true,
            separator: ":".to_string(),
            slices: vec!["USER".to_string(), "PASS".to_string()],
        }
    }
}

/// A rule a single slice of the line must satisfy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DataRuleKind {
    MinLength(usize),
    MaxLength(usize),
    Contains(String),
    MatchesRegex(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRule {
    /// Name of the slice the rule applies to
    pub slice: String,
    pub kind: DataRuleKind,
    /// Invert the outcome of the rule
    #[serde(default)]
    pub invert: bool,
}

/// A single input line of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLine {
    pub data: String,
    pub index: u64,
}

impl DataLine {
    pub fn new(data: impl Into<String>, index: u64) -> Self {
        Self {
            data: data.into(),
            index,
        }
    }

    /// Split the line into named slices according to the wordlist type.
    /// The last slice keeps any extra separators.
    pub fn slices(&self, wordlist_type: &WordlistType) -> Vec<(String, String)> {
        let count = wordlist_type.slices.len().max(1);
        let parts: Vec<&str> = if wordlist_type.separator.is_empty() {
            vec![self.data.as_str()]
        } else {
            self.data.splitn(count, wordlist_type.separator.as_str()).collect()
        };

        wordlist_type
            .slices
            .iter()
            .zip(parts)
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect()
    }
}

enum CompiledRule {
    MinLength(usize),
    MaxLength(usize),
    Contains(String),
    Matches(Regex),
}

/// Validates data lines against a wordlist type and a set of rules.
/// Regexes are compiled once per run.
pub struct LineValidator {
    wordlist_type: WordlistType,
    line_regex: Option<Regex>,
    rules: Vec<(String, bool, CompiledRule)>,
}

impl LineValidator {
    pub fn new(wordlist_type: WordlistType, rules: &[DataRule]) -> Result<Self> {
        let line_regex = if wordlist_type.verify {
            Some(Regex::new(&wordlist_type.regex)?)
        } else {
            None
        };

        let rules = rules
            .iter()
            .map(|rule| -> Result<(String, bool, CompiledRule)> {
                let compiled = match &rule.kind {
                    DataRuleKind::MinLength(n) => CompiledRule::MinLength(*n),
                    DataRuleKind::MaxLength(n) => CompiledRule::MaxLength(*n),
                    DataRuleKind::Contains(s) => CompiledRule::Contains(s.clone()),
                    DataRuleKind::MatchesRegex(r) => CompiledRule::Matches(Regex::new(r)?),
                };
                Ok((rule.slice.clone(), rule.invert, compiled))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            wordlist_type,
            line_regex,
            rules,
        })
    }

    pub fn wordlist_type(&self) -> &WordlistType {
        &self.wordlist_type
    }

    pub fn is_valid(&self, line: &DataLine) -> bool {
        if let Some(regex) = &self.line_regex {
            if !regex.is_match(&line.data) {
                return false;
            }
        }

        let slices = line.slices(&self.wordlist_type);
        if self.wordlist_type.verify && slices.len() != self.wordlist_type.slices.len() {
            return false;
        }

        self.rules.iter().all(|(slice, invert, rule)| {
            let Some((_, value)) = slices.iter().find(|(name, _)| name == slice) else {
                return false;
            };
            let outcome = match rule {
                CompiledRule::MinLength(n) => value.chars().count() >= *n,
                CompiledRule::MaxLength(n) => value.chars().count() <= *n,
                CompiledRule::Contains(s) => value.contains(s.as_str()),
                CompiledRule::Matches(regex) => regex.is_match(value),
            };
            outcome != *invert
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slices_credentials() {
        let line = DataLine::new("user@example.com:p:a:ss", 0);
        let slices = line.slices(&WordlistType::credentials());
        assert_eq!(
            slices,
            vec![
                ("USER".to_string(), "user@example.com".to_string()),
                ("PASS".to_string(), "p:a:ss".to_string()),
            ]
        );
    }

    #[test]
    fn test_default_type_accepts_anything() {
        let validator = LineValidator::new(WordlistType::default(), &[]).unwrap();
        assert!(validator.is_valid(&DataLine::new("whatever", 0)));
        assert!(validator.is_valid(&DataLine::new("", 1)));
    }

    #[test]
    fn test_credentials_require_separator() {
        let validator = LineValidator::new(WordlistType::credentials(), &[]).unwrap();
        assert!(validator.is_valid(&DataLine::new("user:pass", 0)));
        assert!(!validator.is_valid(&DataLine::new("userpass", 1)));
    }

    #[test]
    fn test_data_rules() {
        let rules = vec![
            DataRule {
                slice: "PASS".to_string(),
                kind: DataRuleKind::MinLength(6),
                invert: false,
            },
            DataRule {
                slice: "USER".to_string(),
                kind: DataRuleKind::Contains("@".to_string()),
                invert: false,
            },
            DataRule {
                slice: "PASS".to_string(),
                kind: DataRuleKind::MatchesRegex("^[0-9]+$".to_string()),
                invert: true,
            },
        ];
        let validator = LineValidator::new(WordlistType::credentials(), &rules).unwrap();

        assert!(validator.is_valid(&DataLine::new("a@b.c:secret1", 0)));
        assert!(!validator.is_valid(&DataLine::new("a@b.c:short", 1)));
        assert!(!validator.is_valid(&DataLine::new("ab.c:secret1", 2)));
        assert!(!validator.is_valid(&DataLine::new("a@b.c:123456", 3)));
    }

    #[test]
    fn test_rule_on_missing_slice_fails() {
        let rules = vec![DataRule {
            slice: "EMAIL".to_string(),
            kind: DataRuleKind::MinLength(1),
            invert: false,
        }];
        let validator = LineValidator::new(WordlistType::credentials(), &rules).unwrap();
        assert!(!validator.is_valid(&DataLine::new("a:b", 0)));
    }

    #[test]
    fn test_invalid_regex_is_setup_error() {
        let mut wordlist_type = WordlistType::default();
        wordlist_type.verify = true;
        wordlist_type.regex = "(".to_string();
        assert!(LineValidator::new(wordlist_type, &[]).is_err());
    }
}
