//! Dot-delimited subjects used to route messages between pipeline stages.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubjectError {
    #[error("subject is empty")]
    Empty,
    #[error("subject `{0}` contains an empty token")]
    EmptyToken(String),
    #[error("subject `{0}` contains whitespace")]
    Whitespace(String),
    #[error("`>` must be the last token in `{0}`")]
    MisplacedTail(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject(String);

impl Subject {
    pub fn parse(raw: &str) -> Result<Self, SubjectError> {
        if raw.is_empty() {
            return Err(SubjectError::Empty);
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(SubjectError::Whitespace(raw.to_string()));
        }
        let tokens: Vec<&str> = raw.split('.').collect();
        if tokens.iter().any(|t| t.is_empty()) {
            return Err(SubjectError::EmptyToken(raw.to_string()));
        }
        if let Some(pos) = tokens.iter().position(|t| *t == ">") {
            if pos != tokens.len() - 1 {
                return Err(SubjectError::MisplacedTail(raw.to_string()));
            }
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    pub fn last_token(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    pub fn child(&self, token: &str) -> Result<Self, SubjectError> {
        Self::parse(&format!("{}.{}", self.0, token))
    }

    pub fn is_wildcard(&self) -> bool {
        self.tokens().any(|t| t == "*" || t == ">")
    }

    /// Whether this (concrete) subject is selected by `filter`.
    ///
    /// `*` matches exactly one token, a trailing `>` matches one or more.
    pub fn matches(&self, filter: &Subject) -> bool {
        let mut own = self.tokens();
        let mut pattern = filter.tokens();
        loop {
            match (pattern.next(), own.next()) {
                (Some(">"), Some(_)) => return true,
                (Some("*"), Some(_)) => continue,
                (Some(p), Some(o)) if p == o => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Subject {
    type Err = SubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub fn symbol_token(pair: &str) -> String {
    pair.trim().replace('/', "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn s(raw: &str) -> Subject {
        Subject::parse(raw).unwrap()
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(Subject::parse(""), Err(SubjectError::Empty));
        assert!(matches!(Subject::parse("a..b"), Err(SubjectError::EmptyToken(_))));
        assert!(matches!(Subject::parse("a.b."), Err(SubjectError::EmptyToken(_))));
        assert!(matches!(Subject::parse("a b"), Err(SubjectError::Whitespace(_))));
        assert!(matches!(Subject::parse("a.>.b"), Err(SubjectError::MisplacedTail(_))));
    }

    #[test]
    fn test_last_token_and_child() {
        let raw = s("market-data.raw");
        let child = raw.child("BTC-USD").unwrap();
        assert_eq!(child.as_str(), "market-data.raw.BTC-USD");
        assert_eq!(child.last_token(), "BTC-USD");
        assert!(raw.child("").is_err());
    }

    #[test]
    fn test_wildcard_matching() {
        let msg = s("market-data.raw.BTC-USD");
        assert!(msg.matches(&s("market-data.raw.>")));
        assert!(msg.matches(&s("market-data.*.BTC-USD")));
        assert!(msg.matches(&s("market-data.raw.BTC-USD")));
        assert!(msg.matches(&s(">")));
        assert!(!msg.matches(&s("market-data.processed.>")));
        assert!(!msg.matches(&s("market-data.raw")));
        assert!(!s("market-data.raw").matches(&s("market-data.raw.>")));
        assert!(!msg.matches(&s("market-data.*")));
    }

    #[test]
    fn test_symbol_token() {
        assert_eq!(symbol_token("BTC/USD"), "BTC-USD");
        assert_eq!(symbol_token(" ETH/EUR "), "ETH-EUR");
    }

    proptest! {
        #[test]
        fn prop_tail_wildcard_matches_every_child(
            tokens in proptest::collection::vec("[a-zA-Z0-9-]{1,8}", 1..5),
            leaf in "[a-zA-Z0-9-]{1,8}",
        ) {
            let prefix = s(&tokens.join("."));
            let filter = prefix.child(">").unwrap();
            let subject = prefix.child(&leaf).unwrap();
            prop_assert!(subject.matches(&filter));
            prop_assert!(!prefix.matches(&filter));
            prop_assert_eq!(subject.last_token(), leaf.as_str());
        }
    }
}
