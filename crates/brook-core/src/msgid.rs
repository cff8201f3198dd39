//! Message identifiers
//!
//! Every record flowing through Brook carries an identifier of the form
//! `<source-id><sep><seq>`: the declared primary key of the input report
//! plus a per-source sequence number assigned by the splitter. Identifiers
//! are totally ordered per source; no cross-source ordering is implied.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors produced when parsing or constructing a [`MessageId`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageIdError {
    #[error("message id '{0}' has no separator '{1}'")]
    MissingSeparator(String, char),
    #[error("message id '{0}' has a non-numeric sequence part")]
    InvalidSequence(String),
    #[error("source id '{0}' contains the separator '{1}'")]
    SeparatorInSource(String, char),
}

/// A per-source message identity: source id plus sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub source: String,
    pub seq: u64,
    #[serde(default = "default_sep")]
    pub sep: char,
}

fn default_sep() -> char {
    crate::DEFAULT_SPECIAL_CHAR
}

impl MessageId {
    /// Build an id, rejecting source ids that contain the separator.
    pub fn new(source: &str, seq: u64, sep: char) -> Result<Self, MessageIdError> {
        if source.contains(sep) {
            return Err(MessageIdError::SeparatorInSource(source.to_string(), sep));
        }
        Ok(Self {
            source: source.to_string(),
            seq,
            sep,
        })
    }

    /// Parse `<source><sep><seq>`. The sequence is everything after the
    /// last separator, so source ids are free to use any other byte.
    pub fn parse(raw: &str, sep: char) -> Result<Self, MessageIdError> {
        let (source, seq) = raw
            .rsplit_once(sep)
            .ok_or_else(|| MessageIdError::MissingSeparator(raw.to_string(), sep))?;
        let seq: u64 = seq
            .parse()
            .map_err(|_| MessageIdError::InvalidSequence(raw.to_string()))?;
        Self::new(source, seq, sep)
    }

    /// Identity of the message immediately preceding this one for the same
    /// source, if any.
    pub fn prev_seq(&self) -> Option<u64> {
        self.seq.checked_sub(1).filter(|s| *s >= 1)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.source, self.sep, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_and_parse() {
        let id = MessageId::new("Vehicle 1", 17, ':').unwrap();
        assert_eq!(id.to_string(), "Vehicle 1:17");
        let parsed = MessageId::parse("Vehicle 1:17", ':').unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_parse_missing_separator() {
        assert_eq!(
            MessageId::parse("Vehicle1", ':'),
            Err(MessageIdError::MissingSeparator("Vehicle1".into(), ':'))
        );
    }

    #[test]
    fn test_parse_non_numeric_seq() {
        assert!(matches!(
            MessageId::parse("v1:abc", ':'),
            Err(MessageIdError::InvalidSequence(_))
        ));
    }

    #[test]
    fn test_separator_forbidden_in_source() {
        assert!(matches!(
            MessageId::new("a:b", 1, ':'),
            Err(MessageIdError::SeparatorInSource(_, ':'))
        ));
        // A source containing ':' parses to the wrong split, which new() rejects.
        assert!(MessageId::parse("a:b:3", ':').is_err());
    }

    #[test]
    fn test_custom_separator() {
        let id = MessageId::parse("bus:12|4", '|').unwrap();
        assert_eq!(id.source, "bus:12");
        assert_eq!(id.seq, 4);
    }

    #[test]
    fn test_prev_seq() {
        assert_eq!(MessageId::new("v", 1, ':').unwrap().prev_seq(), None);
        assert_eq!(MessageId::new("v", 5, ':').unwrap().prev_seq(), Some(4));
    }
}
