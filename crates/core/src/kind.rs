//! Message routing tags.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Tag identifying which handler applies to a message (e.g. `"invoice.created"`).
///
/// Tags are non-empty and contain no whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageKind(String);

impl MessageKind {
    pub fn new(tag: impl Into<String>) -> Result<Self, CoreError> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(CoreError::validation("message kind must not be empty"));
        }
        if tag.chars().any(char::is_whitespace) {
            return Err(CoreError::validation(format!(
                "message kind must not contain whitespace: {tag:?}"
            )));
        }
        Ok(Self(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MessageKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for MessageKind {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MessageKind> for String {
    fn from(value: MessageKind) -> Self {
        value.0
    }
}

/// Partition/ordering key. Messages sharing a key are never processed concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderingKey(String);

impl OrderingKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrderingKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
