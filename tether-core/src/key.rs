//! Machine key validation.
//!
//! The key is a credential handed to the backend as its only argument. It is
//! kept in memory only and never printed in full.

use std::fmt;

use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyError {
    Missing,
    Empty,
    NotAString,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "machine key is missing"),
            Self::Empty => write!(f, "machine key is empty"),
            Self::NotAString => write!(f, "machine key must be a string"),
        }
    }
}

impl std::error::Error for KeyError {}

#[derive(Clone, PartialEq, Eq)]
pub struct MachineKey(String);

impl MachineKey {
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        if raw.trim().is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self(raw.to_string()))
    }

    /// Validate a key as it arrives from the UI bridge (any JSON value).
    pub fn from_value(value: &Value) -> Result<Self, KeyError> {
        match value {
            Value::Null => Err(KeyError::Missing),
            Value::String(s) => Self::parse(s),
            _ => Err(KeyError::NotAString),
        }
    }

    /// The cleartext key, for the process argument only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// `****` followed by the last four characters.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        let tail: String = if chars.len() > 8 {
            chars[chars.len() - 4..].iter().collect()
        } else {
            String::new()
        };
        format!("****{}", tail)
    }
}

impl fmt::Debug for MachineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachineKey({})", self.masked())
    }
}

impl fmt::Display for MachineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}
