//! Identifiers routed on by the bridge.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default length of generated ids.
pub const UID_LENGTH: usize = 16;

/// Generate a random base36 id of `len` characters.
///
/// The first character is always a letter so the id is usable as a name
/// prefix on the page side.
pub fn gen_uid(len: usize) -> String {
    let mut rng = rand::rng();
    let mut result = String::with_capacity(len);

    if len == 0 {
        return result;
    }

    if let Some(first) = char::from_digit(rng.random_range(10..36), 36) {
        result.push(first);
    }
    while result.len() < len {
        if let Some(c) = char::from_digit(rng.random_range(0..36), 36) {
            result.push(c);
        }
    }

    result
}

/// Identifies one inspected page (the browser's tab id).
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub u64);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab-{}", self.0)
    }
}

/// Routing key of an in-page broadcast channel. Minted once per context.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    /// Mint a fresh channel id for a context named `name`.
    pub fn mint(name: &str) -> Self {
        Self(format!("{}/{}", name, gen_uid(UID_LENGTH)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Producer id, unique within a panel session: `"<hub id>:<name>"`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublisherId(pub String);

impl PublisherId {
    pub fn new(hub_id: u32, name: &str) -> Self {
        Self(format!("{}:{}", hub_id, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublisherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PublisherId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Correlates a one-shot reply with its request.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackId(pub String);

impl CallbackId {
    pub fn generate() -> Self {
        Self(gen_uid(UID_LENGTH))
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
