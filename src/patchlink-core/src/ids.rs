use serde::{Deserialize, Serialize};
use std::fmt;

/// Scopes which remote subtree a relay observes.
///
/// Producers and the relay MUST agree on this opaque, case-sensitive value;
/// it is stable for the lifetime of a pairing and only changes through an
/// explicit host command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct SessionId(pub String);

const MACHINE_ID_PREFIX: &str = "patch_";
const MACHINE_ID_MAX_LEN: usize = 20;

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a per-computer default session id from the host and user
    /// names: lowercased, anything outside `[a-z0-9]` squashed to `_`,
    /// capped length, stable across restarts on the same machine.
    pub fn for_machine() -> Self {
        let host = hostname();
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "user".to_string());
        let base = format!("{host}_{user}").to_lowercase();
        let mut cleaned: String = base
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        cleaned.truncate(MACHINE_ID_MAX_LEN);
        Self(format!("{MACHINE_ID_PREFIX}{cleaned}"))
    }
}

fn hostname() -> String {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "machine".to_string())
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of one request entry under a session subtree.
///
/// Assigned by the external producer; the relay never inspects it beyond
/// equality.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
