//! Wire parsing for the Realtime Database event stream.
//!
//! The server frames notifications as `event:`/`data:` line pairs separated
//! by blank lines. `put` and `patch` carry a JSON `{path, data}` payload
//! relative to the subscribed node; `keep-alive` is padding; `cancel` and
//! `auth_revoked` end useful delivery.

use patchlink_core::{RequestId, RequestSnapshot, StoreError};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// One framed wire event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WireEvent {
    pub name: String,
    pub data: String,
}

/// Incremental frame parser. Bytes go in as they arrive off the socket;
/// completed events come out. Only whole lines are decoded, so multi-byte
/// characters split across chunks survive.
#[derive(Debug, Default)]
pub(crate) struct EventParser {
    buffer: Vec<u8>,
    name: Option<String>,
    data: Vec<String>,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<WireEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(&['\n', '\r'][..]);
            self.take_line(line, &mut events);
        }
        events
    }

    fn take_line(&mut self, line: &str, events: &mut Vec<WireEvent>) {
        if line.is_empty() {
            if let Some(name) = self.name.take() {
                events.push(WireEvent {
                    name,
                    data: self.data.join("\n"),
                });
            }
            self.data.clear();
            return;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            self.name = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
        // comments and unknown fields are ignored
    }
}

/// `put`/`patch` payload: a path relative to the subscribed node and the
/// value written there.
#[derive(Debug, Deserialize)]
pub(crate) struct ChangePayload {
    pub path: String,
    pub data: Value,
}

/// What one wire event means for the subscription.
#[derive(Debug)]
pub(crate) enum Folded {
    /// The subtree changed; here is the full child set.
    Snapshot(RequestSnapshot),
    /// Delivery is over (revocation, cancellation, malformed frame).
    Lost(StoreError),
    /// Keep-alive or similar padding.
    Ignored,
}

/// Folds put/patch notifications into the current child set, yielding the
/// full snapshot the relay expects after every change.
#[derive(Debug, Default)]
pub(crate) struct SubtreeState {
    children: BTreeMap<String, Value>,
}

impl SubtreeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &WireEvent) -> Folded {
        match event.name.as_str() {
            "put" => match self.parse_payload(&event.data) {
                Ok(payload) => {
                    self.put(&payload.path, payload.data);
                    Folded::Snapshot(self.snapshot())
                }
                Err(error) => Folded::Lost(error),
            },
            "patch" => match self.parse_payload(&event.data) {
                Ok(payload) => {
                    self.patch(&payload.path, payload.data);
                    Folded::Snapshot(self.snapshot())
                }
                Err(error) => Folded::Lost(error),
            },
            "keep-alive" => Folded::Ignored,
            "cancel" => Folded::Lost(StoreError::Other {
                message: "subscription cancelled by the store".into(),
            }),
            "auth_revoked" => Folded::Lost(StoreError::Authentication {
                message: "credentials revoked".into(),
            }),
            other => {
                tracing::debug!(event = other, "ignoring unknown stream event");
                Folded::Ignored
            }
        }
    }

    fn parse_payload(&self, data: &str) -> Result<ChangePayload, StoreError> {
        serde_json::from_str(data).map_err(|error| StoreError::Protocol {
            message: format!("malformed change payload: {error}"),
        })
    }

    fn put(&mut self, path: &str, data: Value) {
        match child_of(path) {
            None => {
                self.children.clear();
                if let Value::Object(map) = data {
                    self.children.extend(map);
                }
            }
            Some((child, rest)) if rest.is_none() => {
                if data.is_null() {
                    self.children.remove(child);
                } else {
                    self.children.insert(child.to_string(), data);
                }
            }
            Some((child, _)) => {
                // writes below a request entry do not fit the flat model
                tracing::debug!(child, path, "ignoring deep put");
            }
        }
    }

    fn patch(&mut self, path: &str, data: Value) {
        let Value::Object(map) = data else { return };
        match child_of(path) {
            None => {
                for (child, value) in map {
                    if value.is_null() {
                        self.children.remove(&child);
                    } else {
                        self.children.insert(child, value);
                    }
                }
            }
            Some((child, _)) => {
                tracing::debug!(child, path, "ignoring deep patch");
            }
        }
    }

    fn snapshot(&self) -> RequestSnapshot {
        self.children
            .iter()
            .map(|(child, value)| {
                let device_name = match value {
                    Value::String(name) => name.clone(),
                    other => other.to_string(),
                };
                (RequestId::new(child.clone()), device_name)
            })
            .collect()
    }
}

/// Split a change path into its first segment and the remainder, if any.
/// `"/"` addresses the subscribed node itself.
fn child_of(path: &str) -> Option<(&str, Option<&str>)> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.split_once('/') {
        Some((child, rest)) => Some((child, Some(rest))),
        None => Some((trimmed, None)),
    }
}
