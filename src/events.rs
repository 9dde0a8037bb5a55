//! Event store.
//!
//! Every traffic request leaves one [`Event`] under its key
//! `(method, normalized uri)`, subject to the [`RetentionConfig`]. Events are
//! immutable once recorded and shared as `Arc`s, so queries never copy whole
//! histories while holding the lock.

use crate::error::QueryError;
use base64::Engine as _;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identity of a request stream: method plus normalized uri.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    pub method: String,
    pub uri: String,
}

impl EventKey {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
        }
    }
}

/// One recorded request/response outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub reception_timestamp_us: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub previous_state: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub request_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<Value>,
    pub response_delay_ms: u64,
    pub response_status_code: u16,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub response_headers: BTreeMap<String, String>,
    pub server_sequence: u64,
    pub recvseq: u64,
}

impl Event {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Snapshot of a message body for the event history.
///
/// JSON bodies are kept as JSON, other UTF-8 text as a string and binary
/// content as base64.
pub fn body_snapshot(body: &[u8]) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        return Some(value);
    }
    Some(match std::str::from_utf8(body) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::String(base64::engine::general_purpose::STANDARD.encode(body)),
    })
}

/// Retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionConfig {
    pub store_events: bool,
    pub store_events_key_history: bool,
    pub purge_execution: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            store_events: true,
            store_events_key_history: true,
            purge_execution: true,
        }
    }
}

/// Selection over the stored events.
///
/// `number` counts from 1; negative values count from the end (`-1` is the
/// last event).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    pub key: Option<EventKey>,
    pub number: Option<i64>,
    pub path: Option<String>,
}

impl EventQuery {
    pub fn from_params(
        method: Option<&str>,
        uri: Option<&str>,
        number: Option<&str>,
        path: Option<&str>,
    ) -> Result<Self, QueryError> {
        let key = match (method, uri) {
            (Some(method), Some(uri)) if !method.is_empty() && !uri.is_empty() => {
                Some(EventKey::new(method, uri))
            }
            (None, None) => None,
            _ => {
                return Err(QueryError(
                    "requestMethod and requestUri must be provided together",
                ))
            }
        };

        let number = match number {
            Some(raw) => {
                if key.is_none() {
                    return Err(QueryError("eventNumber requires requestMethod and requestUri"));
                }
                match raw.parse::<i64>() {
                    Ok(0) | Err(_) => return Err(QueryError("eventNumber must be a non-zero integer")),
                    Ok(n) => Some(n),
                }
            }
            None => None,
        };

        if path.is_some() && number.is_none() {
            return Err(QueryError("eventPath requires eventNumber"));
        }

        Ok(Self {
            key,
            number,
            path: path.map(str::to_string),
        })
    }
}

fn resolve_index(len: usize, number: i64) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let index = if number > 0 { number - 1 } else { len + number };
    (0..len).contains(&index).then_some(index as usize)
}

fn key_json(key: &EventKey, events: &[Arc<Event>]) -> Value {
    json!({
        "method": key.method,
        "uri": key.uri,
        "requests": events.iter().map(|e| e.to_json()).collect::<Vec<_>>(),
    })
}

/// Per-key event histories.
pub struct EventStore {
    retention: RwLock<RetentionConfig>,
    keys: RwLock<BTreeMap<EventKey, Vec<Arc<Event>>>>,
}

impl EventStore {
    pub fn new(retention: RetentionConfig) -> Self {
        Self {
            retention: RwLock::new(retention),
            keys: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn retention(&self) -> RetentionConfig {
        *self.retention.read()
    }

    pub fn set_retention(&self, retention: RetentionConfig) {
        *self.retention.write() = retention;
    }

    /// Append an event, honouring the retention policy.
    pub fn record(&self, key: EventKey, event: Event) {
        let retention = self.retention();
        if !retention.store_events {
            return;
        }
        let mut keys = self.keys.write();
        let history = keys.entry(key).or_default();
        if !retention.store_events_key_history {
            history.clear();
        }
        history.push(Arc::new(event));
    }

    /// Drop the whole history of one key.
    pub fn purge(&self, key: &EventKey) -> bool {
        self.keys.write().remove(key).is_some()
    }

    pub fn event(&self, key: &EventKey, number: i64) -> Option<Arc<Event>> {
        let keys = self.keys.read();
        let history = keys.get(key)?;
        let index = resolve_index(history.len(), number)?;
        Some(Arc::clone(&history[index]))
    }

    pub fn history_len(&self, key: &EventKey) -> usize {
        self.keys.read().get(key).map_or(0, Vec::len)
    }

    pub fn total_events(&self) -> usize {
        self.keys.read().values().map(Vec::len).sum()
    }

    /// Run a query. `None` means nothing matched.
    pub fn query(&self, query: &EventQuery) -> Option<Value> {
        let Some(key) = &query.key else {
            let keys = self.keys.read();
            if keys.is_empty() {
                return None;
            }
            return Some(Value::Array(
                keys.iter().map(|(k, events)| key_json(k, events)).collect(),
            ));
        };

        match query.number {
            None => {
                let keys = self.keys.read();
                keys.get(key).map(|events| key_json(key, events))
            }
            Some(number) => {
                let document = self.event(key, number)?.to_json();
                match &query.path {
                    None => Some(document),
                    Some(path) => document.pointer(path).filter(|v| !v.is_null()).cloned(),
                }
            }
        }
    }

    /// Delete the selection, returning whether anything was removed.
    ///
    /// Removing single events keeps the key entry, even when its history
    /// becomes empty.
    pub fn delete(&self, query: &EventQuery) -> bool {
        let mut keys = self.keys.write();
        let Some(key) = &query.key else {
            let had_any = !keys.is_empty();
            keys.clear();
            return had_any;
        };

        match query.number {
            None => keys.remove(key).is_some(),
            Some(number) => {
                let Some(history) = keys.get_mut(key) else {
                    return false;
                };
                match resolve_index(history.len(), number) {
                    Some(index) => {
                        history.remove(index);
                        true
                    }
                    None => false,
                }
            }
        }
    }

    /// Key counts, limited to the first `max_keys` keys when given.
    pub fn summary(&self, max_keys: Option<usize>) -> Value {
        let keys = self.keys.read();
        let total_events: usize = keys.values().map(Vec::len).sum();
        let list: Vec<Value> = keys
            .iter()
            .take(max_keys.unwrap_or(usize::MAX))
            .map(|(key, events)| {
                json!({"method": key.method, "uri": key.uri, "amount": events.len()})
            })
            .collect();

        json!({
            "totalKeys": keys.len(),
            "totalEvents": total_events,
            "displayedKeys": {"amount": list.len(), "list": list},
        })
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(RetentionConfig::default())
    }
}
