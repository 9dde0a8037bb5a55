//! Per-key state machine.
//!
//! Each key starts in [`INITIAL_STATE`]. Provisions are eligible only when
//! their `inState` equals the key's current state, and the key moves to the
//! provision's `outState` after serving. Two labels are reserved and turned
//! into explicit [`Transition`]s: [`PURGE_STATE`] and [`DELETED_STATE`].

use crate::events::EventKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

pub const INITIAL_STATE: &str = "initial";
pub const PURGE_STATE: &str = "purge";
pub const DELETED_STATE: &str = "deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    /// Virtually deleted: every later request for the key answers 404.
    Deleted,
}

#[derive(Debug, Clone)]
struct KeyState {
    current: String,
    lifecycle: Lifecycle,
    recvseq: u64,
}

impl Default for KeyState {
    fn default() -> Self {
        Self {
            current: INITIAL_STATE.to_string(),
            lifecycle: Lifecycle::Active,
            recvseq: 0,
        }
    }
}

/// What a key's state was when a request was admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub state: String,
    pub lifecycle: Lifecycle,
    pub recvseq: u64,
}

/// Outcome of a provision's `outState`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Move(String),
    /// Purge on termination: drop the key's history and restart it.
    Purge,
    Delete,
}

impl Transition {
    /// Interpret a state label. `purge` is only honoured when purging is enabled;
    /// otherwise it is an ordinary label.
    pub fn from_label(label: &str, purge_enabled: bool) -> Self {
        match label {
            "" => Self::Move(INITIAL_STATE.to_string()),
            PURGE_STATE if purge_enabled => Self::Purge,
            DELETED_STATE => Self::Delete,
            other => Self::Move(other.to_string()),
        }
    }
}

/// Exclusive hold on one key, released on drop.
pub type KeyGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct StateTable {
    keys: Mutex<HashMap<EventKey, KeyState>>,
    /// One gate per key, kept across resets so waiters always share it.
    gates: Mutex<HashMap<EventKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl StateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `key`. Requests for the same key are served
    /// in arrival order; other keys are not blocked.
    pub async fn lock(&self, key: &EventKey) -> KeyGuard {
        let gate = Arc::clone(self.gates.lock().entry(key.clone()).or_default());
        gate.lock_owned().await
    }

    /// Register a request for `key`: bumps its `recvseq` and reports its state.
    pub fn admit(&self, key: &EventKey) -> Admission {
        let mut keys = self.keys.lock();
        let entry = keys.entry(key.clone()).or_default();
        entry.recvseq += 1;
        Admission {
            state: entry.current.clone(),
            lifecycle: entry.lifecycle,
            recvseq: entry.recvseq,
        }
    }

    pub fn current(&self, key: &EventKey) -> String {
        self.keys
            .lock()
            .get(key)
            .map_or_else(|| INITIAL_STATE.to_string(), |s| s.current.clone())
    }

    pub fn lifecycle(&self, key: &EventKey) -> Lifecycle {
        self.keys
            .lock()
            .get(key)
            .map_or(Lifecycle::Active, |s| s.lifecycle)
    }

    /// Apply a transition and return the resulting state label.
    pub fn apply(&self, key: &EventKey, transition: &Transition) -> String {
        let mut keys = self.keys.lock();
        let entry = keys.entry(key.clone()).or_default();
        match transition {
            Transition::Move(state) => entry.current = state.clone(),
            Transition::Purge => {
                entry.current = INITIAL_STATE.to_string();
                entry.lifecycle = Lifecycle::Active;
            }
            Transition::Delete => {
                entry.current = DELETED_STATE.to_string();
                entry.lifecycle = Lifecycle::Deleted;
            }
        }
        entry.current.clone()
    }

    /// Back to `initial` and active. `recvseq` keeps counting.
    pub fn reset(&self, key: &EventKey) -> bool {
        match self.keys.lock().get_mut(key) {
            Some(entry) => {
                entry.current = INITIAL_STATE.to_string();
                entry.lifecycle = Lifecycle::Active;
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for entry in self.keys.lock().values_mut() {
            entry.current = INITIAL_STATE.to_string();
            entry.lifecycle = Lifecycle::Active;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(uri: &str) -> EventKey {
        EventKey::new("GET", uri)
    }

    #[test]
    fn test_new_key_is_initial() {
        let table = StateTable::new();
        let admission = table.admit(&key("/a"));

        assert_eq!(admission.state, INITIAL_STATE);
        assert_eq!(admission.lifecycle, Lifecycle::Active);
        assert_eq!(admission.recvseq, 1);
    }

    #[test]
    fn test_recvseq_is_per_key() {
        let table = StateTable::new();
        let a: Vec<u64> = (0..3)
            .map(|_| {
                table.admit(&key("/b"));
                table.admit(&key("/a")).recvseq
            })
            .collect();

        assert_eq!(a, vec![1, 2, 3]);
        assert_eq!(table.admit(&key("/b")).recvseq, 4);
    }

    #[test]
    fn test_transitions() {
        let table = StateTable::new();
        let k = key("/a");

        assert_eq!(table.apply(&k, &Transition::Move("another".into())), "another");
        assert_eq!(table.current(&k), "another");

        table.apply(&k, &Transition::Delete);
        assert_eq!(table.lifecycle(&k), Lifecycle::Deleted);

        table.apply(&k, &Transition::Purge);
        assert_eq!(table.current(&k), INITIAL_STATE);
        assert_eq!(table.lifecycle(&k), Lifecycle::Active);
    }

    #[test]
    fn test_reset_keeps_recvseq() {
        let table = StateTable::new();
        let k = key("/a");
        table.admit(&k);
        table.apply(&k, &Transition::Delete);

        assert!(table.reset(&k));
        let admission = table.admit(&k);
        assert_eq!(admission.state, INITIAL_STATE);
        assert_eq!(admission.recvseq, 2);
        assert!(!table.reset(&key("/missing")));
    }

    #[tokio::test]
    async fn test_key_lock_is_per_key() {
        let table = StateTable::new();
        let held = table.lock(&key("/a")).await;

        // Another key is free while /a is held.
        let _other = table.lock(&key("/b")).await;
        assert!(tokio::time::timeout(Duration::from_millis(20), table.lock(&key("/a")))
            .await
            .is_err());

        drop(held);
        assert!(tokio::time::timeout(Duration::from_millis(20), table.lock(&key("/a")))
            .await
            .is_ok());
    }

    #[test]
    fn test_transition_labels() {
        assert_eq!(
            Transition::from_label("", true),
            Transition::Move(INITIAL_STATE.into())
        );
        assert_eq!(Transition::from_label("purge", true), Transition::Purge);
        assert_eq!(
            Transition::from_label("purge", false),
            Transition::Move("purge".into())
        );
        assert_eq!(Transition::from_label("deleted", false), Transition::Delete);
    }
}
