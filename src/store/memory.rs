//! In-memory store for unit tests and pipeline tests.
//!
//! Records every call so tests can assert on ordering and timing, and can be
//! told to fail upcoming calls to exercise the error paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use super::{ExpiredKey, ExpirySubscription, KeyType, KeyspaceStore, StoreError};

/// One recorded `TYPE` call.
#[derive(Debug, Clone)]
pub struct TypeCall {
    pub key: ExpiredKey,
    pub at: Instant,
}

#[derive(Default)]
struct InMemoryState {
    config: HashMap<String, String>,
    live_keys: HashMap<ExpiredKey, KeyType>,
    config_sets: Vec<(String, String)>,
    type_calls: Vec<TypeCall>,
    subscribers: Vec<(u32, mpsc::UnboundedSender<ExpiredKey>)>,
    /// Upcoming `TYPE` calls that fail with a connection reset
    transient_type_failures: u32,
    /// Every `TYPE` call fails with a non-retryable server error
    reject_type: bool,
    fail_config_get: bool,
    fail_subscribe: bool,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(parameter: &str, value: &str) -> Self {
        let store = Self::new();
        store.set_config(parameter, value);
        store
    }

    pub fn set_config(&self, parameter: &str, value: &str) {
        self.state
            .lock()
            .config
            .insert(parameter.to_string(), value.to_string());
    }

    pub fn config_value(&self, parameter: &str) -> Option<String> {
        self.state.lock().config.get(parameter).cloned()
    }

    /// Mark a key as existing so `TYPE` reports `kind` instead of `none`.
    pub fn insert_key(&self, key: impl Into<ExpiredKey>, kind: KeyType) {
        self.state.lock().live_keys.insert(key.into(), kind);
    }

    /// `CONFIG SET` calls in order.
    pub fn config_sets(&self) -> Vec<(String, String)> {
        self.state.lock().config_sets.clone()
    }

    /// `TYPE` calls in order.
    pub fn type_calls(&self) -> Vec<TypeCall> {
        self.state.lock().type_calls.clone()
    }

    pub fn inspected_keys(&self) -> Vec<String> {
        self.state
            .lock()
            .type_calls
            .iter()
            .map(|call| call.key.to_string())
            .collect()
    }

    pub fn fail_next_type_calls(&self, count: u32) {
        self.state.lock().transient_type_failures = count;
    }

    pub fn reject_type_calls(&self, reject: bool) {
        self.state.lock().reject_type = reject;
    }

    pub fn fail_config_get(&self, fail: bool) {
        self.state.lock().fail_config_get = fail;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.state.lock().fail_subscribe = fail;
    }

    /// Deliver an expiration event to every subscriber of `db`.
    pub fn publish_expired(&self, db: u32, key: impl Into<ExpiredKey>) -> usize {
        let key = key.into();
        let mut state = self.state.lock();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        state
            .subscribers
            .iter()
            .filter(|(sub_db, _)| *sub_db == db)
            .filter(|(_, tx)| tx.send(key.clone()).is_ok())
            .count()
    }

    /// End every subscription; subscribers see the channel close.
    pub fn close_subscriptions(&self) {
        self.state.lock().subscribers.clear();
    }
}

#[async_trait]
impl KeyspaceStore for InMemoryStore {
    async fn config_get(&self, parameter: &str) -> Result<String, StoreError> {
        let state = self.state.lock();
        if state.fail_config_get {
            return Err(StoreError::Io(IoError::new(
                ErrorKind::ConnectionRefused,
                "config read refused",
            )));
        }
        Ok(state.config.get(parameter).cloned().unwrap_or_default())
    }

    async fn config_set(&self, parameter: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state
            .config_sets
            .push((parameter.to_string(), value.to_string()));
        state
            .config
            .insert(parameter.to_string(), value.to_string());
        Ok(())
    }

    async fn key_type(&self, key: &ExpiredKey) -> Result<KeyType, StoreError> {
        let mut state = self.state.lock();
        state.type_calls.push(TypeCall {
            key: key.clone(),
            at: Instant::now(),
        });

        if state.reject_type {
            return Err(StoreError::Server(
                "NOPERM this user has no permissions to run the 'type' command".to_string(),
            ));
        }
        if state.transient_type_failures > 0 {
            state.transient_type_failures -= 1;
            return Err(StoreError::Io(IoError::new(
                ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }

        // Keys not marked live are reported as already evicted
        Ok(state.live_keys.get(key).cloned().unwrap_or(KeyType::None))
    }

    async fn subscribe_expired(
        &self,
        db: u32,
    ) -> Result<Box<dyn ExpirySubscription>, StoreError> {
        let mut state = self.state.lock();
        if state.fail_subscribe {
            return Err(StoreError::Protocol(format!(
                "PSUBSCRIBE __keyevent@{}__:expired not confirmed",
                db
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push((db, tx));
        Ok(Box::new(InMemorySubscription { rx }))
    }
}

pub struct InMemorySubscription {
    rx: mpsc::UnboundedReceiver<ExpiredKey>,
}

#[async_trait]
impl ExpirySubscription for InMemorySubscription {
    async fn next_expired(&mut self) -> Result<Option<ExpiredKey>, StoreError> {
        Ok(self.rx.recv().await)
    }
}
