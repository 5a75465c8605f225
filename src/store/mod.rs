//! Store boundary
//!
//! Everything the worker needs from the key-value store goes through
//! [`KeyspaceStore`]: reading and writing the notification config, subscribing to
//! expiration events, and type-inspecting a key.
//!
//! ## Implementations
//!
//! - `RedisStore`: RESP2 over TCP, for production
//! - `InMemoryStore`: deterministic double with fault injection, for tests

pub mod connection;
pub mod memory;
pub mod redis_store;

pub use connection::{ConnectOptions, RespConnection};
pub use memory::InMemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

use crate::resp::RespError;

/// Name of an expired key as delivered on the notification channel.
///
/// Keys are binary-safe, so the raw bytes are kept; `Display` is lossy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExpiredKey(Bytes);

impl ExpiredKey {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        ExpiredKey(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ExpiredKey {
    fn from(s: &str) -> Self {
        ExpiredKey(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for ExpiredKey {
    fn from(s: String) -> Self {
        ExpiredKey(Bytes::from(s.into_bytes()))
    }
}

impl fmt::Display for ExpiredKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Reply of `TYPE <key>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyType {
    /// The key does not exist (already evicted, or evicted by this very call).
    None,
    String,
    List,
    Set,
    ZSet,
    Hash,
    Stream,
    Other(String),
}

impl KeyType {
    pub fn parse(reply: &[u8]) -> Self {
        match reply {
            b"none" => KeyType::None,
            b"string" => KeyType::String,
            b"list" => KeyType::List,
            b"set" => KeyType::Set,
            b"zset" => KeyType::ZSet,
            b"hash" => KeyType::Hash,
            b"stream" => KeyType::Stream,
            other => KeyType::Other(String::from_utf8_lossy(other).into_owned()),
        }
    }

    pub fn exists(&self) -> bool {
        !matches!(self, KeyType::None)
    }
}

/// Server error prefixes that describe a temporary condition.
const TRANSIENT_SERVER_ERRORS: [&str; 4] = ["LOADING", "BUSY", "TRYAGAIN", "MASTERDOWN"];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store protocol error: {0}")]
    Protocol(String),
    /// Error reply sent by the server
    #[error("store replied with error: {0}")]
    Server(String),
    #[error("store connection closed")]
    Closed,
}

impl StoreError {
    /// Whether retrying the same command later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Io(_) | StoreError::Closed => true,
            StoreError::Server(msg) => TRANSIENT_SERVER_ERRORS
                .iter()
                .any(|prefix| msg.starts_with(prefix)),
            StoreError::Protocol(_) => false,
        }
    }

    /// Whether the connection that produced this error must be dropped.
    pub fn breaks_connection(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_) | StoreError::Closed | StoreError::Protocol(_)
        )
    }
}

impl From<RespError> for StoreError {
    fn from(e: RespError) -> Self {
        match e {
            RespError::Io(e) => StoreError::Io(e),
            RespError::Protocol(msg) => StoreError::Protocol(msg),
        }
    }
}

/// Channel carrying one message per expired key in database `db`.
pub fn expired_channel(db: u32) -> String {
    format!("__keyevent@{}__:expired", db)
}

/// Live subscription to expiration events.
#[async_trait]
pub trait ExpirySubscription: Send {
    /// Next expired key, or `None` once the channel has closed.
    async fn next_expired(&mut self) -> Result<Option<ExpiredKey>, StoreError>;
}

/// Operations the worker issues against the store.
#[async_trait]
pub trait KeyspaceStore: Send + Sync + 'static {
    /// Value of a config parameter (`CONFIG GET`).
    async fn config_get(&self, parameter: &str) -> Result<String, StoreError>;

    /// Overwrite a config parameter (`CONFIG SET`).
    async fn config_set(&self, parameter: &str, value: &str) -> Result<(), StoreError>;

    /// Type-inspect a key (`TYPE`). Makes the store evaluate the key's expiry.
    async fn key_type(&self, key: &ExpiredKey) -> Result<KeyType, StoreError>;

    /// Subscribe to expiration events of database `db`.
    ///
    /// Returns only once the store has confirmed the subscription.
    async fn subscribe_expired(&self, db: u32)
        -> Result<Box<dyn ExpirySubscription>, StoreError>;
}
