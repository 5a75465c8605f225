//! `KeyspaceStore` over a real Redis-compatible server.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::connection::{expect_ok, ConnectOptions, RespConnection};
use super::{expired_channel, ExpiredKey, ExpirySubscription, KeyType, KeyspaceStore, StoreError};
use crate::resp::RespValue;

/// Command connection shared by all callers; commands are serialized.
///
/// The connection is opened lazily and dropped after any error that leaves it
/// in an unknown state, so the next command reconnects.
pub struct RedisStore {
    options: ConnectOptions,
    conn: Mutex<Option<RespConnection>>,
}

impl RedisStore {
    pub fn new(options: ConnectOptions) -> Self {
        RedisStore {
            options,
            conn: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    async fn execute<A: AsRef<[u8]> + Sync>(&self, args: &[A]) -> Result<RespValue, StoreError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(RespConnection::open(&self.options).await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::Closed);
        };

        match conn.request(args).await {
            Err(e) if e.breaks_connection() => {
                warn!("Dropping store connection to {}: {}", self.options.addr, e);
                *guard = None;
                Err(e)
            }
            result => result,
        }
    }
}

#[async_trait]
impl KeyspaceStore for RedisStore {
    async fn config_get(&self, parameter: &str) -> Result<String, StoreError> {
        let reply = self
            .execute(&[b"CONFIG".as_slice(), b"GET", parameter.as_bytes()])
            .await?;

        // RESP2 reply is a flat [name, value] array
        let value = reply
            .as_array()
            .and_then(|items| items.get(1))
            .and_then(RespValue::as_bytes)
            .ok_or_else(|| {
                StoreError::Protocol(format!("CONFIG GET {} returned no value", parameter))
            })?;
        Ok(String::from_utf8_lossy(value).into_owned())
    }

    async fn config_set(&self, parameter: &str, value: &str) -> Result<(), StoreError> {
        let reply = self
            .execute(&[
                b"CONFIG".as_slice(),
                b"SET",
                parameter.as_bytes(),
                value.as_bytes(),
            ])
            .await?;
        expect_ok("CONFIG SET", &reply)
    }

    async fn key_type(&self, key: &ExpiredKey) -> Result<KeyType, StoreError> {
        let reply = self.execute(&[b"TYPE".as_slice(), key.as_bytes()]).await?;
        match reply {
            RespValue::SimpleString(kind) => Ok(KeyType::parse(&kind)),
            other => Err(StoreError::Protocol(format!(
                "unexpected TYPE reply: {:?}",
                other
            ))),
        }
    }

    async fn subscribe_expired(
        &self,
        db: u32,
    ) -> Result<Box<dyn ExpirySubscription>, StoreError> {
        let channel = expired_channel(db);
        let mut conn = RespConnection::connect(&self.options).await?;
        conn.send(&[b"PSUBSCRIBE".as_slice(), channel.as_bytes()]).await?;

        // Confirmation: ["psubscribe", pattern, subscription count]
        let reply = conn.receive().await?;
        let confirmed = match reply.as_array() {
            Some([kind, pattern, RespValue::Integer(count)]) => {
                kind.as_bytes().is_some_and(|k| &k[..] == b"psubscribe")
                    && pattern.as_bytes().is_some_and(|p| &p[..] == channel.as_bytes())
                    && *count >= 1
            }
            _ => false,
        };
        if !confirmed {
            return Err(match reply {
                RespValue::Error(msg) => {
                    StoreError::Server(String::from_utf8_lossy(&msg).into_owned())
                }
                other => StoreError::Protocol(format!(
                    "PSUBSCRIBE {} not confirmed: {:?}",
                    channel, other
                )),
            });
        }

        info!("Subscribed to {} on {}", channel, conn.addr());
        Ok(Box::new(RedisExpirySubscription { conn, channel }))
    }
}

/// Connection in subscribed mode; only push messages arrive on it.
pub struct RedisExpirySubscription {
    conn: RespConnection,
    channel: String,
}

impl RedisExpirySubscription {
    /// Key name of a `pmessage` push for our channel; `None` for anything else.
    fn expired_key(&self, message: &RespValue) -> Option<ExpiredKey> {
        match message.as_array()? {
            [kind, _pattern, channel, payload] => {
                if &kind.as_bytes()?[..] != b"pmessage"
                    || &channel.as_bytes()?[..] != self.channel.as_bytes()
                {
                    return None;
                }
                payload.as_bytes().map(|key| ExpiredKey::new(key.clone()))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl ExpirySubscription for RedisExpirySubscription {
    async fn next_expired(&mut self) -> Result<Option<ExpiredKey>, StoreError> {
        loop {
            let message = match self.conn.receive().await {
                Ok(message) => message,
                Err(StoreError::Closed) => return Ok(None),
                Err(e) => return Err(e),
            };

            if let RespValue::Error(msg) = &message {
                return Err(StoreError::Server(String::from_utf8_lossy(msg).into_owned()));
            }

            match self.expired_key(&message) {
                Some(key) => return Ok(Some(key)),
                None => debug!("Ignoring message on subscription: {:?}", message),
            }
        }
    }
}
