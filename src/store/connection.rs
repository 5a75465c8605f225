//! Single RESP connection to the store.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use super::StoreError;
use crate::resp::{RespCodec, RespValue};

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// `host:port`
    pub addr: String,
    /// Sent with `AUTH` when set.
    pub password: Option<String>,
    /// Selected with `SELECT` when non-zero.
    pub db: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            addr: "localhost:6379".to_string(),
            password: None,
            db: 0,
        }
    }
}

pub struct RespConnection {
    framed: Framed<TcpStream, RespCodec>,
    addr: String,
}

impl RespConnection {
    /// Connect and authenticate. Does not select a database.
    pub async fn connect(options: &ConnectOptions) -> Result<Self, StoreError> {
        let stream = TcpStream::connect(&options.addr).await?;
        let _ = stream.set_nodelay(true);

        let mut conn = RespConnection {
            framed: Framed::new(stream, RespCodec),
            addr: options.addr.clone(),
        };

        if let Some(password) = options.password.as_deref() {
            let reply = conn.request(&[b"AUTH".as_slice(), password.as_bytes()]).await?;
            expect_ok("AUTH", &reply)?;
        }

        debug!("Connected to store at {}", conn.addr);
        Ok(conn)
    }

    /// Connect, authenticate, and select `options.db`.
    pub async fn open(options: &ConnectOptions) -> Result<Self, StoreError> {
        let mut conn = Self::connect(options).await?;
        if options.db != 0 {
            let db = options.db.to_string();
            let reply = conn.request(&[b"SELECT".as_slice(), db.as_bytes()]).await?;
            expect_ok("SELECT", &reply)?;
        }
        Ok(conn)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn send<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<(), StoreError> {
        self.framed.send(RespValue::command(args)).await?;
        Ok(())
    }

    /// Next frame from the server. Error replies are returned as frames.
    pub async fn receive(&mut self) -> Result<RespValue, StoreError> {
        match self.framed.next().await {
            Some(frame) => Ok(frame?),
            None => Err(StoreError::Closed),
        }
    }

    /// Send a command and wait for its reply; an error reply becomes `StoreError::Server`.
    pub async fn request<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<RespValue, StoreError> {
        self.send(args).await?;
        match self.receive().await? {
            RespValue::Error(msg) => Err(StoreError::Server(
                String::from_utf8_lossy(&msg).into_owned(),
            )),
            reply => Ok(reply),
        }
    }
}

pub(crate) fn expect_ok(command: &str, reply: &RespValue) -> Result<(), StoreError> {
    if reply.is_ok() {
        Ok(())
    } else {
        Err(StoreError::Protocol(format!(
            "unexpected {} reply: {:?}",
            command, reply
        )))
    }
}
