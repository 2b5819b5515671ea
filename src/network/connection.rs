//! Pooled request/response connections to one remote endpoint.

use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{read_message, write_message, Message};
use crate::types::Endpoint;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Idle TCP connections to one endpoint, reused across calls.
///
/// Each call checks a connection out for one request/response exchange, so
/// concurrent callers never interleave frames on the same socket.
#[derive(Debug)]
pub struct ConnectionPool {
    endpoint: Endpoint,
    idle: Mutex<Vec<TcpStream>>,
    max_idle: usize,
    connect_timeout: Duration,
    rpc_timeout: Duration,
    max_message_size: usize,
}

impl ConnectionPool {
    /// Create an empty pool. No connection is opened until the first call.
    pub fn new(
        endpoint: Endpoint,
        max_idle: usize,
        connect_timeout: Duration,
        rpc_timeout: Duration,
        max_message_size: usize,
    ) -> Self {
        Self {
            endpoint,
            idle: Mutex::new(Vec::new()),
            max_idle,
            connect_timeout,
            rpc_timeout,
            max_message_size,
        }
    }

    /// Remote endpoint of this pool.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Number of idle connections held.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = self.endpoint.addr();
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: "connect timed out".to_string(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);
        debug!(endpoint = %self.endpoint, "Opened connection");
        Ok(stream)
    }

    async fn checkout(&self) -> Result<TcpStream> {
        let cached = self.idle.lock().pop();
        match cached {
            Some(stream) => Ok(stream),
            None => self.connect().await,
        }
    }

    fn checkin(&self, stream: TcpStream) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(stream);
        }
    }

    /// Send one message and wait for its response.
    pub async fn call(&self, msg: &Message) -> Result<Message> {
        self.call_with_timeout(msg, self.rpc_timeout).await
    }

    /// Like [`call`](Self::call) with a timeout other than the pool's default.
    pub async fn call_with_timeout(&self, msg: &Message, timeout: Duration) -> Result<Message> {
        let mut stream = self.checkout().await?;

        let exchange = async {
            write_message(&mut stream, msg).await?;
            read_message(&mut stream, self.max_message_size)
                .await?
                .ok_or(Error::Network(NetworkError::ConnectionClosed))
        };

        let outcome = tokio::time::timeout(timeout, exchange).await;
        match outcome {
            Ok(Ok(response)) => {
                self.checkin(stream);
                Ok(response)
            }
            // A failed or abandoned exchange leaves the stream in an unknown
            // framing state, so it is dropped.
            Ok(Err(e)) => Err(e),
            Err(_) => {
                trace!(endpoint = %self.endpoint, "Request timed out");
                Err(Error::Timeout)
            }
        }
    }

    /// Drop all idle connections.
    pub fn clear(&self) {
        self.idle.lock().clear();
    }
}
