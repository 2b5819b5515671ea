//! TCP server for provider requests and bulk buffer access.

use crate::error::{NetworkError, Result};
use crate::network::rpc::{read_message, write_message, Message};
use crate::types::Endpoint;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Handler for incoming messages.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle an incoming message and optionally return a response.
    async fn handle(&self, msg: Message) -> Option<Message>;
}

/// TCP accept loop dispatching framed messages to a [`MessageHandler`].
pub struct NetworkServer {
    /// Bound listener.
    listener: TcpListener,

    /// Address actually bound.
    local_addr: SocketAddr,

    /// Message handler.
    handler: Arc<dyn MessageHandler>,

    /// Frame size limit.
    max_message_size: usize,

    /// Shutdown signal receiver.
    shutdown_rx: mpsc::Receiver<()>,
}

impl NetworkServer {
    /// Bind a new network server.
    ///
    /// Binding happens immediately so the caller learns the real port before
    /// [`NetworkServer::run`] is spawned.
    pub async fn bind(
        bind_addr: SocketAddr,
        handler: Arc<dyn MessageHandler>,
        max_message_size: usize,
    ) -> Result<(Self, mpsc::Sender<()>)> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: bind_addr.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(NetworkError::Io)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            listener,
            local_addr,
            handler,
            max_message_size,
            shutdown_rx,
        };

        Ok((server, shutdown_tx))
    }

    /// Endpoint the server is reachable at.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.local_addr)
    }

    /// Run the server until a shutdown signal arrives.
    pub async fn run(mut self) -> Result<()> {
        info!(addr = %self.local_addr, "Network server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            let max = self.max_message_size;
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler, max).await {
                                    debug!(error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!(addr = %self.local_addr, "Network server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        handler: Arc<dyn MessageHandler>,
        max_message_size: usize,
    ) -> Result<()> {
        let _ = stream.set_nodelay(true);
        while let Some(msg) = read_message(&mut stream, max_message_size).await? {
            if let Some(response) = handler.handle(msg).await {
                write_message(&mut stream, &response).await?;
            }
        }
        Ok(())
    }
}
