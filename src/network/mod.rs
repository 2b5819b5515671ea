//! Network communication layer.

pub mod connection;
pub mod rpc;
pub mod server;

pub use connection::ConnectionPool;
pub use rpc::{Message, Operation, Payload, ProviderRequest, ProviderResponse, ReadSink, Reply};
pub use server::{MessageHandler, NetworkServer};
