pub mod balancer;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod protocol;
pub mod server;

pub use balancer::{Balancer, BalancerEvent, ConnectionError, ConnectionId, IdPolicy};
pub use cli::{Command, prompt};
pub use client::{Client, ClientError};
pub use config::{BalancerKind, ServerConfig};
pub use connection::Connection;
pub use server::{Handler, Server, ServerError, ServerEvent, ServerHandle, ServerState};
