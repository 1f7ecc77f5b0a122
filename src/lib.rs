pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod manager;
pub mod server;
pub mod session;
pub mod store;
pub mod transmit;
pub mod transport;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
