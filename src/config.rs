use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error as ThisError;

use crate::codec::MAX_REQUEST_LEN;

pub const DEFAULT_PORT: u16 = 9;

/// Capacity reported to the transmitter whenever a connection becomes writable. A single send
/// never exceeds it.
pub const DEFAULT_SEND_WINDOW: usize = 64 * 1024;

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum Error {
    #[error("config error; at least one bind address is required")]
    EmptyBindList,
    #[error("config error; send window must be greater than zero")]
    ZeroSendWindow,
    #[error("config error; maximum request length must be greater than zero")]
    ZeroRequestLen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    /// Addresses to listen on, all sharing `port`.
    pub bind: Vec<IpAddr>,
    pub send_window: usize,
    pub max_request_len: usize,
}

impl Config {
    pub fn new(port: u16) -> Config {
        Config {
            port,
            ..Config::default()
        }
    }

    pub fn bind(mut self, bind: impl IntoIterator<Item = IpAddr>) -> Config {
        self.bind = bind.into_iter().collect();
        self
    }

    pub fn send_window(mut self, send_window: usize) -> Config {
        self.send_window = send_window;
        self
    }

    pub fn max_request_len(mut self, max_request_len: usize) -> Config {
        self.max_request_len = max_request_len;
        self
    }

    pub fn validate(self) -> Result<Config, Error> {
        if self.bind.is_empty() {
            return Err(Error::EmptyBindList);
        }
        if self.send_window == 0 {
            return Err(Error::ZeroSendWindow);
        }
        if self.max_request_len == 0 {
            return Err(Error::ZeroRequestLen);
        }

        Ok(self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: vec![
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            ],
            send_window: DEFAULT_SEND_WINDOW,
            max_request_len: MAX_REQUEST_LEN,
        }
    }
}
