//! Addressing types.
//!
//! A storage node is identified by host and port. The host is kept as a
//! string (nodes are usually registered under DNS names); resolution happens
//! at connect time inside the network provider.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of a storage node: host + port.
///
/// Used as the equality key for per-server connection pools.
///
/// # Examples
///
/// ```
/// use tidepool_core::ServerAddress;
///
/// let addr = ServerAddress::new("store-3.local", 3181);
/// assert_eq!(addr.to_string(), "store-3.local:3181");
///
/// let parsed = ServerAddress::parse("127.0.0.1:3181").expect("parse");
/// assert_eq!(parsed.port, 3181);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    /// Hostname or IP address literal.
    pub host: String,
    /// Port number.
    pub port: u16,
}

impl ServerAddress {
    /// Create a new server address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse from string "host:port" format.
    ///
    /// # Errors
    ///
    /// Returns an error if the port separator is missing or the port does
    /// not parse.
    pub fn parse(s: &str) -> Result<Self, AddressParseError> {
        let (host, port_str) = s.rsplit_once(':').ok_or(AddressParseError::MissingPort)?;
        if host.is_empty() {
            return Err(AddressParseError::EmptyHost);
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| AddressParseError::InvalidPort)?;
        Ok(Self::new(host, port))
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error parsing a server address from string.
#[derive(Debug, Clone, Error)]
pub enum AddressParseError {
    /// No port separator (`:`) found in the input.
    #[error("missing port separator")]
    MissingPort,
    /// The port number could not be parsed.
    #[error("invalid port number")]
    InvalidPort,
    /// The host part is empty.
    #[error("empty host")]
    EmptyHost,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_roundtrip() {
        let addr = ServerAddress::new("10.0.0.7", 3181);
        let parsed = ServerAddress::parse(&addr.to_string()).expect("parse");
        assert_eq!(addr, parsed);
    }

    #[test]
    fn test_parse_hostname() {
        let addr = ServerAddress::parse("store-1.example.org:4000").expect("parse");
        assert_eq!(addr.host, "store-1.example.org");
        assert_eq!(addr.port, 4000);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ServerAddress::parse("no-port"),
            Err(AddressParseError::MissingPort)
        ));
        assert!(matches!(
            ServerAddress::parse("host:not-a-port"),
            Err(AddressParseError::InvalidPort)
        ));
        assert!(matches!(
            ServerAddress::parse(":3181"),
            Err(AddressParseError::EmptyHost)
        ));
    }

    #[test]
    fn test_equality_is_pool_key() {
        let a = ServerAddress::new("store-1", 3181);
        let b = ServerAddress::new("store-1", 3181);
        let c = ServerAddress::new("store-1", 3182);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
