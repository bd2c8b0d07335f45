//! `unix://` and `tcp://` socket addresses.

use crate::error::{Error, Result};

use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Unix,
    Tcp,
}

/// A parsed endpoint: transport, host and port.
///
/// For Unix sockets the host is the socket path and the port is 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketAddress {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl SocketAddress {
    /// Parses `unix://<path>` or `tcp://<host>:<port>`. The scheme is case-insensitive.
    ///
    /// # Example
    /// ```ignore
    /// let address = SocketAddress::parse("tcp://127.0.0.1:9000")?;
    /// assert_eq!(address.port(), 9000);
    /// ```
    pub fn parse(address: &str) -> Result<Self> {
        let invalid = || Error::InvalidAddress(address.to_string());

        let (scheme, rest) = address.split_once("://").ok_or_else(invalid)?;
        match scheme.to_ascii_lowercase().as_str() {
            "unix" => {
                if rest.is_empty() {
                    return Err(invalid());
                }
                Ok(Self::unix(rest))
            }
            "tcp" => {
                let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return Err(invalid());
                }
                let port = port.parse().map_err(|_| invalid())?;
                Ok(Self::tcp(host, port))
            }
            _ => Err(invalid()),
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            scheme: Scheme::Unix,
            host: path.into().to_string_lossy().into_owned(),
            port: 0,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: Scheme::Tcp,
            host: host.into(),
            port,
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Unix => write!(f, "unix://{}", self.host),
            Scheme::Tcp if self.host.contains(':') => write!(f, "tcp://[{}]:{}", self.host, self.port),
            Scheme::Tcp => write!(f, "tcp://{}:{}", self.host, self.port),
        }
    }
}
