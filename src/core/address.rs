/// Backend server address list parsing
///
/// Accepted entry forms:
///   siridb01.local            host, default port
///   10.20.30.40:9001          host and port
///   2001:db8::1               bare IPv6, default port
///   [::1]                     bracketed IPv6, default port
///   [::1]:5050                bracketed IPv6 and port
use std::fmt;
use std::num::ParseIntError;

use crate::error::GatewayError;

/// Port used when an entry does not carry one
pub const DEFAULT_PORT: u16 = 9000;

/// One backend server; the order of a resolved list is the failover priority
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Host in the form a socket connect accepts (IPv6 brackets removed)
    pub fn connect_host(&self) -> &str {
        self.host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(&self.host)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // A bare IPv6 host cannot carry a port without brackets; it only ever
        // resolves with the default port, so the host alone round-trips.
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "{}", self.host)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Address list parse errors
#[derive(Debug, thiserror::Error)]
pub enum AddressParseError {
    #[error("invalid port in server address '{entry}': {source}")]
    InvalidPort {
        entry: String,
        #[source]
        source: ParseIntError,
    },

    #[error("empty host in server address '{entry}'")]
    EmptyHost { entry: String },
}

impl From<AddressParseError> for GatewayError {
    fn from(err: AddressParseError) -> Self {
        GatewayError::Parse(err.to_string())
    }
}

/// Resolve a comma separated server list. Fails on the first malformed entry.
pub fn resolve(address_list: &str) -> Result<Vec<ServerAddress>, AddressParseError> {
    address_list
        .split(',')
        .map(|entry| parse_entry(entry.trim()))
        .collect()
}

/// Render a list back into the comma separated form `resolve` accepts
pub fn join(addresses: &[ServerAddress]) -> String {
    addresses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_entry(entry: &str) -> Result<ServerAddress, AddressParseError> {
    let parts: Vec<&str> = entry.split(':').collect();

    let (host, port) = match parts.len() {
        1 => (entry.to_string(), DEFAULT_PORT),
        2 => (parts[0].to_string(), parse_port(entry, parts[1])?),
        _ if !entry.starts_with('[') => (entry.to_string(), DEFAULT_PORT),
        _ if entry.ends_with(']') => (entry.to_string(), DEFAULT_PORT),
        n => {
            let port = parse_port(entry, parts[n - 1])?;
            (parts[..n - 1].join(":"), port)
        }
    };

    if host.is_empty() || host == "[]" {
        return Err(AddressParseError::EmptyHost {
            entry: entry.to_string(),
        });
    }

    Ok(ServerAddress { host, port })
}

fn parse_port(entry: &str, port: &str) -> Result<u16, AddressParseError> {
    port.parse::<u16>()
        .map_err(|source| AddressParseError::InvalidPort {
            entry: entry.to_string(),
            source,
        })
}
