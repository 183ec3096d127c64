//! Core types and cluster-wide constants.

use std::fmt;
use std::str::FromStr;

/// Maximum key size in bytes.
pub const MAX_KEY_BYTES: usize = 20;

/// Maximum value size in bytes.
pub const MAX_VALUE_BYTES: usize = 1000;

/// Number of virtual tokens each physical node contributes to the ring.
/// More tokens = more even key distribution at the cost of table size.
pub const VIRTUAL_TOKENS_PER_NODE: usize = 128;

/// Default manager listen port.
pub const DEFAULT_MANAGER_PORT: u16 = 5000;

/// Largest frame payload a peer will accept.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// A TCP endpoint advertised by a cluster process.
///
/// Stable for the lifetime of the owning process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress {
    /// Host name or IP literal.
    pub host: String,

    /// TCP port.
    pub port: u16,
}

impl NodeAddress {
    /// Create a new address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid address (want host:port): {s}"))?;
        if host.is_empty() {
            return Err(format!("invalid address (empty host): {s}"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port in address: {s}"))?;
        Ok(Self::new(host, port))
    }
}

/// Bytes that cannot appear in keys because the wire encoding uses them
/// as separators.
pub const KEY_FORBIDDEN_BYTES: &[u8] = b",;|#";

/// Bytes that cannot appear in values.
pub const VALUE_FORBIDDEN_BYTES: &[u8] = b";|";

/// Check a key against the size and separator rules.
pub fn key_valid(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_BYTES
        && !key.bytes().any(|b| KEY_FORBIDDEN_BYTES.contains(&b))
}

/// Check a value against the size and separator rules.
pub fn value_valid(value: &str) -> bool {
    value.len() <= MAX_VALUE_BYTES && !value.bytes().any(|b| VALUE_FORBIDDEN_BYTES.contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display_and_parse() {
        let addr = NodeAddress::new("127.0.0.1", 6001);
        assert_eq!(addr.to_string(), "127.0.0.1:6001");
        assert_eq!("127.0.0.1:6001".parse::<NodeAddress>().unwrap(), addr);
        assert!("no-port".parse::<NodeAddress>().is_err());
        assert!(":6001".parse::<NodeAddress>().is_err());
        assert!("h:notaport".parse::<NodeAddress>().is_err());
    }

    #[test]
    fn key_bounds() {
        assert!(!key_valid(""));
        assert!(key_valid(&"k".repeat(MAX_KEY_BYTES)));
        assert!(!key_valid(&"k".repeat(MAX_KEY_BYTES + 1)));
        assert!(!key_valid("a|b"));
        assert!(!key_valid("a;b"));
        assert!(!key_valid("a,b"));
    }

    #[test]
    fn value_bounds() {
        assert!(value_valid(""));
        assert!(value_valid(&"v".repeat(MAX_VALUE_BYTES)));
        assert!(!value_valid(&"v".repeat(MAX_VALUE_BYTES + 1)));
        assert!(!value_valid("a;b"));
        assert!(value_valid("a,b"));
    }
}
