//! Text payload codecs.
//!
//! The protocol carries small text payloads: `key|value` pairs joined by
//! `;`, key lists joined by `;` (or `,` for ALL_KEYS), and the routing
//! table as `<K>#<id>,<host>,<port>,<token>;…`. Keys and values are
//! validated against the separator rules before they ever reach a codec,
//! so these functions only have to split and join.

use crate::error::{NetworkError, Result};
use crate::routing::{RingEntry, RoutingTable};
use crate::types::NodeAddress;
use std::fmt;

/// Separator between pairs or keys in request payloads.
const LIST_SEP: char = ';';

/// Separator between key and value inside a pair.
const PAIR_SEP: char = '|';

/// Separator between keys in an ALL_KEYS payload.
const KEYS_SEP: char = ',';

/// Encode `key|value` pairs joined by `;`.
pub fn encode_pairs<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}{PAIR_SEP}{v}"))
        .collect::<Vec<_>>()
        .join(&LIST_SEP.to_string())
}

/// Parse a PUT payload into `(key, value)` pairs.
pub fn parse_pairs(payload: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for part in payload.split(LIST_SEP) {
        if part.is_empty() {
            continue;
        }
        let (key, value) = part.split_once(PAIR_SEP).ok_or_else(|| {
            NetworkError::MalformedPayload(format!("pair without separator: {part}"))
        })?;
        pairs.push((key.to_string(), value.to_string()));
    }
    if pairs.is_empty() {
        return Err(NetworkError::MalformedPayload("empty pair list".into()).into());
    }
    Ok(pairs)
}

/// Encode a key list joined by `;` (GET / DELETE requests).
pub fn encode_keys<'a, I>(keys: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    keys.into_iter().collect::<Vec<_>>().join(&LIST_SEP.to_string())
}

/// Parse a `;`-joined key list.
pub fn parse_keys(payload: &str) -> Vec<String> {
    payload
        .split(LIST_SEP)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

/// Encode a value list joined by `;` (GET_OK replies, request order).
pub fn encode_values<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    values.into_iter().collect::<Vec<_>>().join(&LIST_SEP.to_string())
}

/// Parse a `;`-joined value list. Values may be empty, so every
/// separator-delimited slot counts.
pub fn parse_values(payload: &str) -> Vec<String> {
    if payload.is_empty() {
        return Vec::new();
    }
    payload.split(LIST_SEP).map(str::to_string).collect()
}

/// Encode a key set for ALL_KEYS, joined by `,`.
pub fn encode_all_keys<'a, I>(keys: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    keys.into_iter().collect::<Vec<_>>().join(&KEYS_SEP.to_string())
}

/// Parse an ALL_KEYS payload.
pub fn parse_all_keys(payload: &str) -> Vec<String> {
    payload
        .split(KEYS_SEP)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

/// Encode a routing table as `<K>#<row>;<row>;…`.
pub fn encode_table(table: &RoutingTable) -> String {
    let rows = table
        .entries()
        .iter()
        .map(|e| {
            format!(
                "{},{},{},{}",
                e.node_id, e.address.host, e.address.port, e.token
            )
        })
        .collect::<Vec<_>>()
        .join(&LIST_SEP.to_string());
    format!("{}#{}", table.replication_factor(), rows)
}

/// Parse a TABLE_PUSH payload back into a routing table.
pub fn parse_table(payload: &str) -> Result<RoutingTable> {
    let (factor, rows) = payload
        .split_once('#')
        .ok_or_else(|| NetworkError::MalformedPayload("table without '#' prefix".into()))?;
    let replication_factor: usize = factor
        .trim()
        .parse()
        .map_err(|_| NetworkError::MalformedPayload(format!("bad replication factor: {factor}")))?;

    let mut entries = Vec::new();
    for row in rows.split(LIST_SEP) {
        if row.is_empty() {
            continue;
        }
        let cols: Vec<&str> = row.split(KEYS_SEP).collect();
        if cols.len() != 4 {
            return Err(NetworkError::MalformedPayload(format!("bad table row: {row}")).into());
        }
        let port: u16 = cols[2]
            .parse()
            .map_err(|_| NetworkError::MalformedPayload(format!("bad port in row: {row}")))?;
        let token: u64 = cols[3]
            .parse()
            .map_err(|_| NetworkError::MalformedPayload(format!("bad token in row: {row}")))?;
        entries.push(RingEntry {
            node_id: cols[0].to_string(),
            address: NodeAddress::new(cols[1], port),
            token,
        });
    }
    Ok(RoutingTable::from_entries(entries, replication_factor))
}

/// Errors surfaced on the wire as ERROR payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Key failed size/separator validation.
    BadKey,
    /// Value failed size/separator validation.
    BadValue,
    /// Another primary write holds the key's lock.
    Locked(String),
    /// Key not present on this node.
    Missing(String),
    /// Node is paused for rebalancing.
    NodePaused,
    /// The node could not locate itself in its routing table.
    Routing,
    /// Unhandled message type.
    Unknown,
}

impl ErrorKind {
    /// Parse an ERROR payload.
    pub fn from_payload(payload: &str) -> Self {
        if let Some(key) = payload.strip_prefix("locked: ") {
            return Self::Locked(key.to_string());
        }
        if let Some(key) = payload.strip_prefix("missing: ") {
            return Self::Missing(key.to_string());
        }
        match payload {
            "bad key" => Self::BadKey,
            "bad value" => Self::BadValue,
            "node_paused" => Self::NodePaused,
            "routing error" => Self::Routing,
            _ => Self::Unknown,
        }
    }

    /// Whether a client should refresh its table and retry another replica.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::NodePaused | Self::Locked(_) | Self::Routing | Self::Unknown)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadKey => write!(f, "bad key"),
            Self::BadValue => write!(f, "bad value"),
            Self::Locked(key) => write!(f, "locked: {key}"),
            Self::Missing(key) => write!(f, "missing: {key}"),
            Self::NodePaused => write!(f, "node_paused"),
            Self::Routing => write!(f, "routing error"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}
