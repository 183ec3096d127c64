//! Consistent-hash routing.

mod ring;

pub use ring::{hash_key, token_for, RingEntry, RoutingTable};
