//! Deterministic local port assignment.
//!
//! Ports are derived from a hash of each entry's `host:tenant` key so that a
//! database keeps its local port from one run to the next, as long as the set
//! of discovered entries does not change. Adding or removing an entry can
//! shift ports for others sharing its collision chain.

use crate::entry::{Entry, TunnelKey};
use std::collections::HashSet;

pub const PORT_RANGE_MIN: u16 = 10000;
pub const PORT_RANGE_MAX: u16 = 65535;
const PORT_RANGE: u32 = (PORT_RANGE_MAX - PORT_RANGE_MIN) as u32 + 1;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(FNV_PRIME)
    })
}

/// The preferred port for a key, before collision resolution.
pub fn hash_port(key: &TunnelKey) -> u16 {
    let hash = fnv1a(key.to_string().as_bytes());
    PORT_RANGE_MIN + (hash % PORT_RANGE) as u16
}

fn next_port(port: u16) -> u16 {
    if port == PORT_RANGE_MAX {
        PORT_RANGE_MIN
    } else {
        port + 1
    }
}

/// Sort entries by key and give each a unique local port.
///
/// Collisions probe forward one port at a time, wrapping at the top of the
/// range. Sorting first makes the probe order, and so the result, the same
/// on every run.
///
/// # Panics
///
/// If there are more entries than ports in the range.
pub fn assign_ports(entries: &mut [Entry]) {
    assert!(
        entries.len() <= PORT_RANGE as usize,
        "cannot assign more than {} ports",
        PORT_RANGE
    );

    entries.sort_by_cached_key(|e| e.key().to_string());

    let mut used = HashSet::with_capacity(entries.len());
    for entry in entries.iter_mut() {
        let mut port = hash_port(&entry.key());
        while !used.insert(port) {
            port = next_port(port);
        }
        entry.local_port = port;
    }
}
