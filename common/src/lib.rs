#![no_std]

//! kgroute common types
//!
//! Endpoint addressing and Maglev consistent hashing shared by the resolver
//! and its tests. Kept `no_std` + `alloc` so it has no runtime dependencies.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use core::net::{IpAddr, SocketAddr};

/// Maglev lookup table size (prime, as required by the permutation scheme)
pub const MAGLEV_TABLE_SIZE: usize = 4099;

/// Maximum number of endpoints a single Maglev table can index
pub const MAX_ENDPOINTS: usize = 1024;

/// Default endpoint weight
pub const DEFAULT_WEIGHT: u16 = 100;

/// A reachable (address, port) pair for one ready instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Endpoint {
    /// Instance IP address
    pub addr: IpAddr,

    /// Port on the instance (the resolved targetPort)
    pub port: u16,

    /// Relative weight for Maglev table population (1-65535)
    pub weight: u16,
}

impl Endpoint {
    pub const fn new(addr: IpAddr, port: u16) -> Self {
        Self {
            addr,
            port,
            weight: DEFAULT_WEIGHT,
        }
    }

    pub const fn with_weight(mut self, weight: u16) -> Self {
        self.weight = weight;
        self
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// Socket address for connecting to this endpoint
    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// 16-byte address form (IPv4 is mapped) used for hashing
    pub fn ip_bytes(&self) -> [u8; 16] {
        match self.addr {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        }
    }

    /// FNV-1a over address and port, the endpoint's Maglev key
    pub fn hash_key(&self) -> u64 {
        let mut key_bytes = [0u8; 18];
        key_bytes[0..16].copy_from_slice(&self.ip_bytes());
        key_bytes[16..18].copy_from_slice(&self.port.to_be_bytes());
        fnv1a_hash(&key_bytes)
    }
}

impl core::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.addr {
            IpAddr::V4(v4) => write!(f, "{}:{}", v4, self.port),
            IpAddr::V6(v6) => write!(f, "[{}]:{}", v6, self.port),
        }
    }
}

/// FNV-1a hash
pub const fn fnv1a_hash(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// Seeded FNV-1a over a u64 key, used for offset/skip generation
fn hash_with_seed(key: u64, seed: u64) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET ^ seed;
    for byte in key.to_le_bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Maglev consistent hashing table
///
/// Based on Google's Maglev paper: https://research.google/pubs/pub44824/
///
/// Every slot holds an index into the endpoint slice the table was built from.
/// Removing one of N endpoints remaps roughly 1/N of flow keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaglevTable {
    slots: Vec<u16>,
    endpoints: usize,
}

impl MaglevTable {
    /// Build a table for `endpoints`, keyed by address and port
    ///
    /// Endpoints beyond `MAX_ENDPOINTS` are ignored. Weight is honored by
    /// giving an endpoint `weight / 10` permutations (at least one).
    pub fn build(endpoints: &[Endpoint]) -> Self {
        let members: Vec<(u64, u16)> = endpoints
            .iter()
            .map(|e| (e.hash_key(), e.weight))
            .collect();
        Self::build_keyed(&members)
    }

    /// Build a table from `(key, weight)` pairs
    ///
    /// Members with distinct keys get independent permutations, so callers
    /// whose members can share an address fold an identity into the key.
    pub fn build_keyed(members: &[(u64, u16)]) -> Self {
        let members = &members[..members.len().min(MAX_ENDPOINTS)];
        if members.is_empty() {
            return Self {
                slots: Vec::new(),
                endpoints: 0,
            };
        }

        let mut permutations = Vec::new();
        for (i, &(key, weight)) in members.iter().enumerate() {
            let repetitions = (weight / 10).max(1) as usize;
            for rep in 0..repetitions {
                // Seeds depend only on the member itself so a membership
                // change leaves the other permutations untouched
                let seed = rep as u64 * 2;
                permutations.push((i as u16, Permutation::new(key, seed)));
            }
        }

        let mut slots = vec![0u16; MAGLEV_TABLE_SIZE];
        let mut filled = vec![false; MAGLEV_TABLE_SIZE];
        let mut filled_count = 0;
        let mut n = 0;

        while filled_count < MAGLEV_TABLE_SIZE {
            for (endpoint_idx, perm) in permutations.iter() {
                let c = perm.at(n);
                if !filled[c] {
                    slots[c] = *endpoint_idx;
                    filled[c] = true;
                    filled_count += 1;
                    if filled_count == MAGLEV_TABLE_SIZE {
                        break;
                    }
                }
            }
            n += 1;
        }

        Self {
            slots,
            endpoints: members.len(),
        }
    }

    /// Index of the endpoint owning `flow_key`, `None` for an empty table
    #[inline(always)]
    pub fn lookup(&self, flow_key: u64) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let idx = (flow_key % MAGLEV_TABLE_SIZE as u64) as usize;
        Some(self.slots[idx] as usize)
    }

    /// Number of endpoints indexed by this table
    pub fn len(&self) -> usize {
        self.endpoints
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints == 0
    }

    /// Raw slot assignments, exposed for distribution checks
    pub fn slots(&self) -> &[u16] {
        &self.slots
    }
}

/// Lazily evaluated permutation `(offset + j * skip) % M`
struct Permutation {
    offset: usize,
    skip: usize,
}

impl Permutation {
    fn new(key: u64, seed: u64) -> Self {
        let m = MAGLEV_TABLE_SIZE as u64;
        Self {
            offset: (hash_with_seed(key, seed) % m) as usize,
            skip: ((hash_with_seed(key, seed + 1) % (m - 1)) + 1) as usize,
        }
    }

    #[inline(always)]
    fn at(&self, j: usize) -> usize {
        (self.offset + (j % MAGLEV_TABLE_SIZE) * self.skip) % MAGLEV_TABLE_SIZE
    }
}
