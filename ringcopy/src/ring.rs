//! Token-ring model: ranges, partitioners and the cached token map.
//!
//! The map caches ring token *values* and replica tuples so that the
//! per-row bisect runs over plain integers, and it pre-binds the
//! partition-key hash so the import hot path never dispatches on the
//! partitioner again.

use std::collections::HashMap;

use rand::seq::SliceRandom;

use crate::cql::HostAddr;
use crate::driver::ClusterMetadata;

/// A half-open token interval `(begin, end]`; `None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenRange {
    pub begin: Option<i64>,
    pub end: Option<i64>,
}

impl TokenRange {
    /// The whole ring.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self { begin: None, end: None }
    }

    /// Whether a token falls inside `(begin, end]`.
    #[must_use]
    pub fn contains(&self, token: i64) -> bool {
        self.begin.is_none_or(|b| token > b) && self.end.is_none_or(|e| token <= e)
    }
}

impl std::fmt::Display for TokenRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fmt_bound = |b: Option<i64>| b.map_or_else(|| "*".to_owned(), |t| t.to_string());
        write!(f, "({}, {}]", fmt_bound(self.begin), fmt_bound(self.end))
    }
}

/// The cluster's partitioner, as named in metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Partitioner {
    Murmur3,
    Random,
    Other(String),
}

impl Partitioner {
    /// Classify a fully-qualified partitioner class name.
    #[must_use]
    pub fn from_class_name(name: &str) -> Self {
        if name.ends_with("Murmur3Partitioner") {
            Partitioner::Murmur3
        } else if name.ends_with("RandomPartitioner") {
            Partitioner::Random
        } else {
            Partitioner::Other(name.to_owned())
        }
    }

    /// The smallest token of the ring, or `None` when the partitioner has
    /// no usable token order (single-range export in that case).
    #[must_use]
    pub fn min_token(&self) -> Option<i64> {
        match self {
            Partitioner::Murmur3 => Some(i64::MIN),
            Partitioner::Random => Some(-1),
            Partitioner::Other(_) => None,
        }
    }
}

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

fn rotl(v: u64, n: u32) -> u64 {
    v.rotate_left(n)
}

fn fmix(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// Sign-extending tail-byte read; the ring hash promotes bytes as signed.
fn tail_byte(b: u8) -> u64 {
    i64::from(b as i8) as u64
}

/// The ring's 64-bit key hash (the first half of murmur3 x64/128, with
/// signed tail-byte promotion). `i64::MIN` normalizes to `i64::MAX` so the
/// minimum token is never produced by a key.
#[must_use]
pub fn murmur3_token(key: &[u8]) -> i64 {
    let nblocks = key.len() / 16;
    let mut h1: u64 = 0;
    let mut h2: u64 = 0;

    for i in 0..nblocks {
        let off = i * 16;
        let mut k1 = u64::from_le_bytes(key[off..off + 8].try_into().expect("8-byte block"));
        let mut k2 =
            u64::from_le_bytes(key[off + 8..off + 16].try_into().expect("8-byte block"));

        k1 = k1.wrapping_mul(C1);
        k1 = rotl(k1, 31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = rotl(h1, 27);
        h1 = h1.wrapping_add(h2);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2);
        k2 = rotl(k2, 33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;
        h2 = rotl(h2, 31);
        h2 = h2.wrapping_add(h1);
        h2 = h2.wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    let tail = &key[nblocks * 16..];
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;
    for i in (8..tail.len()).rev() {
        k2 ^= tail_byte(tail[i]) << ((i - 8) * 8);
    }
    if tail.len() > 8 {
        k2 = k2.wrapping_mul(C2);
        k2 = rotl(k2, 33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;
    }
    for i in (0..tail.len().min(8)).rev() {
        k1 ^= tail_byte(tail[i]) << (i * 8);
    }
    if !tail.is_empty() {
        k1 = k1.wrapping_mul(C1);
        k1 = rotl(k1, 31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    let len = key.len() as u64;
    h1 ^= len;
    h2 ^= len;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix(h1);
    h2 = fmix(h2);
    h1 = h1.wrapping_add(h2);

    let token = h1 as i64;
    if token == i64::MIN { i64::MAX } else { token }
}

/// Index of the first ring slot strictly greater than `v`.
#[must_use]
pub fn bisect_right(ring: &[i64], v: i64) -> usize {
    ring.partition_point(|&t| t <= v)
}

#[derive(Debug, Clone)]
struct HostState {
    datacenter: String,
    is_up: bool,
}

/// Cached ring token values, parallel replica tuples and the pre-bound
/// partition-key hash.
///
/// Without token metadata (or with a partitioner whose key hash cannot be
/// computed client-side) the map degenerates to a single slot routed at
/// the contact host; batching still works, it just loses replica affinity.
pub struct TokenMap {
    /// Sorted ring token values.
    pub ring: Vec<i64>,
    /// Replica hosts per ring slot, parallel to `ring`.
    pub replicas: Vec<Vec<HostAddr>>,
    token_fn: fn(&[u8]) -> i64,
    local_dc: String,
    hosts: HashMap<HostAddr, HostState>,
}

fn degenerate_token(_key: &[u8]) -> i64 {
    0
}

impl TokenMap {
    /// Build the cached map from a metadata snapshot.
    #[must_use]
    pub fn new(meta: &ClusterMetadata) -> Self {
        let hosts = meta
            .hosts
            .iter()
            .map(|(addr, info)| {
                (
                    addr.clone(),
                    HostState { datacenter: info.datacenter.clone(), is_up: info.is_up },
                )
            })
            .collect();

        if meta.ring.is_empty() {
            return Self {
                ring: vec![0],
                replicas: vec![vec![meta.contact_point.clone()]],
                token_fn: degenerate_token,
                local_dc: meta.local_dc.clone(),
                hosts,
            };
        }

        let token_fn = match meta.partitioner {
            Partitioner::Murmur3 => murmur3_token,
            _ => {
                tracing::debug!(partitioner = ?meta.partitioner, "no client-side key hash, using single-position routing");
                degenerate_token
            }
        };

        Self {
            ring: meta.ring.iter().map(|(t, _)| *t).collect(),
            replicas: meta.ring.iter().map(|(_, r)| r.clone()).collect(),
            token_fn,
            local_dc: meta.local_dc.clone(),
            hosts,
        }
    }

    /// The ring token of a serialized partition key.
    #[must_use]
    pub fn token_of(&self, pk: &[u8]) -> i64 {
        (self.token_fn)(pk)
    }

    /// Ring slot owning a token; the right-bisect wraps `len` to 0.
    #[must_use]
    pub fn ring_pos(&self, token: i64) -> usize {
        let idx = bisect_right(&self.ring, token);
        if idx < self.ring.len() { idx } else { 0 }
    }

    /// Shuffle the hosts, then keep those that are up in the local DC.
    #[must_use]
    pub fn filter_replicas(&self, hosts: &[HostAddr]) -> Vec<HostAddr> {
        let mut shuffled: Vec<HostAddr> = hosts.to_vec();
        shuffled.shuffle(&mut rand::thread_rng());
        shuffled.retain(|h| {
            self.hosts
                .get(h)
                .is_some_and(|s| s.is_up && s.datacenter == self.local_dc)
        });
        shuffled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ClusterMetadata, HostInfo};

    fn meta_with_ring(ring: Vec<(i64, Vec<HostAddr>)>) -> ClusterMetadata {
        let mut hosts = HashMap::new();
        for (_, replicas) in &ring {
            for r in replicas {
                hosts.insert(
                    r.clone(),
                    HostInfo { address: r.clone(), datacenter: "dc1".into(), is_up: true },
                );
            }
        }
        ClusterMetadata {
            contact_point: "h1".into(),
            local_dc: "dc1".into(),
            partitioner: Partitioner::Murmur3,
            ring,
            hosts,
        }
    }

    #[test]
    fn range_membership_is_half_open() {
        let r = TokenRange { begin: Some(10), end: Some(20) };
        assert!(!r.contains(10));
        assert!(r.contains(11));
        assert!(r.contains(20));
        assert!(!r.contains(21));
        assert!(TokenRange::unbounded().contains(i64::MIN));
    }

    #[test]
    fn min_token_per_partitioner() {
        assert_eq!(Partitioner::Murmur3.min_token(), Some(i64::MIN));
        assert_eq!(Partitioner::Random.min_token(), Some(-1));
        assert_eq!(
            Partitioner::from_class_name("org.example.dht.ByteOrderedPartitioner")
                .min_token(),
            None
        );
    }

    #[test]
    fn murmur3_is_deterministic_and_spread() {
        let a = murmur3_token(b"alpha");
        let b = murmur3_token(b"beta");
        assert_eq!(a, murmur3_token(b"alpha"));
        assert_ne!(a, b);
        assert_ne!(a, i64::MIN, "minimum token must never be produced");
        // block + tail paths
        let long = murmur3_token(b"a-key-longer-than-sixteen-bytes-with-tail");
        assert_eq!(long, murmur3_token(b"a-key-longer-than-sixteen-bytes-with-tail"));
    }

    #[test]
    fn ring_pos_wraps() {
        let tm = TokenMap::new(&meta_with_ring(vec![
            (-100, vec!["h1".into()]),
            (0, vec!["h2".into()]),
            (100, vec!["h3".into()]),
        ]));
        assert_eq!(tm.ring_pos(-101), 0);
        assert_eq!(tm.ring_pos(-100), 1);
        assert_eq!(tm.ring_pos(50), 2);
        assert_eq!(tm.ring_pos(100), 0, "past the last slot wraps to the first");
        assert_eq!(tm.ring_pos(101), 0);
    }

    #[test]
    fn replica_filtering_drops_remote_and_down_hosts() {
        let mut meta = meta_with_ring(vec![(0, vec!["h1".into(), "h2".into(), "h3".into()])]);
        meta.hosts.get_mut("h2").unwrap().is_up = false;
        meta.hosts.get_mut("h3").unwrap().datacenter = "dc2".into();
        let tm = TokenMap::new(&meta);
        let filtered = tm.filter_replicas(&["h1".into(), "h2".into(), "h3".into()]);
        assert_eq!(filtered, vec!["h1".to_owned()]);
    }

    #[test]
    fn empty_ring_degenerates_to_contact_host() {
        let meta = ClusterMetadata {
            contact_point: "c1".into(),
            local_dc: "dc1".into(),
            partitioner: Partitioner::Murmur3,
            ring: Vec::new(),
            hosts: HashMap::new(),
        };
        let tm = TokenMap::new(&meta);
        assert_eq!(tm.ring, vec![0]);
        assert_eq!(tm.replicas, vec![vec!["c1".to_owned()]]);
        assert_eq!(tm.token_of(b"anything"), 0);
    }
}
