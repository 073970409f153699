//! # Bloom Reachability Maps
//!
//! A node can't know the whole network, but it can know roughly *what is
//! reachable* and *how far away*. A [`BloomMap`] is a stack of Bloom
//! filters indexed by hop distance:
//!
//! ```text
//! F[0]  nodes reachable at distance 0 (ourselves)
//! F[1]  nodes one hop away
//! ...
//! F[d]  nodes d hops away
//! conglomerate = F[0] ∪ F[1] ∪ ... ∪ F[d]
//! ```
//!
//! Maps are gossiped between peers. The receiver calls
//! [`BloomMap::increment`] (everything is one hop further from us than it
//! was from the sender) and merges the result into what it knows.
//!
//! ## Termination
//!
//! Gossip stops when merges stop changing anything. Two things make that
//! happen:
//!
//! - `merge` is idempotent. Re-merging a map already merged reports no
//!   change, and a `filter_hashes` set short-circuits filters we have seen
//!   verbatim before.
//! - `increment` drops levels beyond `max_depth`. On a cycle the same
//!   entries would otherwise be pushed one level deeper forever; with the
//!   cap they eventually fall off and every level saturates.
//!
//! ## Wire format
//!
//! ```json
//! { "filters": [ { "bits": "<hex>", "k": 4 }, ... ] }
//! ```
//!
//! Each filter carries its own size, so peers need not agree on
//! parameters. Filters that can't be unioned with ours are kept beside
//! them on the same level and sent in a `foreign` list:
//!
//! ```json
//! { "filters": [ ... ], "foreign": [ { "level": 2, "bits": "<hex>", "k": 3 } ] }
//! ```

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::{DEFAULT_BLOOM_BITS, DEFAULT_BLOOM_HASHES, DEFAULT_MAX_MAP_DEPTH, HASH_LENGTH};
use crate::crypto::hash::hex_bytes;
use crate::crypto::{sha512, sha512_multi, NodeAddress};

/// Errors related to Bloom filter construction and union.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BloomError {
    #[error("filter parameters differ: {ours_bits}/{ours_k} vs {theirs_bits}/{theirs_k}")]
    ParamMismatch {
        ours_bits: usize,
        ours_k: u8,
        theirs_bits: usize,
        theirs_k: u8,
    },

    #[error("filter size must be a positive multiple of 8, got {0}")]
    SizeNotByteAligned(usize),

    #[error("hash count must be positive")]
    ZeroHashCount,
}

// ---------------------------------------------------------------------------
// BloomFilter
// ---------------------------------------------------------------------------

/// A fixed-size Bloom filter over node addresses.
///
/// Uses double hashing: `h(x, i) = (h1(x) + i·h2(x)) mod m`, with `h1`
/// and `h2` taken from the first 16 bytes of SHA-512(x).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FilterWire", into = "FilterWire")]
pub struct BloomFilter {
    bits: Vec<u8>,
    hash_count: u8,
}

#[derive(Serialize, Deserialize)]
struct FilterWire {
    #[serde(with = "hex_bytes")]
    bits: Vec<u8>,
    k: u8,
}

impl TryFrom<FilterWire> for BloomFilter {
    type Error = BloomError;

    fn try_from(wire: FilterWire) -> Result<Self, Self::Error> {
        Self::from_bytes(wire.bits, wire.k)
    }
}

impl From<BloomFilter> for FilterWire {
    fn from(filter: BloomFilter) -> Self {
        Self {
            bits: filter.bits,
            k: filter.hash_count,
        }
    }
}

impl BloomFilter {
    /// An empty filter of `num_bits` bits using `hash_count` hashes.
    pub fn with_params(num_bits: usize, hash_count: u8) -> Result<Self, BloomError> {
        if num_bits == 0 || num_bits % 8 != 0 {
            return Err(BloomError::SizeNotByteAligned(num_bits));
        }
        if hash_count == 0 {
            return Err(BloomError::ZeroHashCount);
        }
        Ok(Self {
            bits: vec![0u8; num_bits / 8],
            hash_count,
        })
    }

    /// Wrap raw filter bytes.
    pub fn from_bytes(bits: Vec<u8>, hash_count: u8) -> Result<Self, BloomError> {
        if bits.is_empty() {
            return Err(BloomError::SizeNotByteAligned(0));
        }
        if hash_count == 0 {
            return Err(BloomError::ZeroHashCount);
        }
        Ok(Self { bits, hash_count })
    }

    pub fn insert(&mut self, addr: &NodeAddress) {
        for index in self.indices(addr) {
            self.bits[index / 8] |= 1 << (index % 8);
        }
    }

    /// `false` means definitely absent; `true` means probably present.
    pub fn contains(&self, addr: &NodeAddress) -> bool {
        self.indices(addr)
            .into_iter()
            .all(|index| (self.bits[index / 8] >> (index % 8)) & 1 == 1)
    }

    /// OR `other` into this filter. Returns whether any bit flipped.
    pub fn union(&mut self, other: &BloomFilter) -> Result<bool, BloomError> {
        if !self.same_params(other) {
            return Err(BloomError::ParamMismatch {
                ours_bits: self.num_bits(),
                ours_k: self.hash_count,
                theirs_bits: other.num_bits(),
                theirs_k: other.hash_count,
            });
        }
        let mut changed = false;
        for (a, b) in self.bits.iter_mut().zip(&other.bits) {
            let merged = *a | b;
            changed |= merged != *a;
            *a = merged;
        }
        Ok(changed)
    }

    pub fn same_params(&self, other: &BloomFilter) -> bool {
        self.bits.len() == other.bits.len() && self.hash_count == other.hash_count
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn num_bits(&self) -> usize {
        self.bits.len() * 8
    }

    pub fn hash_count(&self) -> u8 {
        self.hash_count
    }

    /// Content hash over the serialized form (bits and k).
    pub fn fingerprint(&self) -> [u8; HASH_LENGTH] {
        sha512_multi(&[&[self.hash_count], &self.bits])
    }

    fn indices(&self, addr: &NodeAddress) -> Vec<usize> {
        let digest = sha512(addr.as_bytes());
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&digest[0..8]);
        h2.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_le_bytes(h1);
        let h2 = u64::from_le_bytes(h2);
        let m = self.num_bits() as u64;

        (0..self.hash_count as u64)
            .map(|i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
            .collect()
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self {
            bits: vec![0u8; DEFAULT_BLOOM_BITS / 8],
            hash_count: DEFAULT_BLOOM_HASHES,
        }
    }
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bits", &self.num_bits())
            .field("k", &self.hash_count)
            .field("ones", &self.count_ones())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// BloomMap
// ---------------------------------------------------------------------------

/// Hop-indexed stack of Bloom filters plus their union.
///
/// Each level holds at most one filter per parameter set. Filters built
/// with our own parameters are the common case; a peer running a different
/// size contributes filters that sit beside ours on the same level and are
/// tested the same way.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "MapWire", into = "MapWire")]
pub struct BloomMap {
    /// `levels[d]`: non-empty filters for entries `d` hops away.
    levels: Vec<Vec<BloomFilter>>,
    /// One union filter per parameter set present in `levels`.
    conglomerate: Vec<BloomFilter>,
    /// Empty filter in our own parameters, used by `add_entry`.
    native: BloomFilter,
    filter_hashes: HashSet<(usize, [u8; HASH_LENGTH])>,
    max_depth: usize,
}

/// `filters[d]` is level `d` in the map's own parameters. Filters from a
/// peer with other parameters travel in `foreign`, tagged with their level.
#[derive(Serialize, Deserialize)]
struct MapWire {
    filters: Vec<BloomFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    foreign: Vec<LevelFilter>,
}

#[derive(Serialize, Deserialize)]
struct LevelFilter {
    level: usize,
    #[serde(with = "hex_bytes")]
    bits: Vec<u8>,
    k: u8,
}

impl TryFrom<MapWire> for BloomMap {
    type Error = BloomError;

    fn try_from(wire: MapWire) -> Result<Self, Self::Error> {
        let Some(first) = wire.filters.first() else {
            return Ok(Self::default());
        };
        let depth = wire.filters.len().min(DEFAULT_MAX_MAP_DEPTH.max(1));

        let mut map = Self {
            levels: vec![Vec::new(); depth],
            conglomerate: Vec::new(),
            native: empty_like(first),
            filter_hashes: HashSet::new(),
            max_depth: DEFAULT_MAX_MAP_DEPTH,
        };
        for (level, filter) in wire.filters.iter().take(depth).enumerate() {
            map.insert_filter(level, filter);
        }
        for extra in wire.foreign {
            let filter = BloomFilter::from_bytes(extra.bits, extra.k)?;
            if extra.level < depth {
                map.insert_filter(extra.level, &filter);
            } else {
                debug!(level = extra.level, "dropping filter past map depth");
            }
        }
        map.rebuild_conglomerate();
        Ok(map)
    }
}

impl From<BloomMap> for MapWire {
    fn from(map: BloomMap) -> Self {
        let mut filters = Vec::with_capacity(map.levels.len());
        let mut foreign = Vec::new();
        for (level, members) in map.levels.into_iter().enumerate() {
            let mut own = None;
            for filter in members {
                if own.is_none() && filter.same_params(&map.native) {
                    own = Some(filter);
                } else {
                    foreign.push(LevelFilter {
                        level,
                        bits: filter.bits,
                        k: filter.hash_count,
                    });
                }
            }
            filters.push(own.unwrap_or_else(|| map.native.clone()));
        }
        Self { filters, foreign }
    }
}

fn empty_like(filter: &BloomFilter) -> BloomFilter {
    BloomFilter {
        bits: vec![0u8; filter.bits.len()],
        hash_count: filter.hash_count,
    }
}

/// The member of `filters` sharing `like`'s parameters, created empty if
/// there is none yet.
fn slot<'a>(filters: &'a mut Vec<BloomFilter>, like: &BloomFilter) -> &'a mut BloomFilter {
    let index = match filters.iter().position(|f| f.same_params(like)) {
        Some(index) => index,
        None => {
            filters.push(empty_like(like));
            filters.len() - 1
        }
    };
    &mut filters[index]
}

impl BloomMap {
    /// An empty map one level deep.
    pub fn new(num_bits: usize, hash_count: u8, max_depth: usize) -> Result<Self, BloomError> {
        Ok(Self {
            levels: vec![Vec::new()],
            conglomerate: Vec::new(),
            native: BloomFilter::with_params(num_bits, hash_count)?,
            filter_hashes: HashSet::new(),
            max_depth: max_depth.max(1),
        })
    }

    /// Tests the conglomerate. May give false positives, never false
    /// negatives for anything added or merged in.
    pub fn is_reachable(&self, addr: &NodeAddress) -> bool {
        self.conglomerate.iter().any(|f| f.contains(addr))
    }

    /// Smallest hop level with a filter matching `addr`.
    pub fn distance(&self, addr: &NodeAddress) -> Option<usize> {
        if !self.is_reachable(addr) {
            return None;
        }
        self.levels
            .iter()
            .position(|level| level.iter().any(|f| f.contains(addr)))
    }

    /// Add `addr` at distance 0.
    pub fn add_entry(&mut self, addr: &NodeAddress) {
        slot(&mut self.levels[0], &self.native).insert(addr);
        slot(&mut self.conglomerate, &self.native).insert(addr);
    }

    /// Push everything one hop further away. Levels past `max_depth` fall off.
    pub fn increment(&mut self) {
        self.levels.insert(0, Vec::new());
        if self.levels.len() > self.max_depth {
            self.levels.truncate(self.max_depth);
            self.rebuild_conglomerate();
        }
        // Level indices moved; remembered fingerprints no longer line up.
        self.filter_hashes.clear();
    }

    /// Union `other` into this map level by level. Returns whether anything
    /// changed.
    pub fn merge(&mut self, other: &BloomMap) -> bool {
        let depth = other.levels.len().min(self.max_depth);
        while self.levels.len() < depth {
            self.levels.push(Vec::new());
        }

        let mut changed = false;
        for (level, filters) in other.levels.iter().take(depth).enumerate() {
            for theirs in filters {
                let key = (level, theirs.fingerprint());
                if self.filter_hashes.contains(&key) {
                    continue;
                }
                changed |= self.insert_filter(level, theirs);
                self.filter_hashes.insert(key);
            }
        }

        if changed {
            self.rebuild_conglomerate();
        }
        changed
    }

    /// Deep copy. Same as `clone`, named for symmetry with gossip code.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Number of hop levels currently held.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Change the depth cap. Takes effect on the next `increment`/`merge`.
    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth.max(1);
    }

    /// Bit count and hash count used for our own entries.
    pub fn params(&self) -> (usize, u8) {
        (self.native.num_bits(), self.native.hash_count())
    }

    /// Number of distinct filter parameter sets held.
    pub fn param_sets(&self) -> usize {
        self.conglomerate.len()
    }

    /// Union `filter` into `level`. `level` must exist.
    fn insert_filter(&mut self, level: usize, filter: &BloomFilter) -> bool {
        if filter.is_empty() {
            return false;
        }
        // Same parameters by construction of `slot`.
        slot(&mut self.levels[level], filter)
            .union(filter)
            .unwrap_or(false)
    }

    fn rebuild_conglomerate(&mut self) {
        let mut union: Vec<BloomFilter> = Vec::new();
        for filter in self.levels.iter().flatten() {
            let _ = slot(&mut union, filter).union(filter);
        }
        self.conglomerate = union;
    }
}

impl Default for BloomMap {
    fn default() -> Self {
        Self {
            levels: vec![Vec::new()],
            conglomerate: Vec::new(),
            native: BloomFilter::default(),
            filter_hashes: HashSet::new(),
            max_depth: DEFAULT_MAX_MAP_DEPTH,
        }
    }
}

impl PartialEq for BloomMap {
    fn eq(&self, other: &Self) -> bool {
        fn ordered(level: &[BloomFilter]) -> Vec<&BloomFilter> {
            let mut sorted: Vec<_> = level.iter().collect();
            sorted.sort_by_key(|f| (f.num_bits(), f.hash_count()));
            sorted
        }
        self.levels.len() == other.levels.len()
            && self
                .levels
                .iter()
                .zip(&other.levels)
                .all(|(a, b)| ordered(a) == ordered(b))
    }
}

impl fmt::Debug for BloomMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ones: usize = self.conglomerate.iter().map(BloomFilter::count_ones).sum();
        f.debug_struct("BloomMap")
            .field("depth", &self.levels.len())
            .field("max_depth", &self.max_depth)
            .field("param_sets", &self.conglomerate.len())
            .field("ones", &ones)
            .finish()
    }
}
