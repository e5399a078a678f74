//! # Routing Table
//!
//! [`ID_BITS`] k-buckets indexed by XOR distance from the local identifier:
//! bucket `d - 1` holds peers at distance `d`. Within a bucket, entries are
//! ordered least-recently-seen first, most-recently-seen last.
//!
//! The table itself is policy-free when a bucket overflows: [`RoutingTable::insert`]
//! reports [`InsertOutcome::Full`] with the incumbent that would be evicted, and
//! the owner decides (per [`EvictionPolicy`](crate::config::EvictionPolicy))
//! whether to drop the newcomer or probe the incumbent and call
//! [`RoutingTable::replace`].

use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::identity::{ID_BITS, ID_LEN, NodeId, distance_cmp};
use crate::peer::Peer;

#[derive(Debug, Clone)]
struct BucketEntry {
    peer: Peer,
    last_seen: Instant,
}

#[derive(Debug, Clone)]
struct RoutingBucket {
    entries: Vec<BucketEntry>,
    last_touched: Instant,
}

/// Result of a routing table insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The peer was new and the bucket had room.
    Inserted,
    /// The peer was already known and is now most-recently-seen.
    Refreshed,
    /// The peer is the local node and was not stored.
    Local,
    /// The bucket is full; `oldest` is its least-recently-seen entry.
    Full { oldest: Peer },
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_touched: Instant::now(),
        }
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|e| e.peer.id() == *id)
    }

    fn touch(&mut self, peer: Peer, k: usize) -> InsertOutcome {
        let now = Instant::now();
        if let Some(pos) = self.position(&peer.id()) {
            self.entries.remove(pos);
            // Keep the latest address we heard from.
            self.entries.push(BucketEntry { peer, last_seen: now });
            self.last_touched = now;
            return InsertOutcome::Refreshed;
        }

        if self.entries.len() < k {
            self.entries.push(BucketEntry { peer, last_seen: now });
            self.last_touched = now;
            InsertOutcome::Inserted
        } else {
            match self.entries.first() {
                Some(oldest) => InsertOutcome::Full { oldest: oldest.peer },
                None => InsertOutcome::Inserted,
            }
        }
    }

    fn remove(&mut self, id: &NodeId) -> Option<Peer> {
        self.position(id).map(|pos| self.entries.remove(pos).peer)
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        let buckets = (0..ID_BITS).map(|_| RoutingBucket::new()).collect();
        Self { self_id, k, buckets }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Bucket slot for an identifier, `None` for the local identifier.
    fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        match self.self_id.distance(id) {
            0 => None,
            d => Some(d - 1),
        }
    }

    /// Insert or refresh a peer.
    pub fn insert(&mut self, peer: Peer) -> InsertOutcome {
        let Some(idx) = self.bucket_index(&peer.id()) else {
            return InsertOutcome::Local;
        };
        let k = self.k;
        self.buckets[idx].touch(peer, k)
    }

    /// Swap a full bucket's stale incumbent for a newcomer.
    ///
    /// Returns `false` (and changes nothing) when the incumbent is already
    /// gone or the two peers do not share a bucket.
    pub fn replace(&mut self, stale: &NodeId, newcomer: Peer) -> bool {
        let (Some(idx), Some(new_idx)) = (self.bucket_index(stale), self.bucket_index(&newcomer.id()))
        else {
            return false;
        };
        if idx != new_idx {
            return false;
        }
        let bucket = &mut self.buckets[idx];
        if bucket.remove(stale).is_none() {
            return false;
        }
        let k = self.k;
        bucket.touch(newcomer, k);
        true
    }

    /// Mark a peer as most-recently-seen if it is present.
    pub fn refresh(&mut self, id: &NodeId) -> bool {
        let Some(idx) = self.bucket_index(id) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        match bucket.position(id) {
            Some(pos) => {
                let mut entry = bucket.entries.remove(pos);
                let now = Instant::now();
                entry.last_seen = now;
                bucket.entries.push(entry);
                bucket.last_touched = now;
                true
            }
            None => false,
        }
    }

    /// Evict a peer after a reported timeout. Returns whether it was present.
    pub fn set_unresponsive_node(&mut self, peer: &Peer) -> bool {
        self.remove(&peer.id()).is_some()
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Peer> {
        let idx = self.bucket_index(id)?;
        self.buckets[idx].remove(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<Peer> {
        let idx = self.bucket_index(id)?;
        self.buckets[idx]
            .entries
            .iter()
            .find(|e| e.peer.id() == *id)
            .map(|e| e.peer)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    /// When a peer was last inserted or refreshed.
    pub fn last_seen(&self, id: &NodeId) -> Option<Instant> {
        let idx = self.bucket_index(id)?;
        self.buckets[idx]
            .entries
            .iter()
            .find(|e| e.peer.id() == *id)
            .map(|e| e.last_seen)
    }

    /// Up to `n` known peers, ascending by XOR distance to `target`.
    pub fn find_closest(&self, target: &NodeId, n: usize) -> Vec<Peer> {
        if n == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct ByDistance {
            dist: [u8; ID_LEN],
            peer: Peer,
        }

        impl Ord for ByDistance {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for ByDistance {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        // Max-heap of the n best so far; the root is the worst kept candidate.
        let mut heap: BinaryHeap<ByDistance> = BinaryHeap::with_capacity(n + 1);
        for bucket in &self.buckets {
            for entry in &bucket.entries {
                let dist = entry.peer.id().xor_distance(target);
                if heap.len() < n {
                    heap.push(ByDistance { dist, peer: entry.peer });
                } else if let Some(worst) = heap.peek()
                    && distance_cmp(&dist, &worst.dist) == std::cmp::Ordering::Less
                {
                    heap.pop();
                    heap.push(ByDistance { dist, peer: entry.peer });
                }
            }
        }

        heap.into_sorted_vec().into_iter().map(|e| e.peer).collect()
    }

    /// Every known peer, nearest buckets first.
    pub fn all_nodes(&self) -> Vec<Peer> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.peer))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.entries.is_empty())
    }

    /// Number of peers at exactly distance `d`.
    pub fn bucket_len(&self, d: usize) -> usize {
        if d == 0 || d > ID_BITS {
            return 0;
        }
        self.buckets[d - 1].entries.len()
    }

    /// Distances of non-empty buckets untouched for longer than `threshold`.
    pub fn stale_buckets(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.entries.is_empty() && b.last_touched.elapsed() > threshold)
            .map(|(idx, _)| idx + 1)
            .collect()
    }
}
