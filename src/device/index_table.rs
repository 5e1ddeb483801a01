//! Receive-side session index table
//!
//! Maps the random 32-bit indices we hand out in handshake messages to the
//! owning peer and, once a session exists, a weak handle to its keypair.

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;

use super::PeerId;
use crate::protocol::transport::Keypair;

/// What an index currently refers to
#[derive(Debug, Clone)]
pub enum IndexSlot {
    /// An in-progress handshake of the peer
    Handshake,
    /// A derived session; dangling once the peer drops it
    Keypair(Weak<Keypair>),
}

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub peer: PeerId,
    pub slot: IndexSlot,
}

impl IndexEntry {
    pub fn keypair(&self) -> Option<Arc<Keypair>> {
        match &self.slot {
            IndexSlot::Keypair(weak) => weak.upgrade(),
            IndexSlot::Handshake => None,
        }
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self.slot, IndexSlot::Handshake)
    }
}

/// Sharded index map; readers only contend with writers on the same shard
#[derive(Default)]
pub struct IndexTable {
    map: DashMap<u32, IndexEntry>,
}

impl IndexTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert under a fresh random non-zero index
    pub fn allocate(&self, peer: PeerId, slot: IndexSlot) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let index: u32 = rng.gen();
            if index == 0 {
                continue;
            }
            if let Entry::Vacant(vacant) = self.map.entry(index) {
                vacant.insert(IndexEntry { peer, slot });
                return index;
            }
        }
    }

    pub fn lookup(&self, index: u32) -> Option<IndexEntry> {
        self.map.get(&index).map(|entry| entry.value().clone())
    }

    /// Repoint an index still owned by `peer`, e.g. handshake -> keypair
    pub fn replace(&self, index: u32, peer: PeerId, slot: IndexSlot) -> bool {
        match self.map.get_mut(&index) {
            Some(mut entry) if entry.peer == peer => {
                entry.slot = slot;
                true
            }
            _ => false,
        }
    }

    /// Remove an index, but only if `peer` still owns it
    pub fn release(&self, index: u32, peer: PeerId) -> bool {
        self.map
            .remove_if(&index, |_, entry| entry.peer == peer)
            .is_some()
    }

    /// Drop every index of a peer
    pub fn remove_peer(&self, peer: PeerId) {
        self.map.retain(|_, entry| entry.peer != peer);
    }

    pub fn count_for(&self, peer: PeerId) -> usize {
        self.map.iter().filter(|entry| entry.peer == peer).count()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
