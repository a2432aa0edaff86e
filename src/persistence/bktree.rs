// * BK-Tree over perceptual hashes
// * Metric tree keyed by Hamming distance, used for near-duplicate lookups

use crate::refinery::phash::PHash;
use std::collections::BTreeMap;

/// A single tree node, children are keyed by their distance to this node
#[derive(Debug, Clone)]
struct Node {
    hash: PHash,
    children: BTreeMap<u32, usize>,
}

/// Append-only BK-tree. Nodes live in an arena and reference each other by index.
#[derive(Debug, Clone, Default)]
pub struct BkTree {
    nodes: Vec<Node>,
}

impl BkTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk-loads a tree, equivalent to inserting every hash in order
    pub fn build<I>(hashes: I) -> Self
    where
        I: IntoIterator<Item = PHash>,
    {
        let mut tree = Self::new();
        for hash in hashes {
            tree.insert(hash);
        }
        tree
    }

    /// Inserts a hash. Re-inserting an existing hash is a no-op.
    pub fn insert(&mut self, hash: PHash) {
        if self.nodes.is_empty() {
            self.nodes.push(Node {
                hash,
                children: BTreeMap::new(),
            });
            return;
        }

        let mut current = 0;
        loop {
            let distance = self.nodes[current].hash.distance(&hash);
            if distance == 0 {
                return;
            }
            match self.nodes[current].children.get(&distance) {
                Some(&child) => current = child,
                None => {
                    let index = self.nodes.len();
                    self.nodes.push(Node {
                        hash,
                        children: BTreeMap::new(),
                    });
                    self.nodes[current].children.insert(distance, index);
                    return;
                }
            }
        }
    }

    /// Returns every indexed hash within `max_distance` of `query`
    pub fn search(&self, query: &PHash, max_distance: u32) -> Vec<PHash> {
        let mut matches = Vec::new();
        if self.nodes.is_empty() {
            return matches;
        }

        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            let distance = node.hash.distance(query);
            if distance <= max_distance {
                matches.push(node.hash);
            }

            // * Triangle inequality: only children in [d - max, d + max] can match
            let low = distance.saturating_sub(max_distance);
            let high = distance.saturating_add(max_distance);
            stack.extend(node.children.range(low..=high).map(|(_, &child)| child));
        }

        matches
    }

    /// Closest indexed hash within `max_distance`, if any
    pub fn nearest(&self, query: &PHash, max_distance: u32) -> Option<(PHash, u32)> {
        self.search(query, max_distance)
            .into_iter()
            .map(|hash| (hash, hash.distance(query)))
            .min_by_key(|&(_, distance)| distance)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
