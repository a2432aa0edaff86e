// * Perceptual Hash Deduplication
// * Exact-hash set + BK-tree behind one mutex, so check-then-insert is atomic across workers

use crate::persistence::bktree::BkTree;
use crate::persistence::store::{MetadataStore, StoreError};
use crate::refinery::phash::PHash;
use std::collections::HashSet;
use std::sync::Mutex;

/// Verdict of a check-and-insert against the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupCheckResult {
    /// Hash was new and is now reserved
    Unique,
    /// Identical hash already indexed
    ExactDuplicate,
    /// An indexed hash lies within the Hamming threshold
    NearDuplicate { matched: PHash, distance: u32 },
}

impl DedupCheckResult {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, DedupCheckResult::Unique)
    }

    pub fn is_unique(&self) -> bool {
        matches!(self, DedupCheckResult::Unique)
    }
}

#[derive(Debug, Default)]
struct IndexState {
    exact: HashSet<PHash>,
    tree: BkTree,
}

/// In-memory index of every accepted perceptual hash.
///
/// The whole check-then-insert sequence runs under a single lock. Nothing inside
/// the lock touches the network or disk.
#[derive(Debug, Default)]
pub struct HashIndex {
    state: Mutex<IndexState>,
}

impl HashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an index from already-accepted hashes
    pub fn from_hashes<I>(hashes: I) -> Self
    where
        I: IntoIterator<Item = PHash>,
    {
        let exact: HashSet<PHash> = hashes.into_iter().collect();
        let tree = BkTree::build(exact.iter().copied());
        Self {
            state: Mutex::new(IndexState { exact, tree }),
        }
    }

    /// Rebuilds the index from the store's hash table
    pub async fn load(store: &dyn MetadataStore) -> Result<Self, StoreError> {
        let hashes = store.iter_all_hashes().await?;
        let index = Self::from_hashes(hashes);
        tracing::info!(hashes = index.len(), "Hash index rebuilt from store");
        Ok(index)
    }

    /// Atomically checks a hash and reserves it when it is unique.
    ///
    /// A threshold of 0 only runs the exact check.
    pub fn check_and_insert(&self, hash: PHash, threshold: u32) -> DedupCheckResult {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.exact.contains(&hash) {
            return DedupCheckResult::ExactDuplicate;
        }

        if threshold > 0 {
            if let Some((matched, distance)) = state.tree.nearest(&hash, threshold) {
                return DedupCheckResult::NearDuplicate { matched, distance };
            }
        }

        state.exact.insert(hash);
        state.tree.insert(hash);
        DedupCheckResult::Unique
    }

    /// Non-reserving lookup
    pub fn contains(&self, hash: &PHash) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .exact
            .contains(hash)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
