//! Identity index: identity key → tracked entities sharing that key.
//!
//! Several distinct entity instances may materialize the same row at once, so
//! every key maps to a bucket rather than a single entry. The index itself is
//! not synchronized; it lives inside the repository state and is only touched
//! while the repository's master lock is held.

use std::collections::HashMap;
use std::sync::Arc;

use crate::meta::MetaEntity;

/// Multi-map from identity key to tracked metadata.
#[derive(Debug, Default)]
pub struct IdentityIndex {
    buckets: HashMap<String, Vec<Arc<MetaEntity>>>,
}

impl IdentityIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `meta` under `key`. Adding the same metadata twice is a no-op.
    pub fn add(&mut self, key: String, meta: Arc<MetaEntity>) {
        let bucket = self.buckets.entry(key).or_default();
        if !bucket.iter().any(|m| Arc::ptr_eq(m, &meta)) {
            bucket.push(meta);
        }
    }

    /// Remove `meta`, looking under `key` first and scanning every bucket when
    /// the key is unknown or stale. Returns whether anything was removed.
    pub fn remove(&mut self, key: Option<&str>, meta: &Arc<MetaEntity>) -> bool {
        if let Some(key) = key {
            if let Some(bucket) = self.buckets.get_mut(key) {
                let before = bucket.len();
                bucket.retain(|m| !Arc::ptr_eq(m, meta));
                let removed = bucket.len() != before;
                if bucket.is_empty() {
                    self.buckets.remove(key);
                }
                if removed {
                    return true;
                }
            }
        }

        let mut removed = false;
        self.buckets.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|m| !Arc::ptr_eq(m, meta));
            removed |= bucket.len() != before;
            !bucket.is_empty()
        });
        if removed {
            tracing::trace!(serial = meta.serial(), "Identity index fallback scan removed entry");
        }
        removed
    }

    /// Every entry sharing `key`; empty when none.
    pub fn find(&self, key: &str) -> &[Arc<MetaEntity>] {
        self.buckets.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Drop every entry whose entity was collected, returning how many.
    pub fn purge_collected(&mut self) -> usize {
        let mut purged = 0;
        self.buckets.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|m| !m.is_collected());
            purged += before - bucket.len();
            !bucket.is_empty()
        });
        purged
    }

    /// Remove everything, returning what was tracked.
    pub fn drain(&mut self) -> Vec<Arc<MetaEntity>> {
        self.buckets.drain().flat_map(|(_, bucket)| bucket).collect()
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::fixtures::Customer;

    fn meta_of(entity: &Entity<Customer>) -> Arc<MetaEntity> {
        MetaEntity::obtain(&entity.erase())
    }

    #[test]
    fn test_equal_keys_share_bucket() {
        let first = Customer::named("Ada");
        let second = Customer::named("Ada");
        let mut index = IdentityIndex::new();
        index.add("i:1".to_string(), meta_of(&first));
        index.add("i:1".to_string(), meta_of(&second));

        let bucket = index.find("i:1");
        assert_eq!(bucket.len(), 2);
        assert!(Arc::ptr_eq(&bucket[0], &meta_of(&first)));
        assert!(Arc::ptr_eq(&bucket[1], &meta_of(&second)));
        assert!(index.find("i:2").is_empty());
    }

    #[test]
    fn test_add_is_idempotent() {
        let entity = Customer::named("Ada");
        let mut index = IdentityIndex::new();
        index.add("i:1".to_string(), meta_of(&entity));
        index.add("i:1".to_string(), meta_of(&entity));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_with_stale_key_scans() {
        let entity = Customer::named("Ada");
        let meta = meta_of(&entity);
        let mut index = IdentityIndex::new();
        index.add("n".to_string(), meta.clone());

        assert!(index.remove(Some("i:9"), &meta));
        assert!(index.is_empty());
        assert!(!index.remove(None, &meta));
    }

    #[test]
    fn test_purge_collected() {
        let kept = Customer::named("kept");
        let dropped = Customer::named("dropped");
        let mut index = IdentityIndex::new();
        index.add("i:1".to_string(), meta_of(&kept));
        index.add("i:2".to_string(), meta_of(&dropped));
        drop(dropped);

        assert_eq!(index.purge_collected(), 1);
        assert_eq!(index.len(), 1);
        assert!(Arc::ptr_eq(&index.find("i:1")[0], &meta_of(&kept)));
        assert!(index.find("i:2").is_empty());
    }
}
