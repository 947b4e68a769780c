//! The document cache: the best-known document of each family.
//!
//! Documents are never changed after they are parsed; a newer one replaces
//! the old one by swapping an [`Arc`], so readers holding the old one keep
//! a consistent view until they drop it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info};

use crate::certificate::KeyCertificateSet;
use crate::consensus::Consensus;
use crate::descriptor::RouterDescriptor;

/// An optional [`Arc`] that can be replaced while others read it.
#[derive(Debug)]
pub struct SharedArc<T> {
    /// Never held across a suspension point.
    inner: RwLock<Option<Arc<T>>>,
}

impl<T> Default for SharedArc<T> {
    fn default() -> Self {
        SharedArc {
            inner: RwLock::new(None),
        }
    }
}

impl<T> SharedArc<T> {
    pub fn new() -> Self {
        SharedArc::default()
    }

    /// Replace the current value with `value`.
    pub fn replace(&self, value: Arc<T>) {
        let mut w = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *w = Some(value);
    }

    /// Return a new reference to the current value, if there is one.
    pub fn get(&self) -> Option<Arc<T>> {
        let r = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        r.as_ref().map(Arc::clone)
    }

    pub fn clear(&self) {
        let mut w = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *w = None;
    }
}

/// A descriptor held in the cache, with the text it was parsed from.
#[derive(Debug, Clone)]
pub struct CachedDescriptor {
    pub descriptor: Arc<RouterDescriptor>,
    pub fetched_at: i64,
    pub raw: Arc<str>,
}

/// Current documents, shared between the coordinator and its readers.
#[derive(Debug, Default)]
pub struct DocumentCache {
    consensus: SharedArc<Consensus>,
    certificates: SharedArc<KeyCertificateSet>,
    /// Keyed by base64 identity digest, as listed in the consensus.
    descriptors: RwLock<HashMap<String, CachedDescriptor>>,
}

impl DocumentCache {
    pub fn new() -> Self {
        DocumentCache::default()
    }

    pub fn consensus(&self) -> Option<Arc<Consensus>> {
        self.consensus.get()
    }

    pub fn set_consensus(&self, consensus: Consensus) -> Arc<Consensus> {
        let consensus = Arc::new(consensus);
        info!(
            relays = consensus.relays.len(),
            valid_after = ?consensus.preamble.valid_after,
            "installed new consensus"
        );
        self.consensus.replace(Arc::clone(&consensus));
        consensus
    }

    pub fn certificates(&self) -> Option<Arc<KeyCertificateSet>> {
        self.certificates.get()
    }

    pub fn set_certificates(&self, certificates: KeyCertificateSet) {
        info!(n = certificates.len(), "installed new key certificates");
        self.certificates.replace(Arc::new(certificates));
    }

    pub fn descriptor(&self, identity: &str) -> Option<Arc<RouterDescriptor>> {
        self.read_descriptors()
            .get(identity)
            .map(|c| Arc::clone(&c.descriptor))
    }

    pub fn descriptor_count(&self) -> usize {
        self.read_descriptors().len()
    }

    /// Store a descriptor unless the one already held for `identity` was
    /// published at the same time or later. Returns true if stored.
    pub fn insert_descriptor(
        &self,
        identity: &str,
        descriptor: RouterDescriptor,
        raw: &str,
        now: i64,
    ) -> bool {
        let mut w = self
            .descriptors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = w.get(identity) {
            if old.descriptor.published >= descriptor.published {
                debug!(identity, "keeping the descriptor we already have");
                return false;
            }
        }
        w.insert(
            identity.to_string(),
            CachedDescriptor {
                descriptor: Arc::new(descriptor),
                fetched_at: now,
                raw: Arc::from(raw),
            },
        );
        true
    }

    /// Evict descriptors held longer than `retention`. Returns how many went.
    pub fn evict_descriptors(&self, now: i64, retention: Duration) -> usize {
        let retention = i64::try_from(retention.as_secs()).unwrap_or(i64::MAX);
        let mut w = self
            .descriptors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = w.len();
        w.retain(|_, c| now - c.fetched_at < retention);
        let evicted = before - w.len();
        if evicted > 0 {
            debug!(evicted, "evicted expired descriptors");
        }
        evicted
    }

    /// All held descriptors as one blob, in identity order.
    pub fn descriptors_raw(&self) -> String {
        let r = self.read_descriptors();
        let mut identities: Vec<&String> = r.keys().collect();
        identities.sort();
        identities
            .into_iter()
            .filter_map(|id| r.get(id))
            .map(|c| c.raw.as_ref())
            .collect::<Vec<_>>()
            .concat()
    }

    fn read_descriptors(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, CachedDescriptor>> {
        self.descriptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SIG: &str = "-----BEGIN SIGNATURE-----\nAAAA\n-----END SIGNATURE-----\n";
    const KEY: &str = "-----BEGIN RSA PUBLIC KEY-----\nAAAA\n-----END RSA PUBLIC KEY-----\n";

    fn descriptor(published: &str) -> (RouterDescriptor, String) {
        let raw = format!(
            "router relay1 10.0.0.1 9001 0 0\npublished {}\nbandwidth 1 2 3\nsigning-key\n{}router-signature\n{}",
            published, KEY, SIG
        );
        (RouterDescriptor::parse(&raw).unwrap(), raw)
    }

    #[test]
    fn shared_arc_swaps() {
        let shared = SharedArc::new();
        assert!(shared.get().is_none());
        shared.replace(Arc::new(1));
        let old = shared.get().unwrap();
        shared.replace(Arc::new(2));
        assert_eq!(*old, 1);
        assert_eq!(*shared.get().unwrap(), 2);
        shared.clear();
        assert!(shared.get().is_none());
    }

    #[test]
    fn consensus_swap_keeps_readers_consistent() {
        let cache = DocumentCache::new();
        let first = cache.set_consensus(
            Consensus::parse("network-status-version 3\nvote-status consensus\n").unwrap(),
        );
        let reader = cache.consensus().unwrap();
        cache.set_consensus(
            Consensus::parse("network-status-version 3\nvote-status consensus\nconsensus-method 20\n")
                .unwrap(),
        );
        assert!(Arc::ptr_eq(&first, &reader));
        assert_eq!(reader.preamble.consensus_method, None);
        assert_eq!(cache.consensus().unwrap().preamble.consensus_method, Some(20));
    }

    #[test]
    fn newer_descriptor_replaces_older() {
        let cache = DocumentCache::new();
        let (old, old_raw) = descriptor("2014-04-24 02:45:39");
        let (new, new_raw) = descriptor("2014-04-24 14:45:39");

        assert!(cache.insert_descriptor("id", new.clone(), &new_raw, 100));
        assert!(!cache.insert_descriptor("id", old.clone(), &old_raw, 200));
        assert_eq!(cache.descriptor("id").unwrap().published, new.published);

        let cache = DocumentCache::new();
        assert!(cache.insert_descriptor("id", old, &old_raw, 100));
        assert!(cache.insert_descriptor("id", new, &new_raw, 200));
        assert_eq!(cache.descriptors_raw(), new_raw);
    }

    #[test]
    fn retention() {
        let cache = DocumentCache::new();
        let (d, raw) = descriptor("2014-04-24 02:45:39");
        let day = 24 * 3600;
        cache.insert_descriptor("a", d.clone(), &raw, 0);
        cache.insert_descriptor("b", d, &raw, day);
        let retention = Duration::from_secs(2 * day as u64);
        assert_eq!(cache.evict_descriptors(2 * day - 1, retention), 0);
        assert_eq!(cache.evict_descriptors(2 * day, retention), 1);
        assert!(cache.descriptor("a").is_none());
        assert_eq!(cache.descriptor_count(), 1);
    }
}
