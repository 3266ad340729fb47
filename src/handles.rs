use std::sync::Arc;

use tracing::debug;

use crate::cast::{ResolvedCast, UNKNOWN_HANDLE};
use crate::hub::Hub;
use crate::storage::KvCache;

pub fn cache_key(fid: u64) -> String {
    format!("fid:fname:{fid}")
}

/// fid -> handle lookups, cached in the local store.
#[derive(Clone)]
pub struct HandleDirectory {
    hub: Arc<dyn Hub>,
    cache: Arc<dyn KvCache>,
}

impl HandleDirectory {
    pub fn new(hub: Arc<dyn Hub>, cache: Arc<dyn KvCache>) -> Self {
        Self { hub, cache }
    }

    /// Never touches the network.
    pub fn cached(&self, fid: u64) -> Option<String> {
        let bytes = self.cache.get(&cache_key(fid)).ok().flatten()?;
        String::from_utf8(bytes).ok().filter(|name| !name.is_empty())
    }

    /// Cached handle, or a hub lookup; `???` when neither works.
    pub fn lookup(&self, fid: u64) -> String {
        self.fetch(fid).unwrap_or_else(|| UNKNOWN_HANDLE.to_string())
    }

    fn fetch(&self, fid: u64) -> Option<String> {
        if let Some(name) = self.cached(fid) {
            return Some(name);
        }
        match self.hub.display_name(fid) {
            Ok(name) if !name.is_empty() => {
                if let Err(err) = self.cache.set(&cache_key(fid), name.as_bytes()) {
                    debug!(fid, error = %err, "handle cache write failed");
                }
                Some(name)
            }
            Ok(_) => None,
            Err(err) => {
                debug!(fid, error = %err, "handle lookup failed");
                None
            }
        }
    }

    /// Resolves the author and every mention so rendering can stay cache-only.
    /// An author that cannot be resolved keeps an empty handle.
    pub fn warm(&self, cast: &mut ResolvedCast) {
        if cast.author_handle.is_empty() {
            if let Some(name) = self.fetch(cast.author_id) {
                cast.author_handle = name;
            }
        }
        for fid in &cast.mentions {
            self.fetch(*fid);
        }
    }

    pub fn cached_or_unknown(&self, fid: u64) -> String {
        self.cached(fid).unwrap_or_else(|| UNKNOWN_HANDLE.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCache;
    use crate::testing::FakeHub;

    #[test]
    fn lookup_caches_hub_answers() {
        let hub = Arc::new(FakeHub::default());
        hub.add_user("alice", 3);
        let cache = Arc::new(MemoryCache::new());
        let handles = HandleDirectory::new(hub.clone(), cache.clone());

        assert_eq!(handles.cached(3), None);
        assert_eq!(handles.lookup(3), "alice");
        assert_eq!(cache.get("fid:fname:3").unwrap(), Some(b"alice".to_vec()));
        assert_eq!(handles.cached_or_unknown(3), "alice");
    }

    #[test]
    fn unknown_fids_render_as_question_marks() {
        let hub = Arc::new(FakeHub::default());
        let handles = HandleDirectory::new(hub, Arc::new(MemoryCache::new()));
        assert_eq!(handles.lookup(404), "???");
        assert_eq!(handles.cached(404), None);
    }

    #[test]
    fn warm_fills_author_and_mentions() {
        let hub = Arc::new(FakeHub::default());
        hub.add_user("alice", 3);
        hub.add_user("bob", 4);
        let handles = HandleDirectory::new(hub, Arc::new(MemoryCache::new()));
        let mut cast = ResolvedCast {
            author_id: 3,
            mentions: vec![4],
            mention_positions: vec![0],
            ..ResolvedCast::default()
        };
        handles.warm(&mut cast);
        assert_eq!(cast.author_handle, "alice");
        assert_eq!(
            cast.text_with_mentions(|fid| handles.cached_or_unknown(fid)),
            "@bob"
        );
    }

    #[test]
    fn warm_leaves_unresolved_authors_empty() {
        let hub = Arc::new(FakeHub::default());
        let handles = HandleDirectory::new(hub.clone(), Arc::new(MemoryCache::new()));
        let mut cast = ResolvedCast {
            author_id: 5,
            ..ResolvedCast::default()
        };
        handles.warm(&mut cast);
        assert_eq!(cast.author_handle, "");
        assert_eq!(cast.handle_or_unknown(), "???");

        hub.add_user("carol", 5);
        handles.warm(&mut cast);
        assert_eq!(cast.author_handle, "carol");
    }
}
