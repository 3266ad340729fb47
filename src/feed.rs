use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cast::{self, ResolvedCast};
use crate::checkpoint::{CheckpointStore, SyncCheckpoint};
use crate::enclosure::EnclosureResolver;
use crate::error::{Error, Result};
use crate::hub::Hub;

pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Newest first, metadata resolved.
    pub new_casts: Vec<ResolvedCast>,
    pub checkpoint: SyncCheckpoint,
}

/// Walks an author's casts newest-first until it reaches the previous frontier.
#[derive(Clone)]
pub struct FeedWalker {
    hub: Arc<dyn Hub>,
    resolver: EnclosureResolver,
    max_pages: Option<u32>,
}

impl FeedWalker {
    pub fn new(hub: Arc<dyn Hub>, resolver: EnclosureResolver) -> Self {
        Self {
            hub,
            resolver,
            max_pages: None,
        }
    }

    /// Stops a walk after `pages` pages even when the hub has more.
    pub fn with_max_pages(mut self, pages: Option<u32>) -> Self {
        self.max_pages = pages.filter(|pages| *pages > 0);
        self
    }

    pub fn sync_author(
        &self,
        handle: &str,
        page_size: u32,
        prior: &SyncCheckpoint,
    ) -> Result<SyncOutcome> {
        let handle = handle.trim_start_matches('@');
        let author_id = self.hub.resolve_author_id(handle)?;
        debug!(handle, author_id, frontier = %prior.last_hash, "sync started");

        let mut seen = HashSet::new();
        let mut newest: Option<String> = None;
        let mut new_casts = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0u32;

        'walk: loop {
            let page = self
                .hub
                .posts_page(author_id, page_token.as_deref(), page_size, true)?;
            pages += 1;

            for raw in &page.posts {
                let hash = cast::cast_hash(&raw.hash)?;
                if !prior.last_hash.is_empty() && hash == prior.last_hash {
                    debug!(handle, %hash, "reached previous frontier");
                    break 'walk;
                }
                if !seen.insert(hash.clone()) {
                    continue;
                }
                if newest.is_none() {
                    newest = Some(hash);
                }
                let Some(mut cast) = cast::decode(raw)? else {
                    continue;
                };
                cast.author_handle = handle.to_string();
                cast.enclosure = Some(self.resolver.resolve(&cast.enclosure_cid)?);
                new_casts.push(cast);
            }

            match page.next_page_token {
                Some(token) if self.max_pages.map_or(true, |max| pages < max) => {
                    page_token = Some(token);
                }
                Some(_) => {
                    warn!(handle, pages, "page limit reached before the frontier");
                    break;
                }
                None => break,
            }
        }

        let Some(last_hash) = newest else {
            return Ok(SyncOutcome {
                new_casts,
                checkpoint: prior.clone(),
            });
        };
        info!(handle, new = new_casts.len(), "sync finished");
        let mut casts = new_casts.clone();
        casts.extend(prior.casts.iter().cloned());
        Ok(SyncOutcome {
            new_casts,
            checkpoint: SyncCheckpoint { last_hash, casts },
        })
    }

    /// One full pass for `handle`: load its checkpoint, walk, and persist the
    /// new checkpoint. A failed walk leaves the stored checkpoint untouched.
    pub fn sync_and_save(
        &self,
        checkpoints: &CheckpointStore,
        handle: &str,
        page_size: u32,
    ) -> Result<SyncOutcome> {
        let handle = handle.trim_start_matches('@');
        let prior = checkpoints.load(handle)?;
        let outcome = self.sync_author(handle, page_size, &prior)?;
        checkpoints.save(handle, &outcome.checkpoint)?;
        Ok(outcome)
    }

    /// Latest enclosure casts of one author, without metadata.
    pub fn recent_casts(&self, author_id: u64, limit: usize) -> Result<Vec<ResolvedCast>> {
        let page_size = u32::try_from(limit.clamp(1, DEFAULT_PAGE_SIZE as usize))
            .unwrap_or(DEFAULT_PAGE_SIZE);
        let mut casts = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0u32;
        loop {
            let page = self
                .hub
                .posts_page(author_id, page_token.as_deref(), page_size, true)?;
            pages += 1;
            for raw in &page.posts {
                match cast::decode(raw) {
                    Ok(Some(cast)) => casts.push(cast),
                    Ok(None) => {}
                    Err(err) => warn!(author_id, error = %err, "skipping undecodable cast"),
                }
                if casts.len() >= limit {
                    return Ok(casts);
                }
            }
            match page.next_page_token {
                Some(token) if self.max_pages.map_or(true, |max| pages < max) => {
                    page_token = Some(token);
                }
                _ => return Ok(casts),
            }
        }
    }

    /// One cast by `@handle` and hash, with its metadata resolved.
    pub fn fetch_cast(&self, handle: &str, hash: &str) -> Result<ResolvedCast> {
        let handle = handle.trim_start_matches('@');
        let hash = cast::cast_hash(hash)?;
        let author_id = self.hub.resolve_author_id(handle)?;
        let raw = self.hub.get_post(author_id, &hash)?;
        let mut cast = cast::decode(&raw)?.ok_or_else(|| Error::NoEnclosure(hash.clone()))?;
        cast.author_handle = handle.to_string();
        cast.enclosure = Some(self.resolver.resolve(&cast.enclosure_cid)?);
        Ok(cast)
    }
}

/// Splits `@handle/0xhash`.
pub fn parse_cast_reference(reference: &str) -> Option<(&str, &str)> {
    let (handle, hash) = reference.split_once('/')?;
    let handle = handle.strip_prefix('@')?;
    if handle.is_empty() || hash.is_empty() || hash.contains('/') {
        return None;
    }
    Some((handle, hash))
}
