//! In-memory hub, storage node and cache used by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::cast::cast_hash;
use crate::error::{Error, Result};
use crate::hub::{EventStream, Hub, HubEvent, PostsPage, RawPost};
use crate::ipfs::{ObjectStore, Progress};
use crate::storage::KvCache;

pub enum Scripted {
    Event(HubEvent),
    Fail(String),
    End,
}

#[derive(Default)]
pub struct FakeHub {
    users: Mutex<HashMap<String, u64>>,
    /// Oldest first, as posted.
    posts: Mutex<Vec<RawPost>>,
    follows: Mutex<HashMap<u64, Vec<u64>>>,
    script: Mutex<Option<Vec<Scripted>>>,
    submitted: Mutex<Vec<Vec<u8>>>,
    pages: Mutex<usize>,
}

impl FakeHub {
    pub fn add_user(&self, name: &str, fid: u64) {
        self.users.lock().insert(name.to_string(), fid);
    }

    pub fn post(&self, fid: u64, hash: &str, embeds: &[&str]) -> RawPost {
        let timestamp = self.posts.lock().len() as u32 + 1;
        let post = RawPost {
            author_id: fid,
            hash: hash.to_string(),
            timestamp,
            text: format!("post {hash}"),
            embeds: embeds.iter().map(|e| e.to_string()).collect(),
            ..RawPost::default()
        };
        self.posts.lock().push(post.clone());
        post
    }

    pub fn follow(&self, fid: u64, target: u64) {
        self.follows.lock().entry(fid).or_default().push(target);
    }

    pub fn script(&self, events: Vec<Scripted>) {
        *self.script.lock() = Some(events);
    }

    pub fn pages_served(&self) -> usize {
        *self.pages.lock()
    }

    pub fn submitted(&self) -> Vec<Vec<u8>> {
        self.submitted.lock().clone()
    }
}

impl Hub for FakeHub {
    fn resolve_author_id(&self, handle: &str) -> Result<u64> {
        let name = handle.trim_start_matches('@');
        self.users
            .lock()
            .get(name)
            .copied()
            .ok_or_else(|| Error::AuthorNotFound(name.to_string()))
    }

    fn posts_page(
        &self,
        author_id: u64,
        page_token: Option<&str>,
        page_size: u32,
        reverse: bool,
    ) -> Result<PostsPage> {
        *self.pages.lock() += 1;
        let mut posts: Vec<RawPost> = self
            .posts
            .lock()
            .iter()
            .filter(|post| post.author_id == author_id)
            .cloned()
            .collect();
        if reverse {
            posts.reverse();
        }
        let offset: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (offset + page_size as usize).min(posts.len());
        let page = posts.get(offset..end).unwrap_or_default().to_vec();
        Ok(PostsPage {
            posts: page,
            next_page_token: (end < posts.len()).then(|| end.to_string()),
        })
    }

    fn get_post(&self, author_id: u64, hash: &str) -> Result<RawPost> {
        let wanted = cast_hash(hash)?;
        self.posts
            .lock()
            .iter()
            .find(|post| {
                post.author_id == author_id
                    && cast_hash(&post.hash).map_or(false, |h| h == wanted)
            })
            .cloned()
            .ok_or_else(|| Error::transport("hub: castById", "not found"))
    }

    fn display_name(&self, fid: u64) -> Result<String> {
        self.users
            .lock()
            .iter()
            .find(|(_, id)| **id == fid)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| Error::transport("hub: userDataByFid", "not found"))
    }

    fn following(&self, fid: u64, limit: u32) -> Result<Vec<u64>> {
        let follows = self.follows.lock();
        let mut targets = follows.get(&fid).cloned().unwrap_or_default();
        targets.truncate(limit as usize);
        Ok(targets)
    }

    fn subscribe(&self) -> Result<Box<dyn EventStream>> {
        let script = self
            .script
            .lock()
            .take()
            .ok_or_else(|| Error::transport("hub: events", "subscription refused"))?;
        Ok(Box::new(ScriptedStream {
            events: script.into(),
        }))
    }

    fn submit_message(&self, message: &[u8]) -> Result<String> {
        self.submitted.lock().push(message.to_vec());
        Ok("0xfeed".to_string())
    }
}

struct ScriptedStream {
    events: VecDeque<Scripted>,
}

impl EventStream for ScriptedStream {
    fn next_event(&mut self) -> Result<Option<HubEvent>> {
        match self.events.pop_front() {
            Some(Scripted::Event(event)) => Ok(Some(event)),
            Some(Scripted::Fail(reason)) => Err(Error::transport("hub: events", reason)),
            Some(Scripted::End) | None => Ok(None),
        }
    }
}

#[derive(Default)]
pub struct FakeStorage {
    documents: Mutex<HashMap<String, Map<String, Value>>>,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    pins: Mutex<Vec<String>>,
    dag_reads: Mutex<Vec<String>>,
    next_id: Mutex<usize>,
}

impl FakeStorage {
    pub fn put_document(&self, cid: &str, doc: Value) {
        let map = match doc {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.documents.lock().insert(cid.to_string(), map);
    }

    pub fn document(&self, cid: &str) -> Option<Map<String, Value>> {
        self.documents.lock().get(cid).cloned()
    }

    pub fn put_bytes(&self, cid: &str, bytes: &[u8]) {
        self.objects.lock().insert(cid.to_string(), bytes.to_vec());
    }

    pub fn fail_object(&self, cid: &str) {
        self.failing.lock().insert(cid.to_string());
    }

    pub fn dag_reads(&self) -> usize {
        self.dag_reads.lock().len()
    }

    pub fn was_read(&self, cid: &str) -> bool {
        self.dag_reads.lock().iter().any(|read| read == cid)
    }

    pub fn pinned(&self) -> Vec<String> {
        self.pins.lock().clone()
    }

    fn next_cid(&self, kind: &str) -> String {
        let mut next = self.next_id.lock();
        *next += 1;
        format!("bafy{kind}{next}")
    }
}

impl ObjectStore for FakeStorage {
    fn put_object(&self, bytes: &[u8]) -> Result<String> {
        let cid = self.next_cid("obj");
        self.put_bytes(&cid, bytes);
        Ok(cid)
    }

    fn add_file(&self, path: &Path, progress: Progress<'_>) -> Result<String> {
        let bytes = fs::read(path).map_err(|err| Error::local_state("fake add", err))?;
        progress(bytes.len() as u64, bytes.len() as u64);
        self.put_object(&bytes)
    }

    fn get_object(&self, cid: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .get(cid)
            .cloned()
            .ok_or_else(|| Error::transport(format!("ipfs: cat {cid}"), "not found"))
    }

    fn get_object_to_file(
        &self,
        cid: &str,
        path: &Path,
        expected_size: u64,
        progress: Progress<'_>,
    ) -> Result<u64> {
        if self.failing.lock().contains(cid) {
            return Err(Error::transport(format!("ipfs: cat {cid}"), "connection reset"));
        }
        let bytes = self.get_object(cid)?;
        let mut written = 0u64;
        for chunk in bytes.chunks(4) {
            written += chunk.len() as u64;
            progress(written, expected_size);
        }
        fs::write(path, &bytes).map_err(|err| Error::local_state("fake write", err))?;
        Ok(written)
    }

    fn put_dag(&self, doc: &Map<String, Value>) -> Result<String> {
        let cid = self.next_cid("dag");
        self.documents.lock().insert(cid.clone(), doc.clone());
        Ok(cid)
    }

    fn get_dag(&self, cid: &str) -> Result<Map<String, Value>> {
        self.dag_reads.lock().push(cid.to_string());
        self.document(cid)
            .ok_or_else(|| Error::transport(format!("ipfs: dag/get {cid}"), "not found"))
    }

    fn pin(&self, cid: &str) -> Result<()> {
        self.pins.lock().push(cid.to_string());
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Reads miss, writes fail.
pub struct FailingCache;

impl KvCache for FailingCache {
    fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn set(&self, key: &str, _value: &[u8]) -> Result<()> {
        Err(Error::local_state(format!("cache: set {key}"), "disk full"))
    }
}
