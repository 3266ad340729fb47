use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ipfs::ObjectStore;
use crate::storage::KvCache;

const CACHE_PREFIX: &str = "enclosure:";

/// An IPLD link, serialized as `{"/": "<cid>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Link {
    #[serde(rename = "/")]
    pub cid: String,
}

impl Link {
    pub fn new(cid: impl Into<String>) -> Self {
        Self { cid: cid.into() }
    }
}

/// The DAG document a lemon3 cast points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EnclosureMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub mime_type: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    pub enclosed: Link,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork: Option<Link>,
}

impl EnclosureMetadata {
    pub fn file_cid(&self) -> &str {
        &self.enclosed.cid
    }

    pub fn artwork_cid(&self) -> Option<&str> {
        self.artwork.as_ref().map(|link| link.cid.as_str())
    }

    pub fn human_size(&self) -> String {
        const KB: f64 = 1024.0;
        let size = self.size as f64;
        if self.size < 1024 {
            format!("{} B", self.size)
        } else if size < KB * KB {
            format!("{:.2} KB", size / KB)
        } else if size < KB * KB * KB {
            format!("{:.2} MB", size / (KB * KB))
        } else {
            format!("{:.2} GB", size / (KB * KB * KB))
        }
    }

    /// Builds typed metadata from an untyped DAG document.
    pub fn from_document(cid: &str, doc: &Map<String, Value>) -> Result<Self> {
        let enclosed = match doc.get("enclosed") {
            None => return Err(Error::malformed_metadata(cid, "missing 'enclosed' field")),
            Some(value) => link_cid(value).ok_or_else(|| {
                Error::malformed_metadata(cid, "'enclosed' is not a {\"/\": cid} link")
            })?,
        };
        let text = |key: &str| {
            doc.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let mut filename = text("filename");
        if filename.is_empty() {
            filename = enclosed.clone();
        }
        Ok(Self {
            title: text("title"),
            description: text("description"),
            mime_type: text("type"),
            filename,
            size: doc.get("size").map_or(0, coerce_size),
            enclosed: Link::new(enclosed),
            artwork: doc.get("artwork").and_then(link_cid).map(Link::new),
        })
    }
}

fn link_cid(value: &Value) -> Option<String> {
    value
        .as_object()?
        .get("/")?
        .as_str()
        .filter(|cid| !cid.is_empty())
        .map(str::to_string)
}

/// Integers pass through, floats truncate toward zero, anything else is 0.
fn coerce_size(value: &Value) -> u64 {
    if let Some(size) = value.as_u64() {
        return size;
    }
    match value.as_f64() {
        Some(size) if size.is_finite() && size > 0.0 => size.trunc() as u64,
        _ => 0,
    }
}

pub fn cache_key(cid: &str) -> String {
    format!("{CACHE_PREFIX}{cid}")
}

/// Resolves enclosure cids to metadata, reading through the local cache.
#[derive(Clone)]
pub struct EnclosureResolver {
    store: Arc<dyn ObjectStore>,
    cache: Arc<dyn KvCache>,
}

impl EnclosureResolver {
    pub fn new(store: Arc<dyn ObjectStore>, cache: Arc<dyn KvCache>) -> Self {
        Self { store, cache }
    }

    pub fn resolve(&self, cid: &str) -> Result<EnclosureMetadata> {
        if let Some(meta) = self.cached(cid) {
            return Ok(meta);
        }

        debug!(cid, "resolving enclosure metadata");
        let doc = self.store.get_dag(cid)?;
        let meta = EnclosureMetadata::from_document(cid, &doc)?;

        match serde_json::to_vec(&meta) {
            Ok(bytes) => {
                if let Err(err) = self.cache.set(&cache_key(cid), &bytes) {
                    warn!(cid, error = %err, "failed to cache enclosure metadata");
                }
            }
            Err(err) => warn!(cid, error = %err, "failed to encode enclosure metadata"),
        }
        Ok(meta)
    }

    /// Cache-only lookup. Read failures and undecodable entries count as misses.
    pub fn cached(&self, cid: &str) -> Option<EnclosureMetadata> {
        let bytes = match self.cache.get(&cache_key(cid)) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                warn!(cid, error = %err, "enclosure cache read failed");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(meta) => Some(meta),
            Err(err) => {
                warn!(cid, error = %err, "ignoring undecodable cached enclosure");
                None
            }
        }
    }
}
