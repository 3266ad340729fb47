use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde_json::{json, Map, Value};
use tracing::info;

use crate::cast::ENCLOSURE_PREFIX;
use crate::enclosure::{EnclosureMetadata, Link};
use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::ipfs::ObjectStore;
use crate::message::{self, CastDraft, Signer};

pub const DEFAULT_GATEWAY_URL: &str = "https://lemon3.vrypan.workers.dev/";
pub const DEFAULT_CAST_TEXT: &str = "Uploaded with lemon3";
const FALLBACK_MIME: &str = "application/octet-stream";

#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub file: PathBuf,
    pub artwork: Option<PathBuf>,
    /// Defaults to the file name.
    pub title: Option<String>,
    /// Overrides the file name recorded in the metadata.
    pub filename: Option<String>,
    /// Overrides content sniffing.
    pub mime_type: Option<String>,
    pub description: String,
    pub cast_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    File,
    Artwork,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub metadata_cid: String,
    pub metadata: EnclosureMetadata,
    pub cast_hash: String,
}

/// Stores a file and its metadata document, then announces it in a signed cast.
pub struct Publisher {
    hub: Arc<dyn Hub>,
    store: Arc<dyn ObjectStore>,
    gateway_url: String,
    fid: u64,
    signer: Signer,
}

impl Publisher {
    pub fn new(
        hub: Arc<dyn Hub>,
        store: Arc<dyn ObjectStore>,
        gateway_url: impl Into<String>,
        fid: u64,
        signer: Signer,
    ) -> Self {
        Self {
            hub,
            store,
            gateway_url: gateway_url.into(),
            fid,
            signer,
        }
    }

    pub fn publish(
        &self,
        request: &UploadRequest,
        on_progress: &mut dyn FnMut(UploadStage, u64, u64),
    ) -> Result<Published> {
        let size = fs::metadata(&request.file)
            .map_err(|err| {
                Error::local_state(format!("upload: stat {}", request.file.display()), err)
            })?
            .len();

        let file_cid = self.store_file(&request.file, UploadStage::File, on_progress)?;
        let artwork_cid = match &request.artwork {
            Some(path) => Some(self.store_file(path, UploadStage::Artwork, on_progress)?),
            None => None,
        };

        let default_name = file_name(&request.file);
        let metadata = EnclosureMetadata {
            title: non_empty(request.title.as_deref()).unwrap_or(default_name.as_str()).to_string(),
            description: request.description.clone(),
            mime_type: match non_empty(request.mime_type.as_deref()) {
                Some(mime) => mime.to_string(),
                None => detect_mime(&request.file),
            },
            filename: non_empty(request.filename.as_deref())
                .unwrap_or(default_name.as_str())
                .to_string(),
            size,
            enclosed: Link::new(file_cid),
            artwork: artwork_cid.map(Link::new),
        };

        let metadata_cid = self.store.put_dag(&metadata_document(&metadata))?;
        self.store.pin(&metadata_cid)?;
        info!(cid = %metadata_cid, "metadata stored");

        let draft = CastDraft {
            text: request.cast_text.clone(),
            embeds: enclosure_embeds(&self.gateway_url, &metadata_cid),
            ..CastDraft::default()
        };
        let signed = message::build_cast(self.fid, &draft, &self.signer, SystemTime::now());
        let accepted = self.hub.submit_message(&signed.bytes)?;
        let cast_hash = if accepted.is_empty() {
            signed.hash_hex()
        } else {
            accepted
        };
        info!(hash = %cast_hash, "cast submitted");

        Ok(Published {
            metadata_cid,
            metadata,
            cast_hash,
        })
    }

    fn store_file(
        &self,
        path: &Path,
        stage: UploadStage,
        on_progress: &mut dyn FnMut(UploadStage, u64, u64),
    ) -> Result<String> {
        let cid = self
            .store
            .add_file(path, &mut |done, total| on_progress(stage, done, total))?;
        let cid = cid.trim_start_matches("/ipfs/").to_string();
        self.store.pin(&cid)?;
        info!(path = %path.display(), %cid, "file stored and pinned");
        Ok(cid)
    }
}

/// The DAG document shape readers parse back into [`EnclosureMetadata`].
pub fn metadata_document(meta: &EnclosureMetadata) -> Map<String, Value> {
    let mut doc = Map::new();
    doc.insert("title".into(), json!(meta.title));
    doc.insert("description".into(), json!(meta.description));
    doc.insert("type".into(), json!(meta.mime_type));
    doc.insert("filename".into(), json!(meta.filename));
    doc.insert("size".into(), json!(meta.size));
    doc.insert("enclosed".into(), json!({ "/": meta.enclosed.cid }));
    if let Some(artwork) = &meta.artwork {
        doc.insert("artwork".into(), json!({ "/": artwork.cid }));
    }
    doc
}

/// A browsable gateway link first, then the machine-readable enclosure link.
pub fn enclosure_embeds(gateway_url: &str, cid: &str) -> Vec<String> {
    let gateway = gateway_url.trim_end_matches('/');
    let mut embeds = Vec::with_capacity(2);
    if !gateway.is_empty() {
        embeds.push(format!("{gateway}/{cid}"));
    }
    embeds.push(format!("{ENCLOSURE_PREFIX}{cid}"));
    embeds
}

pub fn detect_mime(path: &Path) -> String {
    tree_magic_mini::from_filepath(path)
        .unwrap_or(FALLBACK_MIME)
        .to_string()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
