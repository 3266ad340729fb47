use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::enclosure::EnclosureMetadata;
use crate::error::{Error, Result};
use crate::hub::RawPost;

/// Seconds between the UNIX epoch and the protocol epoch (2021-01-01T00:00:00Z).
pub const PROTOCOL_EPOCH: u64 = 1_609_459_200;

/// Embed URL scheme marking a lemon3 enclosure; the rest of the URL is the DAG cid.
pub const ENCLOSURE_PREFIX: &str = "lemon3+ipfs://";

pub const UNKNOWN_HANDLE: &str = "???";

/// A cast known to carry a lemon3 enclosure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResolvedCast {
    #[serde(rename = "fid")]
    pub author_id: u64,
    #[serde(rename = "fname", default)]
    pub author_handle: String,
    /// Absolute UNIX seconds.
    pub timestamp: u64,
    pub hash: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mention_positions: Vec<u32>,
    #[serde(rename = "cid")]
    pub enclosure_cid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enclosure: Option<EnclosureMetadata>,
}

impl ResolvedCast {
    pub fn posted_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.timestamp as i64, 0)
            .single()
            .unwrap_or_default()
    }

    pub fn handle_or_unknown(&self) -> &str {
        if self.author_handle.is_empty() {
            UNKNOWN_HANDLE
        } else {
            &self.author_handle
        }
    }

    /// Directory name for this author's downloads: the handle, or `fid-<n>`
    /// while the handle is unknown.
    pub fn directory_name(&self) -> String {
        if self.author_handle.is_empty() {
            format!("fid-{}", self.author_id)
        } else {
            self.author_handle.clone()
        }
    }

    /// `@handle/0xhash`, the form the `download` command accepts.
    pub fn reference(&self) -> String {
        format!("@{}/{}", self.handle_or_unknown(), self.hash)
    }

    /// Body text with every mention replaced by `@handle`.
    ///
    /// Positions are byte offsets into `text`. Out-of-range, decreasing or
    /// mid-character positions are skipped.
    pub fn text_with_mentions<F>(&self, mut handle_for: F) -> String
    where
        F: FnMut(u64) -> String,
    {
        let mut out = String::with_capacity(self.text.len());
        let mut cursor = 0usize;
        for (fid, position) in self.mentions.iter().zip(&self.mention_positions) {
            let position = *position as usize;
            let Some(chunk) = self
                .text
                .get(cursor..position)
                .filter(|_| position >= cursor)
            else {
                continue;
            };
            out.push_str(chunk);
            out.push('@');
            out.push_str(&handle_for(*fid));
            cursor = position;
        }
        out.push_str(self.text.get(cursor..).unwrap_or_default());
        out
    }
}

/// Returns the enclosure cid of the first embed using the lemon3 scheme.
pub fn enclosure_cid(raw: &RawPost) -> Option<&str> {
    raw.embeds
        .iter()
        .find_map(|url| url.strip_prefix(ENCLOSURE_PREFIX))
}

pub fn is_enclosure_post(raw: &RawPost) -> bool {
    enclosure_cid(raw).is_some()
}

/// Canonical `0x`-prefixed lowercase hex form of a post hash.
pub fn cast_hash(raw: &str) -> Result<String> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    let bytes = hex::decode(digits).map_err(|_| Error::MalformedHash(raw.to_string()))?;
    if bytes.is_empty() {
        return Err(Error::MalformedHash(raw.to_string()));
    }
    Ok(format!("0x{}", hex::encode(bytes)))
}

/// Interprets a hub post. `Ok(None)` means the post carries no enclosure,
/// which is the common case and not an error. Performs no I/O.
pub fn decode(raw: &RawPost) -> Result<Option<ResolvedCast>> {
    let Some(cid) = enclosure_cid(raw) else {
        return Ok(None);
    };
    let hash = cast_hash(&raw.hash)?;
    Ok(Some(ResolvedCast {
        author_id: raw.author_id,
        author_handle: String::new(),
        timestamp: u64::from(raw.timestamp) + PROTOCOL_EPOCH,
        hash,
        text: raw.text.clone(),
        mentions: raw.mentions.clone(),
        mention_positions: raw.mention_positions.clone(),
        enclosure_cid: cid.to_string(),
        enclosure: None,
    }))
}
