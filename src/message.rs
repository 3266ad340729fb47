//! CastAdd message construction: protobuf encoding, BLAKE3 hashing and
//! Ed25519 signing, byte-compatible with what hubs accept on `submitMessage`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signer as _, SigningKey};

use crate::cast::PROTOCOL_EPOCH;
use crate::error::{Error, Result};

const HASH_LEN: usize = 20;
/// Casts longer than this many bytes must be sent as long casts.
pub const SHORT_CAST_LIMIT: usize = 320;

const MESSAGE_TYPE_CAST_ADD: u64 = 1;
const NETWORK_MAINNET: u64 = 1;
const HASH_SCHEME_BLAKE3: u64 = 1;
const SIGNATURE_SCHEME_ED25519: u64 = 1;
const CAST_TYPE_LONG_CAST: u64 = 1;

const WIRE_VARINT: u8 = 0;
const WIRE_LEN: u8 = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CastDraft {
    pub text: String,
    pub embeds: Vec<String>,
    pub mentions: Vec<u64>,
    pub mention_positions: Vec<u32>,
}

/// An app key: the 32-byte Ed25519 seed, hex encoded. A 64-byte
/// seed-plus-public-key export is accepted as well.
pub struct Signer {
    key: SigningKey,
}

impl Signer {
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let trimmed = encoded.trim();
        let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes =
            hex::decode(digits).map_err(|err| Error::Signing(format!("invalid key hex: {err}")))?;
        let seed: [u8; 32] = match bytes.len() {
            32 | 64 => bytes[..32]
                .try_into()
                .map_err(|_| Error::Signing("invalid key length".into()))?,
            n => return Err(Error::Signing(format!("expected 32 or 64 key bytes, got {n}"))),
        };
        Ok(Self {
            key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signer(0x{})", hex::encode(self.public_key()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    pub hash: [u8; HASH_LEN],
    /// The encoded `Message`.
    pub bytes: Vec<u8>,
}

impl SignedMessage {
    pub fn hash_hex(&self) -> String {
        format!("0x{}", hex::encode(self.hash))
    }
}

pub fn protocol_timestamp(now: SystemTime) -> u32 {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    u32::try_from(secs.saturating_sub(PROTOCOL_EPOCH)).unwrap_or(u32::MAX)
}

/// Encodes `MessageData` for a CastAdd.
pub fn encode_cast_add(fid: u64, timestamp: u32, draft: &CastDraft) -> Vec<u8> {
    let mut body = Vec::new();
    put_packed(&mut body, 2, draft.mentions.iter().copied());
    put_bytes(&mut body, 4, draft.text.as_bytes());
    put_packed(
        &mut body,
        5,
        draft.mention_positions.iter().map(|p| u64::from(*p)),
    );
    for url in &draft.embeds {
        let mut embed = Vec::new();
        put_bytes(&mut embed, 1, url.as_bytes());
        put_message(&mut body, 6, &embed);
    }
    if draft.text.len() > SHORT_CAST_LIMIT {
        put_varint(&mut body, 8, CAST_TYPE_LONG_CAST);
    }

    let mut data = Vec::new();
    put_varint(&mut data, 1, MESSAGE_TYPE_CAST_ADD);
    put_varint(&mut data, 2, fid);
    put_varint(&mut data, 3, u64::from(timestamp));
    put_varint(&mut data, 4, NETWORK_MAINNET);
    put_message(&mut data, 5, &body);
    data
}

/// Hashes and signs encoded `MessageData`, returning the full `Message`.
pub fn sign(data: &[u8], signer: &Signer) -> SignedMessage {
    let digest = blake3::hash(data);
    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&digest.as_bytes()[..HASH_LEN]);
    let signature = signer.key.sign(&hash);

    let mut message = Vec::with_capacity(data.len() * 2 + 128);
    put_message(&mut message, 1, data);
    put_bytes(&mut message, 2, &hash);
    put_varint(&mut message, 3, HASH_SCHEME_BLAKE3);
    put_bytes(&mut message, 4, &signature.to_bytes());
    put_varint(&mut message, 5, SIGNATURE_SCHEME_ED25519);
    put_bytes(&mut message, 6, &signer.public_key());
    put_bytes(&mut message, 7, data);
    SignedMessage {
        hash,
        bytes: message,
    }
}

pub fn build_cast(fid: u64, draft: &CastDraft, signer: &Signer, now: SystemTime) -> SignedMessage {
    sign(&encode_cast_add(fid, protocol_timestamp(now), draft), signer)
}

fn put_raw_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn put_key(buf: &mut Vec<u8>, field: u32, wire: u8) {
    put_raw_varint(buf, (u64::from(field) << 3) | u64::from(wire));
}

/// Zero is the proto3 default and is left out.
fn put_varint(buf: &mut Vec<u8>, field: u32, value: u64) {
    if value == 0 {
        return;
    }
    put_key(buf, field, WIRE_VARINT);
    put_raw_varint(buf, value);
}

fn put_bytes(buf: &mut Vec<u8>, field: u32, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    put_message(buf, field, bytes);
}

fn put_message(buf: &mut Vec<u8>, field: u32, bytes: &[u8]) {
    put_key(buf, field, WIRE_LEN);
    put_raw_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn put_packed(buf: &mut Vec<u8>, field: u32, values: impl Iterator<Item = u64>) {
    let mut packed = Vec::new();
    for value in values {
        put_raw_varint(&mut packed, value);
    }
    put_bytes(buf, field, &packed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    const SEED: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";

    #[test]
    fn varints_match_protobuf() {
        let mut buf = Vec::new();
        put_raw_varint(&mut buf, 300);
        assert_eq!(buf, [0xac, 0x02]);
        buf.clear();
        put_raw_varint(&mut buf, 1);
        assert_eq!(buf, [0x01]);
    }

    #[test]
    fn cast_add_layout() {
        let draft = CastDraft {
            text: "hi".into(),
            embeds: vec!["u".into()],
            ..CastDraft::default()
        };
        let data = encode_cast_add(3, 100, &draft);
        assert_eq!(
            data,
            [
                0x08, 0x01, 0x10, 0x03, 0x18, 0x64, 0x20, 0x01, 0x2a, 0x09, 0x22, 0x02, b'h',
                b'i', 0x32, 0x03, 0x0a, 0x01, b'u'
            ]
        );
    }

    #[test]
    fn mentions_are_packed() {
        let draft = CastDraft {
            mentions: vec![3, 300],
            mention_positions: vec![0],
            ..CastDraft::default()
        };
        let data = encode_cast_add(1, 1, &draft);
        let body = &data[10..];
        assert_eq!(body, [0x12, 0x03, 0x03, 0xac, 0x02, 0x2a, 0x01, 0x00]);
    }

    #[test]
    fn long_text_is_a_long_cast() {
        let draft = CastDraft {
            text: "x".repeat(SHORT_CAST_LIMIT + 1),
            ..CastDraft::default()
        };
        let data = encode_cast_add(1, 1, &draft);
        assert_eq!(&data[data.len() - 2..], [0x40, 0x01]);
    }

    #[test]
    fn signature_verifies_over_truncated_hash() {
        let signer = Signer::from_hex(SEED).unwrap();
        let data = encode_cast_add(3, 100, &CastDraft::default());
        let signed = sign(&data, &signer);

        assert_eq!(signed.hash[..], blake3::hash(&data).as_bytes()[..20]);
        assert!(signed.hash_hex().starts_with("0x"));
        assert_eq!(signed.hash_hex().len(), 42);

        // data, hash and hash scheme come first; then key 0x22, length 64.
        let at = 2 + data.len() + 2 + HASH_LEN + 2;
        assert_eq!(signed.bytes[at..at + 2], [0x22, 0x40]);
        let sig: [u8; 64] = signed.bytes[at + 2..at + 66].try_into().unwrap();
        let key = VerifyingKey::from_bytes(&signer.public_key()).unwrap();
        key.verify(&signed.hash, &Signature::from_bytes(&sig)).unwrap();
    }

    #[test]
    fn keys_must_be_hex_seeds() {
        assert!(Signer::from_hex("0x1234").is_err());
        assert!(Signer::from_hex("zz").is_err());
        let long = format!("0x{SEED}{SEED}");
        assert!(Signer::from_hex(&long).is_ok());
    }

    #[test]
    fn timestamps_are_protocol_relative() {
        let at = UNIX_EPOCH + Duration::from_secs(PROTOCOL_EPOCH + 42);
        assert_eq!(protocol_timestamp(at), 42);
        assert_eq!(protocol_timestamp(UNIX_EPOCH), 0);
    }
}
