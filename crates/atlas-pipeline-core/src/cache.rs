//! Build cache keyed by the structural hash of a finalized layout.
//!
//! The key covers rectangle geometry and resource ids only. Pixel content is not part of
//! it, so a resource whose bytes change without changing its envelope keeps hitting the
//! cached atlas.

use crate::error::{AtlasPipelineError, Result};
use crate::model::{
    ATLAS_EXTENSION_ID, ContentHash, PostProcessOperation, Rect, Resource, ResourceId,
    ResourceKind, ResourceRef,
};
use crate::orchestrator::AcceptedLayout;
use crate::store::ResourceStore;
use serde::Serialize;
use sha2::Digest as _;
use xxhash_rust::xxh3::{Xxh3, xxh3_64};

const XXH3_SEED: u64 = 0x5f0d_a7a5_c0de_1a75;

/// Seeded xxh3-128 over a typed byte stream.
struct StableHasher {
    inner: Xxh3,
}

impl StableHasher {
    fn new() -> Self {
        Self {
            inner: Xxh3::with_seed(XXH3_SEED),
        }
    }

    fn write_bytes(&mut self, b: &[u8]) {
        self.inner.update(b);
    }

    fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }

    fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    fn write_str(&mut self, s: &str) {
        self.write_u64(s.len() as u64);
        self.write_bytes(s.as_bytes());
    }

    fn write_json(&mut self, v: &serde_json::Value) {
        match v {
            serde_json::Value::Null => self.write_u8(0),
            serde_json::Value::Bool(x) => {
                self.write_u8(1);
                self.write_u8(u8::from(*x));
            }
            serde_json::Value::Number(n) => {
                self.write_u8(2);
                self.write_str(&n.to_string());
            }
            serde_json::Value::String(s) => {
                self.write_u8(3);
                self.write_str(s);
            }
            serde_json::Value::Array(items) => {
                self.write_u8(4);
                self.write_u64(items.len() as u64);
                for item in items {
                    self.write_json(item);
                }
            }
            serde_json::Value::Object(map) => {
                self.write_u8(5);
                let mut keys = map.keys().collect::<Vec<_>>();
                keys.sort();
                self.write_u64(keys.len() as u64);
                for k in keys {
                    self.write_str(k);
                    self.write_json(&map[k]);
                }
            }
        }
    }

    fn finish_hex(self) -> String {
        format!("{:032x}", self.inner.digest128())
    }
}

/// Deterministic hash of any serializable value; object key order does not matter.
pub fn structural_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let v = serde_json::to_value(value)?;
    let mut h = StableHasher::new();
    h.write_json(&v);
    Ok(h.finish_hex())
}

#[derive(Serialize)]
struct LayoutFingerprint<'a> {
    rects: &'a [Rect],
    ids: &'a [ResourceId],
}

/// `post_process_hash` of a layout: `{rects, ids}` in task order.
pub fn layout_hash(layout: &AcceptedLayout) -> Result<String> {
    let rects: Vec<Rect> = layout.items.iter().map(|i| i.rect).collect();
    let ids = layout.ids();
    structural_hash(&LayoutFingerprint {
        rects: &rects,
        ids: &ids,
    })
}

/// Cache key and the operations list that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub operations: Vec<PostProcessOperation>,
    pub key: String,
}

impl CacheKey {
    pub fn for_layout(layout: &AcceptedLayout) -> Result<Self> {
        let operations = vec![PostProcessOperation {
            extension_id: ATLAS_EXTENSION_ID.to_string(),
            post_process_hash: layout_hash(layout)?,
        }];
        let key = structural_hash(&operations)?;
        Ok(Self { operations, key })
    }

    pub fn post_process_hash(&self) -> &str {
        &self.operations[0].post_process_hash
    }

    /// Store key of the encoded atlas produced for this key.
    pub fn binary_key(&self, atlas_id: ResourceId) -> String {
        format!("atlas-{atlas_id}-{}.png", self.post_process_hash())
    }
}

/// Finds a previously produced atlas whose operations hash to `key` and whose binary is
/// still in the store.
pub fn find<'a, S: ResourceStore + ?Sized>(
    records: impl IntoIterator<Item = &'a Resource>,
    key: &CacheKey,
    store: &S,
) -> Result<Option<&'a Resource>> {
    for r in records {
        if r.kind != ResourceKind::Atlas {
            continue;
        }
        let Some(pp) = &r.post_process else {
            continue;
        };
        if structural_hash(&pp.operations)? != key.key {
            continue;
        }
        let ResourceRef::Binary(binary) = &r.reference else {
            return Err(AtlasPipelineError::MalformedReference(format!(
                "atlas {} must reference its own binary, found '{}'",
                r.id, r.reference
            )));
        };
        if store.exists(binary) {
            return Ok(Some(r));
        }
    }
    Ok(None)
}

/// Fast (xxh3-64) and cryptographic (SHA-256) hashes of an encoded binary.
pub fn content_hash(bytes: &[u8]) -> ContentHash {
    ContentHash {
        len: bytes.len() as u64,
        xxh3: fast_hash(bytes),
        sha256: sha256_hex(bytes),
    }
}

pub fn fast_hash(bytes: &[u8]) -> String {
    format!("{:016x}", xxh3_64(bytes))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = sha2::Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
