use crate::error::AtlasPipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Identifier of a resource record in the store.
pub type ResourceId = u64;

/// Extension id under which atlas packing registers its post-process operation.
pub const ATLAS_EXTENSION_ID: &str = "texture-atlas";

const REDIRECT_SCHEME: &str = "redirect://";

/// Axis-aligned rectangle (pixels). `x,y` is top-left; `w,h` are sizes.
///
/// `flipped` means the rectangle is rotated 90° relative to its source orientation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    #[serde(default)]
    pub flipped: bool,
}

impl Rect {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self {
            x,
            y,
            w,
            h,
            flipped: false,
        }
    }
    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }
    /// Longest side.
    pub fn max_side(&self) -> u32 {
        self.w.max(self.h)
    }
    /// Exclusive right edge (`x + w`).
    pub fn right(&self) -> u32 {
        self.x + self.w
    }
    /// Exclusive bottom edge (`y + h`).
    pub fn bottom(&self) -> u32 {
        self.y + self.h
    }
    /// Returns true if `r` is fully inside `self`.
    pub fn contains(&self, r: &Rect) -> bool {
        r.x >= self.x && r.y >= self.y && r.right() <= self.right() && r.bottom() <= self.bottom()
    }
    pub fn intersects(&self, r: &Rect) -> bool {
        !(self.x >= r.right() || r.x >= self.right() || self.y >= r.bottom() || r.y >= self.bottom())
    }
    /// Swaps width and height and toggles `flipped`.
    pub fn transpose(&mut self) {
        std::mem::swap(&mut self.w, &mut self.h);
        self.flipped = !self.flipped;
    }
}

/// Trimmed opaque-pixel box relative to the raw image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    #[serde(rename = "ex")]
    pub x: u32,
    #[serde(rename = "ey")]
    pub y: u32,
    #[serde(rename = "ew")]
    pub w: u32,
    #[serde(rename = "eh")]
    pub h: u32,
}

impl Envelope {
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.w, self.h)
    }
}

impl From<Rect> for Envelope {
    fn from(r: Rect) -> Self {
        Self {
            x: r.x,
            y: r.y,
            w: r.w,
            h: r.h,
        }
    }
}

/// Final slot of a resource inside its atlas.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Placement {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    /// Rotated 90° clockwise when drawn into the atlas.
    pub f: bool,
}

impl From<Rect> for Placement {
    fn from(r: Rect) -> Self {
        Self {
            x: r.x,
            y: r.y,
            w: r.w,
            h: r.h,
            f: r.flipped,
        }
    }
}

/// Durable per-resource geometry, reused across builds to skip decoding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceGeometry {
    #[serde(rename = "tw")]
    pub raw_width: u32,
    #[serde(rename = "th")]
    pub raw_height: u32,
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<Placement>,
}

impl ResourceGeometry {
    pub fn new(raw_width: u32, raw_height: u32, envelope: Rect) -> Self {
        Self {
            raw_width,
            raw_height,
            envelope: envelope.into(),
            placement: None,
        }
    }

    pub fn raw_area(&self) -> u64 {
        self.raw_width as u64 * self.raw_height as u64
    }

    /// Checks that the envelope is non-empty and lies inside the raw image.
    pub fn validate(&self, resource: ResourceId) -> crate::error::Result<()> {
        let e = self.envelope;
        let raw = Rect::new(0, 0, self.raw_width, self.raw_height);
        if e.w == 0 || e.h == 0 {
            return Err(AtlasPipelineError::InvalidGeometry {
                resource,
                reason: format!("empty envelope {}x{}", e.w, e.h),
            });
        }
        if !raw.contains(&e.rect()) {
            return Err(AtlasPipelineError::InvalidGeometry {
                resource,
                reason: format!(
                    "envelope ({}, {}, {}, {}) outside raw {}x{}",
                    e.x, e.y, e.w, e.h, self.raw_width, self.raw_height
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    #[default]
    Image,
    Atlas,
}

/// Public reference of a resource: either its own binary or a redirect to another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResourceRef {
    Binary(String),
    Redirect(ResourceId),
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceRef::Binary(key) => f.write_str(key),
            ResourceRef::Redirect(id) => write!(f, "{REDIRECT_SCHEME}{id}"),
        }
    }
}

impl FromStr for ResourceRef {
    type Err = AtlasPipelineError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix(REDIRECT_SCHEME) {
            return rest
                .parse::<ResourceId>()
                .map(ResourceRef::Redirect)
                .map_err(|_| AtlasPipelineError::MalformedReference(s.to_string()));
        }
        if s.is_empty() || s.contains("://") {
            return Err(AtlasPipelineError::MalformedReference(s.to_string()));
        }
        Ok(ResourceRef::Binary(s.to_string()))
    }
}

impl TryFrom<String> for ResourceRef {
    type Error = AtlasPipelineError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ResourceRef> for String {
    fn from(r: ResourceRef) -> Self {
        r.to_string()
    }
}

/// One post-process step applied to produce an output binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PostProcessOperation {
    pub extension_id: String,
    pub post_process_hash: String,
}

/// Hashes and size of an encoded output binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentHash {
    pub len: u64,
    /// xxh3-64, used for deduplication.
    pub xxh3: String,
    /// SHA-256, used for integrity checks.
    pub sha256: String,
}

/// Cache record attached to every produced atlas resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostProcessRecord {
    pub operations: Vec<PostProcessOperation>,
    /// Builds this output is valid for.
    pub media_bundle_id: BTreeSet<u32>,
    pub content: ContentHash,
}

/// A resource record as stored and exchanged with the publish pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub id: ResourceId,
    pub name: String,
    #[serde(default)]
    pub kind: ResourceKind,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub episodes: BTreeSet<u32>,
    /// Key of the resource's own binary in the store. Never rewritten.
    pub source: String,
    /// What downstream consumers fetch.
    pub reference: ResourceRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<ResourceGeometry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_process: Option<PostProcessRecord>,
}

impl Resource {
    /// New image resource whose public reference is its own binary.
    pub fn image(id: ResourceId, name: impl Into<String>, source: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            id,
            name: name.into(),
            kind: ResourceKind::Image,
            tags: BTreeSet::new(),
            episodes: BTreeSet::new(),
            reference: ResourceRef::Binary(source.clone()),
            source,
            geometry: None,
            post_process: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_episodes<I: IntoIterator<Item = u32>>(mut self, episodes: I) -> Self {
        self.episodes = episodes.into_iter().collect();
        self
    }

    pub fn redirect_target(&self) -> Option<ResourceId> {
        match self.reference {
            ResourceRef::Redirect(id) => Some(id),
            ResourceRef::Binary(_) => None,
        }
    }

    /// Drops any atlas placement and points the reference back at the own binary.
    pub fn restore_direct_reference(&mut self) {
        self.reference = ResourceRef::Binary(self.source.clone());
        if let Some(g) = self.geometry.as_mut() {
            g.placement = None;
        }
    }
}
