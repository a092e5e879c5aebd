use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Largest side of any atlas, chosen for downstream texture compatibility.
pub const ATLAS_MAX_DIMENSION_SIZE: u32 = 2048;
/// Fill ratio above which a pack is always good enough to try shrinking.
pub const IDEAL_RATIO: f64 = 0.80;
/// Fill ratio above which a pack is acceptable when it does not waste space.
pub const REQUIRED_RATIO: f64 = 0.75;

/// Envelope reported for images without a single pixel above the alpha threshold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransparentPolicy {
    /// `(0, 0, 1, 1)`.
    #[default]
    OneByOne,
    /// `(0, 0, width, height)`.
    FullFrame,
}

impl FromStr for TransparentPolicy {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "one_by_one" | "1x1" => Ok(Self::OneByOne),
            "full_frame" | "keep" => Ok(Self::FullFrame),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Upper bound for both atlas axes; also the starting size limit of every pack pass.
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    /// Usage ratio above which a pack is valid regardless of waste.
    #[serde(default = "default_ideal_ratio")]
    pub ideal_ratio: f64,
    /// Usage ratio above which a pack is valid when raw area fills the container.
    #[serde(default = "default_required_ratio")]
    pub required_ratio: f64,
    /// Let the solver rotate items by 90°.
    #[serde(default = "default_true")]
    pub allow_rotation: bool,
    /// Pixels reserved between packed items.
    #[serde(default)]
    pub texture_padding: u32,
    /// Pixels with alpha <= threshold count as transparent when computing envelopes.
    #[serde(default)]
    pub alpha_threshold: u8,
    #[serde(default)]
    pub transparent_policy: TransparentPolicy,
    /// A resource claimed by an earlier bundle group is excluded from later ones.
    #[serde(default = "default_true")]
    pub deduplicate_groups: bool,
    /// Process groups (and envelope decoding) in parallel when feature "parallel" is on.
    #[serde(default)]
    pub parallel: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_dimension: default_max_dimension(),
            ideal_ratio: default_ideal_ratio(),
            required_ratio: default_required_ratio(),
            allow_rotation: true,
            texture_padding: 0,
            alpha_threshold: 0,
            transparent_policy: TransparentPolicy::default(),
            deduplicate_groups: true,
            parallel: false,
        }
    }
}

impl PipelineConfig {
    /// Validates the configuration parameters.
    ///
    /// Returns an error if:
    /// - `max_dimension` is zero or not a power of two
    /// - ratios are outside `0..=1` or `required_ratio > ideal_ratio`
    /// - padding leaves no usable space
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::AtlasPipelineError;

        if self.max_dimension == 0 {
            return Err(AtlasPipelineError::InvalidDimensions {
                width: self.max_dimension,
                height: self.max_dimension,
            });
        }
        if !self.max_dimension.is_power_of_two() {
            return Err(AtlasPipelineError::InvalidConfig(format!(
                "max_dimension ({}) must be a power of two",
                self.max_dimension
            )));
        }
        for (name, v) in [
            ("ideal_ratio", self.ideal_ratio),
            ("required_ratio", self.required_ratio),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(AtlasPipelineError::InvalidConfig(format!(
                    "{name} ({v}) must be within 0..=1"
                )));
            }
        }
        if self.required_ratio > self.ideal_ratio {
            return Err(AtlasPipelineError::InvalidConfig(format!(
                "required_ratio ({}) exceeds ideal_ratio ({})",
                self.required_ratio, self.ideal_ratio
            )));
        }
        if self.texture_padding >= self.max_dimension {
            return Err(AtlasPipelineError::InvalidConfig(format!(
                "texture_padding ({}) leaves no usable space in {}px atlases",
                self.texture_padding, self.max_dimension
            )));
        }
        Ok(())
    }
}

fn default_max_dimension() -> u32 {
    ATLAS_MAX_DIMENSION_SIZE
}
fn default_ideal_ratio() -> f64 {
    IDEAL_RATIO
}
fn default_required_ratio() -> f64 {
    REQUIRED_RATIO
}
fn default_true() -> bool {
    true
}

/// Builder for `PipelineConfig` for ergonomic construction.
#[derive(Debug, Default, Clone)]
pub struct PipelineConfigBuilder {
    cfg: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn new() -> Self {
        Self {
            cfg: PipelineConfig::default(),
        }
    }
    pub fn max_dimension(mut self, v: u32) -> Self {
        self.cfg.max_dimension = v;
        self
    }
    pub fn ideal_ratio(mut self, v: f64) -> Self {
        self.cfg.ideal_ratio = v;
        self
    }
    pub fn required_ratio(mut self, v: f64) -> Self {
        self.cfg.required_ratio = v;
        self
    }
    pub fn allow_rotation(mut self, v: bool) -> Self {
        self.cfg.allow_rotation = v;
        self
    }
    pub fn texture_padding(mut self, v: u32) -> Self {
        self.cfg.texture_padding = v;
        self
    }
    pub fn alpha_threshold(mut self, v: u8) -> Self {
        self.cfg.alpha_threshold = v;
        self
    }
    pub fn transparent_policy(mut self, v: TransparentPolicy) -> Self {
        self.cfg.transparent_policy = v;
        self
    }
    pub fn deduplicate_groups(mut self, v: bool) -> Self {
        self.cfg.deduplicate_groups = v;
        self
    }
    pub fn parallel(mut self, v: bool) -> Self {
        self.cfg.parallel = v;
        self
    }
    pub fn build(self) -> PipelineConfig {
        self.cfg
    }
}

impl PipelineConfig {
    /// Create a fluent builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
    }
}
