//! Build-time texture atlas pipeline.
//!
//! - Grouping: resources are split into bundle groups by tag and episode predicates
//! - Packing: a shrink/retry orchestrator drives a MaxRects solver per group
//! - Compositing: accepted layouts are drawn into power-of-two PNG atlases
//! - Caching: atlases are keyed by the structural hash of their layout and reused across builds
//!
//! Quick example:
//! ```ignore
//! use atlas_pipeline_core::prelude::*;
//! # fn main() -> anyhow::Result<()> {
//! let store = DirStore::new("out/store")?;
//! let resources = vec![
//!     Resource::image(1, "hero", "sources/hero.png").with_tags(["ui"]),
//!     Resource::image(2, "coin", "sources/coin.png").with_tags(["ui"]),
//! ];
//! let groups = vec![BundlePredicate::new("ui").require_tags(["ui"])];
//! let out = run_build(resources, &groups, 1, &store, &PipelineConfig::default())?;
//! println!("{}", out.report.summary());
//! # Ok(()) }
//! ```

pub mod cache;
pub mod compositing;
pub mod config;
pub mod envelope;
pub mod error;
pub mod export;
pub mod grouping;
pub mod model;
pub mod orchestrator;
pub mod packer;
pub mod pipeline;
pub mod report;
pub mod store;

pub use config::*;
pub use error::*;
pub use export::*;
pub use model::*;
pub use pipeline::*;

/// Convenience prelude for common types and functions.
/// Importing `atlas_pipeline_core::prelude::*` brings the primary APIs into scope.
pub mod prelude {
    pub use crate::config::{PipelineConfig, PipelineConfigBuilder, TransparentPolicy};
    pub use crate::grouping::{BundlePredicate, EpisodeRule};
    pub use crate::model::{Rect, Resource, ResourceId, ResourceKind, ResourceRef};
    pub use crate::orchestrator::{PackItem, PackOrchestrator, PackPlan};
    pub use crate::packer::maxrects::{MaxRectsHeuristic, MaxRectsSolver};
    pub use crate::packer::{PackOutcome, SolveOptions, Solver};
    pub use crate::report::{BuildReport, GroupReport};
    pub use crate::store::{DirStore, MemoryStore, ResourceStore};
    pub use crate::{AtlasPipelineError, BuildOutput, run_build, run_build_with};
}
