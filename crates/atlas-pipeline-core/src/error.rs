use crate::model::ResourceId;
use crate::pipeline::BuildOutput;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AtlasPipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid atlas dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Malformed resource reference: {0}")]
    MalformedReference(String),
    #[error(
        "Placement {placement:?} of resource {resource} does not match its envelope {envelope:?}"
    )]
    PlacementMismatch {
        resource: ResourceId,
        placement: (u32, u32),
        envelope: (u32, u32),
    },
    #[error("Resource id {0} appears more than once")]
    DuplicateResource(ResourceId),
    #[error("No decoded source for resource {0} in layout")]
    MissingSource(ResourceId),
    #[error("Invalid geometry for resource {resource}: {reason}")]
    InvalidGeometry { resource: ResourceId, reason: String },
    #[error("Size limit cannot be halved below 1 (was {size_limit})")]
    CapacityExhausted { size_limit: u32 },
    #[error("Solver failure: {0}")]
    Solver(String),
    #[error("Store error for key '{key}': {reason}")]
    Store { key: String, reason: String },
    #[error("{failed} of {total} bundle groups failed")]
    GroupsFailed {
        failed: usize,
        total: usize,
        output: Box<BuildOutput>,
    },
}

pub type Result<T> = std::result::Result<T, AtlasPipelineError>;
