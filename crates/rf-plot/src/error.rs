//! Error types for the game plot engine

use thiserror::Error;

/// Plot authoring and configuration errors
///
/// Navigation boundaries are not errors; they are reported through
/// [`crate::Navigation`]. Lookup misses return `None`.
#[derive(Error, Debug)]
pub enum PlotError {
    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    #[error("Invalid id: {0}")]
    InvalidId(String),

    #[error("Duplicate {kind} id: {id}")]
    DuplicateId { kind: &'static str, id: String },

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Invalid stage '{id}': {reason}")]
    InvalidStage { id: String, reason: String },

    #[error("{0}: stager is already finalized")]
    Finalized(&'static str),

    #[error("Invalid positions expression: {0}")]
    InvalidPositions(String),

    #[error("Block '{block}': no free slot satisfies positions '{positions}'")]
    Unsatisfiable { block: String, positions: String },

    #[error("Cannot change immutable field '{field}' of {id}")]
    ImmutableField { id: String, field: &'static str },

    #[error("{0}: not available in flexible mode")]
    FlexibleMode(&'static str),

    #[error("{0}: no stage has been added yet")]
    NoCurrentStage(&'static str),

    #[error("Block error: {0}")]
    Block(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias
pub type PlotResult<T> = Result<T, PlotError>;
