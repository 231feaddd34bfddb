//! DryBox error types with granular categories

use thiserror::Error;

use crate::config::Side;

/// Top-level error type for all DryBox operations
#[derive(Debug, Error)]
pub enum DryboxError {
    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Scenario error: {0}")]
    Scenario(#[from] ScenarioError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Acceptance error: {0}")]
    Acceptance(#[from] AcceptanceError),
}

impl DryboxError {
    /// Process exit code for this failure class.
    ///
    /// 2 = acceptance threshold missed, 3 = endpoint misbehaved,
    /// 4 = invalid scenario. Artifact I/O failures surface as 4 as well
    /// since they are environmental, not endpoint faults.
    pub fn exit_code(&self) -> i32 {
        match self {
            DryboxError::Endpoint(_) => 3,
            DryboxError::Scenario(_) => 4,
            DryboxError::Artifact(_) => 4,
            DryboxError::Acceptance(_) => 2,
        }
    }
}

/// Fatal adapter-side failures (ABI violations, bad shapes, panics)
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("{side} adapter panicked in {callback}")]
    CallbackPanicked { side: Side, callback: &'static str },

    #[error("{side} adapter failed in {callback}: {reason}")]
    CallbackFailed {
        side: Side,
        callback: &'static str,
        reason: String,
    },

    #[error("{side} adapter returned a {len}-byte SDU, declared sdu_max_bytes is {max}")]
    OversizeSdu { side: Side, len: usize, max: usize },

    #[error("{side} SDU of {len} bytes needs more than 256 fragments at mtu {mtu}")]
    UnfragmentableSdu { side: Side, len: usize, mtu: usize },

    #[error("{side} adapter returned an audio block of {actual} samples, expected {expected}")]
    BadBlockLength {
        side: Side,
        expected: usize,
        actual: usize,
    },
}

/// Invalid scenario configuration
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("scenario mode {mode} is not advertised by both adapters (left: {left}, right: {right})")]
    ModeUnsupported {
        mode: String,
        left: bool,
        right: bool,
    },

    #[error("invalid scenario field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unknown {what} kind: {value}")]
    UnknownKind { what: &'static str, value: String },

    #[error("invalid {side} key material: {reason}")]
    BadKeyMaterial { side: Side, reason: String },

    #[error("unknown adapter spec: {spec}")]
    UnknownAdapter { spec: String },
}

/// Artifact file I/O failures
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to write {artifact}: {source}")]
    Write {
        artifact: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize {artifact}: {reason}")]
    Serialize { artifact: &'static str, reason: String },
}

/// Post-run acceptance check failures
#[derive(Debug, Error)]
pub enum AcceptanceError {
    #[error("expected at least {expected} {event_type} events (deadline {by_t_ms:?}), observed {observed}")]
    MissingEvents {
        event_type: String,
        expected: usize,
        observed: usize,
        by_t_ms: Option<u64>,
    },
}

/// Result type alias for DryBox operations
pub type Result<T> = std::result::Result<T, DryboxError>;
