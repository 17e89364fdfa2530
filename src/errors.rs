//! Halo server error taxonomy.
//!
//! Mirrors the propagation policy of the design: most of these are consumed
//! at the `ClientGroup` / `AdaptiveTuningSection` boundary and turned into a
//! `tracing::warn!`/`info!` plus a fallback action. Only `ConfigError` and
//! `WireError::Framing` variants that occur during startup are expected to
//! propagate all the way to `main` and abort the process.

use thiserror::Error;

/// Transport-level failures: socket closed, partial read, malformed frame.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Framing(String),

    #[error("unknown message kind {0}")]
    UnknownKind(u32),

    #[error("failed to decode payload for {kind}: {source}")]
    PayloadDecode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Raised when an enrolling client does not match any existing group
/// (bitcode hash / triple / CPU differ). Not fatal — the registrar always
/// falls back to creating a new `ClientGroup`.
#[derive(Debug, Error)]
#[error("client does not match group: {reason}")]
pub struct EnrollmentMismatch {
    pub reason: String,
}

/// Errors from `PseudoBayesTuner::generateConfigs`.
#[derive(Debug, Error, PartialEq)]
pub enum TunerError {
    #[error("insufficient prior observations: have {have}, need at least {need}")]
    InsufficientPrior { have: usize, need: usize },

    #[error("surrogate search produced no candidate worth queueing")]
    NoGoodCandidate,
}

/// Compilation backend failures. A `CodeVersion` touched by one of these is
/// marked `broken` and is never deployed or redirected to.
#[derive(Debug, Error, Clone)]
pub enum CompileError {
    #[error("backend rejected configuration: {0}")]
    BackendRejected(String),

    #[error("compilation pipeline panicked or was cancelled")]
    Cancelled,

    #[error("cannot compile empty bitcode")]
    EmptyBitcode,
}

/// Configuration / CLI parse errors. These are always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing required config key: {0}")]
    MissingKey(&'static str),

    #[error("invalid knob kind `{0}` (expected one of flag, int, optlvl)")]
    InvalidKnobKind(String),

    #[error("invalid knob scale `{0}` (expected one of none, 1/2, 1/100, log)")]
    InvalidKnobScale(String),

    #[error("`{field}` must be in {range}, got {value}")]
    OutOfRange {
        field: &'static str,
        range: &'static str,
        value: String,
    },
}
