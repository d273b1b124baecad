//! Error taxonomy shared by the parser, the handlers and the execution units.
//!
//! Every variant carries a stable machine-readable [`VexecError::code`] that is
//! used in log lines and in [`crate::unit::ExecutionStatus::Error`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while parsing manifests or executing instructions.
#[derive(Debug, Error)]
pub enum VexecError {
    /// The manifest or a referenced file does not exist.
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The manifest extension is not one of the recognized formats.
    #[error("unsupported manifest format: {0}")]
    UnsupportedFormat(String),

    /// The manifest decoded but is structurally wrong.
    #[error("invalid manifest format: {0}")]
    InvalidFormat(String),

    /// The manifest body is missing or empty.
    #[error("manifest contains no instructions")]
    NoInstructions,

    /// The declared checksum does not match the content.
    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// No handler exists for the instruction type.
    #[error("handler not implemented for instruction type {0}")]
    HandlerNotImplemented(String),

    /// An external process exited unsuccessfully.
    #[error("external process failed (exit code {}): {stderr}", display_exit_code(.exit_code))]
    ExternalProcessFailure {
        exit_code: Option<i32>,
        stderr: String,
    },

    /// An external process exceeded its time budget and was killed.
    #[error("{program} timed out after {} ms", .limit.as_millis())]
    Timeout { program: String, limit: Duration },

    /// A source file failed to compile.
    #[error("compilation failed: {0}")]
    CompileFailure(String),

    /// A hash or signature did not verify.
    #[error("verification failed: {0}")]
    VerificationFailure(String),

    /// A required instruction field is absent.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// An instruction field has the wrong shape.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// EXECUTE/COMPILE was given a file type with no known toolchain.
    #[error("unsupported file extension: {0}")]
    UnsupportedExtension(String),

    /// INSTALL was given a package manager outside the supported set.
    #[error("unsupported package manager: {0}")]
    UnsupportedPackageManager(String),

    /// None of the candidate runtimes could be started.
    #[error("runtime not found: {0}")]
    RuntimeNotFound(String),

    /// A relative path tried to leave the unit workspace.
    #[error("path escapes workspace: {0}")]
    PathEscape(String),

    /// The execution unit was already shut down.
    #[error("execution unit {0} is shut down")]
    UnitShutdown(usize),

    /// The signing keypair could not be generated.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl VexecError {
    /// Stable short code used in structured results and log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::InvalidFormat(_) => "invalid_format",
            Self::NoInstructions => "no_instructions",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::HandlerNotImplemented(_) => "not_implemented",
            Self::ExternalProcessFailure { .. } => "process_failure",
            Self::Timeout { .. } => "timeout",
            Self::CompileFailure(_) => "compile_failure",
            Self::VerificationFailure(_) => "verification_failure",
            Self::MissingField(_) => "missing_field",
            Self::InvalidField { .. } => "invalid_field",
            Self::UnsupportedExtension(_) => "unsupported_extension",
            Self::UnsupportedPackageManager(_) => "unsupported_package_manager",
            Self::RuntimeNotFound(_) => "runtime_not_found",
            Self::PathEscape(_) => "path_escape",
            Self::UnitShutdown(_) => "unit_shutdown",
            Self::KeyGeneration(_) => "key_generation",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Whether retrying the same instruction could plausibly succeed.
    ///
    /// Deterministic failures (bad input, unknown types, digest mismatches)
    /// are reported after a single attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ExternalProcessFailure { .. }
                | Self::Timeout { .. }
                | Self::Io(_)
        )
    }
}

impl From<serde_json::Error> for VexecError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

fn display_exit_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Result type for executor operations.
pub type VexecResult<T> = Result<T, VexecError>;
