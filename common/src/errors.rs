// Error handling framework
// One enum per concern; results carry these as messages, nothing panics past a boundary.

use thiserror::Error;

/// Shape and safety validation errors (manifest entries, parameters, paths)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Path is outside the secure root: {0}")]
    OutsideSecureRoot(String),

    #[error("Registry path must be rooted under HKLM\\ (the machine-wide hive) for system operations: {0}")]
    NonMachineHive(String),

    #[error("Unknown operation type: {0}")]
    UnknownOperationType(String),
}

/// Reasons the script safety gate refuses a script
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptRejection {
    #[error("Script not in allowed list: {0}")]
    NotAllowListed(String),

    #[error("Script file does not exist: {0}")]
    NotFound(String),

    #[error("Script not in secure location: {0}")]
    OutsideSecureRoot(String),

    #[error("Script contains a denied pattern '{pattern}': {path}")]
    DeniedPattern { path: String, pattern: String },

    #[error("Script could not be read: {0}")]
    Unreadable(String),
}

/// Child process execution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Failed to start process '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Failed to wait for process: {0}")]
    WaitFailed(String),

    #[error("Failed to capture process output: {0}")]
    CaptureFailed(String),

    #[error("No active user session found")]
    NoActiveSession,

    #[error("Execution cancelled")]
    Cancelled,
}

/// Source resolution errors (local file or http(s) download)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Invalid source path (not a local file or http(s) URI): {0}")]
    UnsupportedSource(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Filesystem error: {0}")]
    Io(String),

    #[error("Download cancelled")]
    Cancelled,
}

impl From<std::io::Error> for ResolveError {
    fn from(err: std::io::Error) -> Self {
        ResolveError::Io(err.to_string())
    }
}

/// Failure of a single manifest entry
#[derive(Error, Debug)]
pub enum OperationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("{message}")]
    CommandFailed {
        message: String,
        output: Option<String>,
    },

    #[error("Destination file exists and overwrite is false: {0}")]
    DestinationExists(String),

    #[error("Filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

impl OperationError {
    /// Whether this failure is a cancellation rather than a genuine error
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            OperationError::Execution(ExecutionError::Cancelled)
                | OperationError::Resolve(ResolveError::Cancelled)
        )
    }
}

/// Signature validation outcomes other than "valid"
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("Operation is not signed")]
    NotSigned,

    #[error("Signing certificate not found in certificate store: {0}")]
    CertificateNotFound(String),

    #[error("Unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    #[error("Signature verification failed")]
    SignatureMismatch,

    #[error("Failed to canonicalize record: {0}")]
    Canonicalization(String),
}

/// Errors raised while producing signatures or handling certificates
#[derive(Error, Debug)]
pub enum SigningError {
    #[error("Certificate does not have a usable RSA private key")]
    MissingPrivateKey,

    #[error("Private key does not match the certificate public key")]
    KeyMismatch,

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("RSA operation failed: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("Key encoding failed: {0}")]
    KeyEncoding(String),

    #[error("Certificate store error: {0}")]
    Store(String),
}

/// Errors reading the agent configuration file
#[derive(Error, Debug)]
pub enum ConfigFileError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Errors reading or writing an operation record file
#[derive(Error, Debug)]
pub enum RecordFileError {
    #[error("Failed to access operation file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid operation file JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Failed to sign record '{id}': {source}")]
    Signing {
        id: String,
        #[source]
        source: SigningError,
    },
}

/// Scheduler lifecycle errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to schedule timer '{0}'")]
    ScheduleFailed(String),
}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        ValidationError::InvalidJson(err.to_string())
    }
}
