use thiserror::Error;

/// Mirror engine error types
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Transport failure, DNS error or exhausted 5xx retries
    #[error("Registry unavailable: {reference} - {message}")]
    RegistryUnavailable { reference: String, message: String },

    /// 404 on HEAD/GET
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// 401/403 from the registry
    #[error("Unauthorized: {reference} - {message}")]
    Unauthorized { reference: String, message: String },

    /// Release-channel image is missing `version.json`, it does not parse,
    /// or the channel is suspended
    #[error("Corrupt release channel: {image} - {reason}")]
    CorruptReleaseChannel { image: String, reason: String },

    /// Layout validation found structural or hash problems
    #[error("Layout invalid: {} problem(s), first: {}", .0.len(), .0.first().map(String::as_str).unwrap_or("-"))]
    LayoutInvalid(Vec<String>),

    /// Chunk content does not match its Stribog sidecar
    #[error("Chunk digest mismatch: {chunk} expected {expected}, got {actual}")]
    ChunkDigestMismatch {
        chunk: String,
        expected: String,
        actual: String,
    },

    /// Operation cancelled through its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// A module filter entry could not be parsed
    #[error("Bad filter expression: {0}")]
    BadFilterExpression(String),

    /// Image reference could not be parsed
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bundle pack/unpack error
    #[error("Bundle error: {0}")]
    Bundle(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error annotated with the operation it happened in
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<MirrorError>,
    },

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl MirrorError {
    /// The underlying error with every breadcrumb removed.
    pub fn root(&self) -> &MirrorError {
        match self {
            MirrorError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self.root(), MirrorError::RegistryUnavailable { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), MirrorError::ImageNotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), MirrorError::Cancelled)
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        MirrorError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for MirrorError {
    fn from(err: serde_yaml::Error) -> Self {
        MirrorError::Serialization(err.to_string())
    }
}

/// Result type alias for mirror operations
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Attach a breadcrumb to the error side of a result.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| MirrorError::Context {
            context: context.into(),
            source: Box::new(e),
        })
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| MirrorError::Context {
            context: f().into(),
            source: Box::new(e),
        })
    }
}
