use thiserror::Error;

/// Main error type for everything that aborts a compile or validation call.
///
/// Validity violations and semantic schema errors are *not* represented here: they go through
/// an [`ErrorSink`](crate::sink::ErrorSink) and surface as a `false` outcome.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML parse error: {system_id}:{line}:{column}: {message}")]
    Parse {
        system_id: String,
        line: u64,
        column: u64,
        message: String,
    },

    #[error("Incorrect schema: {system_id}")]
    IncorrectSchema { system_id: String },

    #[error("Cannot validate without a loaded schema")]
    NoSchemaLoaded,

    #[error("Unsupported URI: {uri} - {reason}")]
    UnsupportedUri { uri: String, reason: String },

    #[error("Validation aborted: {message}")]
    Aborted { message: String },

    #[error("libxml2 failure: {details}")]
    LibXml2Internal { details: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("concurrent validation failed: {details}")]
    Concurrency { details: String },
}

impl ValidationError {
    /// True for errors that only mean "the schema is not correct".
    pub fn is_incorrect_schema(&self) -> bool {
        matches!(self, ValidationError::IncorrectSchema { .. })
    }
}

/// Failures inside the libxml2 binding.
#[derive(Error, Debug)]
pub enum LibXml2Error {
    #[error("Schema parsing failed: {url}")]
    SchemaParseFailed { url: String },

    #[error("Validation context creation failed")]
    ValidationContextCreationFailed,

    #[error("Memory allocation failed in libxml2")]
    MemoryAllocation,

    #[error("Invalid XML structure: {details}")]
    InvalidXml { details: String },

    #[error("Validation internal error with code {code}")]
    InternalError { code: i32 },
}

impl From<LibXml2Error> for ValidationError {
    fn from(err: LibXml2Error) -> Self {
        match err {
            LibXml2Error::SchemaParseFailed { url } => {
                ValidationError::IncorrectSchema { system_id: url }
            }
            other => ValidationError::LibXml2Internal {
                details: other.to_string(),
            },
        }
    }
}

impl From<url::ParseError> for ValidationError {
    fn from(err: url::ParseError) -> Self {
        ValidationError::UnsupportedUri {
            uri: String::new(),
            reason: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ValidationError>;

pub type LibXml2Result<T> = std::result::Result<T, LibXml2Error>;
