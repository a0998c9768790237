use std::borrow::Cow;
use std::{error, fmt, result};

/// Type alias for convenience when using the Result type with our Error.
pub type EtlResult<T> = result::Result<T, EtlError>;

/// Classification of everything that can go wrong across the pipeline.
///
/// The kind drives both the retry decision (only transient remote errors are
/// retried) and the process exit code (configuration errors exit 1, runtime
/// errors exit 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bad CLI flags, missing mapping entries, unreadable directories.
    ConfigError,
    /// 5xx responses and connection-level failures from a remote server.
    TransientRemoteError,
    /// 4xx responses and malformed payloads from a remote server.
    PermanentRemoteError,
    /// Parquet or filesystem write/close failure in the warehouse sink.
    SinkIoError,
    /// Write issued after the sink was closed.
    SinkClosed,
    /// A resource could not be converted between representations.
    ConversionError,
    /// Arrow schema resolution failure.
    SchemaError,
    /// No structure definition or default schema for a resource type.
    UnknownResourceType,
    /// Structure definition directory could not be read or parsed.
    ProfileLoadError,
    /// A search bundle carried no `next` link.
    NoNextLink,
    /// The `next` link was not a parseable URL.
    MalformedLink,
    /// The `next` link had no `_getpages` parameter.
    MissingGetpagesParam,
    /// Database query failure in database-extraction mode.
    QueryFailed,
    /// A fetch worker panicked.
    WorkerPanic,
    /// In-flight work did not drain within the shutdown deadline.
    ShutdownTimeout,
    /// Aggregate of several errors.
    Many,
}

struct EtlErrorInner {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<String>,
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

/// A stable error type for the ETL library.
///
/// Boxes its payload to keep the type a single pointer on the success path.
/// Carries a static description, an optional dynamic detail, and an optional
/// source error for chaining.
pub struct EtlError(Box<EtlErrorInner>);

impl EtlError {
    /// Attaches a source error, preserving kind and description.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        self.0.source = Some(source.into());
        self
    }

    /// Aggregates several errors into one `Many` error; the first error is
    /// used as the source chain.
    pub fn from_many(mut errors: Vec<EtlError>) -> Self {
        if errors.len() == 1 {
            return errors.remove(0);
        }

        let description = format!("{} errors occurred", errors.len());
        let detail = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        let mut error = EtlError::from((ErrorKind::Many, description, detail));
        if let Some(first) = errors.into_iter().next() {
            error = error.with_source(first);
        }
        error
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.0.kind == ErrorKind::TransientRemoteError
    }

    /// Process exit code for this error when it reaches `main`.
    pub fn exit_code(&self) -> i32 {
        match self.0.kind {
            ErrorKind::ConfigError => 1,
            _ => 2,
        }
    }
}

impl<D> From<(ErrorKind, D)> for EtlError
where
    D: Into<Cow<'static, str>>,
{
    fn from((kind, description): (ErrorKind, D)) -> Self {
        EtlError(Box::new(EtlErrorInner {
            kind,
            description: description.into(),
            detail: None,
            source: None,
        }))
    }
}

impl<D> From<(ErrorKind, D, String)> for EtlError
where
    D: Into<Cow<'static, str>>,
{
    fn from((kind, description, detail): (ErrorKind, D, String)) -> Self {
        EtlError(Box::new(EtlErrorInner {
            kind,
            description: description.into(),
            detail: Some(detail),
            source: None,
        }))
    }
}

impl fmt::Debug for EtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtlError")
            .field("kind", &self.0.kind)
            .field("description", &self.0.description)
            .field("detail", &self.0.detail)
            .field("source", &self.0.source)
            .finish()
    }
}

impl fmt::Display for EtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.description)?;
        if let Some(detail) = &self.0.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl error::Error for EtlError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn error::Error + 'static))
    }
}

impl From<Vec<EtlError>> for EtlError {
    fn from(errors: Vec<EtlError>) -> Self {
        EtlError::from_many(errors)
    }
}

impl From<std::io::Error> for EtlError {
    fn from(err: std::io::Error) -> Self {
        EtlError::from((ErrorKind::SinkIoError, "i/o operation failed")).with_source(err)
    }
}

impl From<serde_json::Error> for EtlError {
    fn from(err: serde_json::Error) -> Self {
        EtlError::from((ErrorKind::ConversionError, "json conversion failed")).with_source(err)
    }
}

impl From<arrow::error::ArrowError> for EtlError {
    fn from(err: arrow::error::ArrowError) -> Self {
        EtlError::from((ErrorKind::ConversionError, "arrow operation failed")).with_source(err)
    }
}

impl From<parquet::errors::ParquetError> for EtlError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        EtlError::from((ErrorKind::SinkIoError, "parquet operation failed")).with_source(err)
    }
}

impl From<sqlx::Error> for EtlError {
    fn from(err: sqlx::Error) -> Self {
        EtlError::from((ErrorKind::QueryFailed, "database query failed")).with_source(err)
    }
}

impl From<fhir_etl_config::shared::ValidationError> for EtlError {
    fn from(err: fhir_etl_config::shared::ValidationError) -> Self {
        EtlError::from((ErrorKind::ConfigError, "invalid configuration", err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let config: EtlError = (ErrorKind::ConfigError, "bad flag").into();
        assert_eq!(config.exit_code(), 1);

        let schema: EtlError = (ErrorKind::SchemaError, "no schema").into();
        assert_eq!(schema.exit_code(), 2);
    }

    #[test]
    fn test_only_transient_is_retryable() {
        let transient: EtlError = (ErrorKind::TransientRemoteError, "503").into();
        assert!(transient.is_retryable());

        let permanent: EtlError = (ErrorKind::PermanentRemoteError, "404").into();
        assert!(!permanent.is_retryable());
    }

    #[test]
    fn test_from_many_collapses_single_error() {
        let single: EtlError = (ErrorKind::SinkIoError, "disk full").into();
        let collapsed = EtlError::from_many(vec![single]);
        assert_eq!(collapsed.kind(), ErrorKind::SinkIoError);

        let many = EtlError::from_many(vec![
            (ErrorKind::SinkIoError, "disk full").into(),
            (ErrorKind::PermanentRemoteError, "404").into(),
        ]);
        assert_eq!(many.kind(), ErrorKind::Many);
        assert!(many.to_string().contains("2 errors"));
    }
}
