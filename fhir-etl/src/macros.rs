//! Utility macros for error handling.

/// Creates an [`crate::error::EtlError`] from error kind and description.
///
/// ```rust,no_run
/// use fhir_etl::error::{ErrorKind, EtlError};
/// use fhir_etl::etl_error;
///
/// let error = etl_error!(ErrorKind::ConfigError, "missing resource list");
/// let error = etl_error!(
///     ErrorKind::UnknownResourceType,
///     "no structure definition for resource type",
///     "CarePlan"
/// );
/// ```
#[macro_export]
macro_rules! etl_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::EtlError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::EtlError::from(($kind, $desc, $detail.to_string()))
    };
}

/// Creates and returns an [`crate::error::EtlError`] from the current function.
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return Err($crate::etl_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return Err($crate::etl_error!($kind, $desc, $detail))
    };
}
