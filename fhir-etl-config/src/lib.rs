//! Shared configuration types for FHIR ETL pipelines.

pub mod shared;
