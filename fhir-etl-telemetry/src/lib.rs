//! Telemetry bootstrap shared by the ETL binaries and integration tests.

pub mod tracing;
