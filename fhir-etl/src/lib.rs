pub mod client;
pub mod concurrency;
pub mod db;
pub mod dwh;
pub mod error;
pub mod fhir;
pub mod macros;
pub mod metrics;
pub mod pipeline;
pub mod schema;
pub mod segment;
pub mod sink;
pub mod workers;
