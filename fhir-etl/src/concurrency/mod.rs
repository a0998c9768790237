//! Concurrency primitives for coordinating pipeline workers.
//!
//! The pipeline is a bounded, one-shot dataflow: a finite plan of fetch
//! segments, a pool of workers performing I/O-bound HTTP calls, and a sink
//! with per-resource-type serialization. The [`shutdown`] module provides the
//! watch-based signal that lets the pool stop pulling new segments, drain
//! in-flight work, and close the sink cleanly.

pub mod shutdown;
