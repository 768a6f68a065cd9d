//! Kiln Core
//!
//! This crate contains shared utilities for the kiln command-stream
//! generator: structured logging, profiling, generational-handle storage
//! and integer 2D geometry.

pub mod alloc;
pub mod geometry;
pub mod logging;
pub mod profiling;
