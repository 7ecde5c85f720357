//! Scheduler integration for jobscope
//!
//! This crate provides read-only job metadata lookup, node-list expansion and
//! resolution of a job's output file path and locality.

mod client;
mod error;
pub mod nodelist;
mod resolver;

pub use client::{JobSource, ScontrolJobSource, StaticJobSource};
pub use error::ClusterError;
pub use nodelist::{expand_node_list, expand_node_range};
pub use resolver::{
    NULL_DEVICE, PathResolver, ResolvedPath, ResolverConfig, expand_placeholders,
    validate_output_path,
};

// Re-export types that are used in our public API
pub use jobscope_types::{JobInfo, OutputKind};
