//! Offset document pipeline: fetch both upstream JSON files, merge them into
//! one flat key→value map, and serve the result through a TTL cache with
//! single-flight refresh and stale fallback.

pub mod cache;
pub mod errors;
pub mod fetch;
pub mod json;
pub mod merge;
