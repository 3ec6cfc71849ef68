//! Integration tests for the endpoint copier operator
//!
//! These tests run the controllers in-process against a kind cluster and tell
//! the story of how a Service alias follows its source.
//!
//! # Test Organization
//!
//! - `slice_sync`: per-slice mode, including dynamic aliases and garbage
//!   collection after the source Service is deleted
//!
//! - `endpoints_sync`: whole-object mode with the fixed apiserver port
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored
//!
//! # A single story, with output
//! cargo test --test kind slice_sync -- --ignored --nocapture
//! ```

mod endpoints_sync;
mod helpers;
mod slice_sync;
