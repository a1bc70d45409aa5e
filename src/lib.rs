//! Trading Bot - Main Library
//!
//! Thin root crate for the deployable binary; the business logic lives in
//! the `supervisor` workspace library.

// Re-export the workspace library for convenience
pub use supervisor;
