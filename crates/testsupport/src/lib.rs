//! Test support utilities for the storage workspace.
//!
//! Provides isolated buffer-pool harnesses over temporary volumes so tests
//! can exercise fix/unfix, flushing, and eviction without hand-wiring the
//! disk and log managers every time.

pub mod fixtures;

/// Convenient re-exports for common testing patterns.
pub mod prelude {
    pub use crate::fixtures::*;
}
