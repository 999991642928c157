// Latchtree - Concurrent Latch-Crabbing B+Tree Index
// Core library module

pub mod error;
pub mod index;

pub use error::{BTreeError, Result};
pub use index::btree::{BTreeConfig, BTreeStats, Tree};
