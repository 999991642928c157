use thiserror::Error;

/// Construction-time contract violations for [`crate::index::Tree`].
///
/// The tree's public operations (`find`, `upsert`) never fail; the only
/// documented contract violation is an invalid fanout bound at construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BTreeError {
    #[error("max_keys must be >= 2, got {0}")]
    InvalidMaxKeys(usize),
}

pub type Result<T> = std::result::Result<T, BTreeError>;
