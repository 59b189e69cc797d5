use crate::error::TreeError;

/// Common Result type alias for tree mutations
pub type TreeResult<T> = Result<T, TreeError>;
