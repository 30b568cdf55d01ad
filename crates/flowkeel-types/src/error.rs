use thiserror::Error;

/// Errors from storage port operations (traits live in flowkeel-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("cursor '{source_id}' cannot move backwards from '{current}' to '{proposed}'")]
    CursorRegressed {
        source_id: String,
        current: String,
        proposed: String,
    },
}
