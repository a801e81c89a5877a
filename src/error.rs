/// Errors crossing the handler boundary: database failures from the pool
/// manager and internal failures inside tool/resource providers.
///
/// There is no HTTP rendering here. The auth middleware answers with its
/// fixed plain-text strings, and the dispatcher collapses these variants
/// into sanitized JSON-RPC error envelopes; the detailed cause is logged
/// server-side only.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;
