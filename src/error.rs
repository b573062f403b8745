// =============================================================================
// Connector error taxonomy
// =============================================================================

use thiserror::Error;

/// Errors surfaced by the connector stack. Protocol rejections carry the
/// broker's numeric code; everything else is a plain description.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("request {0} timed out")]
    Timeout(String),

    #[error("order error ({code}): {message}")]
    Order { code: i32, message: String },

    #[error("rate limit exceeded")]
    RateLimit,

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("shutting down")]
    Shutdown,
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;
