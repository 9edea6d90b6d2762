use thiserror::Error;

/// Main error type for the trade manager
#[derive(Error, Debug)]
pub enum CortoError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Venue errors
    #[error("Binance rejected request ({code}): {message}")]
    Venue { code: i64, message: String },

    #[error("Binance unavailable after {attempts} attempts: {last_error}")]
    VenueUnavailable { attempts: u32, last_error: String },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Trade not found: {0}")]
    TradeNotFound(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for CortoError
pub type Result<T> = std::result::Result<T, CortoError>;

impl CortoError {
    /// Binance error code of a venue rejection, if this is one.
    pub fn venue_code(&self) -> Option<i64> {
        match self {
            CortoError::Venue { code, .. } => Some(*code),
            _ => None,
        }
    }
}
