use thiserror::Error;

/// Request-level failures with stable user-facing messages.
///
/// Anything carrying internal detail (database text, upstream bodies) is
/// logged at the failure site and collapsed to the generic message here.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid input")]
    InvalidInput,
    #[error("Invalid signature")]
    Auth,
    #[error("Invalid Uniswap V3 pools")]
    InvalidPool,
    #[error("Block number is too far ahead")]
    InvalidBlock,
    #[error("Block number is stale")]
    StaleBlock,
    #[error("Address does not hold alpha tokens")]
    NotAHolder,
    #[error("Too many requests")]
    RateLimited,
    #[error("{0}")]
    CooldownActive(String),
    #[error("Database error")]
    Database,
    #[error("Upstream service error")]
    Upstream,
    #[error("Hotkey is not a registered miner")]
    NotRegisteredMiner,
    #[error("Incompatible validator version")]
    VersionIncompatible,
    #[error("Internal server error")]
    Internal,
}

impl ServiceError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput => "InvalidInput",
            Self::Auth => "AuthError",
            Self::InvalidPool => "InvalidPool",
            Self::InvalidBlock => "InvalidBlock",
            Self::StaleBlock => "StaleBlock",
            Self::NotAHolder => "NotAHolder",
            Self::RateLimited => "RateLimited",
            Self::CooldownActive(_) => "CooldownActive",
            Self::Database => "DatabaseError",
            Self::Upstream => "UpstreamError",
            Self::NotRegisteredMiner => "NotRegisteredMiner",
            Self::VersionIncompatible => "VersionIncompatible",
            Self::Internal => "InternalError",
        }
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(error: rusqlite::Error) -> Self {
        tracing::error!("sqlite failure: {error}");
        Self::Database
    }
}
