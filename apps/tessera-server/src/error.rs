use tessera_coord::CoordError;

use crate::config::ConfigError;

/// Server process errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Coordination error: {0}")]
    Coord(#[from] CoordError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("No such region server: {0}")]
    UnknownServer(String),
}
