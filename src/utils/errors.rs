use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitoringError {
    #[error("Substrate unavailable: {0}")]
    SubstrateUnavailable(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Process timeout: {0}")]
    ProcessTimeout(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Other error: {0}")]
    Other(String),
}
