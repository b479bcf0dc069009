//! Error types for WaveCall Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Device error: {0}")]
    Device(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Call not found: {0}")]
    NotFound(String),

    #[error("Invalid call state: {0}")]
    InvalidState(String),

    #[error("Session closed")]
    Closed,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::Negotiation(e.to_string())
    }
}
