use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::transport::envelope::EnvelopeError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No transfer link is registered")]
    NoTransferLink,
    #[error("Missing configuration: {0}")]
    MissingConfig(&'static str),
    #[error("Invalid URI: {0}")]
    InvalidUri(#[from] url::ParseError),
    #[error("Invalid header value")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),
    #[error("Failed to (de)serialize envelope")]
    Envelope(#[from] EnvelopeError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
