//! Crate-level error taxonomy.
//!
//! Every failure a caller can observe maps to exactly one [`ErrorKind`].
//! Challenge pages are the only transient condition and are retried inside
//! the gateway; everything else propagates immediately.

use reqwest::StatusCode;
use thiserror::Error;

use crate::stream::multiplexer::StreamError;
use crate::token::extract::TokenError;

/// Flat discriminant for [`AternosError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Token,
    ChallengeExceeded,
    PermissionDenied,
    Credentials,
    TwoFactorRequired,
    UnsupportedMethod,
    ServerStart,
    HttpStatus,
    Transport,
    Decode,
    InvalidInput,
    SessionFile,
    Stream,
}

#[derive(Debug, Error)]
pub enum AternosError {
    #[error("unable to extract ajax token: {0}")]
    Token(#[from] TokenError),

    #[error("anti-bot challenge still present after {attempts} attempts")]
    ChallengeExceeded { attempts: usize },

    #[error("permission denied by the panel (http 402)")]
    PermissionDenied,

    #[error("login rejected: {0}")]
    Credentials(String),

    #[error("two-factor code is required")]
    TwoFactorRequired,

    #[error("unsupported http method {0}, only GET and POST are available")]
    UnsupportedMethod(String),

    #[error("unable to start server: {}", start_reason_message(.reason))]
    ServerStart { reason: String },

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to scrape page: {0}")]
    Pattern(#[from] regex::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("session file error: {0}")]
    SessionFile(#[from] std::io::Error),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
}

impl AternosError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Token(_) => ErrorKind::Token,
            Self::ChallengeExceeded { .. } => ErrorKind::ChallengeExceeded,
            Self::PermissionDenied => ErrorKind::PermissionDenied,
            Self::Credentials(_) => ErrorKind::Credentials,
            Self::TwoFactorRequired => ErrorKind::TwoFactorRequired,
            Self::UnsupportedMethod(_) => ErrorKind::UnsupportedMethod,
            Self::ServerStart { .. } => ErrorKind::ServerStart,
            Self::HttpStatus { .. } => ErrorKind::HttpStatus,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Decode(_) | Self::Pattern(_) => ErrorKind::Decode,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::SessionFile(_) => ErrorKind::SessionFile,
            Self::Stream(_) => ErrorKind::Stream,
        }
    }
}

/// Human-readable text for the reason codes returned by `start.php`.
pub fn start_reason_message(reason: &str) -> String {
    match reason {
        "eula" => "EULA was not accepted, start with accept_eula enabled".to_string(),
        "already" => "server has already started".to_string(),
        "wrongversion" => "incorrect software version installed".to_string(),
        "file" => "file server is unavailable".to_string(),
        "size" => "available storage size limit has been reached".to_string(),
        other => format!("code {other}"),
    }
}
