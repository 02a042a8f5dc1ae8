use std::io;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("payload too short to hold a nonce")]
    Truncated,
    #[error("decryption failed (wrong passphrase or corrupted payload)")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("network access was not granted")]
    NetworkDenied,
    #[error("no catalog URL configured")]
    NoUrl,
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {0}")]
    Status(StatusCode),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("catalog is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("catalog is empty")]
    Empty,
    #[error("cache i/o: {0}")]
    Io(#[from] io::Error),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network access was not granted")]
    NetworkDenied,
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {0}")]
    Status(StatusCode),
    #[error("file i/o: {0}")]
    Io(#[from] io::Error),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid settings: {0}")]
    Settings(String),
    #[error("failed to create HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}
