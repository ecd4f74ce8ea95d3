use thiserror::Error;

/// Failure talking to a text-generation backend. Never retried by the gate.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("connection to translation backend failed: {0}")]
    Connection(String),
    #[error("translation backend rejected credentials: {0}")]
    Auth(String),
    #[error("translation backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode translation backend response: {0}")]
    Decode(String),
    #[error("no API key in environment variable {0}")]
    MissingKey(String),
}

/// Why a document could not be translated
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("document needs {needed} segments, at most {limit} are allowed")]
    TooManySegments { needed: usize, limit: usize },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("translation backend returned an empty response")]
    EmptyResponse,
    #[error("segment {segment} rejected after {attempts} attempts")]
    Exhausted { segment: usize, attempts: usize },
    #[error("no subtitle track suitable for translation")]
    NoSource,
}
