//! Error types raised by the engine.
//!
//! Request analysis never fails (bad input becomes `Error` enum values on
//! the [`Request`](crate::request::Request)). Everything that goes wrong
//! for a single case is turned into that case's `Error` outcome; only
//! [`RunError`] escapes a run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("{url} returned no content")]
    NoContent { url: String },
}

#[derive(Debug, Error)]
pub enum CaseError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("response is {actual} but the baseline is {expected}")]
    DecodeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("response is {actual_w}x{actual_h} but the baseline is {expected_w}x{expected_h}")]
    DimensionMismatch {
        expected_w: u32,
        expected_h: u32,
        actual_w: u32,
        actual_h: u32,
    },
    #[error("baseline is marked as an image but cannot be decoded")]
    CorruptBaseline,
    #[error("text response differs from the baseline")]
    TextMismatch,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("connectivity probe against {url} failed: {source}")]
    ProbeFailed {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("result sink rejected the run: {0}")]
    Sink(String),
    #[error("run task aborted: {0}")]
    Aborted(String),
}
