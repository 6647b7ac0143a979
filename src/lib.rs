//! Regression testing for WMS/WFS map servers.
//!
//! Stored test cases pair a request with an accepted baseline response.
//! A run re-issues every request, compares the new response with its
//! baseline pixel by pixel (or byte by byte for text) and classifies the
//! outcome as success, warning, failure or error.

pub mod codec;
pub mod config;
pub mod diff;
pub mod error;
pub mod model;
pub mod request;
pub mod runner;
pub mod store;
pub mod transport;

pub use config::*;
pub use diff::{DiffColors, DiffConfig, DiffEngine, DiffResult, Rgb, StatusPolicy, ThresholdPolicy};
pub use error::*;
pub use model::*;
pub use request::{Extent, ImageFormat, Request, RequestType, Service};
pub use runner::*;
pub use store::*;
pub use transport::*;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
