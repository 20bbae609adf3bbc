//! Staged AI enrichment of live HLS segments.

pub mod callback;
pub mod config;
pub mod database;
pub mod error;
pub mod inference;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod streams;
pub mod utils;

pub use error::{Error, Result};
