//! Content-source collaborator.
//!
//! This crate provides:
//! - `ContentSource` trait the detection engine polls
//! - `XApiClient`, an X v2 API implementation with bearer-token rotation

pub mod source;
pub mod x_api;

pub use source::{ContentSource, SourceError};
pub use x_api::{TokenStatus, XApiClient};
