//! HTTP document fetching with bounded, constant-delay retry.
//!
//! This crate provides:
//! - [`Fetcher`]: downloads one document into a local file, retrying on failure
//! - [`FetchError`] / [`AttemptError`]: why a download (or one attempt) failed

pub mod download;

pub use download::{AttemptError, FetchError, FetchReport, Fetcher, RetryPolicy};
