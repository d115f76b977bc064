//! Core run orchestration for aipbinder.
//!
//! Ties staging, downloading, and PDF merging together into a single
//! [`Pipeline::run`] over an ordered list of retrieval targets.

pub mod merger;
pub mod pipeline;
pub mod staging;

#[cfg(test)]
mod test_support;

pub use merger::{DocumentMerger, MergeError, PdfMerger};
pub use pipeline::{MergeResult, Pipeline, RetrievalOutcome, RunConfig, TargetFailure};
pub use staging::{Stager, StagingArea, StagingSlot};
