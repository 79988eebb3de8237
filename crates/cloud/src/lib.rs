//! Submitting side of the pipeline.
//!
//! Loads a workflow and its input images, binds them with the injection
//! engine, wraps the result in a (normally sealed) envelope, submits it
//! to the job queue and polls until the job reaches a terminal status.
//! Returned artifacts are written to local storage.

pub mod artifacts;
pub mod config;
pub mod poll;
pub mod queue;
pub mod submit;
