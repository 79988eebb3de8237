//! Execution side of the pipeline.
//!
//! [`handler::JobHandler`] runs one job against ComfyUI: unwrap the
//! envelope, stage inputs, dispatch, monitor, collect outputs and wipe
//! the scratch directories. [`provision`] prepares model files before the
//! worker starts taking jobs.

pub mod config;
pub mod error;
pub mod handler;
pub mod progress;
pub mod provision;
pub mod staging;
