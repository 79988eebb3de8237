//! Core domain library for the secure workflow pipeline.
//!
//! Holds the workflow graph model, the runtime-value injection engine,
//! the (optionally encrypted) transport envelope, secure scratch-file
//! handling, and the small pieces of configuration and retry plumbing
//! shared by the submission client and the execution worker.

pub mod config;
pub mod encoding;
pub mod envelope;
pub mod error;
pub mod graph;
pub mod injection;
pub mod job;
pub mod retry;
pub mod secure_storage;
