//! ComfyUI execution-engine protocol.
//!
//! Typed WebSocket message parsing, the HTTP API wrapper (`/prompt`,
//! `/history`, `/interrupt`), history parsing, and the monitoring loop
//! that waits for one execution to finish. [`engine::ExecutionEngine`]
//! is the seam the worker drives; [`engine::ComfyUIEngine`] is the live
//! implementation.

pub mod api;
pub mod client;
pub mod engine;
pub mod history;
pub mod messages;
pub mod monitor;
