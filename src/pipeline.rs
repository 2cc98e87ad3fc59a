// src/pipeline.rs
//! Lazy record pipeline: the pull protocol, per-item metadata, the
//! configurable stages and the runner that wires them together.

pub mod config;
pub mod context;
pub mod meta;
pub mod plan;
pub mod processors;
pub mod stream;
