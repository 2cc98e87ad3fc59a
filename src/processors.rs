// src/processors.rs
pub mod merge;
pub mod record;
pub mod text;
pub mod window;
