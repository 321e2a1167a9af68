//! Library surface for the process entry point: configuration and the demo
//! sample source, exposed so integration tests can exercise them the way
//! `main.rs` does without spawning the real binary.

pub mod config;
pub mod demo_source;
