//! Shared helpers.

pub mod env;

pub use env::EnvUtils;
