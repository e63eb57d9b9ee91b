//! Command-line front end for the azoauth identity library.

pub mod commands;
pub mod config;
pub mod logger;
