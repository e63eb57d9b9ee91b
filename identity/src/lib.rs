//! # azoauth identity library
//!
//! Resolves Azure AD credentials, caches and refreshes their access tokens,
//! and issues authenticated Azure Resource Manager requests, including
//! long-running operations.
//!
//! ## Modules
//!
//! - [`auth`] - Credential strategies, token caching and the token manager
//! - [`management`] - Resource Manager client and async operation poller
//! - [`config`] - Library configuration with serde defaults
//! - [`error`] - Error type and classification
//! - [`utils`] - Environment helpers

pub mod auth;
pub mod config;
pub mod error;
pub mod management;
pub mod utils;
