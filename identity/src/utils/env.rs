//! Environment variable access for the injected token payload.
//!
//! The payload carries a live access token, so it is read once and removed
//! from the process environment straight away.

use crate::error::{IdentityError, IdentityResult};

pub struct EnvUtils;

impl EnvUtils {
    /// Checks if an environment variable exists and has a non-empty value.
    pub fn has_non_empty_var(name: &str) -> bool {
        match std::env::var(name) {
            Ok(value) => !value.trim().is_empty(),
            Err(_) => false,
        }
    }

    pub fn get_optional_var(name: &str) -> Option<String> {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    /// Reads `name` and removes it from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::EnvVarNotSet`] if the variable is missing or
    /// blank. The variable is left untouched in that case.
    pub fn take_var(name: &str) -> IdentityResult<String> {
        let value = Self::get_optional_var(name).ok_or_else(|| IdentityError::EnvVarNotSet {
            name: name.to_string(),
        })?;
        Self::clear_var(name);
        Ok(value)
    }

    pub fn clear_var(name: &str) {
        // SAFETY: called from the single login path before any credential
        // work is spawned; no other thread reads this variable.
        unsafe { std::env::remove_var(name) };
    }
}
