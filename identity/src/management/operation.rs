//! Long-running operation tracking.
//!
//! A `202 Accepted` from Resource Manager carries a status URL. The
//! [`AsyncOperationPoller`] polls it until the operation reaches a terminal
//! state and then deserialises the result into the caller's target type.
//!
//! An `Azure-AsyncOperation` URL returns a status document whose `properties`
//! hold the result. A `Location` URL answers `202` while the operation runs and
//! then returns the resource itself.

use super::client::ManagementClient;
use crate::config::PollingConfig;
use crate::error::{IdentityError, IdentityResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationStatus {
    Accepted,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Succeeded | OperationStatus::Failed | OperationStatus::Canceled
        )
    }
}

impl FromStr for OperationStatus {
    type Err = std::convert::Infallible;

    /// Case-insensitive. Unrecognised values mean the operation is still running.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s.trim().to_ascii_lowercase().as_str() {
            "accepted" => OperationStatus::Accepted,
            "succeeded" => OperationStatus::Succeeded,
            "failed" => OperationStatus::Failed,
            "canceled" | "cancelled" => OperationStatus::Canceled,
            _ => OperationStatus::Running,
        };
        Ok(status)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationStatus::Accepted => "Accepted",
            OperationStatus::Running => "Running",
            OperationStatus::Succeeded => "Succeeded",
            OperationStatus::Failed => "Failed",
            OperationStatus::Canceled => "Canceled",
        };
        f.write_str(name)
    }
}

impl<'de> Deserialize<'de> for OperationStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let Ok(status) = raw.parse::<OperationStatus>();
        Ok(status)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AsyncOperationError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Body returned by an `Azure-AsyncOperation` status URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncOperationResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub status: OperationStatus,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub percent_complete: Option<f64>,
    #[serde(default)]
    pub properties: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<AsyncOperationError>,
}

impl AsyncOperationResponse {
    /// Status document for a `Location` poll, which carries no body of its own.
    pub(crate) fn from_location(status: OperationStatus, resource: Option<serde_json::Value>) -> Self {
        Self {
            id: None,
            name: None,
            status,
            start_time: None,
            end_time: None,
            percent_complete: None,
            properties: resource,
            error: None,
        }
    }
}

/// Which header of the `202 Accepted` the poll URL came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    AsyncOperation,
    Location,
}

/// Handle to an accepted operation whose result deserialises into `T`.
///
/// Polling takes `&mut self`, so a handle is driven by one poller at a time.
#[derive(Debug)]
pub struct AsyncOperation<T> {
    pub poll_uri: Url,
    pub mode: PollMode,
    pub location: Option<Url>,
    pub retry_after: Option<Duration>,
    pub last_status: OperationStatus,
    pub last_response: Option<AsyncOperationResponse>,
    target: PhantomData<fn() -> T>,
}

impl<T> AsyncOperation<T> {
    pub fn new(
        poll_uri: Url,
        mode: PollMode,
        location: Option<Url>,
        retry_after: Option<Duration>,
    ) -> Self {
        Self {
            poll_uri,
            mode,
            location,
            retry_after,
            last_status: OperationStatus::Accepted,
            last_response: None,
            target: PhantomData,
        }
    }
}

pub struct AsyncOperationPoller<'a> {
    client: &'a ManagementClient,
    polling: PollingConfig,
}

impl<'a> AsyncOperationPoller<'a> {
    pub fn new(client: &'a ManagementClient) -> Self {
        Self {
            client,
            polling: client.polling_config().clone(),
        }
    }

    pub fn with_polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    /// Polls `operation` until it succeeds, fails or `cancel` fires.
    ///
    /// # Errors
    ///
    /// - [`IdentityError::OperationFailed`] when the operation ends Failed or Canceled
    /// - [`IdentityError::Cancelled`] when `cancel` fires
    /// - the last transient error once `max_transient_failures` is exceeded
    /// - any non-transient request error, immediately
    pub async fn poll<T: DeserializeOwned>(
        &self,
        operation: &mut AsyncOperation<T>,
        cancel: &CancellationToken,
    ) -> IdentityResult<T> {
        let mut interval = self.polling.initial_interval();
        let mut transient_failures = 0u32;

        loop {
            let wait = operation
                .retry_after
                .map(|retry_after| retry_after.min(self.polling.max_interval()))
                .unwrap_or(interval);

            tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled(&operation.poll_uri)),
                _ = tokio::time::sleep(wait) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled(&operation.poll_uri)),
                result = self.client.get_operation_status(&operation.poll_uri, operation.mode) => result,
            };

            match result {
                Ok((response, retry_after)) => {
                    transient_failures = 0;
                    operation.retry_after = retry_after;
                    operation.last_status = response.status;
                    operation.last_response = Some(response.clone());
                    log::debug!(
                        "Operation {} is {}",
                        operation.poll_uri.path(),
                        response.status
                    );

                    match response.status {
                        OperationStatus::Succeeded => {
                            let properties =
                                response.properties.unwrap_or(serde_json::Value::Null);
                            return serde_json::from_value(properties).map_err(Into::into);
                        }
                        OperationStatus::Failed | OperationStatus::Canceled => {
                            let error = response.error.unwrap_or_default();
                            return Err(IdentityError::OperationFailed {
                                status: response.status.to_string(),
                                code: error.code,
                                message: error.message,
                            });
                        }
                        OperationStatus::Accepted | OperationStatus::Running => {}
                    }
                }
                Err(e) if e.is_transient() => {
                    transient_failures += 1;
                    if let Some(max) = self.polling.max_transient_failures {
                        if transient_failures > max {
                            return Err(e);
                        }
                    }
                    log::warn!(
                        "Transient failure {transient_failures} while polling {}: {e}",
                        operation.poll_uri.path()
                    );
                    operation.retry_after = None;
                }
                Err(e) => return Err(e),
            }

            interval = self.polling.next_interval(interval);
        }
    }
}

fn cancelled(poll_uri: &Url) -> IdentityError {
    IdentityError::Cancelled(format!("polling {} was cancelled", poll_uri.path()))
}
