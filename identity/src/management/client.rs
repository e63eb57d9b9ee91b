use super::operation::{
    AsyncOperation, AsyncOperationPoller, AsyncOperationResponse, OperationStatus, PollMode,
};
use crate::auth::TokenCredential;
use crate::config::{IdentityConfig, PollingConfig};
use crate::error::{IdentityError, IdentityResult};
use reqwest::header::{
    ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, LOCATION, RETRY_AFTER,
};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
const AZURE_ASYNC_OPERATION: &str = "azure-asyncoperation";

/// Everything a caller adds to a Resource Manager request.
#[derive(Debug, Clone)]
pub struct ManagementRequest {
    pub method: Method,
    pub path_extension: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
}

impl ManagementRequest {
    pub fn new(method: Method, path_extension: impl Into<String>) -> Self {
        Self {
            method,
            path_extension: path_extension.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path_extension: impl Into<String>) -> Self {
        Self::new(Method::GET, path_extension)
    }

    pub fn put(path_extension: impl Into<String>) -> Self {
        Self::new(Method::PUT, path_extension)
    }

    pub fn post(path_extension: impl Into<String>) -> Self {
        Self::new(Method::POST, path_extension)
    }

    pub fn patch(path_extension: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path_extension)
    }

    pub fn delete(path_extension: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path_extension)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> IdentityResult<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }
}

/// Outcome of a single Resource Manager call.
#[derive(Debug)]
pub enum Execution<T> {
    Completed(T),
    Accepted(AsyncOperation<T>),
}

/// Base query pairs followed by the request's own, in order. Duplicate keys
/// are kept.
pub fn combine_query(
    base: impl IntoIterator<Item = (String, String)>,
    extra: &[(String, String)],
) -> Vec<(String, String)> {
    base.into_iter().chain(extra.iter().cloned()).collect()
}

/// Authenticated Azure Resource Manager client.
///
/// A bearer token is fetched from the credential for every request; the
/// credential does its own caching.
pub struct ManagementClient {
    http: reqwest::Client,
    credential: Arc<dyn TokenCredential>,
    endpoint: Url,
    scope: String,
    polling: PollingConfig,
}

impl ManagementClient {
    pub fn new(
        http: reqwest::Client,
        credential: Arc<dyn TokenCredential>,
        config: &IdentityConfig,
    ) -> IdentityResult<Self> {
        Ok(Self {
            http,
            credential,
            endpoint: Url::parse(&config.management_endpoint)?,
            scope: config.management_scope.clone(),
            polling: config.polling.clone(),
        })
    }

    pub fn management_uri(&self) -> &Url {
        &self.endpoint
    }

    pub fn polling_config(&self) -> &PollingConfig {
        &self.polling
    }

    /// Resolves `request` against `base`: the path extension is appended to
    /// the base path and the query strings are combined.
    pub fn create_request(
        &self,
        base: &Url,
        request: &ManagementRequest,
    ) -> IdentityResult<reqwest::Request> {
        let url = request_url(base, request);
        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(serde_json::to_vec(body)?);
        }
        builder
            .build()
            .map_err(|e| IdentityError::Configuration(format!("failed to create request: {e}")))
    }

    async fn bearer(&self) -> IdentityResult<HeaderValue> {
        let token = self.credential.get_token(&[self.scope.as_str()]).await?;
        HeaderValue::from_str(&format!("Bearer {}", token.token)).map_err(|_| {
            IdentityError::InvalidState("access token is not a valid header value".to_string())
        })
    }

    async fn send(&self, mut request: reqwest::Request) -> IdentityResult<reqwest::Response> {
        let bearer = self.bearer().await?;
        let operation = format!("{} {}", request.method(), request.url().path());
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        headers.insert(ACCEPT, HeaderValue::from_static(JSON_CONTENT_TYPE));

        log::debug!("Sending management request {operation}");
        self.http
            .execute(request)
            .await
            .map_err(|e| IdentityError::transport(operation, e))
    }

    /// Sends one request. A `202 Accepted` comes back as an operation handle
    /// for [`AsyncOperationPoller`].
    pub async fn execute<T: DeserializeOwned>(
        &self,
        base: &Url,
        request: &ManagementRequest,
    ) -> IdentityResult<Execution<T>> {
        let http_request = self.create_request(base, request)?;
        let operation = format!("{} {}", request.method, http_request.url().path());
        let response = self.send(http_request).await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| IdentityError::transport(&operation, e))?;
                let body: &[u8] = if body.is_empty() { b"null" } else { &body };
                Ok(Execution::Completed(serde_json::from_slice(body)?))
            }
            StatusCode::ACCEPTED => {
                let headers = response.headers();
                let location = header_url(headers, LOCATION.as_str())?;
                let (poll_uri, mode) = match header_url(headers, AZURE_ASYNC_OPERATION)? {
                    Some(uri) => (uri, PollMode::AsyncOperation),
                    None => match location.clone() {
                        Some(uri) => (uri, PollMode::Location),
                        None => {
                            return Err(IdentityError::Api {
                                operation,
                                status: StatusCode::ACCEPTED.as_u16(),
                                body: "accepted response has neither Azure-AsyncOperation nor Location header"
                                    .to_string(),
                            });
                        }
                    },
                };
                log::info!("{operation} accepted, polling {} ({mode:?})", poll_uri.path());
                Ok(Execution::Accepted(AsyncOperation::new(
                    poll_uri,
                    mode,
                    location,
                    retry_after(headers),
                )))
            }
            _ => Err(IdentityError::from_response(response, operation).await),
        }
    }

    /// Like [`execute`](Self::execute), but resolves accepted operations
    /// before returning. The final status body is returned alongside the
    /// result when polling was needed.
    pub async fn execute_and_wait<T: DeserializeOwned>(
        &self,
        base: &Url,
        request: &ManagementRequest,
        cancel: &CancellationToken,
    ) -> IdentityResult<(Option<AsyncOperationResponse>, T)> {
        match self.execute::<T>(base, request).await? {
            Execution::Completed(value) => Ok((None, value)),
            Execution::Accepted(mut operation) => {
                let value = AsyncOperationPoller::new(self)
                    .poll(&mut operation, cancel)
                    .await?;
                Ok((operation.last_response, value))
            }
        }
    }

    /// Fetches the current state of an accepted operation.
    ///
    /// In [`PollMode::Location`] a `202` means still running and any other
    /// success status means done, with the body (or `null`) as the result.
    pub(crate) async fn get_operation_status(
        &self,
        poll_uri: &Url,
        mode: PollMode,
    ) -> IdentityResult<(AsyncOperationResponse, Option<Duration>)> {
        let operation = format!("GET {}", poll_uri.path());
        let request = self
            .http
            .get(poll_uri.clone())
            .build()
            .map_err(|e| IdentityError::Configuration(format!("failed to create request: {e}")))?;
        let response = self.send(request).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IdentityError::from_response(response, operation).await);
        }

        let retry_after = retry_after(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| IdentityError::transport(&operation, e))?;

        let state = match mode {
            PollMode::AsyncOperation => serde_json::from_slice(&body)?,
            PollMode::Location if status == StatusCode::ACCEPTED => {
                AsyncOperationResponse::from_location(OperationStatus::Running, None)
            }
            PollMode::Location => {
                let resource = if body.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::from_slice(&body)?
                };
                AsyncOperationResponse::from_location(OperationStatus::Succeeded, Some(resource))
            }
        };
        Ok((state, retry_after))
    }
}

fn request_url(base: &Url, request: &ManagementRequest) -> Url {
    let mut url = base.clone();

    let extension = request.path_extension.trim_start_matches('/');
    if !extension.is_empty() {
        let path = format!("{}/{extension}", base.path().trim_end_matches('/'));
        url.set_path(&path);
    }

    let query = combine_query(base.query_pairs().into_owned(), &request.query);
    if query.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(query);
    }
    url
}

fn header_url(headers: &HeaderMap, name: &str) -> IdentityResult<Option<Url>> {
    match headers.get(name).and_then(|value| value.to_str().ok()) {
        Some(value) if !value.is_empty() => Ok(Some(Url::parse(value)?)),
        _ => Ok(None),
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(url: &Url) -> Vec<(String, String)> {
        url.query_pairs().into_owned().collect()
    }

    #[test]
    fn path_extension_is_appended_to_base_path() {
        let base = Url::parse("https://management.azure.com/subscriptions/sub/").unwrap();
        let request = ManagementRequest::get("/resourceGroups/rg");
        let url = request_url(&base, &request);
        assert_eq!(url.path(), "/subscriptions/sub/resourceGroups/rg");
    }

    #[test]
    fn queries_are_combined_in_order() {
        let base = Url::parse("https://management.azure.com/x?api-version=2023-01-01&a=1").unwrap();
        let request = ManagementRequest::get("")
            .query("a", "2")
            .query("$filter", "name eq 'x'");
        let url = request_url(&base, &request);
        assert_eq!(url.path(), "/x");
        assert_eq!(
            pairs(&url),
            vec![
                ("api-version".to_string(), "2023-01-01".to_string()),
                ("a".to_string(), "1".to_string()),
                ("a".to_string(), "2".to_string()),
                ("$filter".to_string(), "name eq 'x'".to_string()),
            ]
        );
    }

    #[test]
    fn retry_after_seconds_are_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(retry_after(&headers), None);
    }
}
