//! Client for the account services API.
//!
//! The account API exposes per-service toggles (`alerting`, ...) and their
//! configuration. Every failure is a [`CodedError`] with a `services.*` code,
//! routed through the connector's own observer list before being returned.

use crate::errors::{CodedError, ErrorCode, ErrorObservers};
use crate::utils::user_agent;
use reqwest::{header, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default account API endpoint.
pub const SERVICE_ENDPOINT: &str = "https://api.stowage.io";

/// The request could not be built.
pub const ERR_BUILD_REQUEST: ErrorCode = ErrorCode("services.request_build");
/// The HTTP call failed.
pub const ERR_DO_REQUEST: ErrorCode = ErrorCode("services.request_do");
/// The API answered with an unexpected status.
pub const ERR_UNEXPECTED_STATUS: ErrorCode = ErrorCode("services.bad_status");
/// The response body could not be read.
pub const ERR_READ_BODY: ErrorCode = ErrorCode("services.read_body");
/// The response body is not the expected JSON.
pub const ERR_DECODE_RESPONSE: ErrorCode = ErrorCode("services.decode_response");
/// The request body could not be encoded.
pub const ERR_ENCODE_REQUEST: ErrorCode = ErrorCode("services.encode_request");
/// The named service is not offered.
pub const ERR_SERVICE_NOT_FOUND: ErrorCode = ErrorCode("services.not_found");

/// Result type of the connector.
pub type ServiceResult<T> = Result<T, CodedError>;

/// A service offered by the account API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescription {
    /// Identifier used in URLs.
    pub name: String,
    /// Human readable name.
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ServiceStatus {
    enabled: bool,
}

/// Talks to the account services API on behalf of an authenticated user.
#[derive(Debug, Clone)]
pub struct ServiceConnector {
    client: reqwest::Client,
    endpoint: String,
    auth_token: String,
    observers: Arc<ErrorObservers>,
}

impl ServiceConnector {
    /// Creates a connector for the default endpoint.
    #[must_use]
    pub fn new(auth_token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: SERVICE_ENDPOINT.to_string(),
            auth_token: auth_token.into(),
            observers: Arc::new(ErrorObservers::logging("service connector")),
        }
    }

    /// Points the connector at another endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// Replaces the observer list errors are routed through.
    #[must_use]
    pub fn with_observers(mut self, observers: Arc<ErrorObservers>) -> Self {
        self.observers = observers;
        self
    }

    /// Observer list owned by this connector.
    #[must_use]
    pub fn observers(&self) -> &Arc<ErrorObservers> {
        &self.observers
    }

    /// Lists the services offered to this account.
    pub async fn get_service_list(&self) -> ServiceResult<Vec<ServiceDescription>> {
        let url = format!("{}/v1/account/services", self.endpoint);
        let body = self.call(Method::GET, &url, None, None, &[StatusCode::OK]).await?;
        self.decode(&body, &url, None, "failed to decode service list")
    }

    /// Returns an error when `name` is not among the offered services.
    pub async fn ensure_service_exists(&self, name: &str) -> ServiceResult<()> {
        let services = self.get_service_list().await?;
        if services.iter().any(|s| s.name == name) {
            return Ok(());
        }
        Err(self.observers.emit(
            CodedError::new(ERR_SERVICE_NOT_FOUND, "service not found").with_context("service", name),
        ))
    }

    /// Returns whether the named service is enabled.
    pub async fn get_service_status(&self, name: &str) -> ServiceResult<bool> {
        let url = self.service_url(name, "");
        let body = self
            .call(Method::GET, &url, Some(name), None, &[StatusCode::OK])
            .await?;
        let status: ServiceStatus = self.decode(&body, &url, Some(name), "failed to decode service status")?;
        Ok(status.enabled)
    }

    /// Enables or disables the named service.
    pub async fn set_service_status(&self, name: &str, enabled: bool) -> ServiceResult<()> {
        let url = self.service_url(name, "");
        let payload = serde_json::to_vec(&ServiceStatus { enabled }).map_err(|e| {
            self.observers.emit(
                CodedError::wrap(ERR_ENCODE_REQUEST, e, "failed to encode service status")
                    .with_context("service", name)
                    .with_context("enabled", enabled),
            )
        })?;
        self.call(
            Method::PUT,
            &url,
            Some(name),
            Some(payload),
            &[StatusCode::OK, StatusCode::NO_CONTENT],
        )
        .await?;
        debug!(service = name, enabled, "service status updated");
        Ok(())
    }

    /// Returns the configuration of the named service.
    pub async fn get_service_configuration(&self, name: &str) -> ServiceResult<BTreeMap<String, String>> {
        let url = self.service_url(name, "/configuration");
        let body = self
            .call(Method::GET, &url, Some(name), None, &[StatusCode::OK])
            .await?;
        self.decode(&body, &url, Some(name), "failed to decode service configuration")
    }

    /// Replaces the configuration of the named service.
    pub async fn set_service_configuration(
        &self,
        name: &str,
        configuration: &BTreeMap<String, String>,
    ) -> ServiceResult<()> {
        let url = self.service_url(name, "/configuration");
        let payload = serde_json::to_vec(configuration).map_err(|e| {
            self.observers.emit(
                CodedError::wrap(ERR_ENCODE_REQUEST, e, "failed to encode service configuration")
                    .with_context("service", name),
            )
        })?;
        self.call(
            Method::PUT,
            &url,
            Some(name),
            Some(payload),
            &[StatusCode::OK, StatusCode::NO_CONTENT],
        )
        .await?;
        Ok(())
    }

    fn service_url(&self, name: &str, suffix: &str) -> String {
        format!("{}/v1/account/services/{name}{suffix}", self.endpoint)
    }

    fn fail(&self, error: CodedError, url: &str, service: Option<&str>) -> CodedError {
        let mut error = error.with_context("url", url);
        if let Some(service) = service {
            error = error.with_context("service", service);
        }
        self.observers.emit(error)
    }

    async fn call(
        &self,
        method: Method,
        url: &str,
        service: Option<&str>,
        payload: Option<Vec<u8>>,
        accepted: &[StatusCode],
    ) -> ServiceResult<Vec<u8>> {
        let mut builder = self
            .client
            .request(method, url)
            .header(header::USER_AGENT, user_agent())
            .header(header::ACCEPT, "application/json")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT_CHARSET, "utf-8");
        if !self.auth_token.is_empty() {
            builder = builder.bearer_auth(&self.auth_token);
        }
        if let Some(payload) = payload {
            builder = builder.body(payload);
        }

        let request = builder.build().map_err(|e| {
            self.fail(CodedError::wrap(ERR_BUILD_REQUEST, e, "failed to create request"), url, service)
        })?;

        let response = self.client.execute(request).await.map_err(|e| {
            self.fail(CodedError::wrap(ERR_DO_REQUEST, e, "service request failed"), url, service)
        })?;

        let status = response.status();
        if !accepted.contains(&status) {
            return Err(self.fail(
                CodedError::new(ERR_UNEXPECTED_STATUS, "unexpected service response")
                    .with_context("status", status.as_u16()),
                url,
                service,
            ));
        }

        let body = response.bytes().await.map_err(|e| {
            self.fail(CodedError::wrap(ERR_READ_BODY, e, "failed to read service response"), url, service)
        })?;
        Ok(body.to_vec())
    }

    fn decode<T: for<'de> Deserialize<'de>>(
        &self,
        body: &[u8],
        url: &str,
        service: Option<&str>,
        message: &str,
    ) -> ServiceResult<T> {
        serde_json::from_slice(body)
            .map_err(|e| self.fail(CodedError::wrap(ERR_DECODE_RESPONSE, e, message), url, service))
    }
}
