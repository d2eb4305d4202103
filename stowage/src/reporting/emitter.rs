//! Report sinks.

use super::errors::{ReportResult, ERR_BAD_STATUS, ERR_BUILD_REQUEST, ERR_DO_REQUEST, ERR_ENCODE_REPORT};
use super::report::Report;
use crate::config::ENV_API_URL;
use crate::cookies::CookieManager;
use crate::errors::{CodedError, ErrorObservers};
use crate::services::{ServiceConnector, SERVICE_ENDPOINT};
use crate::utils::user_agent;
use async_trait::async_trait;
use reqwest::header;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default reporting endpoint.
pub const DEFAULT_REPORTING_URL: &str = "https://api.stowage.io/v1/reporting/reports";

/// Account service gating report emission.
pub const ALERTING_SERVICE: &str = "alerting";

/// Delivers a report somewhere.
#[async_trait]
pub trait Emitter: Send + Sync + fmt::Debug {
    /// Sends one report.
    async fn emit(&self, report: &Report) -> ReportResult<()>;
}

/// Discards reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEmitter;

#[async_trait]
impl Emitter for NullEmitter {
    async fn emit(&self, _report: &Report) -> ReportResult<()> {
        Ok(())
    }
}

/// Posts reports as JSON.
#[derive(Clone)]
pub struct HttpEmitter {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl HttpEmitter {
    /// Creates an emitter posting to `url` with bearer `token`.
    #[must_use]
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
            token: token.into(),
        }
    }

    /// Endpoint reports are posted to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Debug for HttpEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpEmitter")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Emitter for HttpEmitter {
    async fn emit(&self, report: &Report) -> ReportResult<()> {
        let body = serde_json::to_vec(report)
            .map_err(|e| CodedError::wrap(ERR_ENCODE_REPORT, e, "failed to encode report"))?;

        let mut builder = self
            .client
            .post(&self.url)
            .header(header::USER_AGENT, user_agent())
            .header(header::CONTENT_TYPE, "application/json")
            .body(body);
        if !self.token.is_empty() {
            builder = builder.bearer_auth(&self.token);
        }

        let request = builder.build().map_err(|e| {
            CodedError::wrap(ERR_BUILD_REQUEST, e, "failed to build report request")
                .with_context("url", self.url.as_str())
        })?;

        let response = self.client.execute(request).await.map_err(|e| {
            CodedError::wrap(ERR_DO_REQUEST, e, "failed to send report").with_context("url", self.url.as_str())
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CodedError::new(ERR_BAD_STATUS, "reporting endpoint rejected the report")
                .with_context("url", self.url.as_str())
                .with_context("status", status.as_u16()));
        }
        debug!(status = status.as_u16(), "report emitted");
        Ok(())
    }
}

/// Picks the emitter reports should currently go to.
#[async_trait]
pub trait EmitterResolver: Send + Sync {
    /// Returns the emitter to use now.
    async fn resolve(&self) -> Arc<dyn Emitter>;
}

/// Resolves through the user's account: reports are posted only when the
/// user is logged in and has the alerting service enabled.
#[derive(Debug, Clone)]
pub struct AccountEmitterResolver {
    cookies: CookieManager,
    reporting_url: String,
    services_endpoint: String,
    observers: Option<Arc<ErrorObservers>>,
}

impl AccountEmitterResolver {
    /// Creates a resolver reading the token from `cookies`.
    ///
    /// The reporting URL honors `STOWAGE_API_URL`.
    #[must_use]
    pub fn new(cookies: CookieManager) -> Self {
        let reporting_url = std::env::var(ENV_API_URL)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_REPORTING_URL.to_string());
        Self {
            cookies,
            reporting_url,
            services_endpoint: SERVICE_ENDPOINT.to_string(),
            observers: None,
        }
    }

    /// Overrides the reporting URL.
    #[must_use]
    pub fn with_reporting_url(mut self, url: impl Into<String>) -> Self {
        self.reporting_url = url.into();
        self
    }

    /// Overrides the account API endpoint.
    #[must_use]
    pub fn with_services_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.services_endpoint = endpoint.into();
        self
    }

    /// Routes service lookup errors through `observers` instead of the
    /// connector's default logging list.
    #[must_use]
    pub fn with_observers(mut self, observers: Arc<ErrorObservers>) -> Self {
        self.observers = Some(observers);
        self
    }
}

#[async_trait]
impl EmitterResolver for AccountEmitterResolver {
    async fn resolve(&self) -> Arc<dyn Emitter> {
        if !self.cookies.has_auth_token() {
            return Arc::new(NullEmitter);
        }
        let token = match self.cookies.get_auth_token() {
            Ok(token) if !token.is_empty() => token,
            Ok(_) => return Arc::new(NullEmitter),
            Err(e) => {
                warn!(error = %e, "failed to read auth token");
                return Arc::new(NullEmitter);
            }
        };

        let mut connector = ServiceConnector::new(token.clone()).with_endpoint(self.services_endpoint.clone());
        if let Some(observers) = &self.observers {
            connector = connector.with_observers(observers.clone());
        }

        match connector.get_service_status(ALERTING_SERVICE).await {
            Ok(true) => Arc::new(HttpEmitter::new(self.reporting_url.clone(), token)),
            Ok(false) => {
                debug!("alerting service disabled, reports are not emitted");
                Arc::new(NullEmitter)
            }
            Err(e) => {
                warn!(error = %e, "failed to check alerting service status");
                Arc::new(NullEmitter)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporting::report::{ReportRepository, ReportTask};
    use crate::testing::{serve_once, CannedResponse};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sample_report() -> Report {
        let mut report = Report::default();
        report.repository = Some(ReportRepository {
            name: "fs:/backups".into(),
            storage: None,
        });
        report.task = Some(ReportTask::new("backup", "nightly"));
        report
    }

    #[tokio::test]
    async fn test_http_emitter_posts_json() {
        let (url, request) = serve_once(CannedResponse::empty(202)).await;
        let emitter = HttpEmitter::new(format!("{url}/v1/reporting/reports"), "secret-token");

        emitter.emit(&sample_report()).await.unwrap();

        let request = request.await.unwrap();
        let lower = request.to_ascii_lowercase();
        assert!(request.starts_with("POST /v1/reporting/reports "));
        assert!(lower.contains("authorization: bearer secret-token"));
        assert!(lower.contains("content-type: application/json"));
        assert!(request.contains(r#""name":"nightly""#));
    }

    #[tokio::test]
    async fn test_http_emitter_non_2xx() {
        let (url, _request) = serve_once(CannedResponse::empty(503)).await;
        let emitter = HttpEmitter::new(url, "t");

        let err = emitter.emit(&sample_report()).await.unwrap_err();
        assert_eq!(err.code, ERR_BAD_STATUS);
        assert_eq!(err.context["status"], 503);
    }

    #[tokio::test]
    async fn test_http_emitter_unreachable() {
        let emitter = HttpEmitter::new("http://127.0.0.1:9/reports", "t");
        let err = emitter.emit(&sample_report()).await.unwrap_err();
        assert_eq!(err.code, ERR_DO_REQUEST);
    }

    #[tokio::test]
    async fn test_resolver_without_token_is_null() {
        let tmp = TempDir::new().unwrap();
        let cookies = CookieManager::new(tmp.path()).unwrap();
        let resolver = AccountEmitterResolver::new(cookies).with_services_endpoint("http://127.0.0.1:9");

        let emitter = resolver.resolve().await;
        assert_eq!(format!("{emitter:?}"), "NullEmitter");
    }

    #[tokio::test]
    async fn test_resolver_with_alerting_enabled() {
        let tmp = TempDir::new().unwrap();
        let cookies = CookieManager::new(tmp.path()).unwrap();
        cookies.put_auth_token("tok").unwrap();
        let (endpoint, request) = serve_once(CannedResponse::json(200, r#"{"enabled":true}"#)).await;
        let resolver = AccountEmitterResolver::new(cookies)
            .with_services_endpoint(endpoint)
            .with_reporting_url("http://reports.invalid/v1");

        let emitter = resolver.resolve().await;
        assert!(format!("{emitter:?}").starts_with("HttpEmitter"));
        assert!(request.await.unwrap().contains("/v1/account/services/alerting"));
    }

    #[tokio::test]
    async fn test_resolver_falls_back_on_service_error() {
        let tmp = TempDir::new().unwrap();
        let cookies = CookieManager::new(tmp.path()).unwrap();
        cookies.put_auth_token("tok").unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(0usize));
        let observers = Arc::new(ErrorObservers::new());
        let s = seen.clone();
        observers.register(move |_| *s.lock() += 1);

        let resolver = AccountEmitterResolver::new(cookies)
            .with_services_endpoint("http://127.0.0.1:9")
            .with_observers(observers);

        let emitter = resolver.resolve().await;
        assert_eq!(format!("{emitter:?}"), "NullEmitter");
        assert_eq!(*seen.lock(), 1);
    }
}
