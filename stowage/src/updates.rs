//! Release feed check for security and reliability fixes.

use crate::utils::user_agent;
use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, warn};

/// Default release feed.
pub const RELEASES_FEED_URL: &str = "https://releases.stowage.io/releases.json";

/// Name of the cached feed inside the cache directory.
pub const RELEASES_CACHE_FILE: &str = "releases.json";

/// How long a fetched feed is reused.
pub const RELEASES_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors raised while checking for updates.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The feed could not be fetched.
    #[error("failed to fetch release feed: {0}")]
    Fetch(String),

    /// The feed is not valid JSON.
    #[error("invalid release feed: {0}")]
    Decode(#[from] serde_json::Error),

    /// A version string could not be parsed.
    #[error("invalid version: {0}")]
    InvalidVersion(String),
}

/// One published release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    /// Version tag, with or without a leading `v`.
    pub version: String,
    /// The release fixes a security issue.
    #[serde(default)]
    pub security_fix: bool,
    /// The release fixes a reliability issue.
    #[serde(default)]
    pub reliability_fix: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReleaseFeed {
    releases: Vec<Release>,
}

/// What the releases newer than the running version contain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    /// Newest release, empty when up to date.
    pub latest: String,
    /// Number of newer releases.
    pub found_count: usize,
    /// Some newer release fixes a security issue.
    pub security_fix: bool,
    /// Some newer release fixes a reliability issue.
    pub reliability_fix: bool,
}

impl UpdateSummary {
    /// Returns the warning to print, if any fix applies.
    #[must_use]
    pub fn warning(&self) -> Option<String> {
        let concerns = match (self.security_fix, self.reliability_fix) {
            (true, true) => "security and reliability",
            (true, false) => "security",
            (false, true) => "reliability",
            (false, false) => return None,
        };
        Some(format!(
            "WARNING: {concerns} concerns affect your current version, please upgrade to {} (+{} releases).",
            self.latest, self.found_count
        ))
    }
}

/// Checks whether the running version needs an upgrade.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpdateChecker: Send + Sync {
    /// Summarizes the releases newer than `current`.
    async fn check(&self, current: &str) -> Result<UpdateSummary, UpdateError>;
}

/// Fetches the release feed over HTTP, caching it on disk.
#[derive(Debug, Clone)]
pub struct HttpUpdateChecker {
    client: reqwest::Client,
    feed_url: String,
    cache_file: PathBuf,
    max_age: Duration,
}

impl HttpUpdateChecker {
    /// Creates a checker caching the feed in `cache_dir`.
    #[must_use]
    pub fn new(cache_dir: &Path) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            feed_url: RELEASES_FEED_URL.to_string(),
            cache_file: cache_dir.join(RELEASES_CACHE_FILE),
            max_age: RELEASES_MAX_AGE,
        }
    }

    /// Overrides the feed URL.
    #[must_use]
    pub fn with_feed_url(mut self, url: impl Into<String>) -> Self {
        self.feed_url = url.into();
        self
    }

    /// Overrides how long the cached feed is trusted.
    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    fn cached_feed(&self) -> Option<Vec<u8>> {
        let modified = fs::metadata(&self.cache_file).and_then(|m| m.modified()).ok()?;
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        if age >= self.max_age {
            return None;
        }
        fs::read(&self.cache_file).ok()
    }

    async fn fetch_feed(&self) -> Result<Vec<u8>, UpdateError> {
        let response = self
            .client
            .get(&self.feed_url)
            .header(header::USER_AGENT, user_agent())
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| UpdateError::Fetch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(UpdateError::Fetch(format!("status {}", response.status())));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| UpdateError::Fetch(e.to_string()))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl UpdateChecker for HttpUpdateChecker {
    async fn check(&self, current: &str) -> Result<UpdateSummary, UpdateError> {
        let data = match self.cached_feed() {
            Some(data) => data,
            None => {
                let data = self.fetch_feed().await?;
                // Validate before caching.
                serde_json::from_slice::<ReleaseFeed>(&data)?;
                if let Err(e) = fs::write(&self.cache_file, &data) {
                    warn!(error = %e, path = %self.cache_file.display(), "failed to cache release feed");
                }
                data
            }
        };
        let feed: ReleaseFeed = serde_json::from_slice(&data)?;
        let summary = summarize(current, &feed.releases)?;
        debug!(latest = %summary.latest, found = summary.found_count, "release feed checked");
        Ok(summary)
    }
}

/// Summarizes `releases` newer than `current`. Unparseable feed entries are skipped.
pub fn summarize(current: &str, releases: &[Release]) -> Result<UpdateSummary, UpdateError> {
    let current_parts = parse_version(current).ok_or_else(|| UpdateError::InvalidVersion(current.to_string()))?;

    let mut summary = UpdateSummary::default();
    let mut latest: Option<Vec<u64>> = None;
    for release in releases {
        let Some(parts) = parse_version(&release.version) else {
            continue;
        };
        if parts.cmp(&current_parts) != Ordering::Greater {
            continue;
        }
        summary.found_count += 1;
        summary.security_fix |= release.security_fix;
        summary.reliability_fix |= release.reliability_fix;
        if latest.as_ref().map_or(true, |l| parts > *l) {
            summary.latest.clone_from(&release.version);
            latest = Some(parts);
        }
    }
    Ok(summary)
}

/// Compares two version strings numerically.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    Some(parse_version(a)?.cmp(&parse_version(b)?))
}

/// `v1.2.3-rc1` parses as `[1, 2, 3]`; missing components count as zero.
fn parse_version(version: &str) -> Option<Vec<u64>> {
    let core = version.trim().trim_start_matches('v');
    let core = core.split(['-', '+']).next()?;
    let mut parts = core
        .split('.')
        .map(|p| p.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    while parts.len() < 3 {
        parts.push(0);
    }
    Some(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{serve_once, CannedResponse};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn release(version: &str, security: bool, reliability: bool) -> Release {
        Release {
            version: version.into(),
            security_fix: security,
            reliability_fix: reliability,
        }
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("v1.2.0", "1.10.0"), Some(Ordering::Less));
        assert_eq!(compare_versions("1.0", "1.0.0"), Some(Ordering::Equal));
        assert_eq!(compare_versions("2.0.0-beta", "1.9.9"), Some(Ordering::Greater));
        assert_eq!(compare_versions("main", "1.0.0"), None);
    }

    #[test]
    fn test_summarize_newer_releases() {
        let releases = vec![
            release("v0.9.0", true, true),
            release("v1.0.1", false, true),
            release("v1.1.0", true, false),
            release("garbage", true, true),
        ];
        let summary = summarize("1.0.0", &releases).unwrap();
        assert_eq!(
            summary,
            UpdateSummary {
                latest: "v1.1.0".into(),
                found_count: 2,
                security_fix: true,
                reliability_fix: true,
            }
        );
        assert_eq!(
            summary.warning().unwrap(),
            "WARNING: security and reliability concerns affect your current version, please upgrade to v1.1.0 (+2 releases)."
        );
    }

    #[test]
    fn test_up_to_date_has_no_warning() {
        let summary = summarize("2.0.0", &[release("1.0.0", true, false)]).unwrap();
        assert_eq!(summary.found_count, 0);
        assert!(summary.warning().is_none());
        assert!(summarize("dev", &[]).is_err());
    }

    #[tokio::test]
    async fn test_fetch_then_cache() {
        let tmp = TempDir::new().unwrap();
        let feed = r#"{"releases":[{"version":"9.0.0","security_fix":true}]}"#;
        let (url, _request) = serve_once(CannedResponse::json(200, feed)).await;

        let checker = HttpUpdateChecker::new(tmp.path()).with_feed_url(url);
        let summary = checker.check("1.0.0").await.unwrap();
        assert!(summary.security_fix);
        assert!(tmp.path().join(RELEASES_CACHE_FILE).is_file());

        // The server is gone; the cached feed answers.
        let summary = checker.check("1.0.0").await.unwrap();
        assert_eq!(summary.latest, "9.0.0");
    }

    #[tokio::test]
    async fn test_stale_cache_refetches() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(RELEASES_CACHE_FILE), r#"{"releases":[]}"#).unwrap();

        let checker = HttpUpdateChecker::new(tmp.path())
            .with_feed_url("http://127.0.0.1:9/releases.json")
            .with_max_age(Duration::ZERO);
        assert!(matches!(checker.check("1.0.0").await, Err(UpdateError::Fetch(_))));
    }
}
