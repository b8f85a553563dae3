//! # HTTP API Rule Client
//!
//! Evaluates HTTP API approval rules: the release is POSTed as JSON to the
//! rule's URL and any 2xx response whose body arrives intact approves it.
//!
//! ## Retry
//!
//! Rules with `retry_on_fail` are attempted up to `1 + retry_limit` times.
//! Transport failures, non-2xx responses and interrupted bodies are retried, with
//! exponential backoff between attempts. The last attempt's response is what
//! gets recorded.
//!
//! ## Recording
//!
//! Response code, content type and body are kept on the outcome. Bodies are
//! truncated to the configured limit. Transport errors (connection refused,
//! timeouts, TLS failures) leave the response code unset and record the
//! error text instead. A body that breaks off mid-stream keeps the response
//! code and partial body, records the error, and counts as a failed
//! attempt.

use std::time::Duration;

use chrono::{DateTime, Utc};
use relgate_core::{HttpApiRule, HttpResponseRecord, Release, RuleId};
use serde::Serialize;

use crate::backoff::Backoff;
use crate::config::EngineConfig;
use crate::error::EngineError;

/// JSON body sent to HTTP API rule endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseNotification {
    pub organization_id: String,
    pub application_id: String,
    pub release_id: i64,
    pub rule_id: i64,
    pub state: String,
    pub source_identity: Option<String>,
    pub comments: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ReleaseNotification {
    pub fn new(release: &Release, rule_id: RuleId) -> Self {
        Self {
            organization_id: release.key.organization_id.to_string(),
            application_id: release.key.application_id.to_string(),
            release_id: release.key.release_id,
            rule_id: rule_id.0,
            state: release.state.as_str().to_string(),
            source_identity: release.source_identity.clone(),
            comments: release.comments.clone(),
            created_at: release.created_at,
        }
    }
}

/// Shared HTTP client for rule calls.
///
/// Rules carrying their own CA certificate get a dedicated client with that
/// certificate added to the root store; all other rules share one client.
#[derive(Debug, Clone)]
pub struct HttpRuleClient {
    http: reqwest::Client,
    timeout: Duration,
    backoff: Backoff,
    max_body_bytes: usize,
}

impl HttpRuleClient {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self {
            http,
            timeout: config.http_timeout,
            backoff: config.http_retry_backoff,
            max_body_bytes: config.http_max_body_bytes,
        })
    }

    fn client_for(&self, rule: &HttpApiRule) -> Result<reqwest::Client, reqwest::Error> {
        let Some(pem) = &rule.tls_ca_certificate else {
            return Ok(self.http.clone());
        };
        let certificate = reqwest::Certificate::from_pem(pem.as_bytes())?;
        reqwest::Client::builder()
            .timeout(self.timeout)
            .add_root_certificate(certificate)
            .build()
    }

    /// Call the rule endpoint, retrying as the rule allows.
    ///
    /// Never fails: every failure mode ends up in the returned record.
    pub async fn call(&self, rule: &HttpApiRule, notification: &ReleaseNotification) -> HttpResponseRecord {
        let client = match self.client_for(rule) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(url = %rule.url, "cannot build client for HTTP approval rule: {e}");
                return HttpResponseRecord {
                    error: Some(format!("invalid TLS CA certificate: {e}")),
                    ..HttpResponseRecord::default()
                };
            }
        };

        let max_attempts = rule.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let record = self.attempt(&client, rule, notification).await;
            if record.is_success() || attempt >= max_attempts {
                return HttpResponseRecord {
                    attempts: attempt,
                    ..record
                };
            }

            let delay = self.backoff.delay(attempt - 1);
            tracing::warn!(
                url = %rule.url,
                attempt,
                max_attempts,
                response_code = ?record.response_code,
                error = ?record.error,
                "HTTP approval rule failed, retrying in {delay:?}"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(
        &self,
        client: &reqwest::Client,
        rule: &HttpApiRule,
        notification: &ReleaseNotification,
    ) -> HttpResponseRecord {
        let mut request = client.post(&rule.url).json(notification);
        if let Some(username) = &rule.username {
            request = request.basic_auth(username, rule.password.as_deref());
        }

        let mut response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return HttpResponseRecord {
                    error: Some(e.to_string()),
                    attempts: 1,
                    ..HttpResponseRecord::default()
                }
            }
        };

        let response_code = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let mut body = Vec::new();
        let mut error = None;
        while body.len() < self.max_body_bytes {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let take = chunk.len().min(self.max_body_bytes - body.len());
                    body.extend_from_slice(&chunk[..take]);
                }
                Ok(None) => break,
                Err(e) => {
                    error = Some(format!("error reading response body: {e}"));
                    break;
                }
            }
        }

        HttpResponseRecord {
            response_code: Some(response_code),
            content_type,
            body,
            error,
            attempts: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgate_core::{NewRelease, ReleaseKey};
    use wiremock::matchers::{body_partial_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(max_body_bytes: usize) -> HttpRuleClient {
        let config = EngineConfig::default()
            .with_http_timeout(Duration::from_millis(500))
            .with_http_retry_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(5)))
            .with_http_max_body_bytes(max_body_bytes);
        HttpRuleClient::new(&config).unwrap()
    }

    fn notification() -> ReleaseNotification {
        let release = NewRelease::new(ReleaseKey::new("acme", "api", 42))
            .with_source_identity("abc123")
            .into_release(Utc::now());
        ReleaseNotification::new(&release, RuleId(7))
    }

    #[tokio::test]
    async fn success_records_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/approve"))
            .and(body_partial_json(serde_json::json!({
                "organization_id": "acme",
                "release_id": 42,
                "rule_id": 7,
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/plain")
                    .set_body_string("ok"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let rule = HttpApiRule::new(format!("{}/approve", server.uri()));
        let record = client(1024).call(&rule, &notification()).await;
        assert!(record.is_success());
        assert_eq!(record.response_code, Some(200));
        assert_eq!(record.content_type, "text/plain");
        assert_eq!(record.body, b"ok");
        assert_eq!(record.attempts, 1);
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn non_2xx_without_retry_is_single_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let rule = HttpApiRule::new(server.uri());
        let record = client(1024).call(&rule, &notification()).await;
        assert!(!record.is_success());
        assert_eq!(record.response_code, Some(500));
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn retry_on_fail_exhausts_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let rule = HttpApiRule::new(server.uri()).with_retry_on_fail(2);
        let record = client(1024).call(&rule, &notification()).await;
        assert_eq!(record.response_code, Some(503));
        assert_eq!(record.attempts, 3);
    }

    #[tokio::test]
    async fn retry_stops_at_first_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let rule = HttpApiRule::new(server.uri()).with_retry_on_fail(5);
        let record = client(1024).call(&rule, &notification()).await;
        assert_eq!(record.response_code, Some(204));
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn body_is_truncated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(100)))
            .mount(&server)
            .await;

        let rule = HttpApiRule::new(server.uri());
        let record = client(10).call(&rule, &notification()).await;
        assert_eq!(record.body.len(), 10);
    }

    #[tokio::test]
    async fn basic_auth_header_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let rule = HttpApiRule::new(server.uri()).with_basic_auth("ci", "s3cret");
        let record = client(1024).call(&rule, &notification()).await;
        assert!(record.is_success());
    }

    #[tokio::test]
    async fn transport_error_has_no_response_code() {
        let rule = HttpApiRule::new("http://127.0.0.1:1/");
        let record = client(1024).call(&rule, &notification()).await;
        assert!(record.response_code.is_none());
        assert!(record.error.is_some());
        assert!(!record.is_success());
    }

    #[tokio::test]
    async fn timeout_is_a_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let rule = HttpApiRule::new(server.uri());
        let record = client(1024).call(&rule, &notification()).await;
        assert!(record.response_code.is_none());
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn unusable_ca_certificate_fails_rule() {
        let rule = HttpApiRule::new("https://127.0.0.1:1/").with_tls_ca_certificate("not a certificate");
        let record = client(1024).call(&rule, &notification()).await;
        assert!(record.response_code.is_none());
        assert!(record.error.is_some());
    }
}
