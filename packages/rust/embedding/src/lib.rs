//! Embedding service boundary.
//!
//! The sync pipeline only needs one capability from the outside world:
//! `embed(texts) -> vectors`, batched. [`Embedder`] is that seam;
//! [`OpenAiEmbedder`] implements it against any OpenAI-compatible
//! `/embeddings` endpoint with per-batch timeouts and bounded
//! exponential-backoff retries.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use url::Url;

use topicsync_shared::{EmbeddingConfig, Result, TopicSyncError};

/// User-Agent string for embedding requests.
const USER_AGENT: &str = concat!("topicsync/", env!("CARGO_PKG_VERSION"));

/// Base delay for retry backoff; doubled per attempt.
const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(500);

/// Backoff exponent is capped so a long retry budget does not sleep for minutes.
const MAX_BACKOFF_SHIFT: u32 = 5;

// ---------------------------------------------------------------------------
// Embedder trait
// ---------------------------------------------------------------------------

/// A batched text-to-vector service.
#[allow(async_fn_in_trait)]
pub trait Embedder {
    /// Maximum number of texts accepted per [`Embedder::embed`] call.
    fn batch_size(&self) -> usize;

    /// Embed `texts`, returning one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible client
// ---------------------------------------------------------------------------

/// Construction options for [`OpenAiEmbedder`].
#[derive(Debug, Clone)]
pub struct EmbedderOptions {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub dimensions: Option<usize>,
    pub timeout: Duration,
    /// Total attempts per batch (at least 1).
    pub max_attempts: usize,
    pub batch_size: usize,
    pub retry_base: Duration,
}

impl EmbedderOptions {
    /// Build options from the `[embedding]` config section and a resolved API key.
    pub fn from_config(config: &EmbeddingConfig, api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            dimensions: config.dimensions,
            timeout: Duration::from_secs(config.timeout_secs),
            max_attempts: config.max_retries + 1,
            batch_size: config.batch_size,
            retry_base: DEFAULT_RETRY_BASE,
        }
    }
}

/// Embeddings client for OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: Url,
    model: String,
    dimensions: Option<usize>,
    max_attempts: usize,
    batch_size: usize,
    retry_base: Duration,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    /// Build a new client. Fails on a blank key or model, or an invalid base URL.
    pub fn new(opts: EmbedderOptions) -> Result<Self> {
        if opts.api_key.trim().is_empty() {
            return Err(TopicSyncError::config("missing embedding API key"));
        }
        if opts.model.trim().is_empty() {
            return Err(TopicSyncError::config("missing embedding model name"));
        }

        let base = opts.base_url.trim_end_matches('/');
        let endpoint = Url::parse(&format!("{base}/embeddings")).map_err(|e| {
            TopicSyncError::config(format!("invalid embedding base_url {}: {e}", opts.base_url))
        })?;

        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", opts.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| TopicSyncError::config("embedding API key is not a valid header"))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(opts.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| TopicSyncError::Embedding(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            model: opts.model,
            dimensions: opts.dimensions,
            max_attempts: opts.max_attempts.max(1),
            batch_size: opts.batch_size.max(1),
            retry_base: opts.retry_base,
        })
    }

    fn should_retry(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    fn is_retryable_error(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
    }

    fn retry_backoff(&self, attempt: usize) -> Duration {
        let shift = (attempt as u32).min(MAX_BACKOFF_SHIFT);
        self.retry_base * (1 << shift)
    }

    async fn send_once(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, Attempt> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.dimensions,
        };

        let response = match self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                let retry = Self::is_retryable_error(&e);
                return Err(Attempt::failed(format!("request failed: {e}"), retry));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            let snippet: String = body.chars().take(200).collect();
            return Err(Attempt::failed(
                format!("HTTP {status}: {snippet}"),
                Self::should_retry(status),
            ));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Attempt::failed(format!("invalid embedding response: {e}"), false))?;

        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != texts.len() {
            return Err(Attempt::failed(
                format!(
                    "service returned {} embeddings for {} inputs",
                    parsed.data.len(),
                    texts.len()
                ),
                false,
            ));
        }

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Outcome of one failed attempt.
struct Attempt {
    message: String,
    retryable: bool,
}

impl Attempt {
    fn failed(message: String, retryable: bool) -> Self {
        Self { message, retryable }
    }
}

impl Embedder for OpenAiEmbedder {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[instrument(skip_all, fields(inputs = texts.len(), model = %self.model))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.len() > self.batch_size {
            return Err(TopicSyncError::Embedding(format!(
                "batch of {} exceeds configured max {}",
                texts.len(),
                self.batch_size
            )));
        }

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.send_once(texts).await {
                Ok(vectors) => {
                    debug!(attempt, "embedding batch succeeded");
                    return Ok(vectors);
                }
                Err(failure) if failure.retryable && attempt < self.max_attempts => {
                    let delay = self.retry_backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.message,
                        "embedding batch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => {
                    return Err(TopicSyncError::Embedding(format!(
                        "{} (after {attempt} attempt(s))",
                        failure.message
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options(base_url: &str) -> EmbedderOptions {
        EmbedderOptions {
            api_key: "test-key".into(),
            base_url: base_url.into(),
            model: "test-embed".into(),
            dimensions: Some(3),
            timeout: Duration::from_secs(5),
            max_attempts: 3,
            batch_size: 4,
            retry_base: Duration::from_millis(1),
        }
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("topic {i}")).collect()
    }

    fn ok_body(n: usize) -> serde_json::Value {
        // Reverse order to check the client re-sorts by index
        let data: Vec<_> = (0..n)
            .rev()
            .map(|i| serde_json::json!({ "index": i, "embedding": [i as f32, 0.5, -0.5] }))
            .collect();
        serde_json::json!({ "data": data })
    }

    #[test]
    fn rejects_blank_key_and_bad_url() {
        let mut opts = options("http://localhost:1");
        opts.api_key = "  ".into();
        assert!(OpenAiEmbedder::new(opts).is_err());

        let opts = options("not a url");
        assert!(OpenAiEmbedder::new(opts).is_err());
    }

    #[test]
    fn retries_come_on_top_of_first_attempt() {
        let config = EmbeddingConfig::default();
        let opts = EmbedderOptions::from_config(&config, "sk-test");
        assert_eq!(opts.max_attempts, config.max_retries + 1);
        assert_eq!(opts.max_attempts, 5);

        let config = EmbeddingConfig {
            max_retries: 0,
            ..EmbeddingConfig::default()
        };
        assert_eq!(EmbedderOptions::from_config(&config, "sk-test").max_attempts, 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut opts = options("http://localhost:1");
        opts.retry_base = Duration::from_millis(10);
        let client = OpenAiEmbedder::new(opts).unwrap();
        assert_eq!(client.retry_backoff(1), Duration::from_millis(20));
        assert_eq!(client.retry_backoff(2), Duration::from_millis(40));
        assert_eq!(client.retry_backoff(50), Duration::from_millis(320));
    }

    #[tokio::test]
    async fn embeds_batch_in_input_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(3)))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiEmbedder::new(options(&format!("{}/v1/", server.uri()))).unwrap();
        let vectors = client.embed(&texts(3)).await.expect("embed");
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0][0], 0.0);
        assert_eq!(vectors[2][0], 2.0);
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(2)))
            .mount(&server)
            .await;

        let client = OpenAiEmbedder::new(options(&server.uri())).unwrap();
        let vectors = client.embed(&texts(2)).await.expect("embed after retries");
        assert_eq!(vectors.len(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let client = OpenAiEmbedder::new(options(&server.uri())).unwrap();
        let err = client.embed(&texts(1)).await.unwrap_err();
        assert!(err.to_string().contains("after 3 attempt"));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad model"))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiEmbedder::new(options(&server.uri())).unwrap();
        let err = client.embed(&texts(1)).await.unwrap_err();
        assert!(err.to_string().contains("bad model"));
    }

    #[tokio::test]
    async fn count_mismatch_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(1)))
            .mount(&server)
            .await;

        let client = OpenAiEmbedder::new(options(&server.uri())).unwrap();
        let err = client.embed(&texts(2)).await.unwrap_err();
        assert!(err.to_string().contains("1 embeddings for 2 inputs"));
    }

    #[tokio::test]
    async fn oversized_batch_rejected_without_request() {
        let client = OpenAiEmbedder::new(options("http://127.0.0.1:9")).unwrap();
        let err = client.embed(&texts(5)).await.unwrap_err();
        assert!(err.to_string().contains("exceeds configured max"));
    }
}
