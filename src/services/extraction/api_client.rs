use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use super::{freshness_schema, multi_product_prompt, product_prompt, product_schema, VisionExtractor, FRESHNESS_PROMPT};
use crate::core::config::Config;
use crate::core::errors::{AnalysisError, ItemResult};
use crate::core::types::{ProductRecord, RemoteFreshness};
use crate::middleware::{CircuitBreaker, Credential, CredentialPool};
use crate::utils::Metrics;

/// OpenAI-compatible chat completions client with structured outputs
///
/// Each call authenticates with the credential leased by the calling task.
pub struct OpenAiExtractor {
    http_client: reqwest::Client,
    base_url: String,
    model: String,
    max_retries: u32,
    credentials: CredentialPool,
    circuit_breaker: CircuitBreaker,
    metrics: Option<Metrics>,
}

impl OpenAiExtractor {
    pub fn new(config: &Config, credentials: CredentialPool, metrics: Option<Metrics>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api.timeout_seconds))
            .pool_max_idle_per_host(config.credential_pool_size().max(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            base_url: config.api.base_url.trim_end_matches('/').to_string(),
            model: config.api.model.clone(),
            max_retries: config.api.max_retries,
            credentials,
            circuit_breaker: CircuitBreaker::new("vision-api"),
            metrics,
        })
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreaker) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    /// Chat completion request with the images inlined as `image_url` parts
    pub fn build_request(&self, prompt: &str, data_urls: &[&str], schema_name: &str, schema: Value) -> Value {
        let mut content = vec![json!({ "type": "text", "text": prompt })];
        content.extend(
            data_urls
                .iter()
                .map(|url| json!({ "type": "image_url", "image_url": { "url": url } })),
        );

        json!({
            "model": self.model,
            "temperature": 0,
            "messages": [{ "role": "user", "content": content }],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": schema_name,
                    "strict": true,
                    "schema": schema
                }
            }
        })
    }

    async fn complete<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        prompt: &str,
        data_urls: &[&str],
        schema_name: &str,
        schema: Value,
    ) -> ItemResult<T> {
        if !credential.has_key() {
            return Err(AnalysisError::remote(format!(
                "No API key configured for credential {}",
                credential.index
            )));
        }

        if let Err(open) = self.circuit_breaker.check() {
            warn!("Circuit breaker is open, failing fast");
            return Err(AnalysisError::remote(open));
        }

        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_request(prompt, data_urls, schema_name, schema);

        let start = Instant::now();
        let result = self.send_with_retries(&url, &body, credential).await;
        let duration = start.elapsed();

        match result {
            Ok(response_text) => {
                self.circuit_breaker.record_success();
                self.credentials.record_success(credential.index);

                let response: Value = serde_json::from_str(&response_text)
                    .map_err(|e| AnalysisError::remote(format!("Failed to parse API response: {}", e)))?;

                let (input_tokens, output_tokens) = extract_token_usage(&response);
                if let Some(ref m) = self.metrics {
                    m.record_api_call(true, duration, input_tokens, output_tokens);
                }
                debug!(
                    "{} completed in {:.2}ms ({} in / {} out tokens)",
                    schema_name,
                    duration.as_secs_f64() * 1000.0,
                    input_tokens,
                    output_tokens
                );

                parse_completion(&response).map_err(|e| AnalysisError::remote(format!("{:#}", e)))
            }
            Err(e) => {
                // Only an unavailable service counts toward the shared breaker
                if e.is_transient() && self.circuit_breaker.record_failure() {
                    if let Some(ref m) = self.metrics {
                        m.record_circuit_breaker_trip();
                    }
                }
                self.credentials.record_failure(credential.index);
                if let Some(ref m) = self.metrics {
                    m.record_api_call(false, duration, 0, 0);
                }
                warn!("{} failed on credential {}: {}", schema_name, credential.index, e);
                Err(AnalysisError::remote(e))
            }
        }
    }

    /// POST with exponential backoff plus jitter between transient failures
    async fn send_with_retries(
        &self,
        url: &str,
        body: &Value,
        credential: &Credential,
    ) -> std::result::Result<String, SendError> {
        let max_retries = self.max_retries;
        let mut attempt = 0;

        loop {
            let failure = match self
                .http_client
                .post(url)
                .bearer_auth(credential.api_key())
                .json(body)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.text().await.map_err(SendError::Transport);
                    }
                    let body = response.text().await.unwrap_or_default();
                    SendError::Status { status, body }
                }
                Err(e) => SendError::Transport(e),
            };

            if attempt >= max_retries || !failure.is_transient() {
                return Err(failure);
            }

            debug!("{}. Retrying ({}/{})", failure, attempt + 1, max_retries);
            // Rate limits and overloads get a fixed, longer pause
            match failure.status() {
                Some(StatusCode::TOO_MANY_REQUESTS) | Some(StatusCode::SERVICE_UNAVAILABLE) => {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                _ => backoff(attempt).await,
            }
            attempt += 1;
        }
    }
}

/// Outcome of a failed POST, classified by whether the service itself is struggling
#[derive(Debug, thiserror::Error)]
enum SendError {
    #[error("HTTP request to vision API failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("API request failed: {status} - {body}")]
    Status { status: StatusCode, body: String },
}

impl SendError {
    fn status(&self) -> Option<StatusCode> {
        match self {
            SendError::Transport(_) => None,
            SendError::Status { status, .. } => Some(*status),
        }
    }

    /// Transport errors, 5xx and 429 say the service is unavailable.
    /// Any other rejection belongs to the one request that drew it.
    fn is_transient(&self) -> bool {
        match self.status() {
            None => true,
            Some(status) => status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

async fn backoff(attempt: u32) {
    let base_delay = 2_u64.pow(attempt);
    let jitter = rand::random::<u64>() % 1000;
    tokio::time::sleep(Duration::from_millis(base_delay * 1000 + jitter)).await;
}

/// Pull the structured object out of a chat completion
pub fn parse_completion<T: DeserializeOwned>(response: &Value) -> Result<T> {
    let message = &response["choices"][0]["message"];

    if let Some(refusal) = message["refusal"].as_str() {
        anyhow::bail!("Model refused the request: {}", refusal);
    }

    let content = message["content"]
        .as_str()
        .context("Missing message content in API response")?;

    serde_json::from_str(content).context("Failed to parse structured output")
}

fn extract_token_usage(response: &Value) -> (u64, u64) {
    let usage = &response["usage"];
    let input_tokens = usage["prompt_tokens"].as_u64().unwrap_or(0);
    let output_tokens = usage["completion_tokens"].as_u64().unwrap_or(0);
    (input_tokens, output_tokens)
}

#[async_trait]
impl VisionExtractor for OpenAiExtractor {
    #[instrument(skip(self, credential, data_url), fields(credential = credential.index))]
    async fn extract_product(&self, credential: &Credential, data_url: &str) -> ItemResult<ProductRecord> {
        self.complete(credential, &product_prompt(), &[data_url], "product_analysis", product_schema())
            .await
    }

    #[instrument(skip(self, credential, data_url), fields(credential = credential.index))]
    async fn extract_freshness(&self, credential: &Credential, data_url: &str) -> ItemResult<RemoteFreshness> {
        self.complete(credential, FRESHNESS_PROMPT, &[data_url], "freshness_analysis", freshness_schema())
            .await
    }

    #[instrument(skip(self, credential, data_urls), fields(credential = credential.index, images = data_urls.len()))]
    async fn extract_product_multi(
        &self,
        credential: &Credential,
        data_urls: &[String],
    ) -> ItemResult<ProductRecord> {
        let urls: Vec<&str> = data_urls.iter().map(String::as_str).collect();
        self.complete(credential, &multi_product_prompt(), &urls, "product_analysis", product_schema())
            .await
    }
}
