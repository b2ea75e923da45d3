#[cfg(test)]
mod tests;

pub mod transport;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

pub use transport::{
    HttpRequest, HttpResponse, HttpTransport, TransportError, UreqTransport,
};

const DEFAULT_MAX_BATCH_SIZE: usize = 64;
const DEFAULT_MAX_CONCURRENCY: usize = 5;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const EXPONENTIAL_BACKOFF_BASE: u32 = 2;
const MAX_ERROR_MESSAGE_CHARS: usize = 500;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider configuration error: {0}")]
    Configuration(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Unsupported response format: {0}")]
    UnsupportedResponse(String),

    #[error("Mismatch between request and response counts: {expected} vs {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("Embedding request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// HTTP status carried by the error, if any
    #[inline]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Stable machine-readable error code
    #[inline]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Http { .. } => "http",
            Self::Transport(_) => "transport",
            Self::UnsupportedResponse(_) => "unsupported_response",
            Self::CountMismatch { .. } => "count_mismatch",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether repeating the same request may succeed
    #[inline]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            Self::Transport(_) => true,
            _ => false,
        }
    }
}

/// Wire dialect spoken by an embeddings endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// One `prompt` per request, one `embedding` per response
    SingleDocument,
    /// OpenAI-compatible `input` array in, `data` array out
    Batched,
}

impl Dialect {
    /// Infer the dialect from an endpoint URL. Only Ollama's legacy
    /// `/api/embeddings` route is single-document.
    #[inline]
    pub fn detect(endpoint: &str) -> Self {
        let path = Url::parse(endpoint)
            .map(|url| url.path().to_string())
            .unwrap_or_else(|_| endpoint.to_string());

        if path.trim_end_matches('/').ends_with("/api/embeddings") {
            Self::SingleDocument
        } else {
            Self::Batched
        }
    }
}

/// Configured dialect; `Auto` is resolved against the endpoint once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialectPreference {
    #[default]
    Auto,
    SingleDocument,
    Batched,
}

impl DialectPreference {
    #[inline]
    pub fn resolve(self, endpoint: &str) -> Dialect {
        match self {
            Self::Auto => Dialect::detect(endpoint),
            Self::SingleDocument => Dialect::SingleDocument,
            Self::Batched => Dialect::Batched,
        }
    }
}

/// Intent of the text being embedded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputType {
    #[default]
    Document,
    Query,
}

impl InputType {
    /// Hint sent by the single-document dialect
    #[inline]
    pub const fn task_type(self) -> &'static str {
        match self {
            Self::Document => "retrieval_document",
            Self::Query => "retrieval_query",
        }
    }

    /// Hint sent by the batched dialect
    #[inline]
    pub const fn input_type(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Query => "query",
        }
    }
}

/// Cooperative cancellation flag checked before each new request
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EmbedOptions {
    pub input_type: InputType,
    pub cancellation: Option<CancellationFlag>,
}

impl EmbedOptions {
    #[inline]
    pub fn query() -> Self {
        Self {
            input_type: InputType::Query,
            cancellation: None,
        }
    }

    #[inline]
    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancellation = Some(flag);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationFlag::is_cancelled)
    }
}

/// Turns text into raw embedding vectors
#[async_trait]
pub trait EmbeddingsProvider: Send + Sync {
    /// Provider identifier used when building namespaces
    fn provider_id(&self) -> &str;

    fn model(&self) -> &str;

    fn max_batch_size(&self) -> usize;

    /// Dimension seen in the first successful response, if any
    fn observed_dimension(&self) -> Option<usize>;

    fn validate_configuration(&self) -> Result<(), ProviderError>;

    /// Embed `texts`, returning one vector per input in input order
    async fn generate_embeddings(
        &self,
        texts: &[String],
        options: &EmbedOptions,
    ) -> Result<Vec<Vec<f32>>, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct ProviderOptions {
    pub provider_id: String,
    pub endpoint: String,
    pub model: String,
    pub dialect: Dialect,
    pub api_key: Option<String>,
    pub max_batch_size: usize,
    pub max_concurrency: usize,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
}

impl ProviderOptions {
    /// Options with default limits and a dialect detected from `endpoint`
    #[inline]
    pub fn new(provider_id: &str, endpoint: &str, model: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            dialect: Dialect::detect(endpoint),
            api_key: None,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Embeddings provider speaking either wire dialect over an [`HttpTransport`]
#[derive(Debug)]
pub struct HttpEmbeddingsProvider {
    options: ProviderOptions,
    transport: Arc<dyn HttpTransport>,
    observed_dimension: AtomicUsize,
}

impl HttpEmbeddingsProvider {
    #[inline]
    pub fn new(options: ProviderOptions, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            options,
            transport,
            observed_dimension: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub const fn options(&self) -> &ProviderOptions {
        &self.options
    }

    #[inline]
    pub const fn dialect(&self) -> Dialect {
        self.options.dialect
    }

    /// Embed a short sample text and return the endpoint's vector dimension
    #[inline]
    pub async fn health_check(&self) -> Result<usize, ProviderError> {
        debug!(
            "Performing health check for {} at {}",
            self.options.model, self.options.endpoint
        );

        let vectors = self
            .generate_embeddings(&["health check".to_string()], &EmbedOptions::default())
            .await?;
        let dimension = vectors.first().map_or(0, Vec::len);

        info!(
            "Health check passed for {} ({} dimensions)",
            self.options.model, dimension
        );
        Ok(dimension)
    }

    async fn embed_concurrently(
        &self,
        texts: &[String],
        options: &EmbedOptions,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let limit = self.options.max_concurrency.max(1);
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut in_flight = FuturesUnordered::new();
        let mut next = 0;
        let mut first_error: Option<ProviderError> = None;

        loop {
            while first_error.is_none() && next < texts.len() && in_flight.len() < limit {
                if options.is_cancelled() {
                    first_error = Some(ProviderError::Cancelled);
                    break;
                }
                let index = next;
                let text = &texts[index];
                in_flight.push(async move {
                    (index, self.embed_single(text, options.input_type).await)
                });
                next += 1;
            }

            let Some((index, outcome)) = in_flight.next().await else {
                break;
            };

            match outcome {
                Ok(vector) => {
                    if first_error.is_none() {
                        results[index] = Some(vector);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        warn!(
                            "Embedding request {} failed, draining {} in-flight requests: {}",
                            index,
                            in_flight.len(),
                            e
                        );
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        results
            .into_iter()
            .enumerate()
            .map(|(index, vector)| {
                vector.ok_or_else(|| {
                    let message = format!("no embedding returned for input {index}");
                    ProviderError::UnsupportedResponse(message)
                })
            })
            .collect()
    }

    async fn embed_batches(
        &self,
        texts: &[String],
        options: &EmbedOptions,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let batch_size = self.options.max_batch_size.max(1);
        let mut vectors = Vec::with_capacity(texts.len());

        for batch in texts.chunks(batch_size) {
            if options.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            debug!("Embedding sub-batch of {} texts", batch.len());
            vectors.extend(self.embed_batch(batch, options.input_type).await?);
        }

        Ok(vectors)
    }

    async fn embed_single(
        &self,
        text: &str,
        input_type: InputType,
    ) -> Result<Vec<f32>, ProviderError> {
        let body = json!({
            "model": self.options.model,
            "prompt": text,
            "task_type": input_type.task_type(),
        });
        let response = self.post_json(&body).await?;
        parse_single_response(&response)
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        input_type: InputType,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = json!({
            "input": texts,
            "model": self.options.model,
            "encoding_format": "float",
            "input_type": input_type.input_type(),
        });
        let response = self.post_json(&body).await?;
        parse_batch_response(&response, texts.len())
    }

    async fn post_json(&self, body: &Value) -> Result<Value, ProviderError> {
        let attempts = self.options.retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            debug!("HTTP request attempt {}/{}", attempt, attempts);

            let mut request =
                HttpRequest::post(self.options.endpoint.as_str()).with_json_body(body);
            if let Some(key) = self.options.api_key.as_deref().filter(|k| !k.is_empty()) {
                request = request.with_header("Authorization", format!("Bearer {key}"));
            }

            let error = match self.transport.send(request).await {
                Ok(response) if response.is_success() => {
                    return serde_json::from_str(&response.body).map_err(|e| {
                        let message = format!("response is not valid JSON: {e}");
                        ProviderError::UnsupportedResponse(message)
                    });
                }
                Ok(response) => ProviderError::Http {
                    status: response.status,
                    message: extract_error_message(&response.body),
                },
                Err(e) => ProviderError::Transport(e),
            };

            if !error.is_retryable() {
                warn!("Non-retryable error: {}", error);
                return Err(error);
            }

            warn!("Request failed: {}, attempt {}/{}", error, attempt, attempts);
            last_error = Some(error);

            if attempt < attempts {
                let delay =
                    self.options.retry_base_delay * EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1);
                debug!("Waiting {:?} before retry", delay);
                tokio::time::sleep(delay).await;
            }
        }

        error!("All retry attempts failed for request to {}", self.options.endpoint);
        Err(last_error.unwrap_or_else(|| {
            ProviderError::Configuration("no request attempts made".to_string())
        }))
    }

    fn record_dimension(&self, vectors: &[Vec<f32>]) {
        if let Some(first) = vectors.first() {
            if self
                .observed_dimension
                .compare_exchange(0, first.len(), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                debug!("Observed embedding dimension {}", first.len());
            }
        }
    }
}

#[async_trait]
impl EmbeddingsProvider for HttpEmbeddingsProvider {
    #[inline]
    fn provider_id(&self) -> &str {
        &self.options.provider_id
    }

    #[inline]
    fn model(&self) -> &str {
        &self.options.model
    }

    #[inline]
    fn max_batch_size(&self) -> usize {
        self.options.max_batch_size
    }

    #[inline]
    fn observed_dimension(&self) -> Option<usize> {
        match self.observed_dimension.load(Ordering::SeqCst) {
            0 => None,
            dimension => Some(dimension),
        }
    }

    #[inline]
    fn validate_configuration(&self) -> Result<(), ProviderError> {
        if self.options.model.trim().is_empty() {
            return Err(ProviderError::Configuration("model is not set".to_string()));
        }
        if self.options.endpoint.trim().is_empty() {
            return Err(ProviderError::Configuration("endpoint is not set".to_string()));
        }
        let url = Url::parse(&self.options.endpoint)
            .map_err(|e| ProviderError::Configuration(format!("invalid endpoint URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ProviderError::Configuration(format!(
                "unsupported endpoint scheme: {}",
                url.scheme()
            )));
        }
        if self.options.max_batch_size == 0 || self.options.max_concurrency == 0 {
            return Err(ProviderError::Configuration(
                "batch size and concurrency must be positive".to_string(),
            ));
        }
        Ok(())
    }

    async fn generate_embeddings(
        &self,
        texts: &[String],
        options: &EmbedOptions,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.validate_configuration()?;

        debug!(
            "Generating embeddings for {} texts ({:?} dialect)",
            texts.len(),
            self.options.dialect
        );

        let vectors = match self.options.dialect {
            Dialect::SingleDocument => self.embed_concurrently(texts, options).await?,
            Dialect::Batched => self.embed_batches(texts, options).await?,
        };

        self.record_dimension(&vectors);
        debug!("Generated {} embeddings", vectors.len());
        Ok(vectors)
    }
}

/// Best-effort error text from a non-2xx response body.
///
/// Preference: `error.message`, `error` (string), `message`, `detail`, then the raw body.
#[inline]
pub fn extract_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let candidates = [
            value.pointer("/error/message"),
            value.get("error"),
            value.get("message"),
            value.get("detail"),
        ];
        if let Some(message) = candidates
            .into_iter()
            .flatten()
            .find_map(|v| v.as_str().filter(|s| !s.trim().is_empty()))
        {
            return message.to_string();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    trimmed.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}

#[derive(Debug, Deserialize)]
struct IndexedEmbedding {
    index: Option<usize>,
    embedding: Value,
}

fn parse_single_response(response: &Value) -> Result<Vec<f32>, ProviderError> {
    if let Some(embedding) = response.get("embedding") {
        return parse_vector(embedding);
    }
    if let Some(first) = response.pointer("/data/0/embedding") {
        return parse_vector(first);
    }
    if let Some(first) = response.pointer("/embeddings/0") {
        return parse_vector(first);
    }
    Err(ProviderError::UnsupportedResponse(
        "expected `embedding`, `data[].embedding` or `embeddings`".to_string(),
    ))
}

fn parse_batch_response(response: &Value, expected: usize) -> Result<Vec<Vec<f32>>, ProviderError> {
    let vectors = if let Some(data) = response.get("data") {
        let items: Vec<IndexedEmbedding> = serde_json::from_value(data.clone())
            .map_err(|e| {
                ProviderError::UnsupportedResponse(format!("malformed `data` array: {e}"))
            })?;
        let mut positioned = Vec::with_capacity(items.len());
        for (position, item) in items.into_iter().enumerate() {
            positioned.push((item.index.unwrap_or(position), parse_vector(&item.embedding)?));
        }
        positioned.sort_by_key(|(index, _)| *index);
        positioned.into_iter().map(|(_, vector)| vector).collect()
    } else if let Some(embeddings) = response.get("embeddings").and_then(Value::as_array) {
        embeddings.iter().map(parse_vector).collect::<Result<Vec<_>, _>>()?
    } else if let Some(rows) = response.as_array() {
        rows.iter().map(parse_vector).collect::<Result<Vec<_>, _>>()?
    } else {
        return Err(ProviderError::UnsupportedResponse(
            "expected `data`, `embeddings` or an array of vectors".to_string(),
        ));
    };

    if vectors.len() != expected {
        return Err(ProviderError::CountMismatch {
            expected,
            actual: vectors.len(),
        });
    }
    Ok(vectors)
}

fn parse_vector(value: &Value) -> Result<Vec<f32>, ProviderError> {
    let items = value
        .as_array()
        .ok_or_else(|| {
            ProviderError::UnsupportedResponse("embedding is not an array".to_string())
        })?;
    if items.is_empty() {
        return Err(ProviderError::UnsupportedResponse("embedding is empty".to_string()));
    }

    items
        .iter()
        .map(|item| {
            item.as_f64().map(|v| v as f32).ok_or_else(|| {
                let message = "embedding contains a non-numeric value".to_string();
                ProviderError::UnsupportedResponse(message)
            })
        })
        .collect()
}
