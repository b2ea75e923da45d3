use super::*;
use std::sync::Mutex;

type Responder = dyn Fn(&Value, usize) -> (u64, u16, Value) + Send + Sync;

/// In-process transport that scripts delay, status and body per request
struct ScriptedTransport {
    respond: Box<Responder>,
    requests: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    bodies: Mutex<Vec<Value>>,
    headers: Mutex<Vec<Vec<(String, String)>>>,
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport").finish_non_exhaustive()
    }
}

impl ScriptedTransport {
    fn new(
        respond: impl Fn(&Value, usize) -> (u64, u16, Value) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            requests: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            bodies: Mutex::new(Vec::new()),
            headers: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let body: Value = serde_json::from_str(request.body.as_deref().unwrap_or("null"))
            .expect("request body is JSON");
        let attempt = self.requests.fetch_add(1, Ordering::SeqCst);
        self.bodies.lock().unwrap().push(body.clone());
        self.headers.lock().unwrap().push(request.headers.clone());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let (delay_ms, status, response) = (self.respond)(&body, attempt);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(HttpResponse {
            status,
            body: response.to_string(),
        })
    }
}

/// Deterministic two-component vector derived from the text
fn fake_embedding(text: &str) -> Vec<f32> {
    let first = text.bytes().next().map_or(0.0, f32::from);
    vec![first, text.len() as f32]
}

fn single_document_provider(
    transport: Arc<ScriptedTransport>,
    concurrency: usize,
) -> HttpEmbeddingsProvider {
    let mut options = ProviderOptions::new(
        "ollama",
        "http://localhost:11434/api/embeddings",
        "nomic-embed-text",
    );
    options.max_concurrency = concurrency;
    options.retry_attempts = 1;
    options.retry_base_delay = Duration::from_millis(1);
    HttpEmbeddingsProvider::new(options, transport)
}

fn batched_provider(
    transport: Arc<ScriptedTransport>,
    batch_size: usize,
) -> HttpEmbeddingsProvider {
    let mut options = ProviderOptions::new(
        "openai",
        "http://localhost:8080/v1/embeddings",
        "text-embedding-3-small",
    );
    options.max_batch_size = batch_size;
    options.retry_attempts = 1;
    options.retry_base_delay = Duration::from_millis(1);
    HttpEmbeddingsProvider::new(options, transport)
}

fn texts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

#[test]
fn dialect_detection_from_endpoint() {
    assert_eq!(
        Dialect::detect("http://localhost:11434/api/embeddings"),
        Dialect::SingleDocument
    );
    assert_eq!(
        Dialect::detect("http://localhost:11434/api/embeddings/"),
        Dialect::SingleDocument
    );
    assert_eq!(Dialect::detect("http://localhost:11434/api/embed"), Dialect::Batched);
    assert_eq!(Dialect::detect("https://api.openai.com/v1/embeddings"), Dialect::Batched);
    assert_eq!(
        DialectPreference::SingleDocument.resolve("https://api.openai.com/v1/embeddings"),
        Dialect::SingleDocument
    );
    assert_eq!(
        DialectPreference::Auto.resolve("https://api.openai.com/v1/embeddings"),
        Dialect::Batched
    );
}

#[test]
fn input_type_hints_per_dialect() {
    assert_eq!(InputType::default(), InputType::Document);
    assert_eq!(InputType::Document.task_type(), "retrieval_document");
    assert_eq!(InputType::Query.task_type(), "retrieval_query");
    assert_eq!(InputType::Query.input_type(), "query");
}

#[test]
fn error_message_extraction_preference() {
    assert_eq!(
        extract_error_message(r#"{"error": {"message": "nested"}, "message": "top"}"#),
        "nested"
    );
    assert_eq!(extract_error_message(r#"{"error": "model not found"}"#), "model not found");
    assert_eq!(
        extract_error_message(r#"{"message": "top", "detail": "detail"}"#),
        "top"
    );
    assert_eq!(extract_error_message(r#"{"detail": "bad input"}"#), "bad input");
    assert_eq!(extract_error_message("gateway exploded"), "gateway exploded");
    assert_eq!(extract_error_message("   "), "empty response body");
}

#[test]
fn error_classification() {
    let server = ProviderError::Http {
        status: 503,
        message: "busy".to_string(),
    };
    assert_eq!(server.status(), Some(503));
    assert_eq!(server.code(), "http");
    assert!(server.is_retryable());

    let client = ProviderError::Http {
        status: 400,
        message: "bad".to_string(),
    };
    assert!(!client.is_retryable());
    assert!(!ProviderError::UnsupportedResponse("x".to_string()).is_retryable());
    assert_eq!(ProviderError::Cancelled.code(), "cancelled");
}

#[tokio::test]
async fn single_document_results_keep_input_order() {
    // Earlier inputs take longer, so completions arrive in reverse order
    let transport = ScriptedTransport::new(|body, _| {
        let prompt = body["prompt"].as_str().unwrap_or_default().to_string();
        let delay = match prompt.as_str() {
            "a" => 50,
            "b" => 40,
            "c" => 30,
            "d" => 20,
            _ => 10,
        };
        (delay, 200, json!({ "embedding": fake_embedding(&prompt) }))
    });
    let provider = single_document_provider(Arc::clone(&transport), 5);

    let inputs = texts(&["a", "b", "c", "d", "e"]);
    let vectors = provider
        .generate_embeddings(&inputs, &EmbedOptions::default())
        .await
        .expect("embeddings succeed");

    let expected: Vec<Vec<f32>> = inputs.iter().map(|t| fake_embedding(t)).collect();
    assert_eq!(vectors, expected);
    assert_eq!(provider.observed_dimension(), Some(2));
}

#[tokio::test]
async fn single_document_concurrency_is_bounded() {
    let transport = ScriptedTransport::new(|body, _| {
        let prompt = body["prompt"].as_str().unwrap_or_default().to_string();
        (20, 200, json!({ "embedding": fake_embedding(&prompt) }))
    });
    let provider = single_document_provider(Arc::clone(&transport), 5);

    let inputs: Vec<String> = (0..15).map(|i| format!("text {i}")).collect();
    let vectors = provider
        .generate_embeddings(&inputs, &EmbedOptions::default())
        .await
        .expect("embeddings succeed");

    assert_eq!(vectors.len(), 15);
    assert_eq!(transport.requests(), 15);
    assert!(transport.max_in_flight() <= 5, "saw {} in flight", transport.max_in_flight());
    assert!(transport.max_in_flight() > 1);
}

#[tokio::test]
async fn single_document_sends_prompt_and_task_type() {
    let transport = ScriptedTransport::new(|_, _| (0, 200, json!({ "embedding": [0.5, 0.5] })));
    let provider = single_document_provider(Arc::clone(&transport), 5);

    provider
        .generate_embeddings(&texts(&["query text"]), &EmbedOptions::query())
        .await
        .expect("embedding succeeds");

    let bodies = transport.bodies.lock().unwrap();
    assert_eq!(bodies[0]["model"], "nomic-embed-text");
    assert_eq!(bodies[0]["prompt"], "query text");
    assert_eq!(bodies[0]["task_type"], "retrieval_query");
}

#[tokio::test]
async fn first_error_stops_scheduling_and_drains_in_flight() {
    let transport = ScriptedTransport::new(|body, _| {
        let prompt = body["prompt"].as_str().unwrap_or_default().to_string();
        if prompt == "text 3" {
            (0, 500, json!({ "error": { "message": "model crashed" } }))
        } else {
            (50, 200, json!({ "embedding": fake_embedding(&prompt) }))
        }
    });
    let provider = single_document_provider(Arc::clone(&transport), 5);

    let inputs: Vec<String> = (0..15).map(|i| format!("text {i}")).collect();
    let error = provider
        .generate_embeddings(&inputs, &EmbedOptions::default())
        .await
        .expect_err("batch fails");

    match error {
        ProviderError::Http { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "model crashed");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // Only the first window was scheduled, and it finished before returning
    assert_eq!(transport.requests(), 5);
    assert_eq!(transport.in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_prevents_new_requests() {
    let transport = ScriptedTransport::new(|_, _| (0, 200, json!({ "embedding": [1.0] })));
    let provider = single_document_provider(Arc::clone(&transport), 5);

    let flag = CancellationFlag::new();
    flag.cancel();
    let result = provider
        .generate_embeddings(&texts(&["a", "b"]), &EmbedOptions::default().with_cancellation(flag))
        .await;

    assert!(matches!(result, Err(ProviderError::Cancelled)));
    assert_eq!(transport.requests(), 0);
}

#[tokio::test]
async fn batched_dialect_splits_into_sub_batches_and_sorts_by_index() {
    let transport = ScriptedTransport::new(|body, _| {
        let inputs: Vec<String> = serde_json::from_value(body["input"].clone()).unwrap_or_default();
        // Respond out of order to check that the provider sorts by index
        let data: Vec<Value> = inputs
            .iter()
            .enumerate()
            .rev()
            .map(|(index, text)| json!({ "index": index, "embedding": fake_embedding(text) }))
            .collect();
        (0, 200, json!({ "data": data }))
    });
    let provider = batched_provider(Arc::clone(&transport), 2);

    let inputs = texts(&["alpha", "beta", "gamma", "delta", "epsilon"]);
    let vectors = provider
        .generate_embeddings(&inputs, &EmbedOptions::default())
        .await
        .expect("embeddings succeed");

    let expected: Vec<Vec<f32>> = inputs.iter().map(|t| fake_embedding(t)).collect();
    assert_eq!(vectors, expected);
    assert_eq!(transport.requests(), 3);

    let bodies = transport.bodies.lock().unwrap();
    assert_eq!(bodies[0]["input"], json!(["alpha", "beta"]));
    assert_eq!(bodies[2]["input"], json!(["epsilon"]));
    assert_eq!(bodies[0]["encoding_format"], "float");
    assert_eq!(bodies[0]["input_type"], "document");
}

#[tokio::test]
async fn batched_dialect_accepts_bare_arrays_and_ollama_shape() {
    let bare = ScriptedTransport::new(|_, _| (0, 200, json!([[1.0, 0.0], [0.0, 1.0]])));
    let vectors = batched_provider(bare, 10)
        .generate_embeddings(&texts(&["a", "b"]), &EmbedOptions::default())
        .await
        .expect("bare array is accepted");
    assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);

    let ollama = ScriptedTransport::new(|_, _| (0, 200, json!({ "embeddings": [[0.25, 0.75]] })));
    let vectors = batched_provider(ollama, 10)
        .generate_embeddings(&texts(&["a"]), &EmbedOptions::default())
        .await
        .expect("ollama shape is accepted");
    assert_eq!(vectors, vec![vec![0.25, 0.75]]);
}

#[tokio::test]
async fn unrecognized_response_shape_is_an_error() {
    let transport = ScriptedTransport::new(|_, _| (0, 200, json!({ "vectors": [[1.0]] })));
    let result = batched_provider(transport, 10)
        .generate_embeddings(&texts(&["a"]), &EmbedOptions::default())
        .await;
    assert!(matches!(result, Err(ProviderError::UnsupportedResponse(_))));

    let transport = ScriptedTransport::new(|_, _| (0, 200, json!({ "embedding": ["x"] })));
    let result = single_document_provider(transport, 5)
        .generate_embeddings(&texts(&["a"]), &EmbedOptions::default())
        .await;
    assert!(matches!(result, Err(ProviderError::UnsupportedResponse(_))));
}

#[tokio::test]
async fn response_count_mismatch_is_an_error() {
    let transport = ScriptedTransport::new(|_, _| (0, 200, json!([[1.0, 0.0]])));
    let result = batched_provider(transport, 10)
        .generate_embeddings(&texts(&["a", "b"]), &EmbedOptions::default())
        .await;
    assert!(matches!(
        result,
        Err(ProviderError::CountMismatch {
            expected: 2,
            actual: 1
        })
    ));
}

#[tokio::test]
async fn server_errors_are_retried_and_client_errors_are_not() {
    let flaky = ScriptedTransport::new(|_, attempt| {
        if attempt == 0 {
            (0, 503, json!({ "message": "warming up" }))
        } else {
            (0, 200, json!({ "embedding": [0.6, 0.8] }))
        }
    });
    let mut provider = single_document_provider(Arc::clone(&flaky), 1);
    provider.options.retry_attempts = 3;
    let vectors = provider
        .generate_embeddings(&texts(&["a"]), &EmbedOptions::default())
        .await
        .expect("second attempt succeeds");
    assert_eq!(vectors, vec![vec![0.6, 0.8]]);
    assert_eq!(flaky.requests(), 2);

    let rejecting = ScriptedTransport::new(|_, _| (0, 400, json!({ "detail": "bad model" })));
    let mut provider = single_document_provider(Arc::clone(&rejecting), 1);
    provider.options.retry_attempts = 3;
    let error = provider
        .generate_embeddings(&texts(&["a"]), &EmbedOptions::default())
        .await
        .expect_err("client error is final");
    assert_eq!(error.status(), Some(400));
    assert_eq!(rejecting.requests(), 1);
}

#[tokio::test]
async fn api_key_is_sent_as_bearer_token() {
    let transport = ScriptedTransport::new(|_, _| {
        (0, 200, json!({ "data": [{ "index": 0, "embedding": [1.0] }] }))
    });
    let mut options =
        ProviderOptions::new("openai", "https://api.example.com/v1/embeddings", "small");
    options.api_key = Some("secret".to_string());
    let provider =
        HttpEmbeddingsProvider::new(options, Arc::clone(&transport) as Arc<dyn HttpTransport>);

    provider
        .generate_embeddings(&texts(&["a"]), &EmbedOptions::default())
        .await
        .expect("embedding succeeds");

    let headers = transport.headers.lock().unwrap();
    assert!(
        headers[0]
            .iter()
            .any(|(name, value)| name == "Authorization" && value == "Bearer secret")
    );
}

#[tokio::test]
async fn invalid_configuration_is_rejected_before_any_request() {
    let transport = ScriptedTransport::new(|_, _| (0, 200, json!({ "embedding": [1.0] })));
    let options = ProviderOptions::new("ollama", "not a url", "");
    let provider =
        HttpEmbeddingsProvider::new(options, Arc::clone(&transport) as Arc<dyn HttpTransport>);

    assert!(matches!(
        provider.validate_configuration(),
        Err(ProviderError::Configuration(_))
    ));
    let result = provider
        .generate_embeddings(&texts(&["a"]), &EmbedOptions::default())
        .await;
    assert!(matches!(result, Err(ProviderError::Configuration(_))));
    assert_eq!(transport.requests(), 0);

    assert!(
        provider
            .generate_embeddings(&[], &EmbedOptions::default())
            .await
            .expect("empty input is a no-op")
            .is_empty()
    );
}

#[tokio::test]
async fn health_check_reports_dimension() {
    let transport =
        ScriptedTransport::new(|_, _| (0, 200, json!({ "embedding": [0.0, 0.6, 0.8] })));
    let provider = single_document_provider(transport, 1);
    assert_eq!(provider.health_check().await.expect("healthy"), 3);
    assert_eq!(provider.observed_dimension(), Some(3));
}
