//! LLM client for OpenAI-compatible chat completion endpoints.
//!
//! Epistemic foundation:
//! - K_i: OpenAI API schema is the de facto standard (sglang, vLLM, aggregators)
//! - B_i: API will respond within timeout (might fail)
//! - B_i: Response will be valid JSON (might fail)
//! - I^B: Network availability unknowable → retry with backoff

use crate::client::{ChatCompleter, Completion, CompletionRequest, RateLimiter, ToolChoice};
use crate::models::{
    AssistantMessage, Config, ConfigError, GenerationConfig, Message, RerollError, Result,
    TokenUsage, expand_headers,
};
use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

/// Base delay of the exponential retry backoff.
const BASE_DELAY_SECS: f64 = 1.0;

/// Cap on a single retry delay.
const MAX_DELAY_SECS: f64 = 60.0;

/// Chat completion request payload.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a ToolChoice>,
    temperature: f64,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_template_kwargs: Option<TemplateKwargs>,
}

#[derive(Debug, Serialize)]
struct TemplateKwargs {
    thinking: bool,
}

/// Chat completion response.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

/// Client for one OpenAI-compatible endpoint and model.
///
/// Features:
/// - Retry with exponential backoff and jitter on transient failures
/// - Shared 429 backoff across every concurrent caller
/// - Custom headers for auth flexibility
pub struct LLMClient {
    client: reqwest::Client,
    /// Full chat completions URL
    url: String,
    /// Model name sent with every request
    model: String,
    /// Prebuilt request headers
    headers: HeaderMap,
    /// Sampling parameters for every call
    generation: GenerationConfig,
    /// Per-call deadline
    timeout: Duration,
    /// Maximum attempts per call
    max_retries: u32,
    /// Rate limiter
    rate_limiter: RateLimiter,
}

impl LLMClient {
    /// Create a new LLM client.
    ///
    /// # Arguments
    /// - `api_url`: Chat completions URL, or a base URL to append it to
    /// - `model`: Model name
    /// - `api_key`: Optional bearer token (None for local endpoints)
    /// - `custom_headers`: Additional headers to include in requests
    /// - `generation`: Sampling parameters
    /// - `timeout_secs`: Per-call deadline in seconds
    /// - `max_retries`: Maximum attempts per call
    pub fn new(
        api_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        custom_headers: &HashMap<String, String>,
        generation: GenerationConfig,
        timeout_secs: u64,
        max_retries: u32,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(RerollError::Network)?;

        Ok(Self {
            client,
            url: chat_completions_url(api_url),
            model: model.into(),
            headers: build_headers(api_key.as_deref(), custom_headers)?,
            generation,
            timeout,
            max_retries: max_retries.max(1),
            rate_limiter: RateLimiter::new(),
        })
    }

    /// Build a client from the `[endpoint]` and `[generation]` sections.
    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let headers = expand_headers(&config.endpoint.headers);

        Self::new(
            &config.endpoint.api_url,
            config.endpoint.model.clone(),
            api_key,
            &headers,
            config.generation,
            config.endpoint.timeout_secs,
            config.endpoint.max_retries,
        )
    }

    /// Get the model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get the chat completions URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Delay before retry number `attempt + 1`.
    fn backoff(attempt: u32) -> Duration {
        let jitter = rand::rng().random_range(0.0..1.0);
        let secs = (BASE_DELAY_SECS * 2f64.powi(attempt as i32) + jitter).min(MAX_DELAY_SECS);
        Duration::from_secs_f64(secs)
    }

    fn classify_send_error(&self, e: reqwest::Error) -> RerollError {
        if e.is_timeout() {
            RerollError::Timeout(self.timeout)
        } else if e.is_connect() {
            RerollError::Unreachable(e.to_string())
        } else {
            RerollError::Network(e)
        }
    }

    /// Make a single HTTP attempt.
    async fn send_once(&self, payload: &ChatCompletionRequest<'_>) -> Result<Completion> {
        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(payload)
            .send()
            .await
            .map_err(|e| self.classify_send_error(e))?;

        let status = response.status().as_u16();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<f64>().ok());
            self.rate_limiter.record_429(retry_after);
            let body = response.text().await.unwrap_or_default();
            return Err(RerollError::request(status, &body));
        }

        self.rate_limiter.record_response();

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RerollError::request(status, &body));
        }

        let body: ChatCompletionResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                RerollError::Timeout(self.timeout)
            } else {
                RerollError::ParseError(format!("Failed to parse response: {e}"))
            }
        })?;

        let message = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| RerollError::ParseError("No choices in response".to_string()))?;

        Ok(Completion {
            message,
            usage: body.usage.unwrap_or_default(),
        })
    }

    /// Health check: ping the `/models` endpoint next to the completions URL.
    ///
    /// K_i: endpoint is reachable and responding
    /// B_i: endpoint is healthy if /models returns 200
    pub async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let base = self
            .url
            .strip_suffix(CHAT_COMPLETIONS_PATH)
            .unwrap_or(&self.url);
        let url = format!("{base}/models");

        let (status, error) = match self
            .client
            .get(&url)
            .headers(self.headers.clone())
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => (HealthStatus::Healthy, None),
            Ok(response) => (
                HealthStatus::Unhealthy,
                Some(format!("HTTP {}", response.status().as_u16())),
            ),
            Err(e) => (HealthStatus::Unreachable, Some(e.to_string())),
        };

        HealthCheckResult {
            url,
            latency_ms: (status != HealthStatus::Unreachable)
                .then(|| start.elapsed().as_millis() as u64),
            status,
            error,
        }
    }
}

#[async_trait]
impl ChatCompleter for LLMClient {
    /// Complete a chat request.
    ///
    /// B_i(API available) → Result
    /// B_i(valid response) → Result
    /// I^B(rate limits, transient failures) → retry with backoff
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion> {
        // Schemas only go out when a tool is forced; "none" is still sent so
        // the template knows tools are off for this turn.
        let has_tools = !request.tools.is_empty();
        let forced = matches!(request.tool_choice, Some(ToolChoice::Function(_)));
        let payload = ChatCompletionRequest {
            model: &self.model,
            messages: request.messages,
            tools: (has_tools && forced).then_some(request.tools),
            tool_choice: request.tool_choice.filter(|_| has_tools),
            temperature: self.generation.temperature,
            max_tokens: self.generation.max_tokens,
            chat_template_kwargs: request.thinking.then_some(TemplateKwargs { thinking: true }),
        };

        let mut last_error: Option<RerollError> = None;

        for attempt in 0..self.max_retries {
            self.rate_limiter.wait_if_needed().await;

            match self.send_once(&payload).await {
                Ok(completion) => return Ok(completion),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt + 1 < self.max_retries {
                        let backoff = Self::backoff(attempt);
                        debug!(
                            attempt = attempt + 1,
                            max_retries = self.max_retries,
                            backoff_secs = backoff.as_secs_f64(),
                            error = %e,
                            "Retrying completion"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        // All retries exhausted
        Err(last_error.unwrap_or_else(|| RerollError::MaxRetriesExceeded {
            attempts: self.max_retries,
            last_error: "Unknown error".to_string(),
        }))
    }
}

/// Accept either a full chat completions URL or a base URL.
fn chat_completions_url(api_url: &str) -> String {
    let trimmed = api_url.trim_end_matches('/');
    if trimmed.ends_with(CHAT_COMPLETIONS_PATH) {
        trimmed.to_string()
    } else {
        format!("{trimmed}{CHAT_COMPLETIONS_PATH}")
    }
}

fn build_headers(
    api_key: Option<&str>,
    custom_headers: &HashMap<String, String>,
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    if let Some(api_key) = api_key {
        let value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ConfigError::Invalid("API key is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, value);
    }

    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    for (key, value) in custom_headers {
        let name = HeaderName::try_from(key.as_str())
            .map_err(|_| ConfigError::Invalid(format!("invalid header name '{key}'")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ConfigError::Invalid(format!("invalid value for header '{key}'")))?;
        headers.insert(name, value);
    }

    Ok(headers)
}

/// Health check result.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    /// URL that was checked
    pub url: String,
    /// Health status
    pub status: HealthStatus,
    /// Latency in milliseconds (if reachable)
    pub latency_ms: Option<u64>,
    /// Error message (if unhealthy or unreachable)
    pub error: Option<String>,
}

/// Health status of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Endpoint is responding normally
    Healthy,
    /// Endpoint is responding but with errors
    Unhealthy,
    /// Endpoint is not reachable
    Unreachable,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn client_for(server: &MockServer, max_retries: u32) -> LLMClient {
        LLMClient::new(
            &format!("{}/v1", server.uri()),
            "test-model",
            Some("test-key".to_string()),
            &HashMap::new(),
            GenerationConfig::default(),
            5,
            max_retries,
        )
        .unwrap()
    }

    fn tool_spec() -> Vec<Value> {
        vec![json!({"type": "function", "function": {"name": "get_weather", "parameters": {}}})]
    }

    #[test]
    fn test_chat_completions_url() {
        assert_eq!(
            chat_completions_url("http://localhost:30000/v1/chat/completions"),
            "http://localhost:30000/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_url("http://localhost:30000/v1/"),
            "http://localhost:30000/v1/chat/completions"
        );
    }

    #[test]
    fn test_invalid_header_name_is_rejected() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        assert!(build_headers(None, &headers).is_err());
    }

    #[tokio::test]
    async fn test_forced_tool_request_shape() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({
                "model": "test-model",
                "temperature": 0.7,
                "max_tokens": 2048,
                "tools": [{"type": "function", "function": {"name": "get_weather"}}],
                "tool_choice": {"type": "function", "function": {"name": "get_weather"}},
                "chat_template_kwargs": {"thinking": true}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {
                    "role": "assistant",
                    "content": null,
                    "reasoning_content": "need the weather",
                    "tool_calls": [{"id": "B", "type": "function",
                        "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}}]
                }}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 8, "total_tokens": 20}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, 1);
        let messages = vec![Message::user("weather in Oslo?")];
        let tools = tool_spec();
        let choice = ToolChoice::Function("get_weather".to_string());

        let completion = client
            .complete(CompletionRequest {
                messages: &messages,
                tools: &tools,
                tool_choice: Some(&choice),
                thinking: true,
            })
            .await
            .unwrap();

        assert_eq!(completion.message.content, "");
        assert_eq!(completion.message.first_tool_name(), Some("get_weather"));
        assert_eq!(completion.message.tool_calls[0].id, "B");
        assert_eq!(completion.message.reasoning(), Some("need the weather"));
        assert_eq!(completion.usage, TokenUsage::new(12, 8, 20));
    }

    #[tokio::test]
    async fn test_optional_fields_are_omitted() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(|req: &Request| {
                let body: Value = serde_json::from_slice(&req.body).unwrap();
                let obj = body.as_object().unwrap();
                let clean = !obj.contains_key("tools")
                    && !obj.contains_key("tool_choice")
                    && !obj.contains_key("chat_template_kwargs");
                if clean {
                    ResponseTemplate::new(200).set_body_json(json!({
                        "choices": [{"message": {"role": "assistant", "content": "plain"}}]
                    }))
                } else {
                    ResponseTemplate::new(400).set_body_string(body.to_string())
                }
            })
            .mount(&server)
            .await;

        let client = client_for(&server, 1);
        let messages = vec![Message::user("hello")];
        let choice = ToolChoice::None;

        let completion = client
            .complete(CompletionRequest {
                messages: &messages,
                tools: &[],
                tool_choice: Some(&choice),
                thinking: false,
            })
            .await
            .unwrap();

        assert_eq!(completion.message.content, "plain");
        assert_eq!(completion.usage, TokenUsage::default());
    }

    #[tokio::test]
    async fn test_text_turn_sends_no_tool_schemas() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"tool_choice": "none"})))
            .respond_with(|req: &Request| {
                let body: Value = serde_json::from_slice(&req.body).unwrap();
                if body.get("tools").is_none() {
                    ResponseTemplate::new(200).set_body_json(json!({
                        "choices": [{"message": {"role": "assistant", "content": "Here is the answer."}}]
                    }))
                } else {
                    ResponseTemplate::new(400).set_body_string("tools sent on a text turn")
                }
            })
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, 1);
        let messages = vec![Message::user("what's up?")];
        let tools = tool_spec();

        let completion = client
            .complete(CompletionRequest {
                messages: &messages,
                tools: &tools,
                tool_choice: Some(&ToolChoice::None),
                thinking: true,
            })
            .await
            .unwrap();

        assert_eq!(completion.message.content, "Here is the answer.");
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("context too long"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, 3);
        let messages = vec![Message::user("hello")];

        let err = client
            .complete(CompletionRequest {
                messages: &messages,
                tools: &[],
                tool_choice: None,
                thinking: true,
            })
            .await
            .unwrap_err();

        match err {
            RerollError::Request { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "context too long");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_retried_then_succeeds() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "recovered"}}],
                "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, 2);
        let messages = vec![Message::user("hello")];

        let completion = client
            .complete(CompletionRequest {
                messages: &messages,
                tools: &[],
                tool_choice: None,
                thinking: false,
            })
            .await
            .unwrap();

        assert_eq!(completion.message.content, "recovered");
    }

    #[tokio::test]
    async fn test_empty_choices_is_parse_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let client = client_for(&server, 1);
        let messages = vec![Message::user("hello")];

        let err = client
            .complete(CompletionRequest {
                messages: &messages,
                tools: &[],
                tool_choice: None,
                thinking: false,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RerollError::ParseError(_)));
    }

    #[tokio::test]
    async fn test_health_check() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .mount(&server)
            .await;

        let client = client_for(&server, 1);
        let result = client.health_check().await;
        assert_eq!(result.status, HealthStatus::Healthy);
        assert!(result.url.ends_with("/v1/models"));
        assert!(result.latency_ms.is_some());
    }
}
