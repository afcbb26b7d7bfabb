//! Blocking client for an OpenAI-compatible chat completion endpoint

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::LlmError;
use crate::utils::{backoff_delay, truncate};

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub response_format: ResponseFormat,
}

impl ChatRequest {
    /// System + user prompt pair asking for a JSON object answer
    pub fn json(model: &str, temperature: f32, system: &str, user: &str) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature,
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Token accounting reported by the endpoint
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
}

/// Anything that can answer a chat request.
pub trait CompletionClient {
    fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError>;
}

pub struct ChatClient {
    client: Client,
    api_key: String,
    api_base: String,
    retries: u32,
    backoff: Duration,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("api_key", &"***")
            .field("api_base", &self.api_base)
            .field("retries", &self.retries)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl ChatClient {
    pub fn new(api_key: &str, config: &Config) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.ai_timeout())
            .build()
            .map_err(|e| LlmError::ClientInit(e.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.to_string(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            retries: config.ai_retries,
            backoff: config.retry_backoff(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    fn send_once(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(request)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|_| "Could not read error body".to_string());
            return Err(LlmError::HttpStatus {
                code: status.as_u16(),
                body: truncate(&body, 500).to_string(),
            });
        }

        let body = response.text()?;
        let parsed: ChatResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::JsonParse {
                context: format!("chat completion response (body: {})", truncate(&body, 200)),
                source: e,
            })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(LlmError::EmptyResponse)?;

        Ok(Completion {
            content,
            usage: parsed.usage.unwrap_or_default(),
        })
    }
}

impl CompletionClient for ChatClient {
    fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        let mut last_error = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                let delay = backoff_delay(self.backoff, attempt);
                warn!(
                    "Completion retry attempt {}/{} after {:?}",
                    attempt, self.retries, delay
                );
                thread::sleep(delay);
            }

            match self.send_once(request) {
                Ok(completion) => {
                    debug!("Completion used {} tokens", completion.usage.total_tokens);
                    return Ok(completion);
                }
                Err(e) if e.is_transient() => {
                    warn!("Completion request failed: {}", e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(LlmError::RetriesExhausted(Box::new(
            last_error.unwrap_or(LlmError::EmptyResponse),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn start_server() -> (tokio::runtime::Runtime, MockServer) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let server = runtime.block_on(MockServer::start());
        (runtime, server)
    }

    fn test_client(server: &MockServer) -> ChatClient {
        let config = Config {
            api_base: server.uri(),
            ai_retries: 2,
            retry_backoff_ms: 0,
            ..Config::default()
        };
        ChatClient::new("test-key", &config).unwrap()
    }

    fn test_request() -> ChatRequest {
        ChatRequest::json("deepseek-chat", 0.1, "system prompt", "hello")
    }

    fn success_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{
                "message": { "role": "assistant", "content": content }
            }],
            "usage": { "prompt_tokens": 120, "completion_tokens": 80, "total_tokens": 200 }
        })
    }

    #[test]
    fn test_request_serialization() {
        let value = serde_json::to_value(test_request()).unwrap();
        assert_eq!(value["response_format"]["type"], "json_object");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "hello");
        assert_eq!(value["model"], "deepseek-chat");
    }

    #[test]
    fn test_success_on_first_attempt() {
        let (runtime, server) = start_server();
        runtime.block_on(
            Mock::given(method("POST"))
                .and(path("/chat/completions"))
                .and(header("Authorization", "Bearer test-key"))
                .and(body_partial_json(serde_json::json!({
                    "response_format": { "type": "json_object" }
                })))
                .respond_with(ResponseTemplate::new(200).set_body_json(success_body("{}")))
                .expect(1)
                .mount(&server),
        );

        let completion = test_client(&server).complete(&test_request()).unwrap();
        assert_eq!(completion.content, "{}");
        assert_eq!(completion.usage.total_tokens, 200);
    }

    #[test]
    fn test_retry_on_429_then_success() {
        let (runtime, server) = start_server();
        runtime.block_on(async {
            Mock::given(method("POST"))
                .and(path("/chat/completions"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(success_body("after retry")),
                )
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/chat/completions"))
                .respond_with(ResponseTemplate::new(429).set_body_string("Rate limit exceeded"))
                .up_to_n_times(1)
                .with_priority(1)
                .mount(&server)
                .await;
        });

        let completion = test_client(&server).complete(&test_request()).unwrap();
        assert_eq!(completion.content, "after retry");
    }

    #[test]
    fn test_no_retry_on_401() {
        let (runtime, server) = start_server();
        runtime.block_on(
            Mock::given(method("POST"))
                .and(path("/chat/completions"))
                .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
                .expect(1)
                .mount(&server),
        );

        let err = test_client(&server).complete(&test_request()).unwrap_err();
        assert!(matches!(err, LlmError::HttpStatus { code: 401, .. }));
    }

    #[test]
    fn test_retries_exhausted_on_persistent_503() {
        let (runtime, server) = start_server();
        runtime.block_on(
            Mock::given(method("POST"))
                .and(path("/chat/completions"))
                .respond_with(ResponseTemplate::new(503))
                .expect(3)
                .mount(&server),
        );

        let err = test_client(&server).complete(&test_request()).unwrap_err();
        match err {
            LlmError::RetriesExhausted(inner) => {
                assert!(matches!(*inner, LlmError::HttpStatus { code: 503, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_choices() {
        let (runtime, server) = start_server();
        runtime.block_on(
            Mock::given(method("POST"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })),
                )
                .mount(&server),
        );

        let err = test_client(&server).complete(&test_request()).unwrap_err();
        assert!(matches!(err, LlmError::EmptyResponse));
    }

    #[test]
    fn test_malformed_body_is_not_retried() {
        let (runtime, server) = start_server();
        runtime.block_on(
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
                .expect(1)
                .mount(&server),
        );

        let err = test_client(&server).complete(&test_request()).unwrap_err();
        assert!(matches!(err, LlmError::JsonParse { .. }));
    }

    #[test]
    fn test_usage_accumulates() {
        let mut total = Usage::default();
        let step = Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        };
        total.add(&step);
        total.add(&step);
        assert_eq!(total.total_tokens, 30);
        assert_eq!(total.prompt_tokens, 20);
    }

    #[test]
    fn test_debug_hides_api_key() {
        let config = Config::default();
        let client = ChatClient::new("sk-secret", &config).unwrap();
        assert!(!format!("{:?}", client).contains("sk-secret"));
    }
}
