use anyhow::{Result, anyhow};
use blocksmith_core::{
    CancellationToken, ChatMessage, ChatRequest, LlmConfig, LlmResponse, StreamCallback,
    StreamChunk, TokenUsage,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde_json::{Value, json};
use std::error::Error as StdError;
use std::io::BufRead;
use std::thread;
use std::time::{Duration, Instant};

mod stream;

pub use stream::{StreamGate, spawn_chat_stream};

/// Base delay for network/transport error retries (1s, 2s, 4s exponential backoff).
const NETWORK_RETRY_BASE_MS: u64 = 1000;
/// Granularity at which retry back-off sleeps re-check cancellation.
const CANCEL_POLL_MS: u64 = 50;

/// Terminal failures of a model call, as seen by the session loop.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("{0}")]
    Transport(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("model returned an empty response")]
    Empty,
}

impl LlmError {
    /// Classify an error coming back from an [`LlmClient`] call.
    pub fn from_client_error(err: &anyhow::Error, cancel: &CancellationToken) -> Self {
        if let Some(known) = err.downcast_ref::<LlmError>() {
            return known.clone();
        }
        if cancel.is_cancelled() {
            return LlmError::Cancelled;
        }
        LlmError::Transport(format!("{err:#}"))
    }
}

pub trait LlmClient {
    /// Chat completion returning the whole response at once.
    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse>;

    /// Streaming chat completion. Invokes `cb` for each token chunk as it
    /// arrives and returns the fully assembled `LlmResponse` once the stream
    /// ends. Implementations check `cancel` between chunks and fail with
    /// [`LlmError::Cancelled`] once it is set.
    fn complete_chat_streaming(
        &self,
        req: &ChatRequest,
        cb: StreamCallback,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse>;
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
#[derive(Debug, Clone)]
pub struct HttpChatClient {
    cfg: LlmConfig,
    client: Client,
}

impl HttpChatClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self { cfg, client })
    }

    fn build_chat_payload(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| match m {
                ChatMessage::System { content } => json!({"role": "system", "content": content}),
                ChatMessage::User { content } => json!({"role": "user", "content": content}),
                ChatMessage::Assistant { content } => {
                    json!({"role": "assistant", "content": content})
                }
            })
            .collect();

        let mut payload = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "stream": stream
        });
        if let Some(temp) = req.temperature {
            payload["temperature"] = json!(temp);
        }
        if stream {
            payload["stream_options"] = json!({"include_usage": true});
        }
        payload
    }

    fn complete_chat_inner(&self, req: &ChatRequest, api_key: &str) -> Result<LlmResponse> {
        let payload = self.build_chat_payload(req, false);

        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            let response = self
                .client
                .post(&self.cfg.endpoint)
                .bearer_auth(api_key)
                .json(&payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
                    let body = resp.text()?;
                    if status.is_success() {
                        return parse_non_streaming_payload(&body);
                    }
                    last_err = Some(self.format_api_error(status, &body, attempt));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(self.cfg.retry_base_ms, attempt, retry_after));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(format_transport_error(&e));
                    if should_retry_transport_error(&e) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(NETWORK_RETRY_BASE_MS, attempt, None));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("chat request failed")))
    }

    fn complete_chat_streaming_inner(
        &self,
        req: &ChatRequest,
        api_key: &str,
        cb: StreamCallback,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse> {
        let payload = self.build_chat_payload(req, true);

        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled.into());
            }
            let response = self
                .client
                .post(&self.cfg.endpoint)
                .bearer_auth(api_key)
                .json(&payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));

                    if status.is_success() {
                        return read_sse_stream(std::io::BufReader::new(resp), &cb, cancel);
                    }

                    let body = resp.text().unwrap_or_default();
                    last_err = Some(self.format_api_error(status, &body, attempt));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        let delay = retry_delay_ms(self.cfg.retry_base_ms, attempt, retry_after);
                        attempt = attempt.saturating_add(1);
                        cb(StreamChunk::Retrying {
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                        });
                        sleep_unless_cancelled(delay, cancel)?;
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(format_transport_error(&e));
                    if should_retry_transport_error(&e) && attempt < self.cfg.max_retries {
                        let delay = retry_delay_ms(NETWORK_RETRY_BASE_MS, attempt, None);
                        attempt = attempt.saturating_add(1);
                        cb(StreamChunk::Retrying {
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                        });
                        sleep_unless_cancelled(delay, cancel)?;
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("chat streaming request failed")))
    }

    fn resolve_api_key(&self) -> Option<String> {
        std::env::var(&self.cfg.api_key_env)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                self.cfg
                    .api_key
                    .as_ref()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
    }

    fn require_api_key(&self) -> Result<String> {
        self.resolve_api_key()
            .ok_or_else(|| anyhow!("{} not set and llm.api_key is empty", self.cfg.api_key_env))
    }

    /// Produce a user-friendly error from an API HTTP response.
    fn format_api_error(&self, status: StatusCode, body: &str, attempt: u8) -> anyhow::Error {
        let detail = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .and_then(|e| e.get("message").or(Some(e)))
                    .and_then(|m| m.as_str().map(ToString::to_string))
            })
            .unwrap_or_else(|| body.chars().take(200).collect());
        let max_retries = self.cfg.max_retries;

        match status {
            StatusCode::UNAUTHORIZED => anyhow!(
                "Invalid or missing API key (HTTP 401).\n\
                 Set the {} environment variable or configure llm.api_key in settings.",
                self.cfg.api_key_env
            ),
            StatusCode::TOO_MANY_REQUESTS => anyhow!(
                "Rate limited (HTTP 429). Exhausted {}/{} retries. Try again shortly. Detail: {}",
                attempt + 1,
                max_retries + 1,
                detail
            ),
            StatusCode::PAYMENT_REQUIRED => {
                anyhow!("Insufficient balance (HTTP 402). Top up the provider account.")
            }
            StatusCode::INTERNAL_SERVER_ERROR | StatusCode::SERVICE_UNAVAILABLE => anyhow!(
                "Model server error (HTTP {}). Exhausted {}/{} retries. Detail: {}",
                status.as_u16(),
                attempt + 1,
                max_retries + 1,
                detail
            ),
            _ => anyhow!("Model API error (HTTP {}): {}", status.as_u16(), detail),
        }
    }
}

impl LlmClient for HttpChatClient {
    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse> {
        let key = self.require_api_key()?;
        self.complete_chat_inner(req, &key)
    }

    fn complete_chat_streaming(
        &self,
        req: &ChatRequest,
        cb: StreamCallback,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse> {
        let key = self.require_api_key()?;
        self.complete_chat_streaming_inner(req, &key, cb, cancel)
    }
}

/// Consume a server-sent-event body until `[DONE]`, EOF or cancellation.
fn read_sse_stream(
    reader: impl BufRead,
    cb: &StreamCallback,
    cancel: &CancellationToken,
) -> Result<LlmResponse> {
    let mut content_out = String::new();
    let mut finish_reason: Option<String> = None;
    let mut usage: Option<TokenUsage> = None;

    for line_result in reader.lines() {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled.into());
        }
        let line = line_result.map_err(|e| anyhow!("stream read error: {e}"))?;
        let trimmed = line.trim();
        if !trimmed.starts_with("data:") {
            continue;
        }
        let chunk = trimmed.trim_start_matches("data:").trim();
        if chunk == "[DONE]" {
            break;
        }
        let value: Value = match serde_json::from_str(chunk) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if let Some(parsed) = value.get("usage").and_then(parse_usage) {
            usage = Some(parsed);
        }
        let Some(choice) = value
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
        else {
            continue;
        };
        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            finish_reason = Some(reason.to_string());
        }
        if let Some(content) = choice
            .get("delta")
            .and_then(|delta| delta.get("content"))
            .and_then(|v| v.as_str())
            && !content.is_empty()
        {
            content_out.push_str(content);
            cb(StreamChunk::ContentDelta(content.to_string()));
        }
    }

    if cancel.is_cancelled() {
        return Err(LlmError::Cancelled.into());
    }
    cb(StreamChunk::Done);
    Ok(LlmResponse {
        text: content_out,
        finish_reason: finish_reason.unwrap_or_else(|| "stop".to_string()),
        usage,
    })
}

fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled.into());
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep((deadline - now).min(Duration::from_millis(CANCEL_POLL_MS)));
    }
}

/// Produce a user-friendly error from a transport/network failure.
fn format_transport_error(err: &reqwest::Error) -> anyhow::Error {
    let inner_msg = err
        .source()
        .map(|e| e.to_string())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let is_dns = inner_msg.contains("dns")
        || inner_msg.contains("resolve")
        || inner_msg.contains("name or service not known")
        || inner_msg.contains("no such host")
        || inner_msg.contains("getaddrinfo");

    if err.is_timeout() {
        anyhow!(
            "Request timed out. The model endpoint did not respond in time.\n\
             If this persists, try increasing llm.timeout_seconds in your config."
        )
    } else if is_dns {
        anyhow!(
            "DNS resolution failed. Could not resolve the model endpoint hostname.\n\
             Check your internet connection and DNS settings."
        )
    } else if err.is_connect() {
        anyhow!(
            "Connection refused. Could not reach the configured llm.endpoint.\n\
             Check your network connection and firewall settings."
        )
    } else {
        anyhow!("Network error: {err}")
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::SERVICE_UNAVAILABLE
    )
}

fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    parse_retry_after_http_date(value)
}

fn parse_retry_after_http_date(value: &str) -> Option<u64> {
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let delta = retry_at.signed_duration_since(Utc::now()).num_seconds();
    Some(delta.max(0) as u64)
}

fn retry_delay_ms(base_ms: u64, attempt: u8, retry_after_seconds: Option<u64>) -> Duration {
    if let Some(seconds) = retry_after_seconds {
        return Duration::from_millis(seconds.saturating_mul(1000));
    }
    let exponent = u32::from(attempt);
    let exponential = base_ms.saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_millis(exponential.max(base_ms.max(100)))
}

fn parse_usage(value: &Value) -> Option<TokenUsage> {
    let prompt_tokens = value.get("prompt_tokens")?.as_u64()?;
    let completion_tokens = value
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or_default();
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
    })
}

fn parse_non_streaming_payload(body: &str) -> Result<LlmResponse> {
    let value: Value = serde_json::from_str(body)?;
    let Some(choice) = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
    else {
        return Err(anyhow!(
            "unexpected non-streaming payload: missing choices[0]"
        ));
    };
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .unwrap_or("stop")
        .to_string();
    let text = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Ok(LlmResponse {
        text,
        finish_reason,
        usage: value.get("usage").and_then(parse_usage),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, mpsc};
    use std::time::Duration as StdDuration;

    fn request(text: &str) -> ChatRequest {
        ChatRequest {
            model: "test-model".to_string(),
            messages: vec![ChatMessage::user(text)],
            max_tokens: 64,
            temperature: Some(0.0),
        }
    }

    fn client_for(endpoint: &str, key_env: &str, max_retries: u8) -> HttpChatClient {
        let cfg = LlmConfig {
            endpoint: endpoint.to_string(),
            api_key: Some("test-key".to_string()),
            api_key_env: key_env.to_string(),
            max_retries,
            retry_base_ms: 1,
            ..LlmConfig::default()
        };
        HttpChatClient::new(cfg).expect("client")
    }

    fn collecting_callback() -> (StreamCallback, Arc<Mutex<Vec<String>>>) {
        let chunks = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&chunks);
        let cb: StreamCallback = Arc::new(move |chunk| match chunk {
            StreamChunk::ContentDelta(text) => sink.lock().expect("test lock").push(text),
            StreamChunk::Done => sink.lock().expect("test lock").push("[DONE]".to_string()),
            StreamChunk::Retrying { .. } => {}
        });
        (cb, chunks)
    }

    #[test]
    fn parses_non_streaming_with_usage() {
        let body = r#"{"choices":[{"message":{"content":"hello"}}],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#;
        let got = parse_non_streaming_payload(body).expect("parse");
        assert_eq!(got.text, "hello");
        assert_eq!(got.finish_reason, "stop");
        assert_eq!(
            got.usage,
            Some(TokenUsage {
                prompt_tokens: 12,
                completion_tokens: 3
            })
        );
    }

    #[test]
    fn non_streaming_payload_without_choices_is_an_error() {
        assert!(parse_non_streaming_payload(r#"{"id":"x"}"#).is_err());
    }

    #[test]
    fn sse_reader_assembles_content_and_usage() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"he\"}}]}\n\n\
                    : keep-alive\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"llo\"},\"finish_reason\":\"stop\"}]}\n\n\
                    data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n\
                    data: [DONE]\n";
        let (cb, chunks) = collecting_callback();
        let resp = read_sse_stream(body.as_bytes(), &cb, &CancellationToken::new()).expect("read");
        assert_eq!(resp.text, "hello");
        assert_eq!(resp.usage.map(|u| u.prompt_tokens), Some(5));
        assert_eq!(
            *chunks.lock().expect("test lock"),
            vec!["he".to_string(), "llo".to_string(), "[DONE]".to_string()]
        );
    }

    #[test]
    fn sse_reader_stops_when_cancelled() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n";
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (cb, chunks) = collecting_callback();
        let err = read_sse_stream(body.as_bytes(), &cb, &cancel).expect_err("cancelled");
        assert_eq!(
            err.downcast_ref::<LlmError>(),
            Some(&LlmError::Cancelled)
        );
        assert!(chunks.lock().expect("test lock").is_empty());
    }

    #[test]
    fn client_errors_are_classified() {
        let cancel = CancellationToken::new();
        let transport = anyhow!("connection reset");
        assert_eq!(
            LlmError::from_client_error(&transport, &cancel),
            LlmError::Transport("connection reset".to_string())
        );
        let known: anyhow::Error = LlmError::Cancelled.into();
        assert_eq!(
            LlmError::from_client_error(&known, &cancel),
            LlmError::Cancelled
        );
        cancel.cancel();
        assert_eq!(
            LlmError::from_client_error(&transport, &cancel),
            LlmError::Cancelled
        );
    }

    #[test]
    fn retry_status_classification() {
        assert!(should_retry_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(should_retry_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!should_retry_status(StatusCode::UNAUTHORIZED));
        assert!(!should_retry_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn network_retry_base_uses_one_second_delays() {
        let d0 = retry_delay_ms(NETWORK_RETRY_BASE_MS, 0, None);
        let d1 = retry_delay_ms(NETWORK_RETRY_BASE_MS, 1, None);
        let d2 = retry_delay_ms(NETWORK_RETRY_BASE_MS, 2, None);
        assert_eq!(d0, Duration::from_millis(1000));
        assert_eq!(d1, Duration::from_millis(2000));
        assert_eq!(d2, Duration::from_millis(4000));
    }

    #[test]
    fn retry_after_parses_seconds_and_http_date() {
        let seconds_header = reqwest::header::HeaderValue::from_static("7");
        assert_eq!(parse_retry_after_seconds(Some(&seconds_header)), Some(7));

        let future = Utc::now() + chrono::Duration::seconds(5);
        let http_date = future.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let date_header = reqwest::header::HeaderValue::from_str(&http_date).expect("header");
        let parsed = parse_retry_after_seconds(Some(&date_header)).expect("parsed");
        assert!(parsed <= 10);
    }

    #[test]
    fn cancelled_token_skips_the_request() {
        let client = client_for("http://127.0.0.1:9/chat/completions", "BLOCKSMITH_KEY_UNUSED", 0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (cb, _) = collecting_callback();
        let err = client
            .complete_chat_streaming(&request("hi"), cb, &cancel)
            .expect_err("cancelled");
        assert_eq!(err.downcast_ref::<LlmError>(), Some(&LlmError::Cancelled));
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let cfg = LlmConfig {
            endpoint: "http://127.0.0.1:9/chat/completions".to_string(),
            api_key: None,
            api_key_env: "BLOCKSMITH_KEY_DEFINITELY_UNSET".to_string(),
            ..LlmConfig::default()
        };
        let client = HttpChatClient::new(cfg).expect("client");
        let err = client.complete_chat(&request("hi")).expect_err("no key");
        assert!(err.to_string().contains("BLOCKSMITH_KEY_DEFINITELY_UNSET not set"));
    }

    #[test]
    fn complete_retries_transient_status_then_succeeds() {
        let server = start_mock_server(vec![
            MockHttpResponse {
                status: 503,
                body: r#"{"error":"temporarily_unavailable"}"#.to_string(),
                retry_after: Some("0".to_string()),
            },
            MockHttpResponse {
                status: 200,
                body: r#"{"choices":[{"message":{"content":"ok-after-retry"}}]}"#.to_string(),
                retry_after: None,
            },
        ]);
        let client = client_for(&server.endpoint, "BLOCKSMITH_KEY_RETRY_TEST", 3);
        let out = client
            .complete_chat(&request("retry test"))
            .expect("response should eventually succeed");
        assert_eq!(out.text, "ok-after-retry");
        assert!(server.request_count() >= 2);
    }

    #[test]
    fn complete_stops_after_bounded_retries() {
        let server = start_mock_server(vec![MockHttpResponse {
            status: 429,
            body: r#"{"error":"rate_limited"}"#.to_string(),
            retry_after: Some("0".to_string()),
        }]);
        let client = client_for(&server.endpoint, "BLOCKSMITH_KEY_RETRY_LIMIT_TEST", 2);
        let err = client
            .complete_chat(&request("retry limit test"))
            .expect_err("request should fail after retries are exhausted");
        assert!(err.to_string().contains("Rate limited (HTTP 429)"));
        assert_eq!(server.request_count(), 3);
    }

    #[test]
    fn unauthorized_names_the_key_variable_and_does_not_retry() {
        let server = start_mock_server(vec![MockHttpResponse {
            status: 401,
            body: r#"{"error":{"message":"invalid_api_key"}}"#.to_string(),
            retry_after: None,
        }]);
        let client = client_for(&server.endpoint, "BLOCKSMITH_KEY_401_TEST", 2);
        let err = client
            .complete_chat(&request("hello"))
            .expect_err("401 should fail without retrying");
        let msg = err.to_string();
        assert!(msg.contains("Invalid or missing API key"), "{msg}");
        assert!(msg.contains("BLOCKSMITH_KEY_401_TEST"), "{msg}");
        assert_eq!(server.request_count(), 1);
    }

    #[test]
    fn streaming_invokes_callback_per_chunk() {
        let sse_body = "data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\ndata: [DONE]\n";
        let server = start_mock_server(vec![MockHttpResponse {
            status: 200,
            body: sse_body.to_string(),
            retry_after: None,
        }]);
        let client = client_for(&server.endpoint, "BLOCKSMITH_KEY_STREAM_TEST", 0);
        let (cb, chunks) = collecting_callback();
        let resp = client
            .complete_chat_streaming(&request("hello"), cb, &CancellationToken::new())
            .expect("streaming response");

        assert_eq!(resp.text, "hello");
        let collected = chunks.lock().expect("test lock");
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[0], "hel");
        assert_eq!(collected[1], "lo");
        assert_eq!(collected[2], "[DONE]");
    }

    #[test]
    fn streaming_request_asks_for_usage() {
        let client = client_for("http://127.0.0.1:9/chat/completions", "UNUSED", 0);
        let payload = client.build_chat_payload(&request("hi"), true);
        assert_eq!(payload["stream"], json!(true));
        assert_eq!(payload["stream_options"]["include_usage"], json!(true));
        assert_eq!(payload["messages"][0]["role"], json!("user"));
        let plain = client.build_chat_payload(&request("hi"), false);
        assert!(plain.get("stream_options").is_none());
    }

    #[derive(Clone)]
    struct MockHttpResponse {
        status: u16,
        body: String,
        retry_after: Option<String>,
    }

    struct MockServer {
        endpoint: String,
        request_count: Arc<AtomicUsize>,
        stop_tx: Option<mpsc::Sender<()>>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl MockServer {
        fn request_count(&self) -> usize {
            self.request_count.load(Ordering::SeqCst)
        }
    }

    impl Drop for MockServer {
        fn drop(&mut self) {
            if let Some(tx) = self.stop_tx.take() {
                let _ = tx.send(());
            }
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn start_mock_server(scripted: Vec<MockHttpResponse>) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        listener
            .set_nonblocking(true)
            .expect("set nonblocking listener");
        let addr = listener.local_addr().expect("addr");
        let request_count = Arc::new(AtomicUsize::new(0));
        let request_count_thread = Arc::clone(&request_count);
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            loop {
                if rx.try_recv().is_ok() {
                    break;
                }
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        let _ = consume_http_request(&mut stream);
                        let idx = request_count_thread.fetch_add(1, Ordering::SeqCst);
                        let selected = scripted
                            .get(idx)
                            .or_else(|| scripted.last())
                            .cloned()
                            .expect("scripted response");
                        let status_text = match selected.status {
                            200 => "OK",
                            401 => "Unauthorized",
                            429 => "Too Many Requests",
                            503 => "Service Unavailable",
                            _ => "Error",
                        };
                        let mut headers = format!(
                            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
                            selected.status,
                            status_text,
                            selected.body.len()
                        );
                        if let Some(retry_after) = selected.retry_after {
                            headers.push_str(&format!("Retry-After: {retry_after}\r\n"));
                        }
                        headers.push_str("\r\n");
                        let response = format!("{headers}{}", selected.body);
                        let _ = stream.write_all(response.as_bytes());
                        let _ = stream.flush();
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(StdDuration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
        });
        MockServer {
            endpoint: format!("http://{addr}/chat/completions"),
            request_count,
            stop_tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn consume_http_request(stream: &mut std::net::TcpStream) -> std::io::Result<()> {
        let mut buffer = Vec::new();
        let mut chunk = [0_u8; 1024];
        let mut header_end = None;
        while header_end.is_none() {
            let read = stream.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
            header_end = find_subsequence(&buffer, b"\r\n\r\n").map(|idx| idx + 4);
            if buffer.len() > 1_048_576 {
                break;
            }
        }
        let header_len = header_end.unwrap_or(buffer.len());
        let content_length = parse_content_length(&buffer[..header_len]);
        let mut body_len = buffer.len().saturating_sub(header_len);
        while body_len < content_length {
            let read = stream.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            body_len += read;
        }
        Ok(())
    }

    fn parse_content_length(headers: &[u8]) -> usize {
        let raw = String::from_utf8_lossy(headers);
        for line in raw.lines() {
            let mut parts = line.splitn(2, ':');
            let key = parts.next().unwrap_or_default().trim();
            if key.eq_ignore_ascii_case("content-length")
                && let Some(value) = parts.next()
                && let Ok(parsed) = value.trim().parse::<usize>()
            {
                return parsed;
            }
        }
        0
    }

    fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        if needle.is_empty() || haystack.len() < needle.len() {
            return None;
        }
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }
}
