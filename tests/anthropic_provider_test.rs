//! Integration tests for the Anthropic provider against a mock Messages API.

use futures::StreamExt;
use llm_providers::anthropic::{API_VERSION, DEFAULT_MODEL};
use llm_providers::prelude::*;
use llm_providers::streaming::{self, collect_text};
use llm_providers::ProviderCore;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SSE_BODY: &str = "event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"content\":[]}}\n\n\
event: content_block_start\n\
data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n\
event: ping\n\
data: {\"type\":\"ping\"}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\", world\"}}\n\n\
event: content_block_stop\n\
data: {\"type\":\"content_block_stop\",\"index\":0}\n\n\
event: message_delta\n\
data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":3}}\n\n\
event: message_stop\n\
data: {\"type\":\"message_stop\"}\n\n";

fn provider_for(server: &MockServer, config: ProviderConfig) -> AnthropicProvider {
    AnthropicProvider::new(config.with_api_key("test-key").with_base_url(server.uri())).unwrap()
}

fn text_response(text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "id": "msg_1",
        "type": "message",
        "role": "assistant",
        "model": DEFAULT_MODEL,
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 5, "output_tokens": 2}
    }))
}

fn error_response(status: u16, error_type: &str, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(json!({
        "type": "error",
        "error": {"type": error_type, "message": message}
    }))
}

#[tokio::test]
async fn complete_sends_resolved_settings_and_returns_text() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", API_VERSION))
        .and(body_partial_json(json!({
            "model": DEFAULT_MODEL,
            "max_tokens": 4096,
            "stream": false,
            "messages": [{"role": "user", "content": "Hi"}]
        })))
        .respond_with(text_response("Hello!"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider_for(&server, ProviderConfig::new());
    let text = provider.complete("Hi", &CompletionOptions::new()).await.unwrap();

    assert_eq!(text, "Hello!");
}

#[tokio::test]
async fn complete_applies_call_options() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({
            "model": "claude-3-haiku-20240307",
            "max_tokens": 32,
            "system": "Answer in one word."
        })))
        .respond_with(text_response("Yes"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider_for(&server, ProviderConfig::new().with_max_tokens(512));
    let options = CompletionOptions::new()
        .with_model("claude-3-haiku-20240307")
        .with_max_tokens(32)
        .with_system("Answer in one word.");

    assert_eq!(provider.complete("Ok?", &options).await.unwrap(), "Yes");
}

#[tokio::test]
async fn complete_without_text_block_is_empty() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{"type": "tool_use", "id": "t1", "name": "lookup", "input": {}}]
        })))
        .mount(&server)
        .await;

    let provider = provider_for(&server, ProviderConfig::new());
    assert_eq!(provider.complete("x", &CompletionOptions::new()).await.unwrap(), "");
}

#[tokio::test]
async fn stream_yields_text_deltas_in_order() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(SSE_BODY, "text/event-stream"),
        )
        .mount(&server)
        .await;

    let provider = provider_for(&server, ProviderConfig::new());
    let mut stream = provider.stream("Hi", &CompletionOptions::new()).await.unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk.unwrap());
    }

    assert_eq!(chunks, vec!["Hello", ", world"]);
}

#[tokio::test]
async fn stream_with_progress_reports_every_chunk() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(SSE_BODY, "text/event-stream"))
        .mount(&server)
        .await;

    let provider = provider_for(&server, ProviderConfig::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let stream = provider
        .stream_with_progress(
            "Hi",
            Box::new(move |chunk| sink.lock().unwrap().push(chunk.to_string())),
            &CompletionOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(collect_text(stream).await.unwrap(), "Hello, world");
    assert_eq!(*seen.lock().unwrap(), vec!["Hello", ", world"]);
}

#[tokio::test]
async fn cancelled_stream_stops_yielding() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(SSE_BODY, "text/event-stream"))
        .mount(&server)
        .await;

    let provider = provider_for(&server, ProviderConfig::new());
    let inner = provider.stream("Hi", &CompletionOptions::new()).await.unwrap();
    let (mut stream, handle) = streaming::cancellable(inner);

    assert_eq!(stream.next().await.unwrap().unwrap(), "Hello");
    handle.cancel();
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn stream_error_event_surfaces_as_item() {
    let server = MockServer::start().await;
    let body = "event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n\
event: error\n\
data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n";

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let provider = provider_for(&server, ProviderConfig::new());
    let mut stream = provider.stream("Hi", &CompletionOptions::new()).await.unwrap();

    assert_eq!(stream.next().await.unwrap().unwrap(), "Hel");
    let err = stream.next().await.unwrap().unwrap_err();
    assert_eq!(err.code(), &ErrorCode::Overloaded);
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn malformed_stream_event_ends_stream_with_error() {
    let server = MockServer::start().await;
    let body = "event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\", wor\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"ld\"}}\n\n";

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let provider = provider_for(&server, ProviderConfig::new());
    let items: Vec<_> = provider
        .stream("Hi", &CompletionOptions::new())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_deref().unwrap(), "Hello");
    let err = items[1].as_ref().unwrap_err();
    assert_eq!(err.code(), &ErrorCode::Stream);
}

#[tokio::test]
async fn chat_sends_native_messages() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({
            "system": "Be brief.",
            "messages": [
                {"role": "user", "content": "Hello"},
                {"role": "assistant", "content": "Hi"},
                {"role": "user", "content": "Bye"}
            ]
        })))
        .respond_with(text_response("Goodbye"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider_for(&server, ProviderConfig::new());
    let messages = [
        ChatMessage::system("Be brief."),
        ChatMessage::user("Hello"),
        ChatMessage::assistant("Hi"),
        ChatMessage::user("Bye"),
    ];

    let text = provider.chat(&messages, &CompletionOptions::new()).await.unwrap();
    assert_eq!(text, "Goodbye");
}

#[tokio::test]
async fn authentication_failure_is_permanent() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(error_response(401, "authentication_error", "invalid x-api-key"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider_for(&server, ProviderConfig::new());
    let err = provider
        .generate_with_retry("Hi", &CompletionOptions::new(), 3)
        .await
        .unwrap_err();

    assert_eq!(err.code(), &ErrorCode::Authentication);
    assert!(!err.is_operational());
}

#[tokio::test]
async fn rate_limit_response_carries_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            error_response(429, "rate_limit_error", "slow down").insert_header("retry-after", "30"),
        )
        .mount(&server)
        .await;

    let provider = provider_for(&server, ProviderConfig::new());
    let err = provider.complete("Hi", &CompletionOptions::new()).await.unwrap_err();

    assert!(matches!(err.code(), ErrorCode::RateLimited { .. }));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    assert!(err.is_operational());
}

#[tokio::test]
async fn overloaded_response_is_operational() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(error_response(529, "overloaded_error", "Overloaded"))
        .mount(&server)
        .await;

    let provider = provider_for(&server, ProviderConfig::new());
    let err = provider.complete("Hi", &CompletionOptions::new()).await.unwrap_err();

    assert_eq!(err.code(), &ErrorCode::Overloaded);
    assert!(err.is_operational());
}

#[tokio::test]
async fn retry_recovers_from_server_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(error_response(503, "api_error", "temporarily unavailable"))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(text_response("Recovered"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider_for(&server, ProviderConfig::new());
    let retry = RetryConfig::new(3).with_initial_backoff(Duration::from_millis(5));

    let text = provider
        .generate_with_retry_config("Hi", &CompletionOptions::new(), &retry)
        .await
        .unwrap();

    assert_eq!(text, "Recovered");
}

#[tokio::test]
async fn missing_key_fails_before_any_request() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(text_response("unreachable"))
        .expect(0)
        .mount(&server)
        .await;

    let config = ProviderConfig::new().with_base_url(server.uri());
    let core = ProviderCore::new_with_env::<AnthropicProvider, _>(config, |_| None).unwrap();
    let provider = AnthropicProvider::from_core(core).unwrap();

    let err = provider.complete("Hi", &CompletionOptions::new()).await.unwrap_err();
    assert_eq!(err.code(), &ErrorCode::Authentication);
    assert!(err.message().contains("ANTHROPIC_API_KEY"));

    assert!(!provider.test_connection().await);
    assert_eq!(provider.info().name, "anthropic");
}

#[tokio::test]
async fn test_connection_reports_health() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_partial_json(json!({"max_tokens": 10})))
        .respond_with(text_response("Hi"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider_for(&server, ProviderConfig::new());
    assert!(provider.test_connection().await);
}

#[tokio::test]
async fn fire_immediately_limit_still_sends_over_budget() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(text_response("ok"))
        .expect(2)
        .mount(&server)
        .await;

    let policy = RateLimitPolicy::new(1, Interval::Hour).fire_immediately();
    let provider = provider_for(&server, ProviderConfig::new().with_rate_limit(policy));

    assert_eq!(provider.complete("first", &CompletionOptions::new()).await.unwrap(), "ok");
    assert_eq!(provider.complete("second", &CompletionOptions::new()).await.unwrap(), "ok");
}

#[tokio::test]
async fn reject_on_deficit_limit_rejects_without_sending() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(text_response("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let policy = RateLimitPolicy::new(1, Interval::Hour).reject_on_deficit();
    let provider = provider_for(&server, ProviderConfig::new().with_rate_limit(policy));

    provider.complete("first", &CompletionOptions::new()).await.unwrap();
    let err = provider
        .complete("second", &CompletionOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err.code(), ErrorCode::RateLimited { .. }));
    assert!(err.is_operational());
}
