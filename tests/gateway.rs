//! Router-level tests against mock upstreams: the gateway is driven through
//! the real axum router, the backend through a wiremock server.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::util::ServiceExt;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use modelgate::api::{router, AppState};
use modelgate::backends::ollama::OllamaBackend;
use modelgate::backends::openai::OpenAiBackend;
use modelgate::backends::relay::RelayBackend;
use modelgate::backends::Backend;

fn test_client() -> reqwest::Client {
    reqwest::Client::new()
}

fn app_for(backend: Arc<dyn Backend>) -> axum::Router {
    router(AppState {
        backend,
        uri: "http://127.0.0.1:8000".to_string(),
        debug: false,
    })
}

fn openai_app(server: &MockServer) -> axum::Router {
    app_for(Arc::new(OpenAiBackend::new(
        test_client(),
        server.uri(),
        "test-key",
        "openai",
        "openai",
    )))
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn root_answers_the_gateway_base_url() {
    let server = MockServer::start().await;
    let app = openai_app(&server);
    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "http://127.0.0.1:8000");
}

#[tokio::test]
async fn consecutive_user_messages_reach_the_backend_merged() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "messages": [{"role": "user", "content": "hi\nthere"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "m",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"total_tokens": 3}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = app_for(Arc::new(OpenAiBackend::new(
        test_client(),
        server.uri(),
        "test-key",
        "openai",
        "openai",
    )))
    .oneshot(post_json(
        "/v1/chat/completions",
        json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "user", "content": "there"}
            ],
            "stream": false
        }),
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "hello");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 3);
}

#[tokio::test]
async fn streamed_backend_chunks_come_out_as_sse_frames() {
    let server = MockServer::start().await;
    let sse = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"he\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let response = openai_app(&server)
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({
                "model": "m",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let text = body_text(response).await;
    let frames: Vec<&str> = text
        .lines()
        .filter(|l| l.starts_with("data: "))
        .collect();
    // Two upstream chunks, two frames; no fabricated [DONE].
    assert_eq!(frames.len(), 2);
    for frame in &frames {
        let chunk: Value = serde_json::from_str(frame.trim_start_matches("data: ")).unwrap();
        assert_eq!(chunk["object"], "chat.completion.chunk");
    }
    let last: Value = serde_json::from_str(frames[1].trim_start_matches("data: ")).unwrap();
    assert_eq!(last["choices"][0]["finish_reason"], "stop");
    assert_eq!(last["choices"][0]["delta"]["content"], "llo");
}

#[tokio::test]
async fn embedding_models_are_tagged_in_the_catalog() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "data": [{
                "id": "text-embedding-3-small",
                "object": "model",
                "created": 123,
                "owned_by": "openai"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = openai_app(&server)
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["id"], "text-embedding-3-small");
    assert_eq!(body["data"][0]["metadata"]["usage"], "text-embedding");
    assert_eq!(body["data"][0]["created"], 123);
}

#[tokio::test]
async fn catalog_errors_surface_as_500_with_an_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(503).set_body_string("down"))
        .mount(&server)
        .await;

    let response = openai_app(&server)
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn failed_image_fetch_stops_the_request_before_any_chat_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.png"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let response = openai_app(&server)
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({
                "model": "m",
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "text", "text": "what is this"},
                        {"type": "image_url", "image_url": {"url": format!("{}/missing.png", server.uri())}}
                    ]
                }],
                "stream": false
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("missing.png"));
}

#[tokio::test]
async fn malformed_bodies_get_a_400_envelope() {
    let server = MockServer::start().await;
    let response = openai_app(&server)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn backend_errors_mirror_the_upstream_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"message": "rate limited"}
        })))
        .mount(&server)
        .await;

    let response = openai_app(&server)
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({
                "model": "m",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": false
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["error"], "rate limited");
}

#[tokio::test]
async fn ollama_synthesizes_a_single_chunk_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        // The gateway forces stream=false upstream and rewrites the leading
        // system turn to user, merging it with the next user turn.
        .and(body_partial_json(json!({
            "stream": false,
            "messages": [{"role": "user", "content": "be brief\nhi"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "llama3",
            "message": {"role": "assistant", "content": "hello"},
            "done": true,
            "done_reason": "stop"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = app_for(Arc::new(OllamaBackend::new(test_client(), server.uri())));
    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({
                "model": "llama3",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hi"}
                ],
                "stream": true
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let text = body_text(response).await;
    let frames: Vec<&str> = text
        .lines()
        .filter(|l| l.starts_with("data: "))
        .collect();
    assert_eq!(frames.len(), 1);
    let chunk: Value = serde_json::from_str(frames[0].trim_start_matches("data: ")).unwrap();
    assert_eq!(chunk["object"], "chat.completion.chunk");
    assert_eq!(chunk["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(chunk["choices"][0]["delta"]["content"], "hello");
    assert_eq!(chunk["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn embeddings_pass_through_for_openai_backends() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .and(body_partial_json(json!({"model": "text-embedding-3-small", "input": "hi"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"embedding": [0.1, 0.2]}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = openai_app(&server)
        .oneshot(post_json(
            "/v1/embeddings",
            json!({"model": "text-embedding-3-small", "input": "hi"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"][0]["embedding"][0], 0.1);
}

#[tokio::test]
async fn relay_catalog_items_keep_their_usage_tags() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"id": "gpt-4o", "usage": "llm", "created": "1970-01-01T00:01:00Z"},
                {"id": "embedder", "usage": "text-embedding"},
                {"id": "mystery", "usage": "quantum"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = app_for(Arc::new(RelayBackend::new(test_client(), server.uri(), None)));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"][0]["metadata"]["usage"], "llm");
    assert_eq!(body["data"][0]["created"], 60);
    assert_eq!(body["data"][1]["metadata"]["usage"], "text-embedding");
    // Unknown usage strings are dropped, not guessed.
    assert!(body["data"][2]["metadata"].is_null());
}

#[tokio::test]
async fn relay_streams_end_with_the_done_sentinel() {
    let server = MockServer::start().await;
    let sse = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"hi\"},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/api/llm-proxy/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let app = app_for(Arc::new(RelayBackend::new(test_client(), server.uri(), None)));
    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({
                "model": "m",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let text = body_text(response).await;
    let frames: Vec<&str> = text
        .lines()
        .filter(|l| l.starts_with("data: "))
        .collect();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1], "data: [DONE]");
    let chunk: Value = serde_json::from_str(frames[0].trim_start_matches("data: ")).unwrap();
    assert_eq!(chunk["choices"][0]["delta"]["content"], "hi");
}

#[tokio::test]
async fn unsupported_operations_answer_with_an_envelope() {
    let server = MockServer::start().await;
    let app = app_for(Arc::new(OllamaBackend::new(test_client(), server.uri())));
    let response = app
        .oneshot(post_json(
            "/v1/images/generations",
            json!({"model": "dall-e-3", "prompt": "a crab"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("image generation"));
}
