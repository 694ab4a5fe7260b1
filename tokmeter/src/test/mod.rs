//! End-to-end proxy scenarios: a test server in front of a wiremock upstream, with recording
//! telemetry backends.

use axum::http::StatusCode;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::Config;
use crate::metering::FileLogStore;
use crate::test_utils::{
    FailingLogStore, FailingMetricsSink, RecordingMetricsSink, TEST_KEYS, create_test_app,
    create_test_app_with_backends, create_test_config,
};
use crate::usage::{DIMENSION_MODEL, MetricName};

fn opus_response() -> Value {
    json!({
        "id": "msg_01XFDUDYJgAACzvnptvVoYEL",
        "type": "message",
        "role": "assistant",
        "model": "claude-3-opus-20240229",
        "content": [{ "type": "text", "text": "Hello!" }],
        "stop_reason": "end_turn",
        "usage": { "input_tokens": 100, "output_tokens": 50 }
    })
}

fn request_body() -> Value {
    json!({
        "model": "claude-3-opus-20240229",
        "max_tokens": 1024,
        "messages": [{ "role": "user", "content": "Hello" }]
    })
}

async fn mount_opus(upstream: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("request-id", "req_abc123")
                .set_body_json(opus_response()),
        )
        .mount(upstream)
        .await;
}

#[test_log::test(tokio::test)]
async fn test_metered_call_is_relayed_unchanged_and_recorded() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", TEST_KEYS[2]))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("request-id", "req_abc123")
                .set_body_json(opus_response()),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let (app, bg_services, backends) = create_test_app(create_test_config(&upstream.uri())).await;

    let response = app
        .post("/v1/messages")
        .add_header("x-api-key", TEST_KEYS[2])
        .add_header("anthropic-version", "2023-06-01")
        .json(&request_body())
        .await;

    response.assert_status(StatusCode::OK);
    response.assert_json(&opus_response());
    assert_eq!(response.header("request-id"), "req_abc123");

    bg_services.shutdown().await;

    let entries = backends.logs.entries();
    assert_eq!(entries.len(), 1);
    let (stream, entry) = &entries[0];
    assert!(stream.starts_with("dev3/"), "unexpected stream {stream}");

    let record = &entry.message;
    assert_eq!(record["developer"], "dev3");
    assert_eq!(record["model"], "claude-3-opus-20240229");
    assert_eq!(record["input_tokens"], 100);
    assert_eq!(record["output_tokens"], 50);
    assert_eq!(record["total_tokens"], 150);
    assert!((record["cost_usd"].as_f64().unwrap() - 0.00525).abs() < 1e-12);
    assert_eq!(record["status"], "success");
    assert!(record.get("error").is_none());

    let batches = backends.metrics.batches();
    assert_eq!(batches.len(), 1);
    let samples = &batches[0].1;
    assert_eq!(samples.len(), 4);
    assert_eq!(samples[0].name, MetricName::InputTokens);
    assert_eq!(samples[0].value, 100.0);
    assert_eq!(samples[0].dimension(DIMENSION_MODEL), Some("claude-3-opus-20240229"));
    assert_eq!(samples[3].name, MetricName::ApiCall);
    assert_eq!(samples[3].dimension(DIMENSION_MODEL), None);
}

#[test_log::test(tokio::test)]
async fn test_unrecognised_key_is_forwarded_as_unknown() {
    let upstream = MockServer::start().await;
    mount_opus(&upstream).await;

    let (app, bg_services, backends) = create_test_app(create_test_config(&upstream.uri())).await;

    let response = app
        .post("/v1/messages")
        .add_header("x-api-key", "sk-someone-else")
        .json(&request_body())
        .await;

    response.assert_status(StatusCode::OK);
    bg_services.shutdown().await;

    let entries = backends.logs.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1.message["developer"], "unknown");
}

#[test_log::test(tokio::test)]
async fn test_missing_key_is_rejected_without_record() {
    let upstream = MockServer::start().await;
    mount_opus(&upstream).await;

    let (app, bg_services, backends) = create_test_app(create_test_config(&upstream.uri())).await;

    let response = app.post("/v1/messages").json(&request_body()).await;

    response.assert_status(StatusCode::UNAUTHORIZED);
    response.assert_json(&json!({ "error": "Missing API key" }));

    bg_services.shutdown().await;
    assert!(backends.logs.entries().is_empty());
    assert!(backends.metrics.batches().is_empty());
    assert!(upstream.received_requests().await.unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_upstream_timeout_returns_500_and_error_record() {
    let upstream = MockServer::start().await;
    Mock::given(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)).set_body_json(opus_response()))
        .mount(&upstream)
        .await;

    let mut config = create_test_config(&upstream.uri());
    config.upstream.timeout = Duration::from_millis(200);
    let (app, bg_services, backends) = create_test_app(config).await;

    let response = app
        .post("/v1/messages")
        .add_header("x-api-key", TEST_KEYS[0])
        .json(&request_body())
        .await;

    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json();
    let message = body["error"].as_str().expect("error field");
    assert!(!message.is_empty());

    bg_services.shutdown().await;

    let entries = backends.logs.entries();
    assert_eq!(entries.len(), 1);
    let record = &entries[0].1.message;
    assert_eq!(record["developer"], "dev1");
    assert_eq!(record["status"], "error");
    assert_eq!(record["error"], message);
    assert_eq!(record["total_tokens"], 0);
    assert!(record.get("model").is_none());
    assert!(backends.metrics.batches().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_unreachable_upstream_returns_500_and_error_record() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let (app, bg_services, backends) = create_test_app(create_test_config(&format!("http://127.0.0.1:{port}"))).await;

    let response = app
        .post("/v1/messages")
        .add_header("x-api-key", TEST_KEYS[3])
        .json(&request_body())
        .await;

    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("error sending request"));

    bg_services.shutdown().await;
    let entries = backends.logs.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1.message["developer"], "dev4");
    assert_eq!(entries[0].1.message["status"], "error");
}

#[test_log::test(tokio::test)]
async fn test_rate_limited_response_is_relayed_without_metering() {
    let upstream = MockServer::start().await;
    let error_body = json!({
        "type": "error",
        "error": { "type": "rate_limit_error", "message": "Number of requests has exceeded your rate limit" }
    });
    Mock::given(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "30")
                .set_body_json(error_body.clone()),
        )
        .mount(&upstream)
        .await;

    let (app, bg_services, backends) = create_test_app(create_test_config(&upstream.uri())).await;

    let response = app
        .post("/v1/messages")
        .add_header("x-api-key", TEST_KEYS[1])
        .json(&request_body())
        .await;

    response.assert_status(StatusCode::TOO_MANY_REQUESTS);
    response.assert_json(&error_body);
    assert_eq!(response.header("retry-after"), "30");

    bg_services.shutdown().await;
    assert!(backends.logs.entries().is_empty());
    assert!(backends.metrics.batches().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_non_json_success_body_is_relayed_and_metered_as_unknown() {
    let upstream = MockServer::start().await;
    Mock::given(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_string("event: ping\ndata: {}\n\n"))
        .mount(&upstream)
        .await;

    let (app, bg_services, backends) = create_test_app(create_test_config(&upstream.uri())).await;

    let response = app
        .post("/v1/messages")
        .add_header("x-api-key", TEST_KEYS[0])
        .json(&request_body())
        .await;

    response.assert_status(StatusCode::OK);
    response.assert_text("event: ping\ndata: {}\n\n");

    bg_services.shutdown().await;
    let entries = backends.logs.entries();
    assert_eq!(entries.len(), 1);
    let record = &entries[0].1.message;
    assert_eq!(record["model"], "unknown");
    assert_eq!(record["total_tokens"], 0);
    assert_eq!(record["cost_usd"].as_f64(), Some(0.0));
}

#[test_log::test(tokio::test)]
async fn test_telemetry_outage_does_not_change_response() {
    let upstream = MockServer::start().await;
    mount_opus(&upstream).await;

    let (app, bg_services) =
        create_test_app_with_backends(create_test_config(&upstream.uri()), Arc::new(FailingLogStore), Arc::new(FailingMetricsSink))
            .await;

    for _ in 0..3 {
        let response = app
            .post("/v1/messages")
            .add_header("x-api-key", TEST_KEYS[2])
            .json(&request_body())
            .await;

        response.assert_status(StatusCode::OK);
        response.assert_json(&opus_response());
    }

    bg_services.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_telemetry_outage_does_not_change_timeout_response() {
    let upstream = MockServer::start().await;
    Mock::given(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)).set_body_json(opus_response()))
        .mount(&upstream)
        .await;

    let mut config = create_test_config(&upstream.uri());
    config.upstream.timeout = Duration::from_millis(200);

    // Same call against healthy backends, then against failing ones
    let (healthy, healthy_bg, _backends) = create_test_app(config.clone()).await;
    let expected = healthy
        .post("/v1/messages")
        .add_header("x-api-key", TEST_KEYS[0])
        .json(&request_body())
        .await;
    healthy_bg.shutdown().await;

    let (app, bg_services) =
        create_test_app_with_backends(config, Arc::new(FailingLogStore), Arc::new(FailingMetricsSink)).await;
    let response = app
        .post("/v1/messages")
        .add_header("x-api-key", TEST_KEYS[0])
        .json(&request_body())
        .await;

    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json();
    let fields = body.as_object().expect("JSON object body");
    assert_eq!(fields.len(), 1);
    assert!(!fields["error"].as_str().expect("error field").is_empty());
    assert_eq!(body, expected.json::<Value>());

    bg_services.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_telemetry_outage_does_not_change_rate_limited_response() {
    let upstream = MockServer::start().await;
    let error_body = json!({
        "type": "error",
        "error": { "type": "rate_limit_error", "message": "Number of requests has exceeded your rate limit" }
    });
    Mock::given(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "30")
                .set_body_json(error_body.clone()),
        )
        .mount(&upstream)
        .await;

    let (app, bg_services) =
        create_test_app_with_backends(create_test_config(&upstream.uri()), Arc::new(FailingLogStore), Arc::new(FailingMetricsSink))
            .await;

    let response = app
        .post("/v1/messages")
        .add_header("x-api-key", TEST_KEYS[1])
        .json(&request_body())
        .await;

    response.assert_status(StatusCode::TOO_MANY_REQUESTS);
    response.assert_json(&error_body);
    assert_eq!(response.header("retry-after"), "30");

    bg_services.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_calls_from_different_developers_use_separate_streams() {
    let upstream = MockServer::start().await;
    mount_opus(&upstream).await;

    let (app, bg_services, backends) = create_test_app(create_test_config(&upstream.uri())).await;

    for key in [TEST_KEYS[0], TEST_KEYS[1], TEST_KEYS[0]] {
        app.post("/v1/messages")
            .add_header("x-api-key", key)
            .json(&request_body())
            .await
            .assert_status(StatusCode::OK);
    }

    bg_services.shutdown().await;

    assert_eq!(backends.logs.entries().len(), 3);
    let streams = backends.logs.streams();
    assert_eq!(streams.len(), 2);
    assert!(streams.iter().any(|s| s.starts_with("dev1/")));
    assert!(streams.iter().any(|s| s.starts_with("dev2/")));
}

#[test_log::test(tokio::test)]
async fn test_custom_pricing_is_applied() {
    let upstream = MockServer::start().await;
    mount_opus(&upstream).await;

    let mut config = create_test_config(&upstream.uri());
    let opus = config.pricing.families.get_mut("claude-3-opus").unwrap();
    opus.input_per_million = Decimal::from(10);
    opus.output_per_million = Decimal::from(20);

    let (app, bg_services, backends) = create_test_app(config).await;

    app.post("/v1/messages")
        .add_header("x-api-key", TEST_KEYS[0])
        .json(&request_body())
        .await
        .assert_status(StatusCode::OK);

    bg_services.shutdown().await;

    // 100 * 10/1e6 + 50 * 20/1e6
    let cost = backends.logs.entries()[0].1.message["cost_usd"].as_f64().unwrap();
    assert!((cost - 0.002).abs() < 1e-12);
}

#[test_log::test(tokio::test)]
async fn test_file_log_store_end_to_end() {
    let upstream = MockServer::start().await;
    mount_opus(&upstream).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = create_test_config(&upstream.uri());
    config.telemetry.log_dir = dir.path().to_path_buf();

    let log_store = Arc::new(FileLogStore::new(&config.telemetry.log_dir, &config.telemetry.log_group));
    let (app, bg_services) =
        create_test_app_with_backends(config, log_store, Arc::new(RecordingMetricsSink::default())).await;

    for _ in 0..2 {
        app.post("/v1/messages")
            .add_header("x-api-key", TEST_KEYS[2])
            .json(&request_body())
            .await
            .assert_status(StatusCode::OK);
    }

    bg_services.shutdown().await;

    let today = chrono::Utc::now().date_naive().format("%Y/%m/%d").to_string();
    let file = dir.path().join("claude-api").join(format!("dev3/{today}.jsonl"));
    let contents = std::fs::read_to_string(&file).unwrap();
    let lines: Vec<Value> = contents.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["message"]["developer"], "dev3");
    assert_eq!(lines[1]["message"]["total_tokens"], 150);
}

#[test_log::test(tokio::test)]
async fn test_metrics_endpoint_only_when_enabled() {
    let upstream = MockServer::start().await;

    let (app, bg_services, _backends) = create_test_app(create_test_config(&upstream.uri())).await;
    app.get("/internal/metrics").await.assert_status(StatusCode::NOT_FOUND);
    bg_services.shutdown().await;

    let mut config = create_test_config(&upstream.uri());
    config.enable_metrics = true;
    let (app, bg_services, _backends) = create_test_app(config).await;
    app.get("/internal/metrics").await.assert_status(StatusCode::OK);
    bg_services.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_default_application_publishes_usage_metrics() {
    let upstream = MockServer::start().await;
    mount_opus(&upstream).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.upstream.base_url = url::Url::parse(&upstream.uri()).unwrap();
    config.telemetry.log_dir = dir.path().to_path_buf();

    let (app, bg_services) = crate::Application::new(config).await.unwrap().into_test_server();

    app.post("/v1/messages")
        .add_header("x-api-key", "sk-not-a-developer-key")
        .json(&request_body())
        .await
        .assert_status(StatusCode::OK);

    bg_services.shutdown().await;

    let rendered = app.get("/internal/metrics").await.text();
    for series in [
        "claude_api_input_tokens_total",
        "claude_api_output_tokens_total",
        "claude_api_cost_usd",
        "claude_api_api_calls_total",
    ] {
        assert!(
            rendered.lines().any(|line| line.starts_with(series) && line.contains(r#"developer="unknown""#)),
            "{series} missing from:\n{rendered}"
        );
    }
}
