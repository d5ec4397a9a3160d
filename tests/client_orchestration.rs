mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kotoba::config::ProviderConfig;
use kotoba::error::{CancelReason, CancellationPhase, ErrorKind, LLMError};
use kotoba::http::StaticHeaders;
use kotoba::types::{ChatRequest, Message};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{
    CountingPlugin, ECHO_TOOL, MODEL, Reply, ScriptedTransport, builder, echo_definition,
    echo_handler, openai_text, openai_tool_calls,
};

fn ask(text: &str) -> ChatRequest {
    ChatRequest::new(MODEL, vec![Message::user(text)])
}

#[tokio::test]
async fn initializes_once_per_provider_version_and_config() {
    let transport = ScriptedTransport::new(vec![
        Reply::Json(200, openai_text("r1", "one")),
        Reply::Json(200, openai_text("r2", "two")),
        Reply::Json(200, openai_text("r3", "three")),
        Reply::Json(200, openai_text("r4", "four")),
    ]);
    let plugin = Arc::new(CountingPlugin::default());
    let client = builder(&transport)
        .register_plugin(plugin.clone())
        .provider_config(
            "openai",
            "team-b",
            ProviderConfig::api_key("sk-team-b").with_base_url("http://mock.local"),
        )
        .build()
        .await
        .expect("client");

    for text in ["a", "b", "c"] {
        client.chat(ask(text)).await.expect("chat");
    }
    assert_eq!(plugin.initializations(), 1);

    let reply = client
        .chat(ask("d").with_provider_config("team-b"))
        .await
        .expect("chat with named config");
    assert_eq!(reply.text(), "four");
    assert_eq!(plugin.initializations(), 2);
    assert_eq!(client.initialized_sessions().await, 2);

    let requests = transport.requests();
    assert_eq!(
        requests[0].headers.get("Authorization").map(String::as_str),
        Some("Bearer sk-test")
    );
    assert_eq!(
        requests[3].headers.get("Authorization").map(String::as_str),
        Some("Bearer sk-team-b")
    );
    assert_eq!(transport.body(0)["model"], json!("gpt-4o"));
}

#[tokio::test]
async fn unqualified_model_fails_before_any_network_call() {
    let transport = ScriptedTransport::new(vec![Reply::Json(200, openai_text("r1", "unused"))]);
    let client = builder(&transport).build().await.expect("client");

    let err = client
        .chat(ChatRequest::new("gpt-4o", vec![Message::user("hi")]))
        .await
        .expect_err("unqualified model");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(transport.request_count(), 0);
    assert_eq!(client.initialized_sessions().await, 0);
}

#[tokio::test]
async fn caller_cancellation_surfaces_with_phase() {
    let transport = ScriptedTransport::new(vec![Reply::Hang]);
    let client = builder(&transport).build().await.expect("client");
    let token = CancellationToken::new();

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = client
        .chat(ask("slow").with_cancellation(token))
        .await
        .expect_err("cancelled");
    match &err {
        LLMError::Cancelled { phase, reason, .. } => {
            assert_eq!(*phase, CancellationPhase::Execution);
            assert_eq!(*reason, CancelReason::Caller);
        }
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(!err.is_timeout());
}

#[tokio::test]
async fn already_cancelled_token_stops_during_initialization() {
    let transport = ScriptedTransport::new(Vec::new());
    let client = builder(&transport).build().await.expect("client");
    let token = CancellationToken::new();
    token.cancel();

    let err = client
        .chat(ask("never").with_cancellation(token))
        .await
        .expect_err("cancelled");
    assert_eq!(
        err.cancellation_phase(),
        Some(CancellationPhase::Initialization)
    );
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test]
async fn client_timer_reports_timeout() {
    let transport = ScriptedTransport::new(vec![Reply::Hang]);
    let client = builder(&transport)
        .default_timeout(Duration::from_millis(30))
        .build()
        .await
        .expect("client");

    let err = client.chat(ask("slow")).await.expect_err("timed out");
    assert!(err.is_timeout(), "unexpected error: {err:?}");
    assert!(matches!(
        err,
        LLMError::Cancelled {
            reason: CancelReason::Timeout(_),
            ..
        }
    ));
}

#[tokio::test]
async fn single_turn_runs_tools_and_returns_original_message() {
    let transport = ScriptedTransport::new(vec![Reply::Json(
        200,
        openai_tool_calls(
            "r1",
            &[("call_1", ECHO_TOOL, json!({"message": "hello"}))],
        ),
    )]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let client = builder(&transport)
        .register_tool(echo_definition(), echo_handler(seen.clone()))
        .expect("register tool")
        .build()
        .await
        .expect("client");

    let message = client
        .chat(ask("echo hello").with_tools(vec![echo_definition()]))
        .await
        .expect("chat");

    let calls: Vec<_> = message.tool_calls().collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "call_1");
    assert_eq!(seen.lock().expect("seen").as_slice(), ["hello"]);
    assert_eq!(transport.request_count(), 1);
    assert_eq!(transport.body(0)["tools"][0]["function"]["name"], json!(ECHO_TOOL));
}

#[tokio::test]
async fn invalid_tool_definitions_fail_fast() {
    let transport = ScriptedTransport::new(Vec::new());
    let client = builder(&transport)
        .enable_tools()
        .build()
        .await
        .expect("client");
    let mut broken = echo_definition();
    broken.name = "has spaces".to_string();

    let err = client
        .chat(ask("hi").with_tools(vec![broken]))
        .await
        .expect_err("invalid tool");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test]
async fn vendor_status_codes_are_normalized() {
    let transport = ScriptedTransport::new(vec![
        Reply::Json(
            429,
            json!({"error": {"message": "slow down", "type": "rate_limit_exceeded"}}),
        ),
        Reply::Json(
            401,
            json!({"error": {"message": "bad key", "type": "invalid_request_error"}}),
        ),
    ]);
    let client = builder(&transport).build().await.expect("client");

    let err = client.chat(ask("one")).await.expect_err("rate limited");
    assert_eq!(err.kind(), ErrorKind::RateLimit);
    assert!(err.is_retryable());

    let err = client.chat(ask("two")).await.expect_err("auth");
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn interceptors_see_every_request() {
    let transport = ScriptedTransport::new(vec![Reply::Json(200, openai_text("r1", "ok"))]);
    let client = builder(&transport)
        .interceptor(Arc::new(StaticHeaders::default().with("x-team", "qa")))
        .build()
        .await
        .expect("client");

    client.chat(ask("hi")).await.expect("chat");
    let requests = transport.requests();
    assert_eq!(requests[0].headers.get("x-team").map(String::as_str), Some("qa"));
}
