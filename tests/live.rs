use std::env;

use dotenvy::dotenv;
use futures_util::StreamExt;
use kotoba::config::{DEFAULT_CONFIG_NAME, ProviderConfig};
use kotoba::registry::ModelInfo;
use kotoba::types::{ChatRequest, Message};
use kotoba::LLMClient;

fn load_env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 读取 `LIVE_PROVIDER`、`LIVE_MODEL`、`LIVE_API_KEY` 与可选的 `LIVE_BASE_URL`
async fn build_client_from_env() -> Option<(LLMClient, String)> {
    let provider = load_env_var("LIVE_PROVIDER")?;
    let model = load_env_var("LIVE_MODEL")?;
    let api_key = load_env_var("LIVE_API_KEY")?;
    let mut config = ProviderConfig::api_key(api_key);
    if let Some(base_url) = load_env_var("LIVE_BASE_URL") {
        config = config.with_base_url(base_url);
    }
    let model_id = format!("{provider}:{model}");
    let client = LLMClient::builder()
        .register_model(ModelInfo::new(model_id.clone(), provider.clone()))
        .provider_config(&provider, DEFAULT_CONFIG_NAME, config)
        .build()
        .await
        .expect("client should build from env");
    Some((client, model_id))
}

#[tokio::test]
#[ignore = "requires a live provider endpoint"]
async fn live_chat_and_stream() {
    dotenv().ok();
    init_tracing();
    let Some((client, model)) = build_client_from_env().await else {
        return;
    };

    let request = ChatRequest::new(
        model.clone(),
        vec![
            Message::system("You are a helpful assistant."),
            Message::user("Please introduce Rust language in one sentence."),
        ],
    )
    .with_max_tokens(200);

    let reply = client.chat(request.clone()).await.expect("chat should succeed");
    assert!(!reply.text().trim().is_empty(), "assistant reply should not be empty");

    let mut stream = client.stream(request).await.expect("stream should open");
    let mut text = String::new();
    let mut finished = false;
    while let Some(delta) = stream.next().await {
        let delta = delta.expect("delta should decode");
        text.push_str(&delta.text());
        finished |= delta.finished;
    }
    assert!(finished, "stream should end with a finished delta");
    assert!(!text.trim().is_empty(), "streamed text should not be empty");
}
