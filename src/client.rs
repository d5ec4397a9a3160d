use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::agent::stream::run_streaming;
use crate::agent::{AgentLoop, MultiTurnOptions, MultiTurnResult};
use crate::cancel::CallScope;
use crate::config::{ClientConfig, DEFAULT_CONFIG_NAME, ProviderConfig, ProviderConfigs};
use crate::dispatch::Dispatcher;
use crate::error::{CancelReason, CancellationPhase, LLMError};
use crate::http::reqwest::default_dyn_transport;
use crate::http::{
    DynHttpTransport, HttpInterceptor, InterceptedTransport, RateLimitedTransport,
    RetryingTransport,
};
use crate::provider::{DynProviderPlugin, ProviderSession};
use crate::registry::{
    ModelFilter, ModelInfo, PluginRef, ProviderRegistry, ModelRegistry, resolve_plugin_ref,
    split_model_id,
};
use crate::stream::DeltaStream;
use crate::tools::{
    BasicSchemaValidator, DynToolHandler, SchemaValidator, ToolRegistry, ToolRouter,
    ToolServerConnector, discover_all,
};
use crate::types::{CapabilityDescriptor, ChatRequest, Message, ToolCall, ToolDefinition};

/// 初始化缓存键 `providerId:version:configName`
fn session_key(plugin: PluginRef, config_name: &str) -> String {
    format!("{}:{}:{}", plugin.id, plugin.version, config_name)
}

/// LLM 调用入口 负责解析模型、缓存供应商会话并编排工具执行
pub struct LLMClient {
    models: ModelRegistry,
    providers: ProviderRegistry,
    configs: ProviderConfigs,
    transport: DynHttpTransport,
    router: ToolRouter,
    validator: Arc<dyn SchemaValidator>,
    tools_enabled: bool,
    default_timeout: Duration,
    sessions: Mutex<HashMap<String, ProviderSession>>,
}

impl std::fmt::Debug for LLMClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LLMClient")
            .field("models", &self.models.len())
            .field("providers", &self.providers)
            .field("tools", self.router.registry())
            .field("tools_enabled", &self.tools_enabled)
            .finish_non_exhaustive()
    }
}

impl LLMClient {
    /// 创建 Builder
    pub fn builder() -> LLMClientBuilder {
        LLMClientBuilder::new()
    }

    /// 发送聊天请求并返回助手消息
    ///
    /// 带 `multi_turn` 且启用工具时进入多轮循环；否则单轮回复中的工具调用只执行一次，
    /// 返回的仍是原始消息。
    pub async fn chat(&self, request: ChatRequest) -> Result<Message, LLMError> {
        self.validate_tools(&request)?;
        if let Some(options) = request.multi_turn.clone().filter(|_| self.tools_enabled) {
            return self
                .run_multi_turn(&request, options)
                .await
                .map(|result| result.message);
        }

        let dispatcher = self.resolve(&request).await?;
        let scope = self.scope(&request, &dispatcher);
        let response = dispatcher
            .invoke(&request, scope.token())
            .await
            .map_err(|err| scope.classify(err))?;
        let signal = dispatcher.termination(&response);
        debug!(
            provider = dispatcher.provider(),
            model = %dispatcher.model_id,
            reason = ?signal.reason,
            confidence = ?signal.confidence,
            "chat completed"
        );

        let calls: Vec<ToolCall> = response.tool_calls().cloned().collect();
        if !calls.is_empty() && self.tools_enabled {
            let results = self
                .router
                .execute_batch(&calls, 1, None, scope.token())
                .await
                .map_err(|err| scope.classify(err))?;
            debug!(
                provider = dispatcher.provider(),
                executed = results.len(),
                "single-turn tool calls executed"
            );
        }
        Ok(response.into_message())
    }

    /// 发起流式请求
    ///
    /// 带 `multi_turn` 且启用工具时，工具调用会在流中暂停执行后继续输出。
    pub async fn stream(&self, request: ChatRequest) -> Result<DeltaStream, LLMError> {
        self.validate_tools(&request)?;
        let dispatcher = self.resolve(&request).await?;
        if !dispatcher.capabilities.supports_stream {
            return Err(LLMError::validation(format!(
                "model {} does not support streaming",
                dispatcher.model_id
            )));
        }
        let scope = self.scope(&request, &dispatcher);

        if let Some(options) = request.multi_turn.clone().filter(|_| self.tools_enabled) {
            options.validate()?;
            let agent = AgentLoop::new(dispatcher, self.router.clone(), options);
            return Ok(run_streaming(agent, request, scope));
        }

        let inner = dispatcher
            .open_stream(&request, scope.token())
            .await
            .map_err(|err| scope.classify(err))?;
        Ok(scope.guard_stream(inner))
    }

    /// 多轮执行并返回完整结果；未设置 `multi_turn` 时使用默认选项
    pub async fn execute_multi_turn(&self, request: ChatRequest) -> Result<MultiTurnResult, LLMError> {
        if !self.tools_enabled {
            return Err(LLMError::validation(
                "multi-turn execution requires tool support to be enabled",
            ));
        }
        self.validate_tools(&request)?;
        let options = request.multi_turn.clone().unwrap_or_default();
        self.run_multi_turn(&request, options).await
    }

    async fn run_multi_turn(
        &self,
        request: &ChatRequest,
        options: MultiTurnOptions,
    ) -> Result<MultiTurnResult, LLMError> {
        options.validate()?;
        let dispatcher = self.resolve(request).await?;
        let scope = self.scope(request, &dispatcher);
        AgentLoop::new(dispatcher, self.router.clone(), options)
            .run(request, &scope)
            .await
    }

    /// 注册工具并启用工具支持
    pub fn register_tool(
        &mut self,
        definition: ToolDefinition,
        handler: DynToolHandler,
    ) -> Result<(), LLMError> {
        self.router.registry_mut().register(definition, handler)?;
        self.tools_enabled = true;
        Ok(())
    }

    pub fn tools_enabled(&self) -> bool {
        self.tools_enabled
    }

    /// 已注册工具的定义
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.router.registry().definitions()
    }

    pub fn models(&self, filter: Option<&ModelFilter>) -> Vec<&ModelInfo> {
        self.models.list(filter)
    }

    /// 模型能力；模型未声明时使用插件能力
    pub fn capabilities(&self, model: &str) -> Result<CapabilityDescriptor, LLMError> {
        let (info, plugin) = self.lookup(model)?;
        Ok(info
            .capabilities
            .clone()
            .unwrap_or_else(|| plugin.capabilities()))
    }

    /// 已初始化的会话数量
    pub async fn initialized_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn validate_tools(&self, request: &ChatRequest) -> Result<(), LLMError> {
        if request.tools.is_empty() {
            return Ok(());
        }
        if !self.tools_enabled {
            return Err(LLMError::validation(
                "request carries tool definitions but tool support is not enabled",
            ));
        }
        self.validator.validate(&request.tools)
    }

    fn lookup(&self, model: &str) -> Result<(&ModelInfo, DynProviderPlugin), LLMError> {
        if split_model_id(model).is_none() {
            return Err(LLMError::validation(format!(
                "model `{model}` must be provider-qualified as `provider:model`"
            )));
        }
        let info = self
            .models
            .get(model)
            .ok_or_else(|| LLMError::validation(format!("model `{model}` is not registered")))?;
        let plugin_ref = resolve_plugin_ref(&info.provider).ok_or_else(|| {
            LLMError::config(
                format!("models.{model}.provider"),
                format!("unknown provider plugin `{}`", info.provider),
            )
        })?;
        let plugin = self.providers.get(plugin_ref.id).ok_or_else(|| {
            LLMError::config(
                "providers",
                format!("provider plugin `{}` is not registered", plugin_ref.id),
            )
        })?;
        Ok((info, plugin))
    }

    fn provider_config(
        &self,
        plugin_id: &str,
        model: &str,
        name: &str,
    ) -> Result<&ProviderConfig, LLMError> {
        let prefix = split_model_id(model).map(|(prefix, _)| prefix);
        self.configs
            .get(plugin_id, Some(name))
            .or_else(|| prefix.and_then(|prefix| self.configs.get(prefix, Some(name))))
            .ok_or_else(|| {
                LLMError::config(
                    format!("providers.{plugin_id}.{name}"),
                    "provider configuration not found",
                )
            })
    }

    /// 解析模型、插件与会话；会话按 `providerId:version:configName` 缓存
    async fn resolve(&self, request: &ChatRequest) -> Result<Dispatcher, LLMError> {
        if request
            .cancellation
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
        {
            return Err(LLMError::cancelled(
                CancellationPhase::Initialization,
                CancelReason::Caller,
            ));
        }
        let (info, plugin) = self.lookup(&request.model)?;
        let plugin_ref = PluginRef {
            id: plugin.id(),
            version: plugin.version(),
        };
        let config_name = request
            .provider_config
            .as_deref()
            .unwrap_or(DEFAULT_CONFIG_NAME);
        let key = session_key(plugin_ref, config_name);

        let session = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&key) {
                Some(session) => {
                    debug!(key = %key, "provider session cache hit");
                    session.clone()
                }
                None => {
                    let config = self.provider_config(plugin_ref.id, &request.model, config_name)?;
                    let session = plugin.initialize(config)?;
                    info!(provider = plugin_ref.id, config = config_name, "provider initialized");
                    sessions.insert(key, session.clone());
                    session
                }
            }
        };

        Ok(Dispatcher {
            capabilities: info
                .capabilities
                .clone()
                .unwrap_or_else(|| plugin.capabilities()),
            model: info.model_name().to_string(),
            model_id: info.id.clone(),
            plugin,
            session,
            transport: self.transport.clone(),
        })
    }

    fn scope(&self, request: &ChatRequest, dispatcher: &Dispatcher) -> CallScope {
        let timeout = dispatcher.session.timeout.unwrap_or(self.default_timeout);
        CallScope::new(request.cancellation.as_ref(), Some(timeout))
    }
}

/// 负责组装 LLMClient 的 Builder
pub struct LLMClientBuilder {
    config: ClientConfig,
    configs: ProviderConfigs,
    models: ModelRegistry,
    providers: ProviderRegistry,
    transport: Option<DynHttpTransport>,
    interceptors: Vec<Arc<dyn HttpInterceptor>>,
    tools: ToolRegistry,
    connector: Option<Arc<dyn ToolServerConnector>>,
    validator: Option<Arc<dyn SchemaValidator>>,
    enable_tools: bool,
}

impl Default for LLMClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LLMClientBuilder {
    pub fn new() -> Self {
        Self::from_config(ClientConfig::default())
    }

    /// 从配置创建；配置中的模型会被注册
    pub fn from_config(config: ClientConfig) -> Self {
        let mut models = ModelRegistry::new();
        for model in &config.models {
            models.register(model.clone());
        }
        Self {
            configs: config.provider_configs(),
            enable_tools: config.tools.enabled,
            config,
            models,
            providers: ProviderRegistry::builtin(),
            transport: None,
            interceptors: Vec::new(),
            tools: ToolRegistry::new(),
            connector: None,
            validator: None,
        }
    }

    /// 添加一个命名配置
    pub fn provider_config(mut self, provider: &str, name: &str, config: ProviderConfig) -> Self {
        self.configs.insert(provider, name, config);
        self
    }

    pub fn register_model(mut self, info: ModelInfo) -> Self {
        self.models.register(info);
        self
    }

    /// 注册或替换供应商插件
    pub fn register_plugin(mut self, plugin: DynProviderPlugin) -> Self {
        self.providers.register(plugin);
        self
    }

    /// 替换底层 Transport，默认使用 reqwest
    pub fn transport(mut self, transport: DynHttpTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn HttpInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn register_tool(
        mut self,
        definition: ToolDefinition,
        handler: DynToolHandler,
    ) -> Result<Self, LLMError> {
        self.tools.register(definition, handler)?;
        self.enable_tools = true;
        Ok(self)
    }

    pub fn tool_connector(mut self, connector: Arc<dyn ToolServerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn schema_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn enable_tools(mut self) -> Self {
        self.enable_tools = true;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 组装 Transport 装饰器并发现外部工具
    ///
    /// 装饰顺序由外到内：限流 -> 重试 -> 拦截器 -> 基础 Transport。
    pub async fn build(self) -> Result<LLMClient, LLMError> {
        self.config.validate()?;
        let mut transport = match self.transport {
            Some(transport) => transport,
            None => default_dyn_transport()?,
        };
        if !self.interceptors.is_empty() {
            transport = Arc::new(InterceptedTransport::new(transport, self.interceptors));
        }
        if let Some(retry) = &self.config.retry {
            transport = Arc::new(RetryingTransport::new(transport, retry.to_policy()));
        }
        if let Some(rate_limit) = self.config.rate_limit.as_ref().filter(|r| r.enabled) {
            transport = Arc::new(RateLimitedTransport::new(
                transport,
                rate_limit.max_requests_per_second,
                rate_limit.scope,
            ));
        }

        let mut tools = self.tools;
        if let Some(connector) = &self.connector {
            if !self.config.tools.servers.is_empty() {
                discover_all(connector.as_ref(), &self.config.tools.servers, &mut tools).await;
            }
        }
        let tools_enabled = self.enable_tools || !tools.is_empty();

        Ok(LLMClient {
            models: self.models,
            providers: self.providers,
            configs: self.configs,
            transport,
            router: ToolRouter::new(
                tools,
                Duration::from_millis(self.config.tools.default_timeout_ms),
            ),
            validator: self
                .validator
                .unwrap_or_else(|| Arc::new(BasicSchemaValidator)),
            tools_enabled,
            default_timeout: self.config.default_timeout(),
            sessions: Mutex::new(HashMap::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn session_key_includes_config_name() {
        let plugin = PluginRef {
            id: "anthropic",
            version: "2023-06-01",
        };
        assert_eq!(session_key(plugin, "default"), "anthropic:2023-06-01:default");
        assert_ne!(session_key(plugin, "team-a"), session_key(plugin, "team-b"));
    }

    #[tokio::test]
    async fn rejects_unqualified_and_unknown_models() {
        let client = LLMClient::builder()
            .register_model(ModelInfo::new("openai:gpt-4o", "openai"))
            .register_model(ModelInfo::new("mystery:model", "cohere"))
            .provider_config("openai", DEFAULT_CONFIG_NAME, ProviderConfig::api_key("sk-test"))
            .build()
            .await
            .expect("client");

        match client
            .chat(ChatRequest::new("gpt-4", vec![Message::user("hi")]))
            .await
        {
            Err(LLMError::Validation { message }) => assert!(message.contains("provider-qualified")),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(matches!(
            client
                .chat(ChatRequest::new("openai:gpt-5", vec![Message::user("hi")]))
                .await,
            Err(LLMError::Validation { .. })
        ));
        assert!(matches!(
            client
                .chat(ChatRequest::new("mystery:model", vec![Message::user("hi")]))
                .await,
            Err(LLMError::InvalidConfig { .. })
        ));
        assert!(matches!(
            client
                .chat(
                    ChatRequest::new("openai:gpt-4o", vec![Message::user("hi")])
                        .with_provider_config("missing")
                )
                .await,
            Err(LLMError::InvalidConfig { .. })
        ));
        assert_eq!(client.initialized_sessions().await, 0);
    }

    #[tokio::test]
    async fn tools_require_enablement() {
        let client = LLMClient::builder()
            .register_model(ModelInfo::new("openai:gpt-4o", "openai"))
            .build()
            .await
            .expect("client");
        let request = ChatRequest::new("openai:gpt-4o", vec![Message::user("hi")]).with_tools(vec![
            ToolDefinition::new("lookup", "", serde_json::json!({"type": "object"})),
        ]);
        assert!(!client.tools_enabled());
        assert!(matches!(
            client.chat(request).await,
            Err(LLMError::Validation { .. })
        ));
    }
}
