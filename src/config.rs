use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LLMError;
use crate::http::{MAX_REQUEST_INTERVAL, RateLimitScope, RetryPolicy};
use crate::registry::ModelInfo;

/// 未指定配置名时使用的哨兵名
pub const DEFAULT_CONFIG_NAME: &str = "default";

/// 客户端整体配置 可从任意 serde 格式反序列化
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// provider -> 配置名 -> ProviderConfig；单层写法会迁移到 `default`
    #[serde(default)]
    pub providers: HashMap<String, ProviderSection>,
    /// 单次调用的默认超时
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// 额外注册的模型
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

fn default_timeout_ms() -> u64 {
    120_000
}

fn default_tool_timeout_ms() -> u64 {
    30_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            default_timeout_ms: default_timeout_ms(),
            tools: ToolsConfig::default(),
            rate_limit: None,
            retry: None,
            models: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// 展开为 (provider, 配置名) 键控的扁平表
    pub fn provider_configs(&self) -> ProviderConfigs {
        let mut configs = ProviderConfigs::default();
        for (provider, section) in &self.providers {
            match section {
                ProviderSection::Flat(config) => {
                    configs.insert(provider, DEFAULT_CONFIG_NAME, config.clone());
                }
                ProviderSection::Named(named) => {
                    for (name, config) in named {
                        configs.insert(provider, name, config.clone());
                    }
                }
            }
        }
        configs
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// 校验数值字段
    pub fn validate(&self) -> Result<(), LLMError> {
        if self.default_timeout_ms == 0 {
            return Err(LLMError::config("default_timeout_ms", "must be greater than zero"));
        }
        if self.tools.default_timeout_ms == 0 {
            return Err(LLMError::config(
                "tools.default_timeout_ms",
                "must be greater than zero",
            ));
        }
        if let Some(rate_limit) = &self.rate_limit {
            let rate = rate_limit.max_requests_per_second;
            let representable = rate > 0.0 && rate.recip() <= MAX_REQUEST_INTERVAL.as_secs_f64();
            if rate_limit.enabled && !representable {
                return Err(LLMError::config(
                    "rate_limit.max_requests_per_second",
                    "must be positive and allow at least one request per year when rate limiting is enabled",
                ));
            }
        }
        if let Some(retry) = &self.retry {
            if retry.max_attempts == 0 {
                return Err(LLMError::config("retry.max_attempts", "must be at least 1"));
            }
            if retry.multiplier < 1.0 {
                return Err(LLMError::config("retry.multiplier", "must be at least 1.0"));
            }
        }
        for server in &self.tools.servers {
            if server.name.trim().is_empty() {
                return Err(LLMError::config("tools.servers.name", "must not be empty"));
            }
        }
        Ok(())
    }
}

/// provider 配置段：单个配置或按名称分组的多个配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProviderSection {
    Flat(ProviderConfig),
    Named(HashMap<String, ProviderConfig>),
}

/// 单个 provider 的连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub credential: Credential,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// 附加请求头
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// 供应商附加设置 例如 organization / version / beta
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

impl ProviderConfig {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            base_url: None,
            timeout_ms: None,
            headers: HashMap::new(),
            extra: HashMap::new(),
        }
    }

    /// 便捷构造 API Key 配置
    pub fn api_key(key: impl Into<String>) -> Self {
        Self::new(Credential::ApiKey {
            header: None,
            key: key.into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

/// 鉴权信息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// 简单 API Key
    ApiKey {
        /// header 名称 留空时按 provider 默认
        #[serde(default)]
        header: Option<String>,
        key: String,
    },
    /// Bearer Token
    Bearer { token: String },
    /// 无需鉴权的本地 provider
    None,
}

impl Credential {
    /// 取出密钥；空字符串视为缺失
    pub fn secret(&self) -> Option<&str> {
        match self {
            Credential::ApiKey { key, .. } => Some(key.as_str()),
            Credential::Bearer { token } => Some(token.as_str()),
            Credential::None => None,
        }
        .filter(|secret| !secret.trim().is_empty())
    }
}

/// 命名配置的键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigKey {
    pub provider: String,
    pub name: String,
}

impl ConfigKey {
    pub fn new(provider: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            name: name.into(),
        }
    }
}

/// (provider, 配置名) -> ProviderConfig
#[derive(Debug, Clone, Default)]
pub struct ProviderConfigs {
    entries: HashMap<ConfigKey, ProviderConfig>,
}

impl ProviderConfigs {
    pub fn insert(&mut self, provider: &str, name: &str, config: ProviderConfig) {
        self.entries.insert(ConfigKey::new(provider, name), config);
    }

    /// 按名称查找，`None` 表示默认配置
    pub fn get(&self, provider: &str, name: Option<&str>) -> Option<&ProviderConfig> {
        let key = ConfigKey::new(provider, name.unwrap_or(DEFAULT_CONFIG_NAME));
        self.entries.get(&key)
    }

    /// 某个 provider 下的全部配置名
    pub fn names(&self, provider: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .entries
            .keys()
            .filter(|key| key.provider == provider)
            .map(|key| key.name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 工具相关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// 单次工具调用默认超时
    #[serde(default = "default_tool_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub servers: Vec<ToolServerConfig>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_timeout_ms: default_tool_timeout_ms(),
            servers: Vec::new(),
        }
    }
}

/// 工具服务器连接信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

/// 限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub max_requests_per_second: f64,
    #[serde(default)]
    pub scope: RateLimitScope,
}

fn enabled_by_default() -> bool {
    true
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// 单层配置迁移到 default，多层配置按名称展开
    #[test]
    fn flattens_flat_and_named_sections() {
        let config: ClientConfig = serde_json::from_value(json!({
            "providers": {
                "openai": {
                    "credential": {"type": "api_key", "key": "sk-flat"},
                    "extra": {"organization": "org-1"}
                },
                "anthropic": {
                    "default": {"credential": {"type": "api_key", "key": "a-default"}},
                    "team-b": {
                        "credential": {"type": "bearer", "token": "a-team"},
                        "base_url": "https://proxy.local",
                        "timeout_ms": 5000
                    }
                }
            }
        }))
        .expect("deserialize");

        assert_eq!(config.default_timeout_ms, 120_000);
        assert_eq!(config.tools.default_timeout_ms, 30_000);
        assert!(!config.tools.enabled);

        let configs = config.provider_configs();
        let openai = configs.get("openai", None).expect("openai default");
        assert_eq!(openai.credential.secret(), Some("sk-flat"));
        assert_eq!(openai.extra_str("organization"), Some("org-1"));

        assert_eq!(configs.names("anthropic"), vec!["default", "team-b"]);
        let team = configs.get("anthropic", Some("team-b")).expect("team-b");
        assert_eq!(team.base_url.as_deref(), Some("https://proxy.local"));
        assert_eq!(team.timeout(), Some(Duration::from_millis(5000)));
        assert!(configs.get("anthropic", Some("missing")).is_none());
    }

    #[test]
    fn validate_rejects_bad_numbers() {
        let config = ClientConfig {
            default_timeout_ms: 0,
            ..ClientConfig::default()
        };
        match config.validate() {
            Err(LLMError::InvalidConfig { field, .. }) => assert_eq!(field, "default_timeout_ms"),
            other => panic!("unexpected result: {other:?}"),
        }

        let config: ClientConfig = serde_json::from_value(json!({
            "rate_limit": {"max_requests_per_second": 0.0},
            "retry": {"max_attempts": 2}
        }))
        .expect("deserialize");
        assert!(matches!(
            config.validate(),
            Err(LLMError::InvalidConfig { .. })
        ));
        for rate in [1e-20, f64::NAN] {
            let config = ClientConfig {
                rate_limit: Some(RateLimitConfig {
                    enabled: true,
                    max_requests_per_second: rate,
                    scope: RateLimitScope::Provider,
                }),
                ..ClientConfig::default()
            };
            assert!(matches!(
                config.validate(),
                Err(LLMError::InvalidConfig { .. })
            ));
        }

        let retry = config.retry.expect("retry").to_policy();
        assert_eq!(retry.max_attempts, 2);
        assert_eq!(retry.initial_backoff, Duration::from_millis(500));
    }

    #[test]
    fn empty_secret_counts_as_missing() {
        assert_eq!(ProviderConfig::api_key("  ").credential.secret(), None);
        assert_eq!(Credential::None.secret(), None);
    }
}
