use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::provider::{
    AnthropicPlugin, DynProviderPlugin, GeminiPlugin, OpenAiPlugin, ProviderPlugin, XaiPlugin,
};
use crate::types::CapabilityDescriptor;

/// 规范化后的插件标识与协议版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PluginRef {
    pub id: &'static str,
    pub version: &'static str,
}

const OPENAI: PluginRef = PluginRef {
    id: "openai",
    version: "v1",
};
const ANTHROPIC: PluginRef = PluginRef {
    id: "anthropic",
    version: "2023-06-01",
};
const GEMINI: PluginRef = PluginRef {
    id: "gemini",
    version: "v1beta",
};
const XAI: PluginRef = PluginRef {
    id: "xai",
    version: "v1",
};

/// 模型声明的插件字符串 -> 规范插件（固定表）
pub fn resolve_plugin_ref(declared: &str) -> Option<PluginRef> {
    match declared.trim().to_ascii_lowercase().as_str() {
        "openai" | "openai-chat" | "openai_chat" => Some(OPENAI),
        "anthropic" | "anthropic-messages" | "claude" => Some(ANTHROPIC),
        "gemini" | "google" | "google-gemini" => Some(GEMINI),
        "xai" | "grok" => Some(XAI),
        _ => None,
    }
}

/// 拆分 `provider:model`；缺少前缀时返回 None
pub fn split_model_id(model: &str) -> Option<(&str, &str)> {
    let (provider, name) = model.split_once(':')?;
    if provider.trim().is_empty() || name.trim().is_empty() {
        return None;
    }
    Some((provider, name))
}

/// 已注册模型的描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// 带前缀的完整 id，例如 `openai:gpt-4o`
    pub id: String,
    /// 声明的插件字符串，例如 `openai-chat`
    pub provider: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub context_window: Option<u32>,
    /// 缺省时使用插件能力
    #[serde(default)]
    pub capabilities: Option<CapabilityDescriptor>,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            display_name: None,
            context_window: None,
            capabilities: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityDescriptor) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = Some(tokens);
        self
    }

    /// `provider:model` 中的模型部分
    pub fn model_name(&self) -> &str {
        split_model_id(&self.id)
            .map(|(_, name)| name)
            .unwrap_or(&self.id)
    }
}

/// `list` 的过滤条件
#[derive(Debug, Clone, Default)]
pub struct ModelFilter {
    pub provider: Option<String>,
    pub supports_tools: Option<bool>,
    pub supports_stream: Option<bool>,
    pub supports_image_input: Option<bool>,
}

impl ModelFilter {
    pub fn provider(provider: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.into()),
            ..Self::default()
        }
    }

    pub fn with_tools(mut self) -> Self {
        self.supports_tools = Some(true);
        self
    }

    fn matches(&self, info: &ModelInfo) -> bool {
        if let Some(provider) = &self.provider {
            let wanted = resolve_plugin_ref(provider).map(|r| r.id);
            let actual = resolve_plugin_ref(&info.provider).map(|r| r.id);
            let same = match (wanted, actual) {
                (Some(wanted), Some(actual)) => wanted == actual,
                _ => provider.eq_ignore_ascii_case(&info.provider),
            };
            if !same {
                return false;
            }
        }
        let caps = info.capabilities.clone().unwrap_or_default();
        self.supports_tools.is_none_or(|v| caps.supports_tools == v)
            && self.supports_stream.is_none_or(|v| caps.supports_stream == v)
            && self
                .supports_image_input
                .is_none_or(|v| caps.supports_image_input == v)
    }
}

/// 模型注册表，构建后只读
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelInfo>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&ModelInfo> {
        self.models.get(id)
    }

    /// 注册或覆盖模型
    pub fn register(&mut self, info: ModelInfo) {
        self.models.insert(info.id.clone(), info);
    }

    /// 按 id 排序返回
    pub fn list(&self, filter: Option<&ModelFilter>) -> Vec<&ModelInfo> {
        let mut models: Vec<&ModelInfo> = self
            .models
            .values()
            .filter(|info| filter.is_none_or(|f| f.matches(info)))
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// 插件 id -> 插件实例
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    plugins: HashMap<&'static str, DynProviderPlugin>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("plugins", &self.ids())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置的四个供应商插件
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(OpenAiPlugin::new()));
        registry.register(Arc::new(AnthropicPlugin::new()));
        registry.register(Arc::new(GeminiPlugin::new()));
        registry.register(Arc::new(XaiPlugin::new()));
        registry
    }

    /// 同 id 的插件会被替换
    pub fn register(&mut self, plugin: DynProviderPlugin) {
        self.plugins.insert(plugin.id(), plugin);
    }

    pub fn get(&self, id: &str) -> Option<DynProviderPlugin> {
        self.plugins.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<&'static str> = self.plugins.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn capabilities(&self, id: &str) -> Option<CapabilityDescriptor> {
        self.plugins.get(id).map(|plugin| plugin.capabilities())
    }
}

/// 便于测试注入的插件辅助函数
pub fn plugin_ref_of(plugin: &dyn ProviderPlugin) -> PluginRef {
    PluginRef {
        id: plugin.id(),
        version: plugin.version(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_plugin_table() {
        assert_eq!(resolve_plugin_ref("openai-chat"), Some(OPENAI));
        assert_eq!(resolve_plugin_ref("Claude"), Some(ANTHROPIC));
        assert_eq!(resolve_plugin_ref("google"), Some(GEMINI));
        assert_eq!(resolve_plugin_ref("grok").map(|r| r.version), Some("v1"));
        assert_eq!(resolve_plugin_ref("cohere"), None);
    }

    #[test]
    fn split_requires_prefix() {
        assert_eq!(split_model_id("openai:gpt-4o"), Some(("openai", "gpt-4o")));
        assert_eq!(split_model_id("gpt-4"), None);
        assert_eq!(split_model_id(":gpt-4"), None);
        assert_eq!(split_model_id("openai:"), None);
    }

    #[test]
    fn model_registry_lists_with_filter() {
        let mut registry = ModelRegistry::new();
        registry.register(ModelInfo::new("openai:gpt-4o", "openai-chat"));
        registry.register(ModelInfo::new("anthropic:claude-3-5-sonnet", "anthropic"));
        registry.register(
            ModelInfo::new("openai:o1-mini", "openai").with_capabilities(CapabilityDescriptor {
                supports_tools: false,
                ..CapabilityDescriptor::default()
            }),
        );

        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.get("openai:gpt-4o").map(ModelInfo::model_name),
            Some("gpt-4o")
        );
        let openai: Vec<&str> = registry
            .list(Some(&ModelFilter::provider("openai")))
            .into_iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(openai, vec!["openai:gpt-4o", "openai:o1-mini"]);
        let with_tools = registry.list(Some(&ModelFilter::provider("openai").with_tools()));
        assert_eq!(with_tools.len(), 1);
        assert_eq!(registry.list(None).len(), 3);
    }

    #[test]
    fn builtin_registry_has_four_plugins() {
        let registry = ProviderRegistry::builtin();
        assert_eq!(registry.ids(), vec!["anthropic", "gemini", "openai", "xai"]);
        let plugin = registry.get("anthropic").expect("plugin");
        assert_eq!(plugin_ref_of(plugin.as_ref()), ANTHROPIC);
        assert_eq!(
            registry.capabilities("xai").map(|c| c.supports_document_input),
            Some(false)
        );
    }
}
