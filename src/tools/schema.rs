use std::collections::HashSet;

use serde_json::Value;

use crate::error::LLMError;
use crate::types::ToolDefinition;

const MAX_NAME_LEN: usize = 64;

/// 工具定义校验，在发起任何网络请求前调用
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, tools: &[ToolDefinition]) -> Result<(), LLMError>;
}

/// 默认校验器：名称规则与顶层 schema 形状
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicSchemaValidator;

impl BasicSchemaValidator {
    fn validate_name(name: &str) -> Result<(), LLMError> {
        if name.is_empty() {
            return Err(LLMError::validation("tool name must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(LLMError::validation(format!(
                "tool name `{name}` exceeds {MAX_NAME_LEN} characters"
            )));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(LLMError::validation(format!(
                "tool name `{name}` may only contain letters, digits, `_` and `-`"
            )));
        }
        Ok(())
    }

    fn validate_schema(name: &str, schema: &Value) -> Result<(), LLMError> {
        let Some(object) = schema.as_object() else {
            return Err(LLMError::validation(format!(
                "input schema of tool `{name}` must be a JSON object"
            )));
        };
        if let Some(kind) = object.get("type") {
            if kind.as_str() != Some("object") {
                return Err(LLMError::validation(format!(
                    "input schema of tool `{name}` must have type \"object\", got {kind}"
                )));
            }
        }
        if let Some(properties) = object.get("properties") {
            if !properties.is_object() {
                return Err(LLMError::validation(format!(
                    "`properties` of tool `{name}` must be an object"
                )));
            }
        }
        if let Some(required) = object.get("required") {
            let valid = required
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string));
            if !valid {
                return Err(LLMError::validation(format!(
                    "`required` of tool `{name}` must be an array of strings"
                )));
            }
        }
        Ok(())
    }
}

impl SchemaValidator for BasicSchemaValidator {
    fn validate(&self, tools: &[ToolDefinition]) -> Result<(), LLMError> {
        let mut seen = HashSet::new();
        for tool in tools {
            Self::validate_name(&tool.name)?;
            if !seen.insert(tool.name.as_str()) {
                return Err(LLMError::validation(format!(
                    "duplicate tool name `{}`",
                    tool.name
                )));
            }
            Self::validate_schema(&tool.name, &tool.input_schema)?;
        }
        Ok(())
    }
}
