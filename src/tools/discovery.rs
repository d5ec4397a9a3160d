use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::ToolServerConfig;
use crate::error::LLMError;
use crate::types::ToolDefinition;

use super::{DynToolHandler, ToolRegistry};

/// 外部工具服务器提供的工具
#[derive(Clone)]
pub struct DiscoveredTool {
    pub definition: ToolDefinition,
    pub handler: DynToolHandler,
}

impl std::fmt::Debug for DiscoveredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveredTool")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// 连接外部工具服务器并列出其工具
#[async_trait]
pub trait ToolServerConnector: Send + Sync {
    async fn discover(&self, server: &ToolServerConfig) -> Result<Vec<DiscoveredTool>, LLMError>;
}

/// 逐个服务器发现并注册工具；失败只记录警告，返回成功注册的数量
pub async fn discover_all(
    connector: &dyn ToolServerConnector,
    servers: &[ToolServerConfig],
    registry: &mut ToolRegistry,
) -> usize {
    let mut registered = 0;
    for server in servers {
        let tools = match connector.discover(server).await {
            Ok(tools) => tools,
            Err(err) => {
                warn!(server = %server.name, endpoint = %server.endpoint, error = %err, "tool server discovery failed");
                continue;
            }
        };
        for tool in tools {
            let name = tool.definition.name.clone();
            match registry.register(tool.definition, tool.handler) {
                Ok(()) => registered += 1,
                Err(err) => {
                    warn!(server = %server.name, tool = %name, error = %err, "skipping invalid discovered tool");
                }
            }
        }
        info!(server = %server.name, total = registry.len(), "tool server discovered");
    }
    registered
}
