//! MCP bridge for one media server.
//!
//! Serves the kind's [`ToolRegistry`] over MCP Streamable HTTP, so clients
//! such as Claude Desktop (through `mcp-remote`) can list and call the same
//! tools that `POST /tools/{name}` exposes.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler};

use crate::library::MediaLibrary;
use crate::models::MediaKind;
use crate::tools::{validate_params, ToolContext, ToolRegistry};

/// Each MCP session gets a clone; the registry and library are shared.
#[derive(Clone)]
pub struct McpBridge {
    kind: MediaKind,
    library: MediaLibrary,
    tools: Arc<ToolRegistry>,
}

impl McpBridge {
    pub fn new(kind: MediaKind, library: MediaLibrary, tools: Arc<ToolRegistry>) -> Self {
        Self {
            kind,
            library,
            tools,
        }
    }

    fn to_mcp_tool(tool: &dyn crate::tools::Tool) -> Tool {
        let input_schema = match tool.parameters_schema() {
            serde_json::Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };
        // only the insert tools write
        let read_only = !tool.name().starts_with("insert_");

        Tool {
            name: Cow::Owned(tool.name().to_string()),
            title: None,
            description: Some(Cow::Owned(tool.description().to_string())),
            input_schema,
            output_schema: None,
            annotations: Some(ToolAnnotations::new().read_only(read_only)),
            execution: None,
            icons: None,
            meta: None,
        }
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: format!("takeout-{}", self.kind.as_str()),
                title: Some(format!("Takeout {} library", self.kind.as_str())),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Personal {kind} library. Use query_{noun} to search by content, \
                 list_{noun} to browse recent items, get_item to read one item, \
                 and insert_{noun} to add a file.",
                kind = self.kind.as_str(),
                noun = self.kind.noun()
            )),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools: Vec<Tool> = self
            .tools
            .tools()
            .iter()
            .map(|t| Self::to_mcp_tool(t.as_ref()))
            .collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tools.find(name).map(Self::to_mcp_tool)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let tool = self.tools.find(&request.name).ok_or_else(|| {
            McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", request.name),
                None,
            )
        })?;

        let params = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
        let params = validate_params(&tool.parameters_schema(), &params)
            .map_err(|e| McpError::invalid_params(e.to_string(), None))?;

        let ctx = ToolContext::new(self.library.clone());
        match tool.execute(params, &ctx).await {
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result).unwrap_or_default();
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(e) => {
                tracing::warn!(tool = %request.name, error = %e, "tool call failed");
                Ok(CallToolResult::error(vec![Content::text(e.to_string())]))
            }
        }
    }
}
