//! Tools exposed by the per-media query servers.
//!
//! Every server registers four tools for its media kind:
//!
//! | Tool | Parameters | Effect |
//! |------|------------|--------|
//! | `insert_<noun>` | `path` | analyze and store one file |
//! | `query_<noun>` | `query`, `top_k` (default 5, max 50) | ranked search |
//! | `list_<noun>` | `limit` (default 20, max 100) | most recent items |
//! | `get_item` | `id` | full document with chunks |
//!
//! The same [`ToolRegistry`] backs both `POST /tools/{name}` and the MCP
//! bridge. Parameters are checked with [`validate_params`] before
//! [`Tool::execute`] is called.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::PathBuf;

use crate::library::MediaLibrary;
use crate::models::MediaKind;

pub const DEFAULT_TOP_K: i64 = 5;
pub const MAX_TOP_K: i64 = 50;
pub const DEFAULT_LIST_LIMIT: i64 = 20;
pub const MAX_LIST_LIMIT: i64 = 100;

/// A callable tool with a JSON Schema for its parameters.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Route and MCP name, e.g. `query_image`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema object: `type`, `properties`, `required`.
    fn parameters_schema(&self) -> Value;

    /// Run with parameters that already passed [`validate_params`].
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

/// What a tool can reach while executing.
pub struct ToolContext {
    pub library: MediaLibrary,
}

impl ToolContext {
    pub fn new(library: MediaLibrary) -> Self {
        Self { library }
    }
}

/// Entry in `GET /tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

pub struct InsertTool {
    kind: MediaKind,
    name: String,
    description: String,
}

impl InsertTool {
    pub fn new(kind: MediaKind) -> Self {
        let description = match kind {
            MediaKind::Document => "Extract the text of a document file and add it to the library".to_string(),
            MediaKind::Audio => "Transcribe an audio file and add it to the library".to_string(),
            MediaKind::Video => "Transcribe a video's soundtrack and add it to the library".to_string(),
            MediaKind::Image => "Describe an image and add it to the library".to_string(),
        };
        Self {
            kind,
            name: format!("insert_{}", kind.noun()),
            description,
        }
    }
}

#[async_trait]
impl Tool for InsertTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": format!("Path to a {} file ({})", self.kind.noun(), self.kind.extensions().join(", "))
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let path = params["path"].as_str().unwrap_or("").trim();
        if path.is_empty() {
            bail!("path must not be empty");
        }
        let inserted = ctx.library.insert(self.kind, &PathBuf::from(path)).await?;
        Ok(serde_json::to_value(inserted)?)
    }
}

pub struct QueryTool {
    kind: MediaKind,
    name: String,
    description: String,
}

impl QueryTool {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            name: format!("query_{}", kind.noun()),
            description: format!("Search the {} library by content", kind.as_str()),
        }
    }
}

#[async_trait]
impl Tool for QueryTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What to look for" },
                "top_k": {
                    "type": "integer",
                    "description": "Maximum number of results",
                    "default": DEFAULT_TOP_K,
                    "minimum": 1,
                    "maximum": MAX_TOP_K
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let query = params["query"].as_str().unwrap_or("");
        if query.trim().is_empty() {
            bail!("query must not be empty");
        }
        let top_k = params["top_k"].as_i64().unwrap_or(DEFAULT_TOP_K).clamp(1, MAX_TOP_K);
        let results = ctx.library.query(self.kind, query, top_k).await?;
        Ok(json!({ "media": self.kind, "results": results }))
    }
}

pub struct ListTool {
    kind: MediaKind,
    name: String,
    description: String,
}

impl ListTool {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            name: format!("list_{}", kind.noun()),
            description: format!("List the most recently updated {} items", kind.as_str()),
        }
    }
}

#[async_trait]
impl Tool for ListTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of items",
                    "default": DEFAULT_LIST_LIMIT,
                    "minimum": 1,
                    "maximum": MAX_LIST_LIMIT
                }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let limit = params["limit"]
            .as_i64()
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        let items = ctx.library.list(self.kind, limit).await?;
        Ok(json!({ "media": self.kind, "items": items }))
    }
}

pub struct GetItemTool;

#[async_trait]
impl Tool for GetItemTool {
    fn name(&self) -> &str {
        "get_item"
    }

    fn description(&self) -> &str {
        "Retrieve a stored item by id, with its text and chunks"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string", "description": "Item id from query or list results" }
            },
            "required": ["id"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let id = params["id"].as_str().unwrap_or("").trim();
        if id.is_empty() {
            bail!("id must not be empty");
        }
        let doc = ctx.library.get(id).await?;
        Ok(serde_json::to_value(&doc)?)
    }
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// The four tools served for `kind`.
    pub fn for_media(kind: MediaKind) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(InsertTool::new(kind)));
        registry.register(Box::new(QueryTool::new(kind)));
        registry.register(Box::new(ListTool::new(kind)));
        registry.register(Box::new(GetItemTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn infos(&self) -> Vec<ToolInfo> {
        self.tools
            .iter()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Check `params` against a tool schema and fill in defaults.
///
/// Required keys must be present; present keys must match their declared
/// `type`, any `enum`, and integer `minimum`/`maximum` bounds.
pub fn validate_params(schema: &Value, params: &Value) -> Result<Value> {
    let given = match params {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => bail!("parameters must be a JSON object, got {}", json_type_name(other)),
    };

    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !given.contains_key(key) {
                bail!("missing required parameter: {}", key);
            }
        }
    }

    let mut result = given.clone();

    for (name, prop) in &properties {
        let Some(value) = given.get(name) else {
            if let Some(default) = prop.get("default") {
                result.insert(name.clone(), default.clone());
            }
            continue;
        };

        if let Some(expected) = prop.get("type").and_then(|t| t.as_str()) {
            let ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !ok {
                bail!(
                    "parameter '{}' must be of type '{}', got {}",
                    name,
                    expected,
                    json_type_name(value)
                );
            }
        }

        if let Some(allowed) = prop.get("enum").and_then(|e| e.as_array()) {
            if !allowed.contains(value) {
                let allowed: Vec<String> = allowed.iter().map(|v| v.to_string()).collect();
                bail!(
                    "parameter '{}' must be one of [{}], got {}",
                    name,
                    allowed.join(", "),
                    value
                );
            }
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = prop.get("minimum").and_then(|m| m.as_f64()) {
                if n < min {
                    bail!("parameter '{}' must be >= {}, got {}", name, min, value);
                }
            }
            if let Some(max) = prop.get("maximum").and_then(|m| m.as_f64()) {
                if n > max {
                    bail!("parameter '{}' must be <= {}, got {}", name, max, value);
                }
            }
        }
    }

    Ok(Value::Object(result))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
