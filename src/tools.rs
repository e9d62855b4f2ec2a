//! Tool declaration translation between the chat envelope clients send and
//! the envelopes each upstream expects.
//!
//! Three shapes are in play:
//! - chat: `{type:"function", function:{name, description, parameters}}`
//! - Anthropic: `{name, description, input_schema}`
//! - Responses: `{type:"function"|"custom", name, description, parameters, strict?}`
//!
//! Translation never fails. Missing descriptions become `""` and missing
//! schemas become an empty object schema.

use serde_json::{Map, Value, json};

/// Tag placed in front of tool names to keep them out of the upstream's
/// reserved tool namespace. Never visible to gateway clients.
pub const TOOL_NAME_PREFIX: &str = "op_";

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub strict: Option<bool>,
}

impl ToolDeclaration {
    /// Reads either the nested chat envelope or a flat envelope carrying
    /// `parameters` or `input_schema`. Non-object entries yield `None`.
    pub fn from_value(raw: &Value) -> Option<Self> {
        let obj = raw.as_object()?;
        let nested = obj
            .get("function")
            .and_then(|v| v.as_object())
            .filter(|_| obj.get("type").and_then(|v| v.as_str()).unwrap_or("function") == "function");
        let source = nested.unwrap_or(obj);
        Some(Self {
            name: str_field(source, "name"),
            description: str_field(source, "description"),
            parameters: schema_field(source),
            strict: source.get("strict").and_then(|v| v.as_bool()),
        })
    }

    pub fn to_anthropic(&self, tag_name: bool) -> Value {
        let name = if tag_name {
            tag_tool_name(&self.name)
        } else {
            self.name.clone()
        };
        json!({
            "name": name,
            "description": self.description,
            "input_schema": self.parameters,
        })
    }

    pub fn to_responses(&self) -> Value {
        let mut out = json!({
            "type": "function",
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        });
        if let (Some(strict), Some(obj)) = (self.strict, out.as_object_mut()) {
            obj.insert("strict".to_string(), Value::Bool(strict));
        }
        out
    }
}

fn str_field(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn schema_field(obj: &Map<String, Value>) -> Value {
    obj.get("parameters")
        .filter(|v| !v.is_null())
        .or_else(|| obj.get("input_schema").filter(|v| !v.is_null()))
        .cloned()
        .unwrap_or_else(empty_schema)
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

pub fn parse_declarations(tools: Option<&[Value]>) -> Vec<ToolDeclaration> {
    tools
        .unwrap_or_default()
        .iter()
        .filter_map(ToolDeclaration::from_value)
        .collect()
}

/// Chat (or flat) tools to Anthropic declarations. `None` when there is
/// nothing to send, so the caller omits the `tools` field entirely.
pub fn to_anthropic_tools(tools: Option<&[Value]>, tag_names: bool) -> Option<Vec<Value>> {
    let out: Vec<Value> = parse_declarations(tools)
        .iter()
        .map(|decl| decl.to_anthropic(tag_names))
        .collect();
    if out.is_empty() { None } else { Some(out) }
}

/// Normalizes Responses-style flat tools into the nested chat envelope.
/// Entries already nested under `function` pass through unchanged.
pub fn normalize_to_chat_tools(tools: &[Value]) -> Vec<Value> {
    tools.iter().map(normalize_tool).collect()
}

fn normalize_tool(tool: &Value) -> Value {
    let Some(obj) = tool.as_object() else {
        return tool.clone();
    };
    if obj.get("function").is_some_and(|v| v.is_object()) {
        return tool.clone();
    }
    let tool_type = obj.get("type").and_then(|v| v.as_str()).unwrap_or("function");
    if tool_type != "function" && tool_type != "custom" {
        return tool.clone();
    }
    let mut function = Map::new();
    function.insert("name".to_string(), Value::String(str_field(obj, "name")));
    function.insert(
        "description".to_string(),
        Value::String(str_field(obj, "description")),
    );
    if let Some(parameters) = obj.get("parameters").filter(|v| !v.is_null()) {
        function.insert("parameters".to_string(), parameters.clone());
    }
    if let Some(strict) = obj.get("strict").and_then(|v| v.as_bool()) {
        function.insert("strict".to_string(), Value::Bool(strict));
    }
    json!({ "type": "function", "function": Value::Object(function) })
}

/// Any inbound tool envelope to the flat Responses declaration.
pub fn to_responses_tools(tools: Option<&[Value]>) -> Option<Vec<Value>> {
    let normalized = normalize_to_chat_tools(tools.unwrap_or_default());
    let out: Vec<Value> = parse_declarations(Some(normalized.as_slice()))
        .iter()
        .map(ToolDeclaration::to_responses)
        .collect();
    if out.is_empty() { None } else { Some(out) }
}

pub fn tag_tool_name(name: &str) -> String {
    if name.starts_with(TOOL_NAME_PREFIX) {
        name.to_string()
    } else {
        format!("{TOOL_NAME_PREFIX}{name}")
    }
}

pub fn strip_tool_prefix(name: &str) -> &str {
    name.strip_prefix(TOOL_NAME_PREFIX).unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weather_chat_tool() -> Value {
        json!({
            "type": "function",
            "function": {
                "name": "get_weather",
                "description": "Weather by city",
                "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
            }
        })
    }

    #[test]
    fn empty_or_missing_tools_translate_to_none() {
        assert_eq!(to_anthropic_tools(None, false), None);
        assert_eq!(to_anthropic_tools(Some(&[][..]), false), None);
        assert_eq!(to_responses_tools(Some(&[json!(42)][..])), None);
    }

    #[test]
    fn nested_chat_tool_becomes_anthropic_declaration() {
        let out = to_anthropic_tools(Some(&[weather_chat_tool()][..]), false).expect("tools");
        assert_eq!(
            out[0],
            json!({
                "name": "get_weather",
                "description": "Weather by city",
                "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}}
            })
        );
    }

    #[test]
    fn flat_tool_defaults_missing_fields() {
        let out = to_anthropic_tools(Some(&[json!({"name": "ping"})][..]), false).expect("tools");
        assert_eq!(
            out[0],
            json!({
                "name": "ping",
                "description": "",
                "input_schema": {"type": "object", "properties": {}}
            })
        );
    }

    #[test]
    fn flat_tool_accepts_input_schema() {
        let schema = json!({"type": "object", "properties": {"q": {"type": "string"}}});
        let decl = ToolDeclaration::from_value(&json!({"name": "search", "input_schema": schema}))
            .expect("decl");
        assert_eq!(decl.parameters, schema);
    }

    #[test]
    fn tagging_prefixes_anthropic_names_once() {
        let out = to_anthropic_tools(
            Some(&[weather_chat_tool(), json!({"name": "op_already"})][..]),
            true,
        )
        .expect("tools");
        assert_eq!(out[0]["name"], "op_get_weather");
        assert_eq!(out[1]["name"], "op_already");
    }

    #[test]
    fn responses_flat_tools_normalize_to_nested() {
        let normalized = normalize_to_chat_tools(&[
            json!({"type": "function", "name": "a", "description": "d", "parameters": {"type": "object"}, "strict": true}),
            json!({"type": "custom", "name": "apply_patch"}),
            weather_chat_tool(),
        ]);
        assert_eq!(
            normalized[0],
            json!({"type": "function", "function": {"name": "a", "description": "d", "parameters": {"type": "object"}, "strict": true}})
        );
        assert_eq!(
            normalized[1],
            json!({"type": "function", "function": {"name": "apply_patch", "description": ""}})
        );
        assert_eq!(normalized[2], weather_chat_tool());
    }

    #[test]
    fn chat_tools_flatten_for_responses() {
        let out = to_responses_tools(Some(&[weather_chat_tool()][..])).expect("tools");
        assert_eq!(out[0]["type"], "function");
        assert_eq!(out[0]["name"], "get_weather");
        assert_eq!(out[0]["parameters"]["properties"]["city"]["type"], "string");
        assert!(out[0].get("strict").is_none());
    }

    #[test]
    fn strip_is_idempotent_on_untagged_names() {
        for name in ["get_weather", "", "o", "opx", "x_op_"] {
            assert_eq!(strip_tool_prefix(&format!("{TOOL_NAME_PREFIX}{name}")), name);
            assert_eq!(strip_tool_prefix(name), name);
        }
        assert_eq!(strip_tool_prefix(&tag_tool_name("lookup")), "lookup");
    }
}
