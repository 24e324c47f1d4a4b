//! Reads a remote API description into forwardable operations.
//!
//! Parameters come from `parameters` (query and path) plus, when present, the
//! JSON request body, which becomes a single structured parameter named
//! [`BODY_PARAM`]. Schema references are resolved recursively against
//! `components.schemas`. Defaults follow one rule everywhere: required fields
//! get none, an explicit schema `default` is used as is, and anything else
//! starts at the zero value of its type.

use std::collections::HashMap;

use framex_core::{FieldDef, HttpMethod, ModelSchema, Param, ParamType};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Name of the parameter carrying the request body.
pub const BODY_PARAM: &str = "request";

/// Nesting limit for schema resolution; self-referencing schemas stop here.
const MAX_SCHEMA_DEPTH: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum DescriptionError {
    #[error("schema `{0}` not found in components")]
    MissingSchema(String),
    #[error("schema `{0}` nests deeper than {MAX_SCHEMA_DEPTH} levels")]
    TooDeep(String),
}

/// One operation of the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteOperation {
    pub operation_id: String,
    /// Path as declared by the remote service, with `{name}` segments.
    pub path: String,
    pub method: HttpMethod,
    pub params: Vec<Param>,
    /// The remote answers with `text/event-stream`.
    pub stream: bool,
}

impl RemoteOperation {
    /// Whether the operation takes a request body.
    #[must_use]
    pub fn has_body(&self) -> bool {
        self.params.iter().any(|p| p.name == BODY_PARAM)
    }
}

// ---------------------------------------------------------------------------
// Schema resolution
// ---------------------------------------------------------------------------

struct Resolver<'a> {
    components: &'a Map<String, Value>,
    models: HashMap<String, ModelSchema>,
}

fn default_for(schema: &Value, ty: &ParamType, required: bool) -> Option<Value> {
    if required {
        None
    } else {
        Some(schema.get("default").cloned().unwrap_or_else(|| ty.zero_value()))
    }
}

fn ref_name(reference: &str) -> &str {
    reference.rsplit('/').next().unwrap_or(reference)
}

impl<'a> Resolver<'a> {
    fn new(components: &'a Map<String, Value>) -> Self {
        Self {
            components,
            models: HashMap::new(),
        }
    }

    fn resolve(
        &mut self,
        schema: &Value,
        hint: &str,
        depth: usize,
    ) -> Result<ParamType, DescriptionError> {
        if depth > MAX_SCHEMA_DEPTH {
            return Err(DescriptionError::TooDeep(hint.to_string()));
        }
        if let Some(reference) = schema.get("$ref").and_then(Value::as_str) {
            return self.model(ref_name(reference), depth + 1).map(ParamType::Model);
        }
        for key in ["anyOf", "oneOf"] {
            if let Some(variants) = schema.get(key).and_then(Value::as_array) {
                let mut resolved = variants
                    .iter()
                    .map(|v| self.resolve(v, hint, depth + 1))
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(if resolved.len() == 1 {
                    resolved.remove(0)
                } else {
                    ParamType::Union { variants: resolved }
                });
            }
        }
        if let Some([single]) = schema.get("allOf").and_then(Value::as_array).map(Vec::as_slice) {
            return self.resolve(single, hint, depth + 1);
        }

        match schema.get("type") {
            Some(Value::String(ty)) => self.resolve_type(ty, schema, hint, depth),
            Some(Value::Array(types)) => {
                let variants = types
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|ty| self.resolve_type(ty, schema, hint, depth))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ParamType::Union { variants })
            }
            _ => Ok(ParamType::Any),
        }
    }

    fn resolve_type(
        &mut self,
        ty: &str,
        schema: &Value,
        hint: &str,
        depth: usize,
    ) -> Result<ParamType, DescriptionError> {
        Ok(match ty {
            "string" => ParamType::String,
            "integer" => ParamType::Integer,
            "number" => ParamType::Number,
            "boolean" => ParamType::Boolean,
            "null" => ParamType::Null,
            "array" => {
                let items = match schema.get("items") {
                    Some(items) => self.resolve(items, hint, depth + 1)?,
                    None => ParamType::Any,
                };
                ParamType::array(items)
            }
            "object" if schema.get("properties").is_some() => {
                let name = schema
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or(hint)
                    .to_string();
                ParamType::Model(self.build_model(&name, schema, depth + 1)?)
            }
            "object" => ParamType::Object,
            _ => ParamType::Any,
        })
    }

    fn model(&mut self, name: &str, depth: usize) -> Result<ModelSchema, DescriptionError> {
        if let Some(model) = self.models.get(name) {
            return Ok(model.clone());
        }
        let components = self.components;
        let schema = components
            .get(name)
            .ok_or_else(|| DescriptionError::MissingSchema(name.to_string()))?;
        let model = self.build_model(name, schema, depth)?;
        self.models.insert(name.to_string(), model.clone());
        Ok(model)
    }

    fn build_model(
        &mut self,
        name: &str,
        schema: &Value,
        depth: usize,
    ) -> Result<ModelSchema, DescriptionError> {
        if depth > MAX_SCHEMA_DEPTH {
            return Err(DescriptionError::TooDeep(name.to_string()));
        }
        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let mut fields = Vec::new();
        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (field, prop) in properties {
                let ty = self.resolve(prop, &format!("{name}_{field}"), depth + 1)?;
                let is_required = required.contains(&field.as_str());
                fields.push(FieldDef {
                    name: field.clone(),
                    default: default_for(prop, &ty, is_required),
                    ty,
                    required: is_required,
                });
            }
        }
        Ok(ModelSchema::new(name, fields))
    }
}

// ---------------------------------------------------------------------------
// Document parsing
// ---------------------------------------------------------------------------

fn declares_event_stream(operation: &Value) -> bool {
    operation
        .get("responses")
        .and_then(Value::as_object)
        .is_some_and(|responses| {
            responses.values().any(|response| {
                response
                    .get("content")
                    .and_then(Value::as_object)
                    .is_some_and(|content| content.contains_key("text/event-stream"))
            })
        })
}

fn parse_operation(
    resolver: &mut Resolver<'_>,
    path: &str,
    method: HttpMethod,
    operation: &Value,
) -> Result<RemoteOperation, DescriptionError> {
    let operation_id = operation
        .get("operationId")
        .and_then(Value::as_str)
        .map_or_else(
            || crate::network::handlers::openapi::operation_id("proxy", path, method),
            str::to_string,
        );

    let mut params = Vec::new();
    for parameter in operation
        .get("parameters")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(name) = parameter.get("name").and_then(Value::as_str) else {
            continue;
        };
        let in_path = parameter.get("in").and_then(Value::as_str) == Some("path");
        let required = in_path
            || parameter
                .get("required")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        let schema = parameter.get("schema").cloned().unwrap_or(Value::Null);
        let ty = resolver.resolve(&schema, name, 0)?;
        let mut param = Param::new(name, ty);
        param.default = default_for(&schema, &param.ty, required);
        params.push(param);
    }

    if let Some(schema) = operation.pointer("/requestBody/content/application~1json/schema") {
        let ty = resolver.resolve(schema, &format!("{operation_id}_body"), 0)?;
        params.push(Param::new(BODY_PARAM, ty));
    }

    Ok(RemoteOperation {
        operation_id,
        path: path.to_string(),
        method,
        params,
        stream: declares_event_stream(operation),
    })
}

/// Every operation declared by `document`.
///
/// Operations whose schemas cannot be resolved are skipped with a warning;
/// the rest of the document still loads.
#[must_use]
pub fn parse_document(document: &Value) -> Vec<RemoteOperation> {
    let empty = Map::new();
    let components = document
        .pointer("/components/schemas")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let mut resolver = Resolver::new(components);

    let mut operations = Vec::new();
    let Some(paths) = document.get("paths").and_then(Value::as_object) else {
        return operations;
    };
    for (path, item) in paths {
        let Some(item) = item.as_object() else { continue };
        for (method, operation) in item {
            let Ok(method) = method.parse::<HttpMethod>() else {
                debug!(path = %path, method = %method, "skipping unsupported method");
                continue;
            };
            match parse_operation(&mut resolver, path, method, operation) {
                Ok(op) => operations.push(op),
                Err(err) => warn!(path = %path, %method, error = %err, "skipping remote operation"),
            }
        }
    }
    operations
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn document() -> Value {
        json!({
            "openapi": "3.1.0",
            "paths": {
                "/api/v1/mock/get": {
                    "get": {
                        "operationId": "mock_get",
                        "parameters": [
                            {"name": "message", "in": "query", "required": true, "schema": {"type": "string"}},
                            {"name": "count", "in": "query", "schema": {"type": "integer"}},
                            {"name": "lang", "in": "query", "schema": {"type": "string", "default": "en"}}
                        ]
                    }
                },
                "/api/v1/mock/items/{id}": {
                    "post": {
                        "parameters": [{"name": "id", "in": "path", "schema": {"type": "integer"}}],
                        "requestBody": {"content": {"application/json": {"schema": {"$ref": "#/components/schemas/Item"}}}}
                    },
                    "parameters": []
                },
                "/api/v1/mock/stream": {
                    "get": {
                        "operationId": "mock_stream",
                        "responses": {"200": {"content": {"text/event-stream": {"schema": {}}}}}
                    }
                },
                "/api/v1/mock/broken": {
                    "post": {
                        "operationId": "broken",
                        "requestBody": {"content": {"application/json": {"schema": {"$ref": "#/components/schemas/Missing"}}}}
                    }
                }
            },
            "components": {"schemas": {
                "Item": {
                    "type": "object",
                    "required": ["name"],
                    "properties": {
                        "name": {"type": "string"},
                        "tags": {"type": "array", "items": {"type": "string"}},
                        "owner": {"$ref": "#/components/schemas/Owner"},
                        "note": {"anyOf": [{"type": "string"}, {"type": "null"}]}
                    }
                },
                "Owner": {
                    "type": "object",
                    "properties": {"id": {"type": "integer"}, "active": {"type": "boolean", "default": true}}
                }
            }}
        })
    }

    fn find<'a>(ops: &'a [RemoteOperation], path: &str) -> &'a RemoteOperation {
        ops.iter().find(|op| op.path == path).unwrap()
    }

    #[test]
    fn parameters_follow_the_default_inference_rule() {
        let ops = parse_document(&document());
        let get = find(&ops, "/api/v1/mock/get");
        assert_eq!(get.operation_id, "mock_get");
        assert_eq!(get.method, HttpMethod::Get);
        assert!(!get.has_body());

        let by_name = |name: &str| get.params.iter().find(|p| p.name == name).unwrap();
        assert_eq!(by_name("message").default, None);
        assert_eq!(by_name("count").default, Some(json!(0)));
        assert_eq!(by_name("lang").default, Some(json!("en")));
    }

    #[test]
    fn request_bodies_resolve_nested_references() {
        let ops = parse_document(&document());
        let post = find(&ops, "/api/v1/mock/items/{id}");
        assert_eq!(post.operation_id, "proxy_api_v1_mock_items__id__post");
        assert!(post.has_body());
        // Path parameters are always required.
        assert_eq!(post.params[0].default, None);

        let ParamType::Model(item) = &post.params[1].ty else {
            panic!("body should be a model");
        };
        assert_eq!(item.name, "Item");
        let field = |name: &str| item.fields.iter().find(|f| f.name == name).unwrap();
        assert!(field("name").required);
        assert_eq!(field("tags").ty, ParamType::array(ParamType::String));
        assert_eq!(field("tags").default, Some(json!([])));
        assert_eq!(field("note").ty, ParamType::optional(ParamType::String));

        let ParamType::Model(owner) = &field("owner").ty else {
            panic!("owner should be a model");
        };
        assert_eq!(owner.name, "Owner");
        assert_eq!(field("owner").default, Some(json!({"id": 0, "active": true})));
    }

    #[test]
    fn streams_are_detected_and_broken_operations_skipped() {
        let ops = parse_document(&document());
        assert!(find(&ops, "/api/v1/mock/stream").stream);
        assert!(!find(&ops, "/api/v1/mock/get").stream);
        assert!(ops.iter().all(|op| op.operation_id != "broken"));
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn self_referencing_schemas_stop_at_the_depth_limit() {
        let doc = json!({
            "paths": {"/api/v1/tree": {"post": {
                "operationId": "tree",
                "requestBody": {"content": {"application/json": {"schema": {"$ref": "#/components/schemas/Node"}}}}
            }}},
            "components": {"schemas": {"Node": {
                "type": "object",
                "properties": {"child": {"$ref": "#/components/schemas/Node"}}
            }}}
        });
        assert!(parse_document(&doc).is_empty());
    }
}
