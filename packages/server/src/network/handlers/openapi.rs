//! API description of the live route table.
//!
//! The document follows the shape the reverse-proxy gateway consumes, so
//! one host can proxy another: path and query parameters under
//! `parameters`, the structured parameter as a `requestBody` reference into
//! `components.schemas`, and `text/event-stream` responses for streaming
//! routes.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use framex_core::consts::{PROJECT_NAME, VERSION};
use framex_core::HttpMethod;
use serde_json::{json, Map, Value};

use super::AppState;
use crate::network::routes::RouteEntry;

/// Operation id of a route: function, path and method joined, with every
/// non-word character replaced by `_`.
#[must_use]
pub fn operation_id(function: &str, path: &str, method: HttpMethod) -> String {
    let raw = format!("{function}{path}_{}", method.as_str().to_ascii_lowercase());
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn path_param_names(path: &str) -> Vec<&str> {
    path.split('/')
        .filter_map(|seg| seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')))
        .collect()
}

fn render_operation(entry: &RouteEntry, method: HttpMethod, components: &mut Map<String, Value>) -> Value {
    let path = entry.path();
    let in_path = path_param_names(path);
    let mut parameters = Vec::new();
    let mut request_body = None;

    for field in &entry.model.fields {
        let mut schema = field.ty.to_json_schema(components);
        if field.ty.is_structured() {
            request_body = Some(json!({
                "required": field.required,
                "content": {"application/json": {"schema": schema}},
            }));
            continue;
        }
        if let (Some(default), Value::Object(obj)) = (&field.default, &mut schema) {
            obj.insert("default".to_string(), default.clone());
        }
        let located_in_path = in_path.contains(&field.name.as_str());
        parameters.push(json!({
            "name": field.name,
            "in": if located_in_path { "path" } else { "query" },
            "required": field.required || located_in_path,
            "schema": schema,
        }));
    }

    let media = if entry.api.stream {
        "text/event-stream"
    } else {
        "application/json"
    };
    let mut operation = json!({
        "tags": entry.api.tags,
        "operationId": operation_id(&entry.api.function, path, method),
        "parameters": parameters,
        "responses": {
            "200": {
                "description": "Successful Response",
                "content": {media: {"schema": {}}},
            }
        },
    });
    if let (Some(body), Value::Object(obj)) = (request_body, &mut operation) {
        obj.insert("requestBody".to_string(), body);
    }
    operation
}

/// Builds the API description of `routes`.
#[must_use]
pub fn build_document(routes: &[Arc<RouteEntry>]) -> Value {
    let mut components = Map::new();
    let mut paths = Map::new();
    for entry in routes {
        let mut item = match paths.remove(entry.path()) {
            Some(Value::Object(item)) => item,
            _ => Map::new(),
        };
        for method in &entry.api.methods {
            let operation = render_operation(entry, *method, &mut components);
            item.insert(method.as_str().to_ascii_lowercase(), operation);
        }
        paths.insert(entry.path().to_string(), Value::Object(item));
    }
    json!({
        "openapi": "3.1.0",
        "info": {"title": PROJECT_NAME, "version": VERSION},
        "paths": paths,
        "components": {"schemas": components},
    })
}

pub async fn openapi_handler(State(state): State<AppState>) -> Json<Value> {
    Json(build_document(&state.routes.snapshot()))
}

#[cfg(test)]
mod tests {
    use framex_core::{FieldDef, ModelSchema, Param, ParamType};

    use super::*;
    use crate::adapter::testing::StubHandle;
    use crate::config::AuthConfig;
    use crate::network::handlers::testing::harness;
    use crate::network::routes::RouteSpec;

    fn spec(path: &str, function: &str, methods: &[HttpMethod], params: Vec<Param>) -> RouteSpec {
        RouteSpec {
            path: path.to_string(),
            methods: methods.to_vec(),
            function_name: function.to_string(),
            params,
            target: "echo.EchoPlugin".to_string(),
            stream: false,
            direct_output: false,
            tags: vec!["echo(v1)".to_string()],
            auth_keys: None,
        }
    }

    #[test]
    fn operation_ids_are_word_characters() {
        assert_eq!(
            operation_id("__call__", "/api/v1/echo", HttpMethod::Get),
            "__call___api_v1_echo_get"
        );
        assert_eq!(
            operation_id("get_user", "/api/v1/users/{id}", HttpMethod::Post),
            "get_user_api_v1_users__id__post"
        );
    }

    #[tokio::test]
    async fn document_describes_parameters_and_bodies() {
        let harness = harness(StubHandle::new("echo.EchoPlugin"), AuthConfig::default()).await;
        let model = ModelSchema::new(
            "Item",
            vec![FieldDef {
                name: "id".into(),
                ty: ParamType::Integer,
                required: true,
                default: None,
            }],
        );
        harness
            .registrar
            .add_route(&spec(
                "/api/v1/echo",
                "__call__",
                &[HttpMethod::Get],
                vec![Param::new("message", ParamType::String)],
            ))
            .unwrap();
        harness
            .registrar
            .add_route(&spec(
                "/api/v1/items/{group}",
                "save",
                &[HttpMethod::Post],
                vec![
                    Param::new("group", ParamType::String),
                    Param::new("item", ParamType::Model(model)),
                    Param::new("dry_run", ParamType::Boolean).with_default(json!(false)),
                ],
            ))
            .unwrap();
        let mut stream = spec("/api/v1/echo_stream", "echo_stream", &[HttpMethod::Get], Vec::new());
        stream.stream = true;
        harness.registrar.add_route(&stream).unwrap();

        let doc = openapi_handler(State(harness.state.clone())).await.0;

        let echo = &doc["paths"]["/api/v1/echo"]["get"];
        assert_eq!(echo["operationId"], "__call___api_v1_echo_get");
        assert_eq!(echo["parameters"][0]["in"], "query");
        assert_eq!(echo["parameters"][0]["required"], true);
        assert_eq!(echo["tags"], json!(["echo(v1)"]));

        let save = &doc["paths"]["/api/v1/items/{group}"]["post"];
        assert_eq!(save["parameters"][0]["in"], "path");
        assert_eq!(save["parameters"][1]["name"], "dry_run");
        assert_eq!(save["parameters"][1]["schema"]["default"], false);
        assert_eq!(
            save["requestBody"]["content"]["application/json"]["schema"]["$ref"],
            "#/components/schemas/Item"
        );
        assert_eq!(doc["components"]["schemas"]["Item"]["required"], json!(["id"]));

        let streaming = &doc["paths"]["/api/v1/echo_stream"]["get"];
        assert!(streaming["responses"]["200"]["content"]
            .get("text/event-stream")
            .is_some());
    }
}
