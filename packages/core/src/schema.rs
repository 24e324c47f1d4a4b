//! Parameter schemas for operation arguments.
//!
//! A [`ParamType`] describes the shape one keyword argument may take. Structured
//! arguments are described by a [`ModelSchema`], which doubles as the request
//! model synthesized for every HTTP route: incoming keyword arguments are
//! validated and coerced against it before an operation is invoked.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::types::Kwargs;

/// Prefix of a local schema reference in a JSON-schema document.
pub const SCHEMA_REF_PREFIX: &str = "#/components/schemas/";

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// A keyword argument failed validation against its declared type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid argument `{field}`: {reason}")]
pub struct ValidationError {
    /// Dotted path of the offending field, e.g. `request.id`.
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    fn reason(reason: impl Into<String>) -> Self {
        Self::new(String::new(), reason)
    }

    /// Places the error under `parent`.
    fn under(self, parent: &str) -> Self {
        let field = if self.field.is_empty() {
            parent.to_string()
        } else {
            format!("{parent}.{}", self.field)
        };
        Self { field, ..self }
    }
}

// ---------------------------------------------------------------------------
// ParamType
// ---------------------------------------------------------------------------

/// Declared type of an operation parameter or a model field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array { items: Box<ParamType> },
    Object,
    Null,
    Any,
    /// First variant that accepts the value wins.
    Union { variants: Vec<ParamType> },
    /// A structured, multi-field type.
    Model(ModelSchema),
}

impl ParamType {
    /// Optional wrapper: `variant | null`.
    #[must_use]
    pub fn optional(inner: ParamType) -> Self {
        Self::Union {
            variants: vec![inner, Self::Null],
        }
    }

    #[must_use]
    pub fn array(items: ParamType) -> Self {
        Self::Array {
            items: Box::new(items),
        }
    }

    /// Whether this is a structured (multi-field) type.
    #[must_use]
    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Model(_))
    }

    /// Converts `value` into this type, accepting the textual forms query
    /// strings and path segments arrive in.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when the value cannot represent this type.
    /// Its `field` is empty unless the failure is inside a nested model.
    pub fn coerce(&self, value: Value) -> Result<Value, ValidationError> {
        match (self, value) {
            (Self::Any, v) => Ok(v),
            (Self::Null, Value::Null) => Ok(Value::Null),
            (Self::String, Value::String(s)) => Ok(Value::String(s)),
            (Self::String, v @ (Value::Number(_) | Value::Bool(_))) => {
                Ok(Value::String(v.to_string()))
            }
            (Self::Integer, Value::Number(n)) => {
                if n.is_i64() || n.is_u64() {
                    Ok(Value::Number(n))
                } else {
                    match n.as_f64() {
                        #[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
                        Some(f) if f.fract() == 0.0 => Ok(json!(f as i64)),
                        _ => Err(ValidationError::reason(format!("expected integer, got {n}"))),
                    }
                }
            }
            (Self::Integer, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| ValidationError::reason(format!("expected integer, got {s:?}"))),
            (Self::Number, Value::Number(n)) => Ok(Value::Number(n)),
            (Self::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
                .ok_or_else(|| ValidationError::reason(format!("expected number, got {s:?}"))),
            (Self::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
            (Self::Boolean, Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
                "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
                _ => Err(ValidationError::reason(format!("expected boolean, got {s:?}"))),
            },
            (Self::Array { items }, Value::Array(values)) => values
                .into_iter()
                .map(|v| items.coerce(v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            // A single query value for a list parameter.
            (Self::Array { items }, v @ (Value::String(_) | Value::Number(_) | Value::Bool(_))) => {
                Ok(Value::Array(vec![items.coerce(v)?]))
            }
            (Self::Object, Value::Object(map)) => Ok(Value::Object(map)),
            (Self::Object | Self::Model(_), Value::String(s)) => {
                let parsed: Value = serde_json::from_str(&s)
                    .map_err(|_| ValidationError::reason(format!("expected JSON object, got {s:?}")))?;
                if parsed.is_object() {
                    self.coerce(parsed)
                } else {
                    Err(ValidationError::reason(format!("expected JSON object, got {s:?}")))
                }
            }
            (Self::Model(model), Value::Object(map)) => model.validate(&map).map(Value::Object),
            (Self::Union { variants }, v) => variants
                .iter()
                .find_map(|variant| variant.coerce(v.clone()).ok())
                .ok_or_else(|| {
                    ValidationError::reason(format!("value {v} matches none of the accepted types"))
                }),
            (ty, v) => Err(ValidationError::reason(format!(
                "expected {}, got {v}",
                ty.label()
            ))),
        }
    }

    /// Value a non-required field without an explicit default starts with.
    #[must_use]
    pub fn zero_value(&self) -> Value {
        match self {
            Self::String => Value::String(String::new()),
            Self::Integer => json!(0),
            Self::Number => json!(0.0),
            Self::Boolean => Value::Bool(false),
            Self::Array { .. } => Value::Array(Vec::new()),
            Self::Object => Value::Object(Map::new()),
            Self::Null | Self::Any => Value::Null,
            Self::Union { variants } => variants.first().map_or(Value::Null, Self::zero_value),
            Self::Model(model) => Value::Object(model.zero_value()),
        }
    }

    /// Renders this type as JSON schema. Nested models are emitted as `$ref`s
    /// and their definitions collected into `components`.
    #[must_use]
    pub fn to_json_schema(&self, components: &mut Map<String, Value>) -> Value {
        match self {
            Self::String => json!({"type": "string"}),
            Self::Integer => json!({"type": "integer"}),
            Self::Number => json!({"type": "number"}),
            Self::Boolean => json!({"type": "boolean"}),
            Self::Array { items } => {
                json!({"type": "array", "items": items.to_json_schema(components)})
            }
            Self::Object => json!({"type": "object"}),
            Self::Null => json!({"type": "null"}),
            Self::Any => json!({}),
            Self::Union { variants } => json!({
                "anyOf": variants.iter().map(|v| v.to_json_schema(components)).collect::<Vec<_>>()
            }),
            Self::Model(model) => {
                if !components.contains_key(&model.name) {
                    // Placeholder first so self-referencing models terminate.
                    components.insert(model.name.clone(), Value::Null);
                    let rendered = model.to_json_schema(components);
                    components.insert(model.name.clone(), rendered);
                }
                json!({"$ref": format!("{SCHEMA_REF_PREFIX}{}", model.name)})
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array { .. } => "array",
            Self::Object | Self::Model(_) => "object",
            Self::Null => "null",
            Self::Any => "any",
            Self::Union { .. } => "union",
        }
    }
}

// ---------------------------------------------------------------------------
// Param
// ---------------------------------------------------------------------------

/// One named parameter of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(rename = "schema")]
    pub ty: ParamType,
    /// Default used when the argument is omitted. `None` marks it required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Param {
    #[must_use]
    pub fn new(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
        }
    }

    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    #[must_use]
    pub fn required(&self) -> bool {
        self.default.is_none()
    }
}

// ---------------------------------------------------------------------------
// ModelSchema
// ---------------------------------------------------------------------------

/// One field of a structured type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "schema")]
    pub ty: ParamType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// A named structured type: an ordered list of fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSchema {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl ModelSchema {
    #[must_use]
    pub fn new(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Builds the request model of an operation from its parameter list.
    #[must_use]
    pub fn from_params(name: impl Into<String>, params: &[Param]) -> Self {
        let fields = params
            .iter()
            .map(|p| FieldDef {
                name: p.name.clone(),
                ty: p.ty.clone(),
                required: p.required(),
                default: p.default.clone(),
            })
            .collect();
        Self::new(name, fields)
    }

    /// Validates `input` against the fields, coercing values to their
    /// declared types and filling defaults. Unknown keys are dropped.
    ///
    /// # Errors
    ///
    /// Returns the first missing required field or the first value that does
    /// not match its declared type.
    pub fn validate(&self, input: &Kwargs) -> Result<Kwargs, ValidationError> {
        let mut out = Kwargs::new();
        for field in &self.fields {
            match input.get(&field.name) {
                Some(Value::Null) if !field.required && field.default.is_some() => {
                    out.insert(field.name.clone(), field.default.clone().unwrap_or_default());
                }
                Some(value) => {
                    let coerced = field
                        .ty
                        .coerce(value.clone())
                        .map_err(|e| e.under(&field.name))?;
                    out.insert(field.name.clone(), coerced);
                }
                None => {
                    if let Some(default) = &field.default {
                        out.insert(field.name.clone(), default.clone());
                    } else if field.required {
                        return Err(ValidationError::new(&field.name, "field required"));
                    }
                }
            }
        }
        Ok(out)
    }

    /// An instance with every field at its default or zero value.
    #[must_use]
    pub fn zero_value(&self) -> Kwargs {
        self.fields
            .iter()
            .map(|f| {
                let value = f.default.clone().unwrap_or_else(|| f.ty.zero_value());
                (f.name.clone(), value)
            })
            .collect()
    }

    /// The structured parameter of this model, if any.
    #[must_use]
    pub fn structured_field(&self) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.ty.is_structured())
    }

    /// Renders the model as a JSON-schema object definition.
    #[must_use]
    pub fn to_json_schema(&self, components: &mut Map<String, Value>) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            let mut schema = field.ty.to_json_schema(components);
            if let (Some(default), Value::Object(obj)) = (&field.default, &mut schema) {
                obj.insert("default".to_string(), default.clone());
            }
            properties.insert(field.name.clone(), schema);
            if field.required {
                required.push(Value::String(field.name.clone()));
            }
        }
        json!({
            "title": self.name,
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_model() -> ModelSchema {
        ModelSchema::new(
            "MockModel",
            vec![
                FieldDef {
                    name: "id".into(),
                    ty: ParamType::Integer,
                    required: true,
                    default: None,
                },
                FieldDef {
                    name: "name".into(),
                    ty: ParamType::String,
                    required: false,
                    default: Some(json!("default")),
                },
            ],
        )
    }

    fn kwargs(value: Value) -> Kwargs {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn query_strings_coerce_to_scalars() {
        assert_eq!(ParamType::Integer.coerce(json!("42")).unwrap(), json!(42));
        assert_eq!(ParamType::Number.coerce(json!("1.5")).unwrap(), json!(1.5));
        assert_eq!(ParamType::Boolean.coerce(json!("TRUE")).unwrap(), json!(true));
        assert_eq!(ParamType::String.coerce(json!(7)).unwrap(), json!("7"));
        assert!(ParamType::Integer.coerce(json!("forty")).is_err());
    }

    #[test]
    fn union_takes_first_accepting_variant() {
        let ty = ParamType::Union {
            variants: vec![ParamType::Integer, ParamType::String],
        };
        assert_eq!(ty.coerce(json!("12")).unwrap(), json!(12));
        assert_eq!(ty.coerce(json!("twelve")).unwrap(), json!("twelve"));
        assert_eq!(ParamType::optional(ParamType::String).coerce(Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn array_wraps_single_query_value() {
        let ty = ParamType::array(ParamType::Integer);
        assert_eq!(ty.coerce(json!("3")).unwrap(), json!([3]));
        assert_eq!(ty.coerce(json!(["1", 2])).unwrap(), json!([1, 2]));
    }

    #[test]
    fn validate_fills_defaults_and_drops_unknown_keys() {
        let out = mock_model()
            .validate(&kwargs(json!({"id": "5", "extra": true})))
            .unwrap();
        assert_eq!(Value::Object(out), json!({"id": 5, "name": "default"}));
    }

    #[test]
    fn validate_reports_missing_required_field() {
        let err = mock_model().validate(&Kwargs::new()).unwrap_err();
        assert_eq!(err.field, "id");
        assert_eq!(err.reason, "field required");
    }

    #[test]
    fn nested_model_errors_carry_dotted_path() {
        let outer = ModelSchema::from_params(
            "Request",
            &[Param::new("model", ParamType::Model(mock_model()))],
        );
        let err = outer
            .validate(&kwargs(json!({"model": {"id": "x"}})))
            .unwrap_err();
        assert_eq!(err.field, "model.id");
    }

    #[test]
    fn zero_value_follows_declared_types() {
        let model = ModelSchema::new(
            "Zero",
            vec![
                FieldDef {
                    name: "tags".into(),
                    ty: ParamType::array(ParamType::String),
                    required: false,
                    default: None,
                },
                FieldDef {
                    name: "inner".into(),
                    ty: ParamType::Model(mock_model()),
                    required: false,
                    default: None,
                },
            ],
        );
        assert_eq!(
            Value::Object(model.zero_value()),
            json!({"tags": [], "inner": {"id": 0, "name": "default"}})
        );
    }

    #[test]
    fn json_schema_collects_nested_components() {
        let mut components = Map::new();
        let rendered = ParamType::Model(mock_model()).to_json_schema(&mut components);
        assert_eq!(rendered, json!({"$ref": "#/components/schemas/MockModel"}));
        let def = &components["MockModel"];
        assert_eq!(def["required"], json!(["id"]));
        assert_eq!(def["properties"]["name"]["default"], json!("default"));
    }

    #[test]
    fn params_without_default_are_required() {
        let model = ModelSchema::from_params(
            "Echo",
            &[
                Param::new("message", ParamType::String),
                Param::new("times", ParamType::Integer).with_default(json!(1)),
            ],
        );
        assert!(model.fields[0].required);
        assert!(!model.fields[1].required);
        assert!(model.structured_field().is_none());
    }
}
