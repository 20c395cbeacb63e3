//! Composable validators for JSON values and HTML pages.
//!
//! A [`Schema`] both checks and reshapes its input: `Dict` keeps only the
//! declared keys, `Regex` returns the capture groups, `XPath` turns an HTML
//! string into the selected values, and `AllOf` pipes each result into the
//! next schema. Failures nest, so the rendered [`ValidationError`] shows
//! which level of the schema rejected the value.
//!
//! ```rust,ignore
//! let schema = Schema::all_of([
//!     Schema::xpath_first("//script[@id='embedded-data']/@data-props")?,
//!     Schema::Json,
//!     Schema::get(&["site", "relive", "webSocketUrl"]),
//!     Schema::url().scheme("wss").build(),
//! ]);
//! let ws_url = schema.validate(&Value::String(page))?;
//! ```

mod error;
mod html;
mod xpath;

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde_json::{Map, Value};
use url::Url;

pub use error::ValidationError;
pub use html::{Element, ElementId, HtmlDocument, Node};
pub use xpath::{XNode, XPath, XPathError};

use error::{describe, type_name};

pub type TransformFn = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Primitive type assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Null,
    Bool,
    Int,
    Float,
    Str,
    List,
    Dict,
}

impl ValueType {
    fn name(self) -> &'static str {
        match self {
            ValueType::Null => "null",
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Str => "str",
            ValueType::List => "list",
            ValueType::Dict => "dict",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            ValueType::Null => value.is_null(),
            ValueType::Bool => value.is_boolean(),
            ValueType::Int => value.is_i64() || value.is_u64(),
            // ints are accepted where floats are expected
            ValueType::Float => value.is_number(),
            ValueType::Str => value.is_string(),
            ValueType::List => value.is_array(),
            ValueType::Dict => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictKey {
    pub name: String,
    pub optional: bool,
}

impl DictKey {
    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: true,
        }
    }
}

impl From<&str> for DictKey {
    fn from(name: &str) -> Self {
        Self {
            name: name.to_string(),
            optional: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlPart {
    Scheme,
    Host,
    Path,
    Query,
}

impl UrlPart {
    fn name(self) -> &'static str {
        match self {
            UrlPart::Scheme => "scheme",
            UrlPart::Host => "host",
            UrlPart::Path => "path",
            UrlPart::Query => "query",
        }
    }

    fn extract(self, url: &Url) -> Value {
        match self {
            UrlPart::Scheme => Value::String(url.scheme().to_string()),
            UrlPart::Host => url
                .host_str()
                .map(|h| Value::String(h.to_string()))
                .unwrap_or(Value::Null),
            UrlPart::Path => Value::String(url.path().to_string()),
            UrlPart::Query => url
                .query()
                .map(|q| Value::String(q.to_string()))
                .unwrap_or(Value::Null),
        }
    }
}

/// Builder for [`Schema::Url`].
#[derive(Debug, Clone, Default)]
pub struct UrlSchemaBuilder {
    parts: Vec<(UrlPart, Schema)>,
}

impl UrlSchemaBuilder {
    /// `http` also accepts `https`.
    pub fn scheme(mut self, scheme: &str) -> Self {
        let schema = if scheme == "http" {
            Schema::any_of([Schema::equals("http"), Schema::equals("https")])
        } else {
            Schema::equals(scheme)
        };
        self.parts.push((UrlPart::Scheme, schema));
        self
    }

    pub fn part(mut self, part: UrlPart, schema: Schema) -> Self {
        self.parts.push((part, schema));
        self
    }

    pub fn build(self) -> Schema {
        Schema::Url(self.parts)
    }
}

/// What an XPath schema produces from its matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XPathOutput {
    /// String value of the first match, or null.
    First,
    /// String values of every match.
    Strings,
    /// Every match, elements as `{tag, attributes, text}` objects.
    Nodes,
}

#[derive(Clone, Default)]
pub enum Schema {
    #[default]
    Any,
    Type(ValueType),
    Equals(Value),
    List(Box<Schema>),
    Dict(Vec<(DictKey, Schema)>),
    /// Null passes through, anything else must match the inner schema.
    NoneOr(Box<Schema>),
    /// First schema that validates wins.
    AnyOf(Vec<Schema>),
    /// Each schema validates the output of the previous one.
    AllOf(Vec<Schema>),
    Transform {
        name: String,
        func: TransformFn,
    },
    /// Nested key/index lookup. Missing keys yield null.
    Get(Vec<String>),
    /// Several `Get` lookups collected into a list.
    UnionGet(Vec<Vec<String>>),
    Regex {
        pattern: Regex,
        search: bool,
    },
    Url(Vec<(UrlPart, Schema)>),
    /// Parses a JSON string.
    Json,
    XPath {
        path: XPath,
        output: XPathOutput,
    },
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    MinLength(usize),
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schema::Any => write!(f, "Any"),
            Schema::Type(t) => write!(f, "Type({})", t.name()),
            Schema::Equals(v) => write!(f, "Equals({v})"),
            Schema::List(s) => f.debug_tuple("List").field(s).finish(),
            Schema::Dict(entries) => f.debug_tuple("Dict").field(entries).finish(),
            Schema::NoneOr(s) => f.debug_tuple("NoneOr").field(s).finish(),
            Schema::AnyOf(s) => f.debug_tuple("AnyOf").field(s).finish(),
            Schema::AllOf(s) => f.debug_tuple("AllOf").field(s).finish(),
            Schema::Transform { name, .. } => write!(f, "Transform({name})"),
            Schema::Get(path) => write!(f, "Get({path:?})"),
            Schema::UnionGet(paths) => write!(f, "UnionGet({paths:?})"),
            Schema::Regex { pattern, search } => {
                write!(f, "Regex({}, search={search})", pattern.as_str())
            }
            Schema::Url(parts) => f.debug_tuple("Url").field(parts).finish(),
            Schema::Json => write!(f, "Json"),
            Schema::XPath { path, output } => write!(f, "XPath({}, {output:?})", path.as_str()),
            Schema::Contains(s) => write!(f, "Contains({s:?})"),
            Schema::StartsWith(s) => write!(f, "StartsWith({s:?})"),
            Schema::EndsWith(s) => write!(f, "EndsWith({s:?})"),
            Schema::MinLength(n) => write!(f, "MinLength({n})"),
        }
    }
}

impl Schema {
    pub fn equals(value: impl Into<Value>) -> Self {
        Schema::Equals(value.into())
    }

    pub fn list(item: Schema) -> Self {
        Schema::List(Box::new(item))
    }

    pub fn dict<K: Into<DictKey>>(entries: impl IntoIterator<Item = (K, Schema)>) -> Self {
        Schema::Dict(entries.into_iter().map(|(k, s)| (k.into(), s)).collect())
    }

    pub fn none_or(inner: Schema) -> Self {
        Schema::NoneOr(Box::new(inner))
    }

    pub fn any_of(schemas: impl IntoIterator<Item = Schema>) -> Self {
        Schema::AnyOf(schemas.into_iter().collect())
    }

    pub fn all_of(schemas: impl IntoIterator<Item = Schema>) -> Self {
        Schema::AllOf(schemas.into_iter().collect())
    }

    pub fn transform<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Schema::Transform {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn get(path: &[&str]) -> Self {
        Schema::Get(path.iter().map(|p| p.to_string()).collect())
    }

    pub fn union_get(paths: &[&[&str]]) -> Self {
        Schema::UnionGet(
            paths
                .iter()
                .map(|path| path.iter().map(|p| p.to_string()).collect())
                .collect(),
        )
    }

    /// Anchored at the start of the input.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Schema::Regex {
            pattern: Regex::new(pattern)?,
            search: false,
        })
    }

    /// Matches anywhere in the input.
    pub fn regex_search(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Schema::Regex {
            pattern: Regex::new(pattern)?,
            search: true,
        })
    }

    pub fn url() -> UrlSchemaBuilder {
        UrlSchemaBuilder::default()
    }

    pub fn xpath(expr: &str, output: XPathOutput) -> Result<Self, XPathError> {
        Ok(Schema::XPath {
            path: XPath::parse(expr)?,
            output,
        })
    }

    pub fn xpath_first(expr: &str) -> Result<Self, XPathError> {
        Self::xpath(expr, XPathOutput::First)
    }

    pub fn validate(&self, value: &Value) -> Result<Value, ValidationError> {
        match self {
            Schema::Any => Ok(value.clone()),
            Schema::Type(expected) => {
                check_type(value, *expected)?;
                Ok(value.clone())
            }
            Schema::Equals(expected) => {
                if value == expected {
                    Ok(value.clone())
                } else {
                    Err(ValidationError::new(
                        "equality",
                        format!("{} does not equal {}", describe(value), describe(expected)),
                    ))
                }
            }
            Schema::List(item) => validate_list(item, value),
            Schema::Dict(entries) => validate_dict(entries, value),
            Schema::NoneOr(inner) => {
                if value.is_null() {
                    Ok(Value::Null)
                } else {
                    inner.validate(value)
                }
            }
            Schema::AnyOf(schemas) => validate_any(schemas, value),
            Schema::AllOf(schemas) => {
                let mut current = value.clone();
                for schema in schemas {
                    current = schema.validate(&current)?;
                }
                Ok(current)
            }
            Schema::Transform { name, func } => func(value.clone()).map_err(|reason| {
                ValidationError::new(
                    "transform",
                    format!("Unable to transform {} with {name}: {reason}", describe(value)),
                )
            }),
            Schema::Get(path) => lookup(value, path),
            Schema::UnionGet(paths) => paths
                .iter()
                .map(|path| lookup(value, path))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Schema::Regex { pattern, search } => validate_regex(pattern, *search, value),
            Schema::Url(parts) => validate_url(parts, value),
            Schema::Json => {
                let text = expect_str(value)?;
                serde_json::from_str(text).map_err(|e| {
                    ValidationError::new("json", format!("Unable to parse JSON: {e} ({})", describe(value)))
                })
            }
            Schema::XPath { path, output } => {
                let text = expect_str(value)?;
                let doc = HtmlDocument::parse(text);
                let nodes = path.evaluate(&doc);
                Ok(match output {
                    XPathOutput::First => nodes
                        .first()
                        .map(|node| Value::String(node.string_value(&doc)))
                        .unwrap_or(Value::Null),
                    XPathOutput::Strings => Value::Array(
                        nodes
                            .iter()
                            .map(|node| Value::String(node.string_value(&doc)))
                            .collect(),
                    ),
                    XPathOutput::Nodes => {
                        Value::Array(nodes.iter().map(|node| node.to_value(&doc)).collect())
                    }
                })
            }
            Schema::Contains(needle) => {
                check_str(value, "contains", needle, |s| s.contains(needle.as_str()), "does not contain")
            }
            Schema::StartsWith(prefix) => check_str(
                value,
                "startswith",
                prefix,
                |s| s.starts_with(prefix.as_str()),
                "does not start with",
            ),
            Schema::EndsWith(suffix) => check_str(
                value,
                "endswith",
                suffix,
                |s| s.ends_with(suffix.as_str()),
                "does not end with",
            ),
            Schema::MinLength(min) => {
                let len = match value {
                    Value::String(s) => s.chars().count(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    other => {
                        return Err(ValidationError::new(
                            "length",
                            format!("Type of {} has no length", describe(other)),
                        ));
                    }
                };
                if len < *min {
                    return Err(ValidationError::new(
                        "length",
                        format!("Minimum length is {min}, but value is {len}"),
                    ));
                }
                Ok(value.clone())
            }
        }
    }
}

fn check_type(value: &Value, expected: ValueType) -> Result<(), ValidationError> {
    if expected.accepts(value) {
        return Ok(());
    }
    Err(ValidationError::new(
        "type",
        format!(
            "Type of {} should be {}, but is {}",
            describe(value),
            expected.name(),
            type_name(value)
        ),
    ))
}

fn expect_str(value: &Value) -> Result<&str, ValidationError> {
    check_type(value, ValueType::Str)?;
    Ok(value.as_str().unwrap_or_default())
}

fn check_str(
    value: &Value,
    kind: &'static str,
    operand: &str,
    check: impl Fn(&str) -> bool,
    verb: &str,
) -> Result<Value, ValidationError> {
    let text = expect_str(value)?;
    if check(text) {
        Ok(value.clone())
    } else {
        Err(ValidationError::new(
            kind,
            format!(
                "{} {verb} {}",
                describe(value),
                describe(&Value::String(operand.to_string()))
            ),
        ))
    }
}

fn validate_list(item: &Schema, value: &Value) -> Result<Value, ValidationError> {
    check_type(value, ValueType::List)?;
    let items = value.as_array().map(Vec::as_slice).unwrap_or_default();
    items
        .iter()
        .enumerate()
        .map(|(index, element)| {
            item.validate(element).map_err(|e| {
                ValidationError::new("list", format!("Unable to validate list item at index {index}"))
                    .with_context(e)
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

fn validate_dict(entries: &[(DictKey, Schema)], value: &Value) -> Result<Value, ValidationError> {
    check_type(value, ValueType::Dict)?;
    let Some(object) = value.as_object() else {
        return Ok(Value::Null);
    };

    let mut out = Map::new();
    for (key, schema) in entries {
        let Some(field) = object.get(&key.name) else {
            if key.optional {
                continue;
            }
            return Err(ValidationError::new(
                "dict",
                format!("Key '{}' not found in {}", key.name, describe(value)),
            ));
        };
        let validated = schema.validate(field).map_err(|e| {
            ValidationError::new(
                "dict",
                format!("Unable to validate value of key '{}'", key.name),
            )
            .with_context(e)
        })?;
        out.insert(key.name.clone(), validated);
    }
    Ok(Value::Object(out))
}

fn validate_any(schemas: &[Schema], value: &Value) -> Result<Value, ValidationError> {
    let mut failures = Vec::with_capacity(schemas.len());
    for schema in schemas {
        match schema.validate(value) {
            Ok(validated) => return Ok(validated),
            Err(e) => failures.push(e),
        }
    }
    Err(failures.into_iter().fold(
        ValidationError::new("any", format!("No schema matched {}", describe(value))),
        ValidationError::with_context,
    ))
}

fn lookup(value: &Value, path: &[String]) -> Result<Value, ValidationError> {
    let mut current = value;
    for key in path {
        let next = match current {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            Value::Null => return Ok(Value::Null),
            other => {
                return Err(ValidationError::new(
                    "get",
                    format!("Could not get key '{key}' from {}", describe(other)),
                ));
            }
        };
        match next {
            Some(next) => current = next,
            None => return Ok(Value::Null),
        }
    }
    Ok(current.clone())
}

fn validate_regex(pattern: &Regex, search: bool, value: &Value) -> Result<Value, ValidationError> {
    let text = expect_str(value)?;
    let captures = pattern
        .captures(text)
        .filter(|caps| search || caps.get(0).is_some_and(|m| m.start() == 0));
    let Some(captures) = captures else {
        return Err(ValidationError::new(
            "re",
            format!(
                "Pattern {} does not match {}",
                describe(&Value::String(pattern.as_str().to_string())),
                describe(value)
            ),
        ));
    };

    let to_value = |m: Option<regex::Match<'_>>| {
        m.map(|m| Value::String(m.as_str().to_string()))
            .unwrap_or(Value::Null)
    };

    let names: Vec<&str> = pattern.capture_names().flatten().collect();
    if names.is_empty() {
        return Ok(Value::Array(captures.iter().map(to_value).collect()));
    }
    Ok(Value::Object(
        names
            .into_iter()
            .map(|name| (name.to_string(), to_value(captures.name(name))))
            .collect(),
    ))
}

fn validate_url(parts: &[(UrlPart, Schema)], value: &Value) -> Result<Value, ValidationError> {
    let text = expect_str(value)?;
    let url = Url::parse(text).map_err(|e| {
        ValidationError::new("url", format!("{} is not a valid URL: {e}", describe(value)))
    })?;

    for (part, schema) in parts {
        schema.validate(&part.extract(&url)).map_err(|e| {
            ValidationError::new(
                "url",
                format!("Unable to validate URL attribute '{}'", part.name()),
            )
            .with_context(e)
        })?;
    }
    Ok(value.clone())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const WATCH_PAGE: &str = r#"<!DOCTYPE html><html><head>
<script id="embedded-data" data-props="{&quot;site&quot;:{&quot;relive&quot;:{&quot;webSocketUrl&quot;:&quot;wss://a.live2.example.jp/wsapi/v2/watch/12345?audience_token=abc&quot;}},&quot;program&quot;:{&quot;title&quot;:&quot;Night show&quot;}}"></script>
</head><body></body></html>"#;

    #[test]
    fn extracts_nested_json_from_html() {
        let schema = Schema::all_of([
            Schema::xpath_first("//script[@id='embedded-data']/@data-props").unwrap(),
            Schema::Json,
            Schema::dict([
                ("site", Schema::dict([("relive", Schema::dict([("webSocketUrl", Schema::url().scheme("wss").build())]))])),
                ("program", Schema::dict([("title", Schema::Type(ValueType::Str))])),
            ]),
            Schema::union_get(&[&["site", "relive", "webSocketUrl"], &["program", "title"]]),
        ]);

        let value = schema.validate(&Value::String(WATCH_PAGE.to_string())).unwrap();
        assert_eq!(
            value,
            json!([
                "wss://a.live2.example.jp/wsapi/v2/watch/12345?audience_token=abc",
                "Night show"
            ])
        );
    }

    #[test]
    fn dict_keeps_declared_keys_and_skips_missing_optionals() {
        let schema = Schema::dict([
            (DictKey::from("id"), Schema::Type(ValueType::Int)),
            (DictKey::optional("title"), Schema::Type(ValueType::Str)),
        ]);
        let value = schema.validate(&json!({"id": 7, "extra": true})).unwrap();
        assert_eq!(value, json!({"id": 7}));
    }

    #[test]
    fn nested_failures_render_as_context_tree() {
        let schema = Schema::dict([("data", Schema::dict([("id", Schema::Type(ValueType::Str))]))]);
        let err = schema.validate(&json!({"data": {"id": 123}})).unwrap_err();
        assert_eq!(
            err.render(),
            "ValidationError(dict):\n  Unable to validate value of key 'data'\n  Context(dict):\n    Unable to validate value of key 'id'\n    Context(type):\n      Type of 123 should be str, but is int"
        );
    }

    #[test]
    fn any_of_reports_every_branch() {
        let schema = Schema::any_of([Schema::Type(ValueType::Int), Schema::equals("live")]);
        assert_eq!(schema.validate(&json!("live")).unwrap(), json!("live"));

        let err = schema.validate(&json!("vod")).unwrap_err();
        assert_eq!(err.kind(), "any");
        assert_eq!(err.context().len(), 2);
        assert_eq!(err.context()[1].message(), "'vod' does not equal 'live'");
    }

    #[test]
    fn regex_returns_named_groups() {
        let schema = Schema::regex_search(r"lv(?P<id>\d+)").unwrap();
        assert_eq!(
            schema.validate(&json!("https://live.example.jp/watch/lv123")).unwrap(),
            json!({"id": "123"})
        );

        let anchored = Schema::regex(r"lv(?P<id>\d+)").unwrap();
        assert!(anchored.validate(&json!("watch/lv123")).is_err());
    }

    #[test]
    fn url_parts_are_validated() {
        let schema = Schema::url()
            .scheme("http")
            .part(UrlPart::Path, Schema::EndsWith(".m3u8".into()))
            .build();
        assert!(schema.validate(&json!("https://cdn.example/live/index.m3u8")).is_ok());

        let err = schema.validate(&json!("https://cdn.example/live/index.mpd")).unwrap_err();
        assert_eq!(err.message(), "Unable to validate URL attribute 'path'");
        assert!(schema.validate(&json!("not a url")).is_err());
    }

    #[test]
    fn list_transform_and_get() {
        let schema = Schema::all_of([
            Schema::get(&["items"]),
            Schema::list(Schema::transform("double", |v| {
                v.as_i64().map(|n| json!(n * 2)).ok_or_else(|| "not an int".to_string())
            })),
        ]);
        assert_eq!(schema.validate(&json!({"items": [1, 2]})).unwrap(), json!([2, 4]));
        assert_eq!(Schema::get(&["missing", "deeper"]).validate(&json!({})).unwrap(), Value::Null);

        let err = schema.validate(&json!({"items": [1, "x"]})).unwrap_err();
        assert_eq!(err.message(), "Unable to validate list item at index 1");
    }

    #[test]
    fn long_values_are_truncated_in_messages() {
        let long = "a".repeat(200);
        let err = Schema::Type(ValueType::Int).validate(&json!(long)).unwrap_err();
        assert!(err.message().contains(&format!("'{}...'", "a".repeat(60))));
        assert!(!err.message().contains(&"a".repeat(61)));
    }
}
